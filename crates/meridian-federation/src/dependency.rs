//! Remote dependency resolution.
//!
//! A dependent job lives at its origin. Each clause is owned by the cluster
//! that allocated the referenced job. The origin evaluates its own clauses
//! and sends the expression to every other owner; each owner keeps a
//! placeholder, evaluates only the clauses it owns and reports changes back.
//! The origin combines the reports and flips the job's dependency status
//! exactly once when the aggregate becomes satisfied or can never be.
//!
//! Three workers drive this: a receiver for inbound expressions, a periodic
//! tester and an applier for reports arriving at the origin.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::MAX_PENDING_DEPENDENCY_MESSAGES;
use crate::context::FederationContext;
use crate::error::InvalidDependencySnafu;
use crate::error::QueueFullSnafu;
use crate::error::Result;
use crate::error::ShuttingDownSnafu;
use crate::job_store::DependencyStatus;
use crate::job_store::JobUpdate;
use crate::pure::dependency::AggregateTransition;
use crate::pure::dependency::DependencyAggregate;
use crate::pure::dependency::DependencyClause;
use crate::pure::dependency::combine;
use crate::pure::dependency::evaluate_clause;
use crate::pure::dependency::parse_dependency;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::RemoteDependencyState;
use crate::wire::MessageBody;

/// Sibling-side stand-in for a remote dependent job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPlaceholder {
    pub job_id: JobId,
    pub origin: ClusterId,
    pub user_id: u32,
    /// Clauses owned by the local cluster.
    pub clauses: Vec<DependencyClause>,
    pub last_reported: Option<RemoteDependencyState>,
}

/// Origin-side state of a dependent job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentJob {
    pub job_id: JobId,
    /// Clauses evaluated locally.
    pub local_clauses: Vec<DependencyClause>,
    pub aggregate: DependencyAggregate,
}

/// Persisted dependency state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    pub placeholders: Vec<DependencyPlaceholder>,
    pub dependents: Vec<DependentJob>,
}

/// Expression received from a dependent job's origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDependency {
    pub sender: ClusterId,
    pub job_id: JobId,
    pub expression: String,
    pub user_id: u32,
}

/// Report received from a clause owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyReport {
    pub sender: ClusterId,
    pub job_id: JobId,
    pub state: RemoteDependencyState,
}

/// Bounded channel whose receiver is handed to exactly one worker.
#[derive(Debug)]
struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T> WorkQueue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn push(&self, item: T, queue: &str) -> Result<()> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => QueueFullSnafu { queue }.fail(),
            Err(TrySendError::Closed(_)) => ShuttingDownSnafu.fail(),
        }
    }
}

/// Tracks cross-cluster dependencies on both sides.
#[derive(Debug)]
pub struct DependencyResolver {
    ctx: Arc<FederationContext>,
    placeholders: Mutex<BTreeMap<JobId, DependencyPlaceholder>>,
    dependents: Mutex<BTreeMap<JobId, DependentJob>>,
    inbound: WorkQueue<InboundDependency>,
    reports: WorkQueue<DependencyReport>,
}

impl DependencyResolver {
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self {
            ctx,
            placeholders: Mutex::new(BTreeMap::new()),
            dependents: Mutex::new(BTreeMap::new()),
            inbound: WorkQueue::new(MAX_PENDING_DEPENDENCY_MESSAGES),
            reports: WorkQueue::new(MAX_PENDING_DEPENDENCY_MESSAGES),
        }
    }

    fn evaluate(&self, clauses: &[DependencyClause]) -> RemoteDependencyState {
        combine(clauses.iter().map(|clause| {
            let job = self.ctx.jobs.get(clause.job_id).map(|record| (record.state, record.exit_code));
            evaluate_clause(clause.kind, job)
        }))
    }

    fn is_local_clause(&self, clause: &DependencyClause) -> bool {
        clause.owner().map_or(true, |owner| owner == self.ctx.local_id())
    }

    // ========================================================================
    // Origin side
    // ========================================================================

    /// Split `expression` into locally evaluated clauses and the set of
    /// remote owners. Every referenced local job must exist and every
    /// remote owner must be a member.
    fn resolve_clauses(&self, expression: &str) -> Result<(Vec<DependencyClause>, BTreeSet<ClusterId>)> {
        let clauses =
            parse_dependency(expression).map_err(|reason| InvalidDependencySnafu { expression, reason }.build())?;

        let mut owners = BTreeSet::new();
        let mut local_clauses = Vec::new();
        for clause in clauses {
            if self.is_local_clause(&clause) {
                if self.ctx.jobs.get(clause.job_id).is_none() {
                    return InvalidDependencySnafu {
                        expression,
                        reason: format!("job {} does not exist", clause.job_id),
                    }
                    .fail();
                }
                local_clauses.push(clause);
                continue;
            }
            let Some(owner) = clause.owner().filter(|owner| self.ctx.federation.contains(*owner)) else {
                return InvalidDependencySnafu {
                    expression,
                    reason: format!("job {} belongs to no federation member", clause.job_id),
                }
                .fail();
            };
            owners.insert(owner);
        }
        Ok((local_clauses, owners))
    }

    /// Reject an expression that could never be tracked.
    pub fn validate(&self, expression: &str) -> Result<()> {
        self.resolve_clauses(expression).map(|_| ())
    }

    /// Start tracking the dependency of a job submitted here.
    pub fn register_dependent_job(&self, job_id: JobId, expression: &str) -> Result<Option<AggregateTransition>> {
        let (local_clauses, owners) = self.resolve_clauses(expression)?;

        let user_id = self.ctx.jobs.get(job_id).map(|record| record.description.user_id).unwrap_or(0);
        for owner in &owners {
            self.ctx.rpc.enqueue(*owner, MessageBody::DependencySubmit {
                job_id,
                dependency: expression.to_string(),
                user_id,
            });
        }

        let mut aggregate = DependencyAggregate::new(self.evaluate(&local_clauses), owners.iter().copied());
        let transition = aggregate.take_transition();
        self.dependents.lock().insert(job_id, DependentJob {
            job_id,
            local_clauses,
            aggregate,
        });
        debug!(%job_id, remote_owners = owners.len(), "dependent job registered");

        if let Some(transition) = transition {
            self.apply_transition(job_id, transition);
        }
        Ok(transition)
    }

    /// Apply a clause owner's report. Returns the transition it caused, if any.
    pub fn apply_remote_update(&self, report: DependencyReport) -> Option<AggregateTransition> {
        let transition = {
            let mut dependents = self.dependents.lock();
            let Some(dependent) = dependents.get_mut(&report.job_id) else {
                debug!(job_id = %report.job_id, cluster = %report.sender, "report for untracked dependent job");
                return None;
            };
            dependent.aggregate.record_remote(report.sender, report.state)
        };
        if let Some(transition) = transition {
            self.apply_transition(report.job_id, transition);
        }
        transition
    }

    /// Flip the scheduler-facing status and tell sibling copies.
    fn apply_transition(&self, job_id: JobId, transition: AggregateTransition) {
        let status = match transition {
            AggregateTransition::BecameSatisfied => DependencyStatus::Satisfied,
            AggregateTransition::BecameFailed => DependencyStatus::Never,
        };
        if let Err(err) = self.ctx.jobs.update(job_id, &mut |record| record.dependency = status) {
            warn!(%job_id, error = %err, "dependent job vanished before its dependency resolved");
            return;
        }
        let update = JobUpdate {
            dependency: Some(status),
            ..Default::default()
        };
        for sibling in self.ctx.remote_active(job_id) {
            self.ctx.rpc.enqueue(sibling, MessageBody::UpdateJob {
                job_id,
                update: update.clone(),
                uid: 0,
            });
        }
        info!(%job_id, ?status, "dependency resolved");
    }

    // ========================================================================
    // Clause owner side
    // ========================================================================

    /// Create a placeholder for a dependent job of `sender` and evaluate it.
    /// An empty expression means the dependent job is gone.
    pub fn handle_dependency_submit(&self, inbound: InboundDependency) -> Result<()> {
        let expression = inbound.expression.as_str();
        let clauses =
            parse_dependency(expression).map_err(|reason| InvalidDependencySnafu { expression, reason }.build())?;
        if clauses.is_empty() {
            if self.placeholders.lock().remove(&inbound.job_id).is_some() {
                debug!(job_id = %inbound.job_id, origin = %inbound.sender, "dependency placeholder released");
            }
            return Ok(());
        }
        let owned: Vec<DependencyClause> = clauses.into_iter().filter(|clause| self.is_local_clause(clause)).collect();

        self.placeholders.lock().insert(inbound.job_id, DependencyPlaceholder {
            job_id: inbound.job_id,
            origin: inbound.sender,
            user_id: inbound.user_id,
            clauses: owned,
            last_reported: None,
        });
        debug!(job_id = %inbound.job_id, origin = %inbound.sender, "dependency placeholder created");
        self.test_placeholders();
        Ok(())
    }

    /// Re-evaluate placeholders and report changes to their origins.
    fn test_placeholders(&self) -> usize {
        let snapshot: Vec<DependencyPlaceholder> = self.placeholders.lock().values().cloned().collect();
        let mut reports = Vec::new();
        for placeholder in snapshot {
            let state = self.evaluate(&placeholder.clauses);
            if state != placeholder.last_reported.unwrap_or(RemoteDependencyState::Pending) {
                reports.push((placeholder.origin, placeholder.job_id, state));
            }
        }

        {
            let mut placeholders = self.placeholders.lock();
            for (_, job_id, state) in &reports {
                if *state == RemoteDependencyState::Pending {
                    if let Some(placeholder) = placeholders.get_mut(job_id) {
                        placeholder.last_reported = Some(*state);
                    }
                } else {
                    placeholders.remove(job_id);
                }
            }
        }

        for (origin, job_id, state) in &reports {
            self.ctx.rpc.enqueue(*origin, MessageBody::DependencyUpdateToOrigin {
                job_id: *job_id,
                state: *state,
            });
        }
        reports.len()
    }

    /// One tester pass over both sides. Returns the number of changes.
    pub fn test_dependencies(&self) -> usize {
        let reported = self.test_placeholders();

        let pending: Vec<(JobId, Vec<DependencyClause>)> = self
            .dependents
            .lock()
            .values()
            .filter(|dependent| !dependent.aggregate.is_settled())
            .map(|dependent| (dependent.job_id, dependent.local_clauses.clone()))
            .collect();

        let mut transitions = Vec::new();
        for (job_id, clauses) in pending {
            if self.ctx.jobs.get(job_id).is_none() {
                self.forget_job(job_id);
                continue;
            }
            let state = self.evaluate(&clauses);
            let transition =
                self.dependents.lock().get_mut(&job_id).and_then(|dependent| dependent.aggregate.set_local(state));
            if let Some(transition) = transition {
                transitions.push((job_id, transition));
            }
        }

        for (job_id, transition) in &transitions {
            self.apply_transition(*job_id, *transition);
        }
        reported + transitions.len()
    }

    // ========================================================================
    // Membership and persistence
    // ========================================================================

    /// Forget a departed sibling on both sides.
    pub fn remove_cluster(&self, cluster: ClusterId) {
        self.placeholders.lock().retain(|_, placeholder| placeholder.origin != cluster);
        let transitions: Vec<(JobId, AggregateTransition)> = self
            .dependents
            .lock()
            .values_mut()
            .filter_map(|dependent| dependent.aggregate.remove_cluster(cluster).map(|t| (dependent.job_id, t)))
            .collect();
        for (job_id, transition) in transitions {
            self.apply_transition(job_id, transition);
        }
    }

    /// Drop all dependency state for a job. Owners still holding a
    /// placeholder for it are told to release theirs.
    pub fn forget_job(&self, job_id: JobId) {
        self.placeholders.lock().remove(&job_id);
        let Some(dependent) = self.dependents.lock().remove(&job_id) else {
            return;
        };
        let holders = dependent
            .aggregate
            .remote
            .iter()
            .filter(|(_, state)| **state == RemoteDependencyState::Pending)
            .map(|(owner, _)| *owner);
        for owner in holders {
            self.ctx.rpc.enqueue(owner, MessageBody::DependencySubmit {
                job_id,
                dependency: String::new(),
                user_id: 0,
            });
        }
    }

    pub fn placeholder(&self, job_id: JobId) -> Option<DependencyPlaceholder> {
        self.placeholders.lock().get(&job_id).cloned()
    }

    pub fn dependent(&self, job_id: JobId) -> Option<DependentJob> {
        self.dependents.lock().get(&job_id).cloned()
    }

    pub fn snapshot(&self) -> DependencySnapshot {
        DependencySnapshot {
            placeholders: self.placeholders.lock().values().cloned().collect(),
            dependents: self.dependents.lock().values().cloned().collect(),
        }
    }

    pub fn restore(&self, snapshot: DependencySnapshot) {
        *self.placeholders.lock() = snapshot.placeholders.into_iter().map(|p| (p.job_id, p)).collect();
        *self.dependents.lock() = snapshot.dependents.into_iter().map(|d| (d.job_id, d)).collect();
    }

    // ========================================================================
    // Workers
    // ========================================================================

    pub fn queue_inbound(&self, inbound: InboundDependency) -> Result<()> {
        self.inbound.push(inbound, "dependency receiver")
    }

    pub fn queue_report(&self, report: DependencyReport) -> Result<()> {
        self.reports.push(report, "dependency update")
    }

    /// Create placeholders for inbound expressions until cancelled.
    pub async fn run_receiver(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.inbound.rx.lock().take() else {
            warn!("dependency receiver already running");
            return;
        };
        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => break,
                inbound = rx.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            let job_id = inbound.job_id;
            if let Err(err) = self.handle_dependency_submit(inbound) {
                warn!(%job_id, error = %err, "rejected remote dependency");
            }
        }
        debug!("dependency receiver stopped");
    }

    /// Apply reports from clause owners until cancelled.
    pub async fn run_applier(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.reports.rx.lock().take() else {
            warn!("dependency applier already running");
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                report = rx.recv() => match report {
                    Some(report) => {
                        self.apply_remote_update(report);
                    }
                    None => break,
                },
            }
        }
        debug!("dependency applier stopped");
    }

    /// Periodically re-test every dependency until cancelled.
    pub async fn run_tester(self: Arc<Self>, cancel: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let changes = self.test_dependencies();
                    if changes > 0 {
                        debug!(changes, "dependency test pass");
                    }
                }
            }
        }
        debug!("dependency tester stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FederationError;
    use crate::job_store::JobDescription;
    use crate::job_store::JobRecord;
    use crate::testing::cid;
    use crate::testing::context;
    use crate::transport::memory::MemoryNetwork;
    use crate::types::FederationMetadata;
    use crate::types::JobState;
    use crate::types::SiblingMask;

    fn resolver(local: u32) -> (Arc<FederationContext>, DependencyResolver) {
        let network = MemoryNetwork::new();
        let ctx = context(&network, &[1, 2, 3], local);
        (ctx.clone(), DependencyResolver::new(ctx))
    }

    fn add_job(ctx: &FederationContext, job_id: JobId, state: JobState, exit_code: i32) {
        let mut record = JobRecord::new(job_id, JobDescription::default(), 0);
        record.state = state;
        record.exit_code = exit_code;
        ctx.jobs.insert(record).unwrap();
    }

    fn add_dependent(ctx: &FederationContext, job_id: JobId) {
        let viable: SiblingMask = [cid(1), cid(2)].into_iter().collect();
        let mut meta = FederationMetadata::new(cid(1), viable, 0);
        meta.set_active(viable);
        ctx.index.insert(job_id, meta);
        let mut record = JobRecord::new(job_id, JobDescription::default(), 0);
        record.dependency = DependencyStatus::Waiting;
        ctx.jobs.insert(record).unwrap();
    }

    #[test]
    fn test_local_only_dependency_resolves_immediately() {
        let (ctx, deps) = resolver(1);
        let upstream = JobId::new(cid(1), 1).unwrap();
        add_job(&ctx, upstream, JobState::Completed, 0);
        let job = JobId::new(cid(1), 2).unwrap();
        add_dependent(&ctx, job);

        let transition = deps.register_dependent_job(job, &format!("afterok:{upstream}")).unwrap();
        assert_eq!(transition, Some(AggregateTransition::BecameSatisfied));
        assert_eq!(ctx.jobs.get(job).unwrap().dependency, DependencyStatus::Satisfied);
        // The sibling copy on cluster 2 is told.
        assert_eq!(ctx.rpc.pending_for(cid(2)), 1);
    }

    #[test]
    fn test_aggregate_waits_for_every_owner() {
        let (ctx, deps) = resolver(1);
        let on_two = JobId::new(cid(2), 5).unwrap();
        let on_three = JobId::new(cid(3), 6).unwrap();
        let job = JobId::new(cid(1), 2).unwrap();
        add_dependent(&ctx, job);

        let expression = format!("afterany:{on_two},afterok:{on_three}");
        assert_eq!(deps.register_dependent_job(job, &expression).unwrap(), None);
        assert_eq!(ctx.rpc.pending_for(cid(3)), 1);

        let report = |sender: u32, state| DependencyReport {
            sender: cid(sender),
            job_id: job,
            state,
        };
        assert_eq!(deps.apply_remote_update(report(2, RemoteDependencyState::Satisfied)), None);
        assert_eq!(ctx.jobs.get(job).unwrap().dependency, DependencyStatus::Waiting);
        assert_eq!(
            deps.apply_remote_update(report(3, RemoteDependencyState::Satisfied)),
            Some(AggregateTransition::BecameSatisfied)
        );
        assert_eq!(deps.apply_remote_update(report(3, RemoteDependencyState::Satisfied)), None);
        assert_eq!(ctx.jobs.get(job).unwrap().dependency, DependencyStatus::Satisfied);
    }

    #[test]
    fn test_departed_owner_no_longer_blocks() {
        let (ctx, deps) = resolver(1);
        let on_two = JobId::new(cid(2), 5).unwrap();
        let job = JobId::new(cid(1), 2).unwrap();
        add_dependent(&ctx, job);
        deps.register_dependent_job(job, &format!("afterok:{on_two}")).unwrap();

        deps.remove_cluster(cid(2));
        assert_eq!(ctx.jobs.get(job).unwrap().dependency, DependencyStatus::Satisfied);
    }

    #[test]
    fn test_invalid_expression() {
        let (_, deps) = resolver(1);
        let job = JobId::new(cid(1), 2).unwrap();
        assert!(deps.register_dependent_job(job, "afterwhen:3").is_err());
        assert!(deps.register_dependent_job(job, &format!("afterok:{}", JobId::new(cid(9), 1).unwrap())).is_err());
    }

    #[test]
    fn test_unknown_local_job_rejected() {
        let (ctx, deps) = resolver(1);
        let job = JobId::new(cid(1), 2).unwrap();
        add_dependent(&ctx, job);

        let missing = JobId::new(cid(1), 17).unwrap();
        let err = deps.register_dependent_job(job, &format!("afterok:{missing}")).unwrap_err();
        assert!(matches!(err, FederationError::InvalidDependency { .. }), "{err}");
        assert!(deps.validate("afterok:17").is_err());
        assert!(deps.dependent(job).is_none());
        assert_eq!(ctx.jobs.get(job).unwrap().dependency, DependencyStatus::Waiting);

        add_job(&ctx, missing, JobState::Pending, 0);
        assert!(deps.validate(&format!("afterok:{missing}")).is_ok());
        assert_eq!(deps.register_dependent_job(job, &format!("afterok:{missing}")).unwrap(), None);
    }

    #[test]
    fn test_forgotten_dependent_releases_remote_placeholders() {
        let (ctx, deps) = resolver(1);
        let on_two = JobId::new(cid(2), 5).unwrap();
        let on_three = JobId::new(cid(3), 6).unwrap();
        let job = JobId::new(cid(1), 2).unwrap();
        add_dependent(&ctx, job);
        deps.register_dependent_job(job, &format!("afterok:{on_two},afterok:{on_three}")).unwrap();
        // Cluster 3 already reported and dropped its placeholder.
        deps.apply_remote_update(DependencyReport {
            sender: cid(3),
            job_id: job,
            state: RemoteDependencyState::Satisfied,
        });
        let (to_two, to_three) = (ctx.rpc.pending_for(cid(2)), ctx.rpc.pending_for(cid(3)));

        deps.forget_job(job);
        assert!(deps.dependent(job).is_none());
        assert_eq!(ctx.rpc.pending_for(cid(2)), to_two + 1);
        assert_eq!(ctx.rpc.pending_for(cid(3)), to_three);
    }

    #[test]
    fn test_empty_submit_releases_placeholder() {
        let (ctx, deps) = resolver(2);
        let upstream = JobId::new(cid(2), 5).unwrap();
        add_job(&ctx, upstream, JobState::Pending, 0);
        let dependent = JobId::new(cid(1), 9).unwrap();
        let submit = |expression: String| InboundDependency {
            sender: cid(1),
            job_id: dependent,
            expression,
            user_id: 1000,
        };

        deps.handle_dependency_submit(submit(format!("afterok:{upstream}"))).unwrap();
        assert!(deps.placeholder(dependent).is_some());

        deps.handle_dependency_submit(submit(String::new())).unwrap();
        assert!(deps.placeholder(dependent).is_none());
        assert_eq!(deps.test_dependencies(), 0);
        assert_eq!(ctx.rpc.pending_for(cid(1)), 0);
    }

    #[test]
    fn test_placeholder_reports_once_resolved() {
        let (ctx, deps) = resolver(2);
        let upstream = JobId::new(cid(2), 5).unwrap();
        add_job(&ctx, upstream, JobState::Running, 0);
        let dependent = JobId::new(cid(1), 9).unwrap();
        let elsewhere = JobId::new(cid(3), 1).unwrap();

        deps.handle_dependency_submit(InboundDependency {
            sender: cid(1),
            job_id: dependent,
            expression: format!("afterok:{upstream},afterok:{elsewhere}"),
            user_id: 1000,
        })
        .unwrap();
        let placeholder = deps.placeholder(dependent).unwrap();
        assert_eq!(placeholder.clauses.len(), 1);
        assert_eq!(ctx.rpc.pending_for(cid(1)), 0);

        ctx.jobs
            .update(upstream, &mut |record| {
                record.state = JobState::Failed;
                record.exit_code = 1;
            })
            .unwrap();
        assert_eq!(deps.test_dependencies(), 1);
        assert_eq!(ctx.rpc.pending_for(cid(1)), 1);
        assert!(deps.placeholder(dependent).is_none());
        assert_eq!(deps.test_dependencies(), 0);
    }

    #[test]
    fn test_snapshot_restore() {
        let (ctx, deps) = resolver(1);
        let job = JobId::new(cid(1), 2).unwrap();
        add_dependent(&ctx, job);
        deps.register_dependent_job(job, &format!("after:{}", JobId::new(cid(2), 3).unwrap())).unwrap();

        let snapshot = deps.snapshot();
        let (_, restored) = resolver(1);
        restored.restore(snapshot.clone());
        assert_eq!(restored.snapshot(), snapshot);
        assert!(restored.dependent(job).is_some());
    }
}

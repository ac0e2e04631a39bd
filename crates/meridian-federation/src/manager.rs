//! Federation manager.
//!
//! Owns every federation service, runs the background workers and is the
//! [`MessageHandler`] for inbound sibling traffic. The local scheduler
//! drives federated jobs through the lifecycle methods here
//! ([`FederationManager::submit_job`], [`FederationManager::job_start`],
//! [`FederationManager::job_complete`] and friends).
//!
//! Inbound requests that mutate jobs are acknowledged right away and
//! applied later, in order, by the job-update processor. Lock requests,
//! sync requests and submission validation are answered inline.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::accounting::AccountingProbe;
use crate::config::FederationConfig;
use crate::connection::ConnectionManager;
use crate::constants::CONNECTION_MAINTAIN_INTERVAL;
use crate::constants::MAX_PENDING_JOB_UPDATES;
use crate::constants::PROTOCOL_VERSION;
use crate::constants::SHUTDOWN_TIMEOUT;
use crate::constants::SIGKILL;
use crate::context::FederationContext;
use crate::dependency::DependencyReport;
use crate::dependency::DependencyResolver;
use crate::dependency::InboundDependency;
use crate::error::FederationError;
use crate::error::InvalidConfigSnafu;
use crate::error::JobNotFoundSnafu;
use crate::error::JobNotPendingSnafu;
use crate::error::MalformedMessageSnafu;
use crate::error::Result;
use crate::error::UnknownClusterSnafu;
use crate::federation::ClusterDescriptor;
use crate::federation::FederationDescriptor;
use crate::federation::FederationService;
use crate::federation::MembershipChange;
use crate::job_index::JobIndexService;
use crate::job_store::JobDescription;
use crate::job_store::JobRecord;
use crate::job_store::JobStore;
use crate::job_store::JobUpdate;
use crate::lock::JobLockService;
use crate::reconcile::ReconciliationEngine;
use crate::revoke::RevocationPropagator;
use crate::revoke::RevokeApplied;
use crate::rpc_agent::RpcAgent;
use crate::state_store::PersistedState;
use crate::state_store::StateStore;
use crate::submission::SubmissionRouter;
use crate::submission::SubmitOutcome;
use crate::transport::InboundSession;
use crate::transport::MessageHandler;
use crate::transport::SiblingTransport;
use crate::types::ClusterId;
use crate::types::FederationMetadata;
use crate::types::JobId;
use crate::types::JobState;
use crate::types::SiblingMask;
use crate::types::now_unix_ms;
use crate::update_queue::JobUpdateQueue;
use crate::update_queue::PendingJobUpdate;
use crate::wire::FederationMessage;
use crate::wire::FederationReply;
use crate::wire::JobOutcome;
use crate::wire::MessageBody;

/// The federation manager of one cluster.
pub struct FederationManager {
    config: FederationConfig,
    ctx: Arc<FederationContext>,
    locks: Arc<JobLockService>,
    revoke: Arc<RevocationPropagator>,
    submissions: Arc<SubmissionRouter>,
    reconcile: Arc<ReconciliationEngine>,
    dependencies: Arc<DependencyResolver>,
    updates: Arc<JobUpdateQueue>,
    store: StateStore,
    cancel: CancellationToken,
    task_tracker: TaskTracker,
}

impl std::fmt::Debug for FederationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationManager")
            .field("cluster", &self.config.cluster_name)
            .field("jobs", &self.ctx.index.len())
            .field("pending_updates", &self.updates.len())
            .finish()
    }
}

impl FederationManager {
    /// Build a manager from validated configuration and restore saved state.
    ///
    /// A saved membership replaces the configured one only when it is newer
    /// and still contains the local cluster. Index entries for jobs the
    /// local job store no longer knows are dropped.
    pub fn new(
        config: FederationConfig,
        jobs: Arc<dyn JobStore>,
        accounting: Arc<dyn AccountingProbe>,
        transport: Arc<dyn SiblingTransport>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(|err| InvalidConfigSnafu { reason: err.to_string() }.build())?;
        let local = config.local_cluster_id().map_err(|err| InvalidConfigSnafu { reason: err.to_string() }.build())?;

        let store = StateStore::new(&config.state_dir, config.ignore_state_errors);
        let saved = store.load()?.unwrap_or_default();

        let descriptor = choose_descriptor(&config.federation, saved.descriptor, local);
        let federation = Arc::new(FederationService::new(descriptor, local)?);
        let timing = config.timing.clone();
        let connections = Arc::new(ConnectionManager::new(
            federation.clone(),
            transport,
            timing.connect_timeout(),
            timing.request_timeout(),
        ));
        let rpc = Arc::new(RpcAgent::new(connections.clone(), timing.rpc_agent_interval(), timing.max_backoff_exponent));

        let index = Arc::new(JobIndexService::new());
        let restored = saved.jobs.len();
        index.restore(saved.jobs.into_iter().filter(|entry| jobs.get(entry.job_id).is_some()).collect());
        if index.len() < restored {
            warn!(dropped = restored - index.len(), "dropped saved index entries for unknown jobs");
        }

        let ctx = Arc::new(FederationContext {
            federation,
            index,
            jobs,
            connections,
            rpc,
            accounting,
            timing,
        });

        let revoke = Arc::new(RevocationPropagator::new(ctx.clone()));
        let dependencies = Arc::new(DependencyResolver::new(ctx.clone()));
        dependencies.restore(saved.dependencies);

        info!(
            cluster = %config.cluster_name,
            local = %local,
            generation = ctx.federation.generation(),
            jobs = ctx.index.len(),
            "federation manager created"
        );

        Ok(Arc::new(Self {
            locks: Arc::new(JobLockService::new(ctx.clone())),
            submissions: Arc::new(SubmissionRouter::new(ctx.clone())),
            reconcile: Arc::new(ReconciliationEngine::new(ctx.clone(), revoke.clone())),
            revoke,
            dependencies,
            updates: Arc::new(JobUpdateQueue::new(MAX_PENDING_JOB_UPDATES)),
            store,
            cancel: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
            ctx,
            config,
        }))
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Spawn the background workers.
    pub fn start(self: &Arc<Self>) {
        let timing = &self.ctx.timing;

        self.task_tracker.spawn(self.ctx.rpc.clone().run(self.cancel.child_token()));

        match self.updates.take_receiver() {
            Some(rx) => {
                self.task_tracker.spawn(Self::update_processor(self.clone(), rx, self.cancel.child_token()));
            }
            None => warn!("job update processor already running"),
        }

        self.task_tracker.spawn(self.dependencies.clone().run_receiver(self.cancel.child_token()));
        self.task_tracker.spawn(self.dependencies.clone().run_applier(self.cancel.child_token()));
        self.task_tracker.spawn(
            self.dependencies.clone().run_tester(self.cancel.child_token(), timing.dependency_test_interval()),
        );
        self.task_tracker.spawn(Self::connection_maintainer(self.clone(), self.cancel.child_token()));
        self.task_tracker.spawn(Self::state_saver(self.clone(), self.cancel.child_token()));

        info!(cluster = %self.config.cluster_name, "federation manager started");
    }

    /// Stop the workers, save state and close every link.
    pub async fn shutdown(&self) -> Result<()> {
        info!(cluster = %self.config.cluster_name, "shutting down federation manager");

        self.cancel.cancel();
        self.task_tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task_tracker.wait()).await.is_err() {
            warn!("federation workers did not complete within timeout");
        }

        let saved = self.save_state();
        self.ctx.rpc.shutdown();
        self.ctx.connections.close_all();
        saved
    }

    /// Token cancelled when the manager shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write the current state to disk.
    pub fn save_state(&self) -> Result<()> {
        self.store.save(&self.persisted_state())
    }

    fn persisted_state(&self) -> PersistedState {
        PersistedState {
            saved_at_ms: now_unix_ms(),
            descriptor: Some(self.ctx.federation.descriptor()),
            jobs: self.ctx.index.snapshot(),
            dependencies: self.dependencies.snapshot(),
        }
    }

    async fn update_processor(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::Receiver<PendingJobUpdate>,
        cancel: CancellationToken,
    ) {
        debug!("job update processor started");
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            let kind = update.kind();
            let sender = update.sender();
            if let Err(err) = self.apply_update(update).await {
                warn!(kind, cluster = %sender, error = %err, "failed to apply job update");
            }
        }
        debug!("job update processor stopped");
    }

    async fn connection_maintainer(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CONNECTION_MAINTAIN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.maintain_connections().await,
            }
        }
        debug!("connection maintainer stopped");
    }

    /// Re-open links to active siblings and request a sync from every
    /// connected sibling not reconciled since its link last failed.
    pub async fn maintain_connections(&self) {
        for cluster in self.ctx.federation.clusters() {
            if cluster.id == self.ctx.local_id() || !cluster.state.accepts_new_jobs() {
                continue;
            }
            if !self.ctx.connections.is_connected(cluster.id) {
                if let Err(err) = self.ctx.connections.open(cluster.id).await {
                    debug!(cluster = %cluster.name, error = %err, "sibling still unreachable");
                    continue;
                }
            }
            self.reconcile.sync_if_needed(cluster.id);
        }
    }

    async fn state_saver(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.timing.state_save_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; nothing has changed yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let store = self.store.clone();
                    let state = self.persisted_state();
                    match tokio::task::spawn_blocking(move || store.save(&state)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(error = %err, "failed to save federation state"),
                        Err(err) => error!(error = %err, "state save task panicked"),
                    }
                }
            }
        }
        debug!("state saver stopped");
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Answer one request body. Mutations are queued, not applied.
    fn dispatch(&self, sender: ClusterId, body: MessageBody) -> Result<FederationReply> {
        let update = match body {
            MessageBody::Hello { .. } => {
                return MalformedMessageSnafu {
                    reason: "hello after handshake",
                }
                .fail();
            }
            MessageBody::Batch(_) => {
                return MalformedMessageSnafu {
                    reason: "nested batch",
                }
                .fail();
            }
            MessageBody::JobLock { job_id, cluster } => return Ok(self.locks.handle_lock_request(job_id, cluster)),
            MessageBody::JobUnlock { job_id, cluster } => return Ok(self.locks.handle_unlock_request(job_id, cluster)),
            MessageBody::SyncRequest => {
                let listing = self.reconcile.build_listing(sender);
                debug!(cluster = %sender, jobs = listing.jobs.len(), "answering sync request");
                self.ctx.rpc.enqueue(sender, MessageBody::SyncJobs(listing));
                return Ok(FederationReply::Ack);
            }
            MessageBody::DependencySubmit {
                job_id,
                dependency,
                user_id,
            } => {
                self.dependencies.queue_inbound(InboundDependency {
                    sender,
                    job_id,
                    expression: dependency,
                    user_id,
                })?;
                return Ok(FederationReply::Ack);
            }
            MessageBody::DependencyUpdateToOrigin { job_id, state } => {
                self.dependencies.queue_report(DependencyReport { sender, job_id, state })?;
                return Ok(FederationReply::Ack);
            }
            MessageBody::SubmitSibling(submit) => {
                self.submissions.validate_sibling_submit(sender, &submit)?;
                PendingJobUpdate::Submit { sender, submit }
            }
            MessageBody::JobStart {
                job_id,
                starting_cluster,
                start_time_ms,
                lock_epoch,
            } => PendingJobUpdate::Start {
                sender,
                job_id,
                starting_cluster,
                start_time_ms,
                lock_epoch,
            },
            MessageBody::JobComplete(outcome) => PendingJobUpdate::Complete { sender, outcome },
            MessageBody::JobRevoke(outcome) => PendingJobUpdate::Revoke { sender, outcome },
            MessageBody::JobCancel { job_id, signal, uid } => PendingJobUpdate::Cancel {
                sender,
                job_id,
                signal,
                uid,
            },
            MessageBody::JobRequeue { job_id, flags } => PendingJobUpdate::Requeue { sender, job_id, flags },
            MessageBody::SyncJobs(listing) => PendingJobUpdate::Sync { sender, listing },
            MessageBody::UpdateJob { job_id, update, uid } => PendingJobUpdate::UpdateJob {
                sender,
                job_id,
                update,
                uid,
            },
            MessageBody::UpdateJobAck { job_id, return_code } => PendingJobUpdate::UpdateResponse {
                sender,
                job_id,
                return_code,
            },
        };
        self.updates.push(update)?;
        Ok(FederationReply::Ack)
    }

    fn reply(&self, sender: ClusterId, body: MessageBody) -> FederationReply {
        let kind = body.kind();
        match self.dispatch(sender, body) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(cluster = %sender, kind, error = %err, "request rejected");
                FederationReply::from_error(&err)
            }
        }
    }

    /// Apply one queued update.
    pub async fn apply_update(&self, update: PendingJobUpdate) -> Result<()> {
        match update {
            PendingJobUpdate::Submit { sender, submit } => self.submissions.apply_sibling_submit(sender, submit),
            PendingJobUpdate::Start {
                sender,
                job_id,
                starting_cluster,
                start_time_ms,
                lock_epoch,
            } => self.apply_start(sender, job_id, starting_cluster, start_time_ms, lock_epoch),
            PendingJobUpdate::Complete { sender, outcome } => self.apply_complete(sender, &outcome),
            PendingJobUpdate::Revoke { sender, outcome } => {
                if self.revoke.handle_revoke(sender, &outcome) == RevokeApplied::Purged {
                    self.dependencies.forget_job(outcome.job_id);
                }
                Ok(())
            }
            PendingJobUpdate::Cancel {
                sender,
                job_id,
                signal,
                uid,
            } => {
                if self.ctx.is_origin(job_id) {
                    self.cancel_at_origin(job_id, signal, uid)
                } else {
                    self.cancel_sibling_copy(sender, job_id, signal)
                }
            }
            PendingJobUpdate::Requeue { sender, job_id, .. } => {
                if self.ctx.is_origin(job_id) {
                    self.requeue_at_origin(job_id).await
                } else {
                    debug!(%job_id, cluster = %sender, "requeue for a job this cluster does not own");
                    Ok(())
                }
            }
            PendingJobUpdate::Sync { sender, listing } => {
                let report = self.reconcile.apply_listing(sender, &listing)?;
                for job_id in report.removed {
                    self.dependencies.forget_job(job_id);
                }
                Ok(())
            }
            PendingJobUpdate::UpdateResponse {
                sender,
                job_id,
                return_code,
            } => {
                if return_code != 0 {
                    warn!(%job_id, cluster = %sender, return_code, "sibling failed to apply job update");
                }
                self.ctx.index.update(job_id, |meta| meta.ack_pending(sender));
                Ok(())
            }
            PendingJobUpdate::UpdateJob {
                sender,
                job_id,
                update,
                uid,
            } => self.apply_remote_job_update(sender, job_id, update, uid),
        }
    }

    fn apply_start(
        &self,
        sender: ClusterId,
        job_id: JobId,
        starting_cluster: ClusterId,
        start_time_ms: u64,
        lock_epoch: u64,
    ) -> Result<()> {
        if !self.ctx.is_origin(job_id) {
            let outcome = JobOutcome {
                job_id,
                state: JobState::Running,
                return_code: 0,
                start_time_ms,
            };
            if self.revoke.handle_revoke(sender, &outcome) == RevokeApplied::Purged {
                self.dependencies.forget_job(job_id);
            }
            return Ok(());
        }

        let meta = self.ctx.metadata(job_id)?;
        match meta.cluster_lock() {
            Some(holder) if holder != starting_cluster => {
                error!(
                    %job_id,
                    %holder,
                    starter = %starting_cluster,
                    "job started on a cluster not holding its lock, revoking the starter"
                );
                self.ctx.rpc.enqueue(starting_cluster, MessageBody::JobCancel {
                    job_id,
                    signal: SIGKILL,
                    uid: 0,
                });
                Ok(())
            }
            _ => {
                if lock_epoch < meta.lock_epoch {
                    debug!(%job_id, lock_epoch, current = meta.lock_epoch, "start reported with an older lock epoch");
                }
                self.revoke.propagate_start(job_id, starting_cluster, sender, start_time_ms)?;
                Ok(())
            }
        }
    }

    fn apply_complete(&self, sender: ClusterId, outcome: &JobOutcome) -> Result<()> {
        let job_id = outcome.job_id;
        if !self.ctx.is_origin(job_id) {
            self.ctx.jobs.purge(job_id);
            self.ctx.index.remove(job_id);
            self.dependencies.forget_job(job_id);
            debug!(%job_id, cluster = %sender, "sibling copy removed after completion elsewhere");
            return Ok(());
        }

        let now_ms = now_unix_ms();
        self.ctx.jobs.update(job_id, &mut |record| {
            record.revoked = true;
            record.running_cluster = Some(sender);
            record.state = outcome.state;
            record.exit_code = outcome.return_code;
            if outcome.start_time_ms > 0 {
                record.start_time_ms = Some(outcome.start_time_ms);
            }
            record.end_time_ms = Some(now_ms);
        })?;
        self.ctx.index.update(job_id, |meta| {
            meta.clear_lock();
            meta.set_active(SiblingMask::empty());
        });
        info!(%job_id, cluster = %sender, state = %outcome.state, "federated job finished on sibling");
        Ok(())
    }

    fn apply_remote_job_update(&self, sender: ClusterId, job_id: JobId, update: JobUpdate, uid: u32) -> Result<()> {
        let is_origin = self.ctx.is_origin(job_id);
        let applied = self.apply_job_update_locally(job_id, &update);
        if let Err(err) = &applied {
            debug!(%job_id, cluster = %sender, error = %err, "remote job update not applied");
        }

        if is_origin {
            if applied.is_ok() {
                self.fan_out_update(job_id, &update, uid);
            }
        } else {
            let return_code = if applied.is_ok() { 0 } else { 1 };
            self.ctx.rpc.enqueue(sender, MessageBody::UpdateJobAck { job_id, return_code });
        }
        Ok(())
    }

    /// Apply `update` to a local copy. Dependency changes apply to any
    /// pending copy; user changes require a pending, not yet started job.
    fn apply_job_update_locally(&self, job_id: JobId, update: &JobUpdate) -> Result<()> {
        let record = self.ctx.jobs.get(job_id).ok_or_else(|| JobNotFoundSnafu { job_id }.build())?;
        if !record.state.is_pending() {
            return JobNotPendingSnafu {
                job_id,
                state: record.state,
            }
            .fail();
        }
        self.ctx.jobs.update(job_id, &mut |record| update.apply_to(record))
    }

    /// Forward an update to every remote copy and count it as pending.
    fn fan_out_update(&self, job_id: JobId, update: &JobUpdate, uid: u32) {
        let now_ms = now_unix_ms();
        let targets = self.ctx.remote_active(job_id);
        for target in &targets {
            self.ctx.rpc.enqueue(*target, MessageBody::UpdateJob {
                job_id,
                update: update.clone(),
                uid,
            });
        }
        self.ctx.index.update(job_id, |meta| {
            for target in &targets {
                meta.record_pending(*target, now_ms);
            }
        });
    }

    fn cancel_at_origin(&self, job_id: JobId, signal: u16, uid: u32) -> Result<()> {
        let record = self.ctx.jobs.get(job_id).ok_or_else(|| JobNotFoundSnafu { job_id }.build())?;
        let local = self.ctx.local_id();

        if record.state.is_terminal() {
            return Ok(());
        }

        if record.state.is_started() {
            match record.running_cluster {
                Some(cluster) if cluster != local && record.revoked => {
                    self.ctx.rpc.enqueue(cluster, MessageBody::JobCancel { job_id, signal, uid });
                    info!(%job_id, %cluster, signal, "cancel forwarded to running cluster");
                }
                _ => {
                    self.ctx.jobs.signal(job_id, signal)?;
                    info!(%job_id, signal, "signalled locally running job");
                }
            }
            return Ok(());
        }

        for sibling in self.ctx.remote_active(job_id) {
            self.ctx.rpc.enqueue(sibling, MessageBody::JobCancel { job_id, signal, uid });
        }
        let now_ms = now_unix_ms();
        self.ctx.jobs.update(job_id, &mut |record| {
            record.state = JobState::Cancelled;
            record.end_time_ms = Some(now_ms);
        })?;
        self.ctx.index.update(job_id, |meta| {
            meta.clear_lock();
            meta.set_active(SiblingMask::empty());
        });
        self.dependencies.forget_job(job_id);
        info!(%job_id, uid, "pending federated job cancelled");
        Ok(())
    }

    /// The origin asked to cancel this cluster's copy.
    fn cancel_sibling_copy(&self, sender: ClusterId, job_id: JobId, signal: u16) -> Result<()> {
        let Some(record) = self.ctx.jobs.get(job_id) else {
            self.ctx.index.remove(job_id);
            return Ok(());
        };
        if record.state.is_started() && !record.state.is_terminal() {
            self.ctx.jobs.signal(job_id, signal)?;
            info!(%job_id, origin = %sender, signal, "signalled running copy on request of origin");
            return Ok(());
        }
        self.ctx.jobs.purge(job_id);
        self.ctx.index.remove(job_id);
        self.dependencies.forget_job(job_id);
        debug!(%job_id, origin = %sender, "sibling copy cancelled");
        Ok(())
    }

    async fn requeue_at_origin(&self, job_id: JobId) -> Result<()> {
        let record = self.ctx.jobs.get(job_id).ok_or_else(|| JobNotFoundSnafu { job_id }.build())?;
        self.revoke.prepare_requeue(job_id)?;
        let active = self.submissions.replicate(job_id, &record.description).await?;

        let local = self.ctx.local_id();
        let runnable_locally = self.ctx.index.update(job_id, |meta| meta.add_active(local)).unwrap_or(false);
        self.ctx.jobs.update(job_id, &mut |record| record.tracking_only = !runnable_locally)?;
        info!(%job_id, %active, "federated job requeued");
        Ok(())
    }

    // ========================================================================
    // Local job lifecycle
    // ========================================================================

    /// Submit a job with the local cluster as origin.
    pub async fn submit_job(&self, description: JobDescription) -> Result<SubmitOutcome> {
        let dependency = description.dependency.clone();
        if let Some(expression) = &dependency {
            self.dependencies.validate(expression)?;
        }

        let outcome = self.submissions.submit(description).await?;

        if let Some(expression) = &dependency {
            if let Err(err) = self.dependencies.register_dependent_job(outcome.job_id, expression) {
                warn!(job_id = %outcome.job_id, error = %err, "dependency not tracked, job held");
            }
        }
        Ok(outcome)
    }

    /// Called by the local scheduler before starting a job. Returns the lock epoch.
    #[instrument(skip(self), fields(cluster = %self.config.cluster_name))]
    pub async fn job_start(&self, job_id: JobId) -> Result<u64> {
        let record = self.ctx.jobs.get(job_id).ok_or_else(|| JobNotFoundSnafu { job_id }.build())?;
        if !record.is_runnable() {
            return JobNotPendingSnafu {
                job_id,
                state: record.state,
            }
            .fail();
        }

        let epoch = self.locks.acquire(job_id).await?;
        let local = self.ctx.local_id();
        let start_time_ms = now_unix_ms();
        self.ctx.jobs.update(job_id, &mut |record| {
            record.state = JobState::Running;
            record.start_time_ms = Some(start_time_ms);
            record.running_cluster = Some(local);
        })?;

        if self.ctx.is_origin(job_id) {
            self.revoke.propagate_start(job_id, local, local, start_time_ms)?;
        } else {
            self.ctx.index.update(job_id, |meta| meta.set_active(SiblingMask::single(local)));
            if let Some(origin) = job_id.origin() {
                self.ctx.rpc.enqueue(origin, MessageBody::JobStart {
                    job_id,
                    starting_cluster: local,
                    start_time_ms,
                    lock_epoch: epoch,
                });
            }
        }
        info!(%job_id, epoch, "federated job started");
        Ok(epoch)
    }

    /// Called by the local scheduler when a locally running job ends.
    pub fn job_complete(&self, job_id: JobId, state: JobState, exit_code: i32) -> Result<()> {
        let record = self.ctx.jobs.get(job_id).ok_or_else(|| JobNotFoundSnafu { job_id }.build())?;
        let now_ms = now_unix_ms();
        self.ctx.jobs.update(job_id, &mut |record| {
            record.state = state;
            record.exit_code = exit_code;
            record.end_time_ms = Some(now_ms);
        })?;

        if self.ctx.is_origin(job_id) {
            self.ctx.index.update(job_id, |meta| {
                meta.clear_lock();
                meta.set_active(SiblingMask::empty());
            });
        } else {
            self.ctx.index.remove(job_id);
            if let Some(origin) = job_id.origin() {
                self.ctx.rpc.enqueue(
                    origin,
                    MessageBody::JobComplete(JobOutcome {
                        job_id,
                        state,
                        return_code: exit_code,
                        start_time_ms: record.start_time_ms.unwrap_or(0),
                    }),
                );
            }
        }
        info!(%job_id, %state, exit_code, "federated job completed");
        Ok(())
    }

    /// Called by the local scheduler when a started job goes back to pending.
    pub async fn job_requeue(&self, job_id: JobId) -> Result<()> {
        if self.ctx.is_origin(job_id) {
            return self.requeue_at_origin(job_id).await;
        }

        self.ctx.metadata(job_id)?;
        self.ctx.jobs.update(job_id, &mut |record| {
            record.state = JobState::Pending;
            record.start_time_ms = None;
            record.running_cluster = None;
        })?;
        self.ctx.index.update(job_id, |meta| meta.clear_lock());
        if let Some(origin) = job_id.origin() {
            self.ctx.rpc.enqueue(origin, MessageBody::JobRequeue { job_id, flags: 0 });
        }
        info!(%job_id, "requeue reported to origin");
        Ok(())
    }

    /// User cancel. The origin cancels everywhere; a sibling asks the origin.
    pub fn cancel_job(&self, job_id: JobId, signal: u16, uid: u32) -> Result<()> {
        if self.ctx.is_origin(job_id) {
            return self.cancel_at_origin(job_id, signal, uid);
        }
        self.ctx.metadata(job_id)?;
        if let Some(origin) = job_id.origin() {
            self.ctx.rpc.enqueue(origin, MessageBody::JobCancel { job_id, signal, uid });
        }
        debug!(%job_id, signal, "cancel forwarded to origin");
        Ok(())
    }

    /// User update of a pending job.
    pub fn update_job(&self, job_id: JobId, update: JobUpdate, uid: u32) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        if !self.ctx.is_origin(job_id) {
            let record = self.ctx.jobs.get(job_id).ok_or_else(|| JobNotFoundSnafu { job_id }.build())?;
            if !record.state.is_pending() {
                return JobNotPendingSnafu {
                    job_id,
                    state: record.state,
                }
                .fail();
            }
            if let Some(origin) = job_id.origin() {
                self.ctx.rpc.enqueue(origin, MessageBody::UpdateJob { job_id, update, uid });
            }
            return Ok(());
        }

        self.apply_job_update_locally(job_id, &update)?;
        self.fan_out_update(job_id, &update, uid);
        info!(%job_id, uid, "federated job updated");
        Ok(())
    }

    /// Remove a job from federation bookkeeping.
    pub fn purge_job(&self, job_id: JobId) {
        self.ctx.jobs.purge(job_id);
        self.ctx.index.remove(job_id);
        self.dependencies.forget_job(job_id);
        debug!(%job_id, "federated job purged");
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Replace the federation membership.
    pub fn apply_membership(&self, descriptor: FederationDescriptor) -> Result<MembershipChange> {
        let change = self.ctx.federation.apply_membership(descriptor)?;

        for cluster in &change.removed {
            let touched = self.ctx.index.remove_cluster_from_all(*cluster);
            self.ctx.rpc.remove_sibling(*cluster);
            self.ctx.connections.remove(*cluster);
            self.dependencies.remove_cluster(*cluster);
            info!(%cluster, jobs = touched.len(), "sibling left the federation");
        }

        if !change.removed.is_empty() {
            let now_ms = now_unix_ms();
            for entry in self.ctx.index.snapshot() {
                if !entry.metadata.viable().is_empty() {
                    continue;
                }
                let job_id = entry.job_id;
                let cancelled = self.ctx.jobs.update(job_id, &mut |record| {
                    if !record.state.is_terminal() {
                        record.state = JobState::Cancelled;
                        record.end_time_ms = Some(now_ms);
                    }
                });
                if let Err(err) = cancelled {
                    debug!(%job_id, error = %err, "job without viable cluster already gone");
                }
                self.ctx.index.remove(job_id);
                self.dependencies.forget_job(job_id);
                warn!(%job_id, "no viable cluster left, job cancelled");
            }
        }

        for cluster in &change.added {
            debug!(%cluster, "sibling joined the federation");
        }
        Ok(change)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn local_id(&self) -> ClusterId {
        self.ctx.local_id()
    }

    pub fn clusters(&self) -> Vec<ClusterDescriptor> {
        self.ctx.federation.clusters()
    }

    pub fn cluster_features(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.ctx.federation.cluster_features()
    }

    pub fn sibling_by_name(&self, name: &str) -> Result<ClusterDescriptor> {
        self.ctx.federation.sibling_by_name(name)
    }

    pub fn job_metadata(&self, job_id: JobId) -> Option<FederationMetadata> {
        self.ctx.index.get(job_id)
    }

    pub fn job(&self, job_id: JobId) -> Option<JobRecord> {
        self.ctx.jobs.get(job_id)
    }

    pub fn context(&self) -> &Arc<FederationContext> {
        &self.ctx
    }

    pub fn dependencies(&self) -> &Arc<DependencyResolver> {
        &self.dependencies
    }

    pub fn locks(&self) -> &Arc<JobLockService> {
        &self.locks
    }

    /// Inbound updates waiting for the processor.
    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }
}

#[async_trait]
impl MessageHandler for FederationManager {
    fn accept_inbound(&self, sender: ClusterId, cluster_name: &str, protocol_version: u16) -> Result<InboundSession> {
        let registration = self.ctx.connections.add_inbound(sender, cluster_name, protocol_version)?;
        if registration.needs_sync {
            self.reconcile.sync_if_needed(sender);
        }
        Ok(InboundSession {
            ack: FederationReply::HelloAck {
                cluster_name: self.ctx.federation.local_name(),
                protocol_version: PROTOCOL_VERSION,
            },
            closed: registration.closed,
        })
    }

    async fn handle_message(&self, message: FederationMessage) -> FederationReply {
        let sender = message.sender;
        if sender == self.ctx.local_id() || !self.ctx.federation.contains(sender) {
            let err: FederationError = UnknownClusterSnafu { id: sender.value() }.build();
            warn!(cluster = %sender, kind = message.body.kind(), "message from unknown cluster");
            return FederationReply::from_error(&err);
        }

        match message.body {
            MessageBody::Batch(bodies) => {
                FederationReply::Batch(bodies.into_iter().map(|body| self.reply(sender, body)).collect())
            }
            body => self.reply(sender, body),
        }
    }
}

/// Prefer a saved membership that is newer than the configured one.
fn choose_descriptor(
    configured: &FederationDescriptor,
    saved: Option<FederationDescriptor>,
    local: ClusterId,
) -> FederationDescriptor {
    match saved {
        Some(saved) if saved.generation > configured.generation && saved.cluster(local).is_some() => {
            info!(generation = saved.generation, "using saved federation membership");
            saved
        }
        _ => configured.clone(),
    }
}

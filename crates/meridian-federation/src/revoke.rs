//! Revocation of sibling copies once a job starts.
//!
//! When a federated job starts on one cluster, the origin tells every other
//! active sibling to drop its pending copy. The origin keeps its own copy as
//! a revoked tracking record that mirrors the remote state, so users can
//! still query the job where they submitted it.

use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::context::FederationContext;
use crate::error::Result;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::JobState;
use crate::types::SiblingMask;
use crate::wire::JobOutcome;
use crate::wire::MessageBody;

/// What happened to the local copy on a revoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeApplied {
    /// Non-origin copy removed.
    Purged,
    /// Origin copy kept as a tracking record.
    Tracked,
    /// The job was unknown locally.
    AlreadyGone,
    /// The local copy is running and was left alone.
    KeptRunning,
}

/// Sends and applies revocations.
#[derive(Debug)]
pub struct RevocationPropagator {
    ctx: Arc<FederationContext>,
}

impl RevocationPropagator {
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self { ctx }
    }

    /// Record that `winner` started the job and revoke every other copy.
    ///
    /// `notifier` is the cluster that reported the start; it already knows
    /// and is not sent a revoke. Returns the clusters a revoke was queued for.
    pub fn propagate_start(
        &self,
        job_id: JobId,
        winner: ClusterId,
        notifier: ClusterId,
        start_time_ms: u64,
    ) -> Result<Vec<ClusterId>> {
        let local = self.ctx.local_id();
        let meta = self.ctx.metadata(job_id)?;

        let targets: Vec<ClusterId> = if meta.viable().count() <= 1 {
            Vec::new()
        } else {
            meta.active().without(winner).without(notifier).without(local).iter().collect()
        };

        self.ctx.index.update(job_id, |meta| {
            if meta.viable().count() <= 1 {
                meta.standalone = true;
            }
            meta.set_lock(winner);
            meta.set_active(SiblingMask::single(winner));
            if winner != local {
                meta.revoked = true;
            }
        });

        let outcome = JobOutcome {
            job_id,
            state: JobState::Cancelled,
            return_code: 0,
            start_time_ms,
        };
        for target in &targets {
            self.ctx.rpc.enqueue(*target, MessageBody::JobRevoke(outcome.clone()));
        }

        if winner != local && self.ctx.is_origin(job_id) {
            let updated = self.ctx.jobs.update(job_id, &mut |record| {
                record.revoked = true;
                record.running_cluster = Some(winner);
                if record.state.is_pending() {
                    record.state = JobState::Running;
                    record.start_time_ms = Some(start_time_ms);
                }
            });
            if let Err(err) = updated {
                warn!(%job_id, error = %err, "origin copy missing while tracking remote start");
            }
        }

        info!(%job_id, %winner, revoked = ?targets, "job started, sibling copies revoked");
        Ok(targets)
    }

    /// Apply a `JobRevoke` from `sender`. Applying the same revoke twice is harmless.
    pub fn handle_revoke(&self, sender: ClusterId, outcome: &JobOutcome) -> RevokeApplied {
        let job_id = outcome.job_id;
        let Some(record) = self.ctx.jobs.get(job_id) else {
            self.ctx.index.remove(job_id);
            debug!(%job_id, %sender, "revoke for unknown job");
            return RevokeApplied::AlreadyGone;
        };

        if self.ctx.is_origin(job_id) {
            let state = outcome.state;
            let updated = self.ctx.jobs.update(job_id, &mut |record| {
                record.revoked = true;
                record.running_cluster.get_or_insert(sender);
                record.state = state;
                if outcome.start_time_ms > 0 {
                    record.start_time_ms = Some(outcome.start_time_ms);
                }
                if state.is_terminal() {
                    record.exit_code = outcome.return_code;
                }
            });
            if updated.is_err() {
                return RevokeApplied::AlreadyGone;
            }
            self.ctx.index.update(job_id, |meta| meta.revoked = true);
            debug!(%job_id, %sender, %state, "origin copy tracks remote state");
            return RevokeApplied::Tracked;
        }

        if record.state.is_started() && !record.revoked {
            warn!(%job_id, %sender, "revoke for a running copy ignored");
            return RevokeApplied::KeptRunning;
        }

        self.ctx.jobs.purge(job_id);
        self.ctx.index.remove(job_id);
        info!(%job_id, %sender, "sibling copy revoked");
        RevokeApplied::Purged
    }

    /// Reset origin bookkeeping before a requeued job is offered again.
    pub fn prepare_requeue(&self, job_id: JobId) -> Result<()> {
        self.ctx.metadata(job_id)?;
        self.ctx.index.update(job_id, |meta| {
            meta.clear_lock();
            meta.set_active(SiblingMask::empty());
            meta.revoked = false;
            meta.standalone = false;
        });
        self.ctx.jobs.update(job_id, &mut |record| {
            record.state = JobState::Pending;
            record.revoked = false;
            record.running_cluster = None;
            record.start_time_ms = None;
            record.end_time_ms = None;
            record.tracking_only = false;
        })?;
        debug!(%job_id, "job reset for requeue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::JobDescription;
    use crate::job_store::JobRecord;
    use crate::testing::cid;
    use crate::testing::context;
    use crate::transport::memory::MemoryNetwork;
    use crate::types::FederationMetadata;

    fn setup(local: u32, job_id: JobId) -> (Arc<FederationContext>, RevocationPropagator) {
        let network = MemoryNetwork::new();
        let ctx = context(&network, &[1, 2, 3], local);
        let viable: SiblingMask = [cid(1), cid(2), cid(3)].into_iter().collect();
        let mut meta = FederationMetadata::new(job_id.origin().unwrap(), viable, 0);
        meta.set_active(viable);
        ctx.index.insert(job_id, meta);
        ctx.jobs.insert(JobRecord::new(job_id, JobDescription::default(), 0)).unwrap();
        let revoke = RevocationPropagator::new(ctx.clone());
        (ctx, revoke)
    }

    #[test]
    fn test_start_revokes_other_active_siblings() {
        let job = JobId::new(cid(1), 1).unwrap();
        let (ctx, revoke) = setup(1, job);

        let targets = revoke.propagate_start(job, cid(2), cid(2), 1_000).unwrap();
        assert_eq!(targets, vec![cid(3)]);
        assert_eq!(ctx.rpc.pending_for(cid(3)), 1);
        assert_eq!(ctx.rpc.pending_for(cid(2)), 0);

        let meta = ctx.index.get(job).unwrap();
        assert_eq!(meta.active(), SiblingMask::single(cid(2)));
        assert_eq!(meta.cluster_lock(), Some(cid(2)));

        let record = ctx.jobs.get(job).unwrap();
        assert!(record.revoked);
        assert_eq!(record.running_cluster, Some(cid(2)));
        assert_eq!(record.state, JobState::Running);
    }

    #[test]
    fn test_local_start_keeps_origin_copy() {
        let job = JobId::new(cid(1), 1).unwrap();
        let (ctx, revoke) = setup(1, job);
        let targets = revoke.propagate_start(job, cid(1), cid(1), 1_000).unwrap();
        assert_eq!(targets, vec![cid(2), cid(3)]);
        assert!(!ctx.jobs.get(job).unwrap().revoked);
        assert!(!ctx.index.get(job).unwrap().revoked);
    }

    #[test]
    fn test_revoke_is_idempotent_on_sibling() {
        let job = JobId::new(cid(1), 1).unwrap();
        let (ctx, revoke) = setup(3, job);
        let outcome = JobOutcome {
            job_id: job,
            state: JobState::Cancelled,
            return_code: 0,
            start_time_ms: 5,
        };
        assert_eq!(revoke.handle_revoke(cid(1), &outcome), RevokeApplied::Purged);
        assert!(ctx.jobs.get(job).is_none());
        assert!(!ctx.index.contains(job));
        assert_eq!(revoke.handle_revoke(cid(1), &outcome), RevokeApplied::AlreadyGone);
    }

    #[test]
    fn test_revoke_at_origin_tracks_remote_state() {
        let job = JobId::new(cid(1), 1).unwrap();
        let (ctx, revoke) = setup(1, job);
        let outcome = JobOutcome {
            job_id: job,
            state: JobState::Running,
            return_code: 0,
            start_time_ms: 42,
        };
        assert_eq!(revoke.handle_revoke(cid(2), &outcome), RevokeApplied::Tracked);
        assert_eq!(revoke.handle_revoke(cid(2), &outcome), RevokeApplied::Tracked);
        let record = ctx.jobs.get(job).unwrap();
        assert!(record.revoked);
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.start_time_ms, Some(42));
        assert_eq!(record.running_cluster, Some(cid(2)));
    }

    #[test]
    fn test_running_copy_not_purged() {
        let job = JobId::new(cid(1), 1).unwrap();
        let (ctx, revoke) = setup(2, job);
        ctx.jobs.update(job, &mut |record| record.state = JobState::Running).unwrap();
        let outcome = JobOutcome {
            job_id: job,
            state: JobState::Cancelled,
            return_code: 0,
            start_time_ms: 0,
        };
        assert_eq!(revoke.handle_revoke(cid(1), &outcome), RevokeApplied::KeptRunning);
        assert!(ctx.jobs.get(job).is_some());
    }

    #[test]
    fn test_requeue_resets_origin() {
        let job = JobId::new(cid(1), 1).unwrap();
        let (ctx, revoke) = setup(1, job);
        revoke.propagate_start(job, cid(2), cid(2), 1_000).unwrap();
        revoke.prepare_requeue(job).unwrap();
        let meta = ctx.index.get(job).unwrap();
        assert_eq!(meta.cluster_lock(), None);
        assert!(meta.active().is_empty());
        let record = ctx.jobs.get(job).unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert!(!record.revoked);
    }
}

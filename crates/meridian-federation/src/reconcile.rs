//! Reconciliation after a sibling (re)connects.
//!
//! Either side may ask the other for a listing of every federated job it is
//! origin of or viable for. The receiver compares that listing with its own
//! index job by job and applies the corrective actions decided in
//! [`crate::pure::reconcile`]. Jobs submitted locally after the peer took its
//! snapshot are skipped; the peer could not have known about them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::constants::MAX_SYNC_JOBS;
use crate::constants::SIGKILL;
use crate::context::FederationContext;
use crate::error::Result;
use crate::pure::reconcile::LocalJobView;
use crate::pure::reconcile::ReconcileAction;
use crate::pure::reconcile::RemoteJobView;
use crate::pure::reconcile::decide;
use crate::revoke::RevocationPropagator;
use crate::revoke::RevokeApplied;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::now_unix_ms;
use crate::wire::JobOutcome;
use crate::wire::MessageBody;
use crate::wire::SyncJobInfo;
use crate::wire::SyncJobListing;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Local jobs compared with the listing.
    pub examined: usize,
    /// Non-trivial actions taken.
    pub actions: Vec<(JobId, ReconcileAction)>,
    /// Local copies removed; dependency state for them should be dropped.
    pub removed: Vec<JobId>,
}

/// Builds and applies sync listings.
#[derive(Debug)]
pub struct ReconciliationEngine {
    ctx: Arc<FederationContext>,
    revoke: Arc<RevocationPropagator>,
}

impl ReconciliationEngine {
    pub fn new(ctx: Arc<FederationContext>, revoke: Arc<RevocationPropagator>) -> Self {
        Self { ctx, revoke }
    }

    /// Ask `peer` for its listing. The reply arrives later as `SyncJobs`.
    fn request_sync(&self, peer: ClusterId) -> bool {
        debug!(cluster = %peer, last_sync_ms = self.ctx.federation.last_sync_ms(peer), "requesting job sync");
        self.ctx.rpc.enqueue(peer, MessageBody::SyncRequest)
    }

    /// Request a sync from `peer` unless it is synced or one is already
    /// outstanding.
    pub fn sync_if_needed(&self, peer: ClusterId) -> bool {
        if !self.ctx.federation.begin_sync(peer, now_unix_ms()) {
            return false;
        }
        if !self.request_sync(peer) {
            self.ctx.federation.mark_unsynced(peer);
            return false;
        }
        true
    }

    /// Listing of every federated job `requester` is origin of or viable for.
    pub fn build_listing(&self, requester: ClusterId) -> SyncJobListing {
        let snapshot_ms = now_unix_ms();
        let mut jobs = Vec::new();
        for entry in self.ctx.index.snapshot() {
            if jobs.len() >= MAX_SYNC_JOBS {
                warn!(cluster = %requester, limit = MAX_SYNC_JOBS, "sync listing truncated");
                break;
            }
            let meta = &entry.metadata;
            if meta.origin() != requester && !meta.viable().contains(requester) {
                continue;
            }
            let Some(record) = self.ctx.jobs.get(entry.job_id) else {
                continue;
            };
            jobs.push(SyncJobInfo {
                job_id: entry.job_id,
                state: record.state,
                revoked: record.revoked,
                start_time_ms: record.start_time_ms,
                exit_code: record.exit_code,
                cluster_lock: meta.cluster_lock(),
                running_cluster: record.running_cluster,
            });
        }
        SyncJobListing {
            cluster: self.ctx.local_id(),
            snapshot_ms,
            jobs,
        }
    }

    /// Reconcile local state with `peer`'s listing.
    pub fn apply_listing(&self, peer: ClusterId, listing: &SyncJobListing) -> Result<ReconcileReport> {
        let remote: HashMap<JobId, &SyncJobInfo> = listing.jobs.iter().map(|info| (info.job_id, info)).collect();
        let mut report = ReconcileReport::default();

        for entry in self.ctx.index.snapshot() {
            let job_id = entry.job_id;
            let meta = entry.metadata;
            let is_origin = meta.origin() == self.ctx.local_id();

            let relevant = if is_origin {
                meta.viable().contains(peer)
            } else {
                meta.origin() == peer || meta.viable().contains(peer)
            };
            if !relevant || meta.submit_time_ms > listing.snapshot_ms {
                continue;
            }
            let Some(record) = self.ctx.jobs.get(job_id) else {
                continue;
            };

            report.examined += 1;
            let local = LocalJobView {
                is_origin,
                origin: meta.origin(),
                state: record.state,
                revoked: record.revoked,
                cluster_lock: meta.cluster_lock(),
                peer_active: meta.active().contains(peer),
            };
            let remote_view = remote.get(&job_id).map(|info| RemoteJobView {
                state: info.state,
                revoked: info.revoked,
                start_time_ms: info.start_time_ms,
                exit_code: info.exit_code,
            });

            let action = decide(&local, remote_view.as_ref(), peer);
            if action == ReconcileAction::None {
                continue;
            }
            if self.apply_action(peer, job_id, action)? {
                report.removed.push(job_id);
            }
            report.actions.push((job_id, action));
        }

        self.ctx.federation.mark_synced(peer, listing.snapshot_ms);
        info!(
            cluster = %peer,
            examined = report.examined,
            actions = report.actions.len(),
            "reconciled jobs with sibling"
        );
        Ok(report)
    }

    /// Apply one action; returns true when the local copy was removed.
    fn apply_action(&self, peer: ClusterId, job_id: JobId, action: ReconcileAction) -> Result<bool> {
        debug!(%job_id, cluster = %peer, ?action, "reconcile action");
        match action {
            ReconcileAction::None => Ok(false),
            ReconcileAction::CancelLocal => {
                self.ctx.jobs.purge(job_id);
                self.ctx.index.remove(job_id);
                info!(%job_id, cluster = %peer, "stale sibling copy cancelled");
                Ok(true)
            }
            ReconcileAction::RevokeLocal { state, start_time_ms } => {
                let outcome = JobOutcome {
                    job_id,
                    state,
                    return_code: 0,
                    start_time_ms,
                };
                Ok(self.revoke.handle_revoke(peer, &outcome) == RevokeApplied::Purged)
            }
            ReconcileAction::CompleteFromPeer {
                state,
                exit_code,
                start_time_ms,
            } => {
                let end_time_ms = now_unix_ms();
                self.ctx.jobs.update(job_id, &mut |record| {
                    record.state = state;
                    record.exit_code = exit_code;
                    record.revoked = true;
                    record.running_cluster = Some(peer);
                    record.end_time_ms = Some(end_time_ms);
                    if start_time_ms > 0 {
                        record.start_time_ms = Some(start_time_ms);
                    }
                })?;
                self.ctx.index.update(job_id, |meta| {
                    meta.clear_lock();
                    meta.remove_active(peer);
                    meta.revoked = true;
                });
                info!(%job_id, cluster = %peer, %state, "job finished on sibling while disconnected");
                Ok(false)
            }
            ReconcileAction::ClearPeerActive => {
                self.ctx.index.update(job_id, |meta| meta.remove_active(peer));
                Ok(false)
            }
            ReconcileAction::GrantLockToPeer { start_time_ms } => {
                warn!(%job_id, cluster = %peer, "sibling started job without a recorded lock, granting");
                self.revoke.propagate_start(job_id, peer, peer, start_time_ms)?;
                Ok(false)
            }
            ReconcileAction::RevokePeer => {
                error!(%job_id, cluster = %peer, "job running on a sibling that does not hold the lock, killing it");
                self.ctx.rpc.enqueue(peer, MessageBody::JobCancel {
                    job_id,
                    signal: SIGKILL,
                    uid: 0,
                });
                Ok(false)
            }
        }
    }
}

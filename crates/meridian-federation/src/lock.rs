//! Distributed job lock.
//!
//! A federated job may only start on the cluster holding its cluster lock.
//! The origin is the lock authority. When the origin cannot be reached but
//! the accounting backend can, a sibling falls back to asking every other
//! viable sibling; it takes the lock only if all of them agree.
//!
//! Two siblings running the fallback for the same job at once are resolved
//! by cluster id: the lower id refuses the higher one's request, so at most
//! one of them collects every vote.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::context::FederationContext;
use crate::error::FederationError;
use crate::error::LockHeldSnafu;
use crate::error::LockRefusedSnafu;
use crate::error::NotFederatedSnafu;
use crate::error::NotViableSnafu;
use crate::error::OriginUnreachableSnafu;
use crate::error::PendingUpdatesSnafu;
use crate::error::Result;
use crate::error::UnexpectedReplySnafu;
use crate::pure::lock::FallbackOutcome;
use crate::pure::lock::LockDecision;
use crate::pure::lock::LockDenial;
use crate::pure::lock::decide_lock_grant;
use crate::pure::lock::fallback_outcome;
use crate::pure::lock::refuse_competing_fallback;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::SiblingMask;
use crate::types::now_unix_ms;
use crate::wire::FederationReply;
use crate::wire::MessageBody;

/// Grants, refuses and releases cluster locks.
#[derive(Debug)]
pub struct JobLockService {
    ctx: Arc<FederationContext>,
    /// Jobs this cluster is currently acquiring through the fallback.
    acquiring: Mutex<HashSet<JobId>>,
}

/// Removes a job from the acquiring set when the fallback round ends.
struct AcquiringGuard<'a> {
    acquiring: &'a Mutex<HashSet<JobId>>,
    job_id: JobId,
}

impl Drop for AcquiringGuard<'_> {
    fn drop(&mut self) {
        self.acquiring.lock().remove(&self.job_id);
    }
}

impl JobLockService {
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self {
            ctx,
            acquiring: Mutex::new(HashSet::new()),
        }
    }

    /// Answer a sibling's `JobLock` request.
    pub fn handle_lock_request(&self, job_id: JobId, requester: ClusterId) -> FederationReply {
        let result = if self.ctx.is_origin(job_id) {
            self.grant_as_origin(job_id, requester)
        } else {
            self.vote_as_sibling(job_id, requester)
        };
        match result {
            Ok(epoch) => FederationReply::LockGranted { epoch },
            Err(FederationError::LockHeld { holder, .. }) => FederationReply::LockDenied {
                holder: Some(holder),
                reason: "lock held by another cluster".into(),
            },
            Err(err @ (FederationError::PendingUpdates { .. } | FederationError::LockRefused { .. })) => {
                FederationReply::LockDenied {
                    holder: None,
                    reason: err.to_string(),
                }
            }
            Err(err) => FederationReply::from_error(&err),
        }
    }

    /// Answer a sibling's `JobUnlock` request. Only the holder may release.
    pub fn handle_unlock_request(&self, job_id: JobId, requester: ClusterId) -> FederationReply {
        let released = self.ctx.index.update(job_id, |meta| match meta.cluster_lock() {
            Some(holder) if holder == requester => {
                meta.clear_lock();
                Ok(())
            }
            None => Ok(()),
            Some(holder) => Err(holder),
        });
        match released {
            // Unknown job: nothing to release.
            None | Some(Ok(())) => FederationReply::Ack,
            Some(Err(holder)) => {
                debug!(%job_id, %requester, %holder, "unlock from non-holder ignored");
                FederationReply::from_error(&FederationError::LockHeld { job_id, holder })
            }
        }
    }

    /// Origin-side grant decision, also used when the origin itself starts a job.
    fn grant_as_origin(&self, job_id: JobId, requester: ClusterId) -> Result<u64> {
        let now_ms = now_unix_ms();
        let stale_ms = self.ctx.timing.pending_update_stale_ms;
        let decision = self.ctx.index.update(job_id, |meta| {
            let decision =
                decide_lock_grant(meta.cluster_lock(), meta.viable(), meta.newest_pending(), requester, now_ms, stale_ms);
            match decision {
                LockDecision::Grant => {
                    meta.set_lock(requester);
                    Ok(meta.lock_epoch)
                }
                LockDecision::GrantAfterClearingStale => {
                    let cleared = meta.clear_stale_pending(now_ms, stale_ms);
                    debug!(%job_id, ?cleared, "cleared stale pending update counters");
                    meta.set_lock(requester);
                    Ok(meta.lock_epoch)
                }
                LockDecision::Deny(denial) => Err(denial),
            }
        });

        match decision {
            None => NotFederatedSnafu { job_id }.fail(),
            Some(Ok(epoch)) => {
                debug!(%job_id, %requester, epoch, "cluster lock granted");
                Ok(epoch)
            }
            Some(Err(LockDenial::HeldElsewhere(holder))) => LockHeldSnafu { job_id, holder }.fail(),
            Some(Err(LockDenial::PendingUpdate(cluster))) => PendingUpdatesSnafu { job_id, cluster }.fail(),
            Some(Err(LockDenial::NotViable)) => NotViableSnafu {
                job_id,
                cluster: requester,
            }
            .fail(),
        }
    }

    /// Non-origin vote in another sibling's ask-everyone round.
    fn vote_as_sibling(&self, job_id: JobId, requester: ClusterId) -> Result<u64> {
        let local = self.ctx.local_id();
        if self.acquiring.lock().contains(&job_id) && refuse_competing_fallback(local, requester) {
            return LockRefusedSnafu {
                job_id,
                cluster: local,
                reason: "competing fallback in progress",
            }
            .fail();
        }

        if self.ctx.jobs.get(job_id).is_some_and(|job| job.state.is_started() && !job.revoked) {
            return LockHeldSnafu { job_id, holder: local }.fail();
        }

        let vote = self.ctx.index.update(job_id, |meta| match meta.cluster_lock() {
            Some(holder) if holder != requester => Err(holder),
            _ => {
                meta.set_lock(requester);
                Ok(meta.lock_epoch)
            }
        });
        match vote {
            // No local copy, so nothing here can conflict.
            None => Ok(0),
            Some(Ok(epoch)) => {
                info!(%job_id, %requester, "agreed to fallback lock request");
                Ok(epoch)
            }
            Some(Err(holder)) => LockHeldSnafu { job_id, holder }.fail(),
        }
    }

    /// Acquire the lock for a local start. Returns the lock epoch.
    #[instrument(skip(self), fields(local = %self.ctx.local_id()))]
    pub async fn acquire(&self, job_id: JobId) -> Result<u64> {
        let local = self.ctx.local_id();
        let meta = self.ctx.metadata(job_id)?;
        if !meta.viable().contains(local) {
            return NotViableSnafu { job_id, cluster: local }.fail();
        }
        if meta.cluster_lock() == Some(local) {
            return Ok(meta.lock_epoch);
        }

        let origin = meta.origin();
        if origin == local {
            return self.grant_as_origin(job_id, local);
        }
        if let Some(holder) = meta.cluster_lock() {
            return LockHeldSnafu { job_id, holder }.fail();
        }

        let request = MessageBody::JobLock { job_id, cluster: local };
        match self.ctx.connections.call(origin, request).await {
            Ok(FederationReply::LockGranted { epoch }) => {
                self.ctx.index.update(job_id, |meta| {
                    meta.set_lock(local);
                    meta.lock_epoch = epoch;
                });
                debug!(%job_id, epoch, "cluster lock granted by origin");
                Ok(epoch)
            }
            Ok(FederationReply::LockDenied {
                holder: Some(holder), ..
            }) => LockHeldSnafu { job_id, holder }.fail(),
            Ok(FederationReply::LockDenied { holder: None, reason }) => LockRefusedSnafu {
                job_id,
                cluster: origin,
                reason,
            }
            .fail(),
            Ok(other) => UnexpectedReplySnafu {
                operation: "job_lock",
                reply: format!("{other:?}"),
            }
            .fail(),
            Err(err) if origin_unreachable(&err) => self.acquire_by_fallback(job_id, origin, meta.viable(), &err).await,
            Err(err) => Err(err),
        }
    }

    async fn acquire_by_fallback(
        &self,
        job_id: JobId,
        origin: ClusterId,
        viable: SiblingMask,
        cause: &FederationError,
    ) -> Result<u64> {
        let local = self.ctx.local_id();
        if !self.ctx.accounting.is_reachable().await {
            warn!(%job_id, %origin, error = %cause, "origin and accounting both unreachable, not starting");
            return OriginUnreachableSnafu {
                job_id,
                origin,
                reason: "accounting backend also unreachable",
            }
            .fail();
        }

        if !self.acquiring.lock().insert(job_id) {
            return OriginUnreachableSnafu {
                job_id,
                origin,
                reason: "fallback already in progress",
            }
            .fail();
        }
        let _guard = AcquiringGuard {
            acquiring: &self.acquiring,
            job_id,
        };

        let voters = viable.without(local).without(origin);
        info!(%job_id, %origin, voters = %voters, "origin unreachable, asking every viable sibling");

        let votes = join_all(voters.iter().map(|sibling| async move {
            let request = MessageBody::JobLock { job_id, cluster: local };
            let granted = match self.ctx.connections.call(sibling, request).await {
                Ok(FederationReply::LockGranted { .. }) => true,
                Ok(reply) => {
                    debug!(%job_id, %sibling, ?reply, "sibling refused fallback lock");
                    false
                }
                Err(err) => {
                    debug!(%job_id, %sibling, error = %err, "sibling unreachable during fallback");
                    false
                }
            };
            (sibling, granted)
        }))
        .await;

        match fallback_outcome(&votes) {
            FallbackOutcome::Granted => {
                let epoch = self
                    .ctx
                    .index
                    .update(job_id, |meta| {
                        meta.set_lock(local);
                        meta.lock_epoch
                    })
                    .unwrap_or(0);
                info!(%job_id, epoch, "cluster lock acquired through fallback");
                Ok(epoch)
            }
            FallbackOutcome::Refused { release, refused_by } => {
                for sibling in release {
                    self.ctx.rpc.enqueue(sibling, MessageBody::JobUnlock { job_id, cluster: local });
                }
                LockRefusedSnafu {
                    job_id,
                    cluster: refused_by,
                    reason: "fallback lock refused",
                }
                .fail()
            }
        }
    }

    /// Release a lock held by the local cluster.
    pub fn release(&self, job_id: JobId) -> Result<()> {
        let local = self.ctx.local_id();
        let held = self
            .ctx
            .index
            .update(job_id, |meta| {
                if meta.cluster_lock() == Some(local) {
                    meta.clear_lock();
                    true
                } else {
                    false
                }
            })
            .ok_or(FederationError::NotFederated { job_id })?;

        if held && !self.ctx.is_origin(job_id) {
            if let Some(origin) = job_id.origin() {
                self.ctx.rpc.enqueue(origin, MessageBody::JobUnlock { job_id, cluster: local });
            }
        }
        Ok(())
    }

    /// Whether a fallback round for `job_id` is running here.
    pub fn is_acquiring(&self, job_id: JobId) -> bool {
        self.acquiring.lock().contains(&job_id)
    }
}

/// The origin could not be reached at all, as opposed to answering with an error.
fn origin_unreachable(err: &FederationError) -> bool {
    matches!(
        err,
        FederationError::ConnectFailed { .. }
            | FederationError::Timeout { .. }
            | FederationError::LinkClosed { .. }
            | FederationError::Io { .. }
    )
}

//! Per-job reconciliation decisions.
//!
//! After reconnecting to a sibling, each local federated job is compared
//! with the sibling's view of the same job. The decision favours
//! convergence: a job that may legitimately be running is never killed,
//! but two clusters are never left both believing they run a job without
//! one side being revoked.

use crate::types::ClusterId;
use crate::types::JobState;

/// What this cluster knows about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalJobView {
    /// The local cluster is the job's origin.
    pub is_origin: bool,
    pub origin: ClusterId,
    pub state: JobState,
    /// Origin tracking copy (the job runs or ran elsewhere).
    pub revoked: bool,
    pub cluster_lock: Option<ClusterId>,
    /// The peer's bit is set in the active mask.
    pub peer_active: bool,
}

/// What the peer reported about the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteJobView {
    pub state: JobState,
    /// The peer's copy is a revoked tracking record.
    pub revoked: bool,
    pub start_time_ms: Option<u64>,
    pub exit_code: i32,
}

impl RemoteJobView {
    /// The peer itself runs the job.
    pub fn peer_runs(&self) -> bool {
        self.state.is_started() && !self.revoked
    }

    /// The peer ran the job to a terminal state itself.
    pub fn peer_finished(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed) && !self.revoked && self.start_time_ms.is_some()
    }
}

/// Corrective action for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Views agree or nothing can safely be done.
    None,
    /// Cancel the local copy as a stale artifact.
    CancelLocal,
    /// Revoke the local copy: the job started elsewhere.
    RevokeLocal { state: JobState, start_time_ms: u64 },
    /// Origin: the peer ran the job; record it as finished.
    CompleteFromPeer { state: JobState, exit_code: i32, start_time_ms: u64 },
    /// Origin: the peer has no live copy; clear its active bit.
    ClearPeerActive,
    /// Origin: the peer runs the job without a recorded lock; grant it
    /// retroactively and revoke every other sibling.
    GrantLockToPeer { start_time_ms: u64 },
    /// Origin: the peer runs the job but another cluster holds the lock.
    RevokePeer,
}

/// Decide how to reconcile one job with `peer`'s report.
///
/// `remote` is `None` when the peer's listing does not contain the job.
pub fn decide(local: &LocalJobView, remote: Option<&RemoteJobView>, peer: ClusterId) -> ReconcileAction {
    if local.state.is_terminal() {
        return ReconcileAction::None;
    }

    let Some(remote) = remote else {
        return decide_missing(local, peer);
    };

    if local.is_origin {
        decide_as_origin(local, remote, peer)
    } else {
        decide_as_sibling(local, remote, peer)
    }
}

fn decide_missing(local: &LocalJobView, peer: ClusterId) -> ReconcileAction {
    if local.is_origin {
        if local.peer_active && local.cluster_lock == Some(peer) {
            return ReconcileAction::CompleteFromPeer {
                state: JobState::Completed,
                exit_code: 0,
                start_time_ms: 0,
            };
        }
        if local.peer_active {
            return ReconcileAction::ClearPeerActive;
        }
        return ReconcileAction::None;
    }

    // The origin no longer knows the job. A running copy is left to finish.
    if local.origin == peer && local.state.is_pending() {
        return ReconcileAction::CancelLocal;
    }
    ReconcileAction::None
}

fn decide_as_origin(local: &LocalJobView, remote: &RemoteJobView, peer: ClusterId) -> ReconcileAction {
    if remote.peer_runs() {
        let start_time_ms = remote.start_time_ms.unwrap_or(0);
        return match local.cluster_lock {
            None => ReconcileAction::GrantLockToPeer { start_time_ms },
            Some(holder) if holder == peer => {
                if local.revoked && local.state == remote.state {
                    ReconcileAction::None
                } else {
                    ReconcileAction::RevokeLocal {
                        state: remote.state,
                        start_time_ms,
                    }
                }
            }
            Some(_) => ReconcileAction::RevokePeer,
        };
    }

    if remote.peer_finished() && local.cluster_lock == Some(peer) {
        return ReconcileAction::CompleteFromPeer {
            state: remote.state,
            exit_code: remote.exit_code,
            start_time_ms: remote.start_time_ms.unwrap_or(0),
        };
    }

    if remote.state.is_terminal() && local.peer_active {
        return ReconcileAction::ClearPeerActive;
    }

    ReconcileAction::None
}

fn decide_as_sibling(local: &LocalJobView, remote: &RemoteJobView, peer: ClusterId) -> ReconcileAction {
    if !local.state.is_pending() || local.revoked {
        return ReconcileAction::None;
    }

    match remote.state {
        JobState::Cancelled => ReconcileAction::CancelLocal,
        JobState::Running | JobState::Suspended => ReconcileAction::RevokeLocal {
            state: JobState::Cancelled,
            start_time_ms: remote.start_time_ms.unwrap_or(0),
        },
        JobState::Completed | JobState::Failed => {
            if local.origin == peer {
                ReconcileAction::CancelLocal
            } else {
                ReconcileAction::RevokeLocal {
                    state: JobState::Cancelled,
                    start_time_ms: remote.start_time_ms.unwrap_or(0),
                }
            }
        }
        JobState::Pending => ReconcileAction::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(id: u32) -> ClusterId {
        ClusterId::new(id).unwrap()
    }

    fn origin_view(state: JobState, lock: Option<ClusterId>, peer_active: bool) -> LocalJobView {
        LocalJobView {
            is_origin: true,
            origin: cid(1),
            state,
            revoked: false,
            cluster_lock: lock,
            peer_active,
        }
    }

    fn sibling_view(state: JobState) -> LocalJobView {
        LocalJobView {
            is_origin: false,
            origin: cid(1),
            state,
            revoked: false,
            cluster_lock: None,
            peer_active: false,
        }
    }

    fn remote(state: JobState, start: Option<u64>) -> RemoteJobView {
        RemoteJobView {
            state,
            revoked: false,
            start_time_ms: start,
            exit_code: 0,
        }
    }

    #[test]
    fn test_sibling_copy_missing_at_origin_is_cancelled() {
        assert_eq!(decide(&sibling_view(JobState::Pending), None, cid(1)), ReconcileAction::CancelLocal);
        // A running copy is left alone.
        assert_eq!(decide(&sibling_view(JobState::Running), None, cid(1)), ReconcileAction::None);
        // Missing from an unrelated sibling's listing means nothing.
        assert_eq!(decide(&sibling_view(JobState::Pending), None, cid(3)), ReconcileAction::None);
    }

    #[test]
    fn test_sibling_pending_remote_cancelled() {
        let r = remote(JobState::Cancelled, None);
        assert_eq!(decide(&sibling_view(JobState::Pending), Some(&r), cid(1)), ReconcileAction::CancelLocal);
    }

    #[test]
    fn test_sibling_pending_remote_started_revokes() {
        let r = RemoteJobView {
            revoked: true,
            ..remote(JobState::Running, Some(500))
        };
        assert_eq!(decide(&sibling_view(JobState::Pending), Some(&r), cid(1)), ReconcileAction::RevokeLocal {
            state: JobState::Cancelled,
            start_time_ms: 500
        });
    }

    #[test]
    fn test_origin_missing_on_locked_peer_completes() {
        let local = origin_view(JobState::Running, Some(cid(2)), true);
        assert!(matches!(decide(&local, None, cid(2)), ReconcileAction::CompleteFromPeer { .. }));
    }

    #[test]
    fn test_origin_missing_on_unlocked_peer_clears_bit() {
        let local = origin_view(JobState::Pending, None, true);
        assert_eq!(decide(&local, None, cid(2)), ReconcileAction::ClearPeerActive);
        let inactive = origin_view(JobState::Pending, None, false);
        assert_eq!(decide(&inactive, None, cid(2)), ReconcileAction::None);
    }

    #[test]
    fn test_origin_grants_lock_retroactively() {
        let local = origin_view(JobState::Pending, None, true);
        let r = remote(JobState::Running, Some(1_000));
        assert_eq!(decide(&local, Some(&r), cid(2)), ReconcileAction::GrantLockToPeer { start_time_ms: 1_000 });
    }

    #[test]
    fn test_origin_revokes_peer_running_without_lock() {
        let local = origin_view(JobState::Running, Some(cid(1)), true);
        let r = remote(JobState::Running, Some(1_000));
        assert_eq!(decide(&local, Some(&r), cid(2)), ReconcileAction::RevokePeer);
    }

    #[test]
    fn test_origin_already_tracking_peer_is_noop() {
        let local = LocalJobView {
            revoked: true,
            ..origin_view(JobState::Running, Some(cid(2)), true)
        };
        let r = remote(JobState::Running, Some(1_000));
        assert_eq!(decide(&local, Some(&r), cid(2)), ReconcileAction::None);
    }

    #[test]
    fn test_terminal_local_is_untouched() {
        let local = origin_view(JobState::Completed, None, true);
        assert_eq!(decide(&local, None, cid(2)), ReconcileAction::None);
    }
}

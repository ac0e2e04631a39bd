//! Cluster-lock grant decisions.
//!
//! The origin of a job is the authority for its lock. These functions decide
//! whether a request can be granted given the recorded holder, the viable set
//! and outstanding update responses.

use crate::types::ClusterId;
use crate::types::SiblingMask;

/// Why a lock request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDenial {
    /// A different cluster holds the lock.
    HeldElsewhere(ClusterId),
    /// An update response from this cluster is outstanding and not yet stale.
    PendingUpdate(ClusterId),
    /// The requester is not a viable sibling.
    NotViable,
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    /// Grant the lock (fresh grant or re-grant to the holder).
    Grant,
    /// Grant, but first drop pending counters older than the staleness bound.
    GrantAfterClearingStale,
    Deny(LockDenial),
}

/// Decide whether `requester` may take the lock.
///
/// # Arguments
///
/// * `holder` - Current lock holder, if any
/// * `viable` - Viable siblings of the job
/// * `newest_pending` - Most recent outstanding update response `(cluster, since_ms)`
/// * `requester` - Cluster asking for the lock
/// * `now_ms` - Current time in Unix milliseconds
/// * `stale_ms` - Age after which a pending response stops blocking
pub fn decide_lock_grant(
    holder: Option<ClusterId>,
    viable: SiblingMask,
    newest_pending: Option<(ClusterId, u64)>,
    requester: ClusterId,
    now_ms: u64,
    stale_ms: u64,
) -> LockDecision {
    if let Some(holder) = holder {
        if holder != requester {
            return LockDecision::Deny(LockDenial::HeldElsewhere(holder));
        }
        return LockDecision::Grant;
    }

    if !viable.contains(requester) {
        return LockDecision::Deny(LockDenial::NotViable);
    }

    // Only once the newest counter is stale can every counter be cleared.
    match newest_pending {
        None => LockDecision::Grant,
        Some((_, since_ms)) if now_ms.saturating_sub(since_ms) > stale_ms => LockDecision::GrantAfterClearingStale,
        Some((cluster, _)) => LockDecision::Deny(LockDenial::PendingUpdate(cluster)),
    }
}

/// Whether a cluster that is itself running the ask-everyone fallback for a
/// job should refuse a competing request from `requester`.
///
/// The lower cluster id wins a race; the higher one backs off.
#[inline]
pub fn refuse_competing_fallback(local: ClusterId, requester: ClusterId) -> bool {
    local < requester
}

/// Result of collecting fallback replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// Every polled sibling agreed.
    Granted,
    /// At least one refusal; these siblings agreed and must be released.
    Refused { release: Vec<ClusterId>, refused_by: ClusterId },
}

/// Fold the per-sibling answers of an ask-everyone round.
pub fn fallback_outcome(replies: &[(ClusterId, bool)]) -> FallbackOutcome {
    match replies.iter().find(|(_, granted)| !granted) {
        None => FallbackOutcome::Granted,
        Some((refused_by, _)) => FallbackOutcome::Refused {
            release: replies.iter().filter(|(_, granted)| *granted).map(|(id, _)| *id).collect(),
            refused_by: *refused_by,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(id: u32) -> ClusterId {
        ClusterId::new(id).unwrap()
    }

    fn viable() -> SiblingMask {
        [cid(1), cid(2), cid(3)].into_iter().collect()
    }

    #[test]
    fn test_grant_unlocked() {
        assert_eq!(decide_lock_grant(None, viable(), None, cid(2), 0, 60_000), LockDecision::Grant);
    }

    #[test]
    fn test_deny_held_elsewhere() {
        assert_eq!(
            decide_lock_grant(Some(cid(1)), viable(), None, cid(2), 0, 60_000),
            LockDecision::Deny(LockDenial::HeldElsewhere(cid(1)))
        );
        assert_eq!(decide_lock_grant(Some(cid(2)), viable(), None, cid(2), 0, 60_000), LockDecision::Grant);
    }

    #[test]
    fn test_pending_updates_block_until_stale() {
        let pending = Some((cid(3), 10_000));
        assert_eq!(
            decide_lock_grant(None, viable(), pending, cid(2), 50_000, 60_000),
            LockDecision::Deny(LockDenial::PendingUpdate(cid(3)))
        );
        assert_eq!(
            decide_lock_grant(None, viable(), pending, cid(2), 70_001, 60_000),
            LockDecision::GrantAfterClearingStale
        );
    }

    #[test]
    fn test_fresh_pending_blocks_even_with_stale_ones() {
        let mut meta = crate::types::FederationMetadata::new(cid(1), viable(), 0);
        meta.record_pending(cid(2), 0);
        meta.record_pending(cid(3), 110_000);
        assert_eq!(
            decide_lock_grant(None, viable(), meta.newest_pending(), cid(2), 120_000, 60_000),
            LockDecision::Deny(LockDenial::PendingUpdate(cid(3)))
        );

        meta.ack_pending(cid(3));
        assert_eq!(
            decide_lock_grant(None, viable(), meta.newest_pending(), cid(2), 120_000, 60_000),
            LockDecision::GrantAfterClearingStale
        );
    }

    #[test]
    fn test_not_viable() {
        assert_eq!(
            decide_lock_grant(None, viable(), None, cid(9), 0, 60_000),
            LockDecision::Deny(LockDenial::NotViable)
        );
    }

    #[test]
    fn test_fallback_tiebreak_and_outcome() {
        assert!(refuse_competing_fallback(cid(1), cid(2)));
        assert!(!refuse_competing_fallback(cid(3), cid(2)));

        assert_eq!(fallback_outcome(&[(cid(2), true), (cid(3), true)]), FallbackOutcome::Granted);
        assert_eq!(fallback_outcome(&[(cid(2), true), (cid(3), false), (cid(4), true)]), FallbackOutcome::Refused {
            release: vec![cid(2), cid(4)],
            refused_by: cid(3),
        });
    }
}

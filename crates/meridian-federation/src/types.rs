//! Identifiers, sibling masks and per-job federation metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::CLUSTER_ID_SHIFT;
use crate::constants::MAX_FED_CLUSTERS;
use crate::constants::MAX_LOCAL_JOB_ID;

// ============================================================================
// ClusterId
// ============================================================================

/// Numeric cluster id, 1..=63. Each id owns one bit of a [`SiblingMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ClusterId(u32);

impl ClusterId {
    /// Create a cluster id, or `None` when outside 1..=63.
    pub const fn new(id: u32) -> Option<Self> {
        if id >= 1 && id <= MAX_FED_CLUSTERS {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Raw numeric id.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The mask bit owned by this cluster.
    pub const fn bit(self) -> u64 {
        1u64 << (self.0 - 1)
    }
}

impl TryFrom<u32> for ClusterId {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ClusterId::new(value).ok_or_else(|| format!("cluster id {value} outside 1..={MAX_FED_CLUSTERS}"))
    }
}

impl From<ClusterId> for u32 {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SiblingMask
// ============================================================================

/// Set of clusters, one bit per [`ClusterId`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiblingMask(u64);

impl SiblingMask {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Rebuild a mask from raw bits, dropping bits above the cluster limit.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & ((1u64 << MAX_FED_CLUSTERS) - 1))
    }

    /// Set containing exactly one cluster.
    pub const fn single(id: ClusterId) -> Self {
        Self(id.bit())
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, id: ClusterId) -> bool {
        self.0 & id.bit() != 0
    }

    pub fn insert(&mut self, id: ClusterId) {
        self.0 |= id.bit();
    }

    pub fn remove(&mut self, id: ClusterId) {
        self.0 &= !id.bit();
    }

    #[must_use]
    pub const fn with(self, id: ClusterId) -> Self {
        Self(self.0 | id.bit())
    }

    #[must_use]
    pub const fn without(self, id: ClusterId) -> Self {
        Self(self.0 & !id.bit())
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// The only member, if the set has exactly one.
    pub fn sole_member(self) -> Option<ClusterId> {
        if self.count() == 1 {
            ClusterId::new(self.0.trailing_zeros() + 1)
        } else {
            None
        }
    }

    /// Members in ascending id order.
    pub fn iter(self) -> impl Iterator<Item = ClusterId> {
        (1..=MAX_FED_CLUSTERS).filter_map(ClusterId::new).filter(move |id| self.contains(*id))
    }
}

impl FromIterator<ClusterId> for SiblingMask {
    fn from_iter<I: IntoIterator<Item = ClusterId>>(iter: I) -> Self {
        let mut mask = SiblingMask::empty();
        for id in iter {
            mask.insert(id);
        }
        mask
    }
}

impl fmt::Display for SiblingMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, id) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// JobId
// ============================================================================

/// Federation-wide job id. The high bits carry the origin cluster id so that
/// every cluster allocates from its own disjoint range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u32);

impl JobId {
    /// Compose a job id from its origin cluster and local sequence number.
    pub fn new(origin: ClusterId, local: u32) -> Option<Self> {
        if local == 0 || local > MAX_LOCAL_JOB_ID {
            return None;
        }
        Some(Self((origin.value() << CLUSTER_ID_SHIFT) | local))
    }

    /// Wrap a raw id (e.g. decoded from user input).
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Origin cluster encoded in the high bits, or `None` for ids allocated
    /// outside any federation range.
    pub fn origin(self) -> Option<ClusterId> {
        ClusterId::new(self.0 >> CLUSTER_ID_SHIFT)
    }

    /// Cluster-local sequence number.
    pub const fn local(self) -> u32 {
        self.0 & MAX_LOCAL_JOB_ID
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(JobId)
    }
}

// ============================================================================
// States
// ============================================================================

/// Lifecycle state of a local job copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_pending(self) -> bool {
        matches!(self, JobState::Pending)
    }

    /// Running or suspended: resources are allocated somewhere.
    pub fn is_started(self) -> bool {
        matches!(self, JobState::Running | JobState::Suspended)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Administrative state of a cluster within the federation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    #[default]
    Active,
    /// Not accepting or running federated work.
    Inactive,
    /// Finishing existing work; no new submissions.
    Draining,
    /// Leaving the federation once its jobs are gone.
    Removing,
}

impl ClusterState {
    /// Whether new federated jobs may be placed on the cluster.
    pub fn accepts_new_jobs(self) -> bool {
        matches!(self, ClusterState::Active)
    }
}

/// Satisfaction state of one portion of a cross-cluster dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteDependencyState {
    Pending,
    Satisfied,
    /// Can never be satisfied (e.g. `afterok` on a failed job).
    Failed,
}

// ============================================================================
// FederationMetadata
// ============================================================================

/// Outstanding update responses from one sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounter {
    /// Number of unacknowledged updates.
    pub count: u32,
    /// When the oldest unacknowledged update was sent (Unix ms).
    pub since_ms: u64,
}

/// Federation bookkeeping for one job.
///
/// The masks and the lock are private so that `active ⊆ viable` and
/// `cluster_lock ∈ viable` hold after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationMetadata {
    origin: ClusterId,
    viable: SiblingMask,
    active: SiblingMask,
    cluster_lock: Option<ClusterId>,
    /// Incremented on every lock grant.
    pub lock_epoch: u64,
    /// Per-sibling unacknowledged update counters.
    pub pending: BTreeMap<ClusterId, PendingCounter>,
    /// Origin only: the local copy was revoked and is kept for tracking.
    pub revoked: bool,
    /// A single viable cluster remains; the job runs non-federated.
    pub standalone: bool,
    /// Submission time (Unix ms).
    pub submit_time_ms: u64,
}

impl FederationMetadata {
    pub fn new(origin: ClusterId, viable: SiblingMask, submit_time_ms: u64) -> Self {
        Self {
            origin,
            viable,
            active: SiblingMask::empty(),
            cluster_lock: None,
            lock_epoch: 0,
            pending: BTreeMap::new(),
            revoked: false,
            standalone: false,
            submit_time_ms,
        }
    }

    pub fn origin(&self) -> ClusterId {
        self.origin
    }

    pub fn viable(&self) -> SiblingMask {
        self.viable
    }

    pub fn active(&self) -> SiblingMask {
        self.active
    }

    pub fn cluster_lock(&self) -> Option<ClusterId> {
        self.cluster_lock
    }

    /// Replace the viable set, shrinking active and the lock to match.
    pub fn set_viable(&mut self, viable: SiblingMask) {
        self.viable = viable;
        self.active = self.active.intersection(viable);
        if let Some(holder) = self.cluster_lock {
            if !viable.contains(holder) {
                self.cluster_lock = None;
            }
        }
    }

    /// Replace the active set; non-viable members are dropped.
    pub fn set_active(&mut self, active: SiblingMask) {
        self.active = active.intersection(self.viable);
    }

    /// Mark a viable cluster as holding a live copy. Returns false when the
    /// cluster is not viable.
    pub fn add_active(&mut self, id: ClusterId) -> bool {
        if self.viable.contains(id) {
            self.active.insert(id);
            true
        } else {
            false
        }
    }

    pub fn remove_active(&mut self, id: ClusterId) {
        self.active.remove(id);
    }

    /// Grant the lock to `id`. Returns false when `id` is not viable.
    ///
    /// Callers decide whether the grant is allowed; see
    /// [`crate::pure::lock::decide_lock_grant`].
    pub fn set_lock(&mut self, id: ClusterId) -> bool {
        if !self.viable.contains(id) {
            return false;
        }
        if self.cluster_lock != Some(id) {
            self.cluster_lock = Some(id);
            self.lock_epoch = self.lock_epoch.saturating_add(1);
        }
        true
    }

    pub fn clear_lock(&mut self) {
        self.cluster_lock = None;
    }

    /// Drop every trace of a departed cluster.
    pub fn remove_cluster(&mut self, id: ClusterId) {
        self.viable.remove(id);
        self.active.remove(id);
        if self.cluster_lock == Some(id) {
            self.cluster_lock = None;
        }
        self.pending.remove(&id);
    }

    /// Record one more unacknowledged update sent to `id`.
    pub fn record_pending(&mut self, id: ClusterId, now_ms: u64) {
        let entry = self.pending.entry(id).or_insert(PendingCounter {
            count: 0,
            since_ms: now_ms,
        });
        if entry.count == 0 {
            entry.since_ms = now_ms;
        }
        entry.count = entry.count.saturating_add(1);
    }

    /// Acknowledge one update from `id`.
    pub fn ack_pending(&mut self, id: ClusterId) {
        if let Some(entry) = self.pending.get_mut(&id) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                self.pending.remove(&id);
            }
        }
    }

    /// Remove pending counters older than `stale_ms`; returns the clusters cleared.
    pub fn clear_stale_pending(&mut self, now_ms: u64, stale_ms: u64) -> Vec<ClusterId> {
        let stale: Vec<ClusterId> = self
            .pending
            .iter()
            .filter(|(_, counter)| now_ms.saturating_sub(counter.since_ms) > stale_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.pending.remove(id);
        }
        stale
    }

    /// The sibling whose outstanding update response is most recent.
    ///
    /// Every other counter is at least as old, so when this one is stale
    /// they all are.
    pub fn newest_pending(&self) -> Option<(ClusterId, u64)> {
        self.pending.iter().max_by_key(|(_, counter)| counter.since_ms).map(|(id, counter)| (*id, counter.since_ms))
    }
}

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the epoch rather than panicking.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cid(id: u32) -> ClusterId {
        ClusterId::new(id).unwrap()
    }

    #[test]
    fn test_cluster_id_bounds() {
        assert!(ClusterId::new(0).is_none());
        assert!(ClusterId::new(64).is_none());
        assert_eq!(cid(1).bit(), 1);
        assert_eq!(cid(63).bit(), 1 << 62);
    }

    #[test]
    fn test_job_id_encodes_origin() {
        let id = JobId::new(cid(5), 1234).unwrap();
        assert_eq!(id.origin(), Some(cid(5)));
        assert_eq!(id.local(), 1234);
        assert!(JobId::new(cid(5), 0).is_none());
        assert!(JobId::new(cid(5), MAX_LOCAL_JOB_ID + 1).is_none());
        assert_eq!(JobId::from_raw(17).origin(), None);
    }

    #[test]
    fn test_mask_set_operations() {
        let a: SiblingMask = [cid(1), cid(3)].into_iter().collect();
        let b = SiblingMask::single(cid(3)).with(cid(4));
        assert_eq!(a.intersection(b), SiblingMask::single(cid(3)));
        assert_eq!(a.union(b).count(), 3);
        assert_eq!(a.difference(b).sole_member(), Some(cid(1)));
        assert!(SiblingMask::single(cid(3)).is_subset_of(a));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![cid(1), cid(3)]);
        assert_eq!(a.to_string(), "{1,3}");
    }

    #[test]
    fn test_active_stays_within_viable() {
        let viable = SiblingMask::single(cid(1)).with(cid(2));
        let mut meta = FederationMetadata::new(cid(1), viable, 0);
        meta.set_active(viable.with(cid(3)));
        assert_eq!(meta.active(), viable);
        assert!(!meta.add_active(cid(4)));

        meta.set_viable(SiblingMask::single(cid(2)));
        assert_eq!(meta.active(), SiblingMask::single(cid(2)));
    }

    #[test]
    fn test_lock_requires_viable_member() {
        let mut meta = FederationMetadata::new(cid(1), SiblingMask::single(cid(2)), 0);
        assert!(!meta.set_lock(cid(3)));
        assert!(meta.set_lock(cid(2)));
        assert_eq!(meta.lock_epoch, 1);
        // Re-granting to the holder does not bump the epoch.
        assert!(meta.set_lock(cid(2)));
        assert_eq!(meta.lock_epoch, 1);

        meta.remove_cluster(cid(2));
        assert_eq!(meta.cluster_lock(), None);
        assert!(meta.viable().is_empty());
    }

    #[test]
    fn test_pending_counters() {
        let mut meta = FederationMetadata::new(cid(1), SiblingMask::single(cid(2)).with(cid(3)), 0);
        meta.record_pending(cid(2), 1_000);
        meta.record_pending(cid(2), 2_000);
        meta.record_pending(cid(3), 5_000);
        assert_eq!(meta.pending[&cid(2)].count, 2);
        assert_eq!(meta.newest_pending(), Some((cid(3), 5_000)));

        meta.ack_pending(cid(2));
        assert_eq!(meta.pending[&cid(2)].count, 1);

        let cleared = meta.clear_stale_pending(62_000, 60_000);
        assert_eq!(cleared, vec![cid(2)]);
        assert!(meta.pending.contains_key(&cid(3)));
    }

    #[derive(Debug, Clone)]
    enum MaskOp {
        SetViable(u64),
        SetActive(u64),
        AddActive(u32),
        RemoveActive(u32),
        Lock(u32),
        RemoveCluster(u32),
    }

    fn mask_op() -> impl Strategy<Value = MaskOp> {
        prop_oneof![
            any::<u64>().prop_map(MaskOp::SetViable),
            any::<u64>().prop_map(MaskOp::SetActive),
            (1u32..64).prop_map(MaskOp::AddActive),
            (1u32..64).prop_map(MaskOp::RemoveActive),
            (1u32..64).prop_map(MaskOp::Lock),
            (1u32..64).prop_map(MaskOp::RemoveCluster),
        ]
    }

    proptest! {
        #[test]
        fn prop_active_and_lock_stay_within_viable(
            viable_bits in any::<u64>(),
            ops in proptest::collection::vec(mask_op(), 0..40),
        ) {
            let mut meta = FederationMetadata::new(cid(1), SiblingMask::from_bits(viable_bits), 0);
            for op in ops {
                match op {
                    MaskOp::SetViable(bits) => meta.set_viable(SiblingMask::from_bits(bits)),
                    MaskOp::SetActive(bits) => meta.set_active(SiblingMask::from_bits(bits)),
                    MaskOp::AddActive(id) => {
                        meta.add_active(cid(id));
                    }
                    MaskOp::RemoveActive(id) => meta.remove_active(cid(id)),
                    MaskOp::Lock(id) => {
                        meta.set_lock(cid(id));
                    }
                    MaskOp::RemoveCluster(id) => meta.remove_cluster(cid(id)),
                }
                prop_assert!(meta.active().is_subset_of(meta.viable()));
                if let Some(holder) = meta.cluster_lock() {
                    prop_assert!(meta.viable().contains(holder));
                }
            }
        }
    }
}

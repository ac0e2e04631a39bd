//! Federation job index: job id to [`FederationMetadata`].
//!
//! Kept apart from the local job store so the federation manager can track
//! jobs without touching scheduler records, and so the index alone can be
//! persisted and restored.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;

use crate::types::ClusterId;
use crate::types::FederationMetadata;
use crate::types::JobId;

/// Persisted form of one index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIndexEntry {
    pub job_id: JobId,
    pub metadata: FederationMetadata,
}

/// Owner of every job's federation metadata.
#[derive(Debug, Default)]
pub struct JobIndexService {
    entries: RwLock<HashMap<JobId, FederationMetadata>>,
}

impl JobIndexService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `job_id`.
    pub fn insert(&self, job_id: JobId, metadata: FederationMetadata) -> Option<FederationMetadata> {
        self.entries.write().insert(job_id, metadata)
    }

    pub fn get(&self, job_id: JobId) -> Option<FederationMetadata> {
        self.entries.read().get(&job_id).cloned()
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.entries.read().contains_key(&job_id)
    }

    pub fn remove(&self, job_id: JobId) -> Option<FederationMetadata> {
        self.entries.write().remove(&job_id)
    }

    /// Mutate an entry in place; `None` when the job is not indexed.
    pub fn update<R>(&self, job_id: JobId, f: impl FnOnce(&mut FederationMetadata) -> R) -> Option<R> {
        self.entries.write().get_mut(&job_id).map(f)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries sorted by job id.
    pub fn snapshot(&self) -> Vec<JobIndexEntry> {
        let mut entries: Vec<JobIndexEntry> = self
            .entries
            .read()
            .iter()
            .map(|(job_id, metadata)| JobIndexEntry {
                job_id: *job_id,
                metadata: metadata.clone(),
            })
            .collect();
        entries.sort_unstable_by_key(|entry| entry.job_id);
        entries
    }

    /// Replace the whole index.
    pub fn restore(&self, entries: Vec<JobIndexEntry>) {
        let mut map = self.entries.write();
        map.clear();
        map.extend(entries.into_iter().map(|entry| (entry.job_id, entry.metadata)));
    }

    /// Drop a departed cluster from every entry; returns the jobs touched.
    pub fn remove_cluster_from_all(&self, cluster: ClusterId) -> Vec<JobId> {
        let mut touched = Vec::new();
        for (job_id, metadata) in self.entries.write().iter_mut() {
            let before = (metadata.viable(), metadata.active(), metadata.cluster_lock(), metadata.pending.len());
            metadata.remove_cluster(cluster);
            let after = (metadata.viable(), metadata.active(), metadata.cluster_lock(), metadata.pending.len());
            if before != after {
                touched.push(*job_id);
            }
        }
        touched.sort_unstable();
        touched
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::SiblingMask;

    fn cid(id: u32) -> ClusterId {
        ClusterId::new(id).unwrap()
    }

    #[test]
    fn test_update_and_remove_cluster() {
        let index = JobIndexService::new();
        let job = JobId::new(cid(1), 1).unwrap();
        let viable: SiblingMask = [cid(1), cid(2), cid(3)].into_iter().collect();
        index.insert(job, FederationMetadata::new(cid(1), viable, 0));

        assert_eq!(index.update(job, |m| m.set_lock(cid(2))), Some(true));
        assert_eq!(index.update(JobId::from_raw(99), |m| m.set_lock(cid(2))), None);

        assert_eq!(index.remove_cluster_from_all(cid(2)), vec![job]);
        let meta = index.get(job).unwrap();
        assert_eq!(meta.cluster_lock(), None);
        assert!(!meta.viable().contains(cid(2)));
        assert!(index.remove_cluster_from_all(cid(2)).is_empty());
    }

    proptest! {
        #[test]
        fn prop_entry_round_trip_preserves_masks_and_lock(
            viable_bits in 1u64..(1u64 << 63),
            active_bits in any::<u64>(),
            lock_pick in 0u32..64,
            epoch in any::<u64>(),
        ) {
            let viable = SiblingMask::from_bits(viable_bits);
            let mut meta = FederationMetadata::new(cid(1), viable, 1_000);
            meta.set_active(SiblingMask::from_bits(active_bits));
            if let Some(lock) = ClusterId::new(lock_pick) {
                meta.set_lock(lock);
            }
            meta.lock_epoch = epoch;

            let entry = JobIndexEntry { job_id: JobId::from_raw(7), metadata: meta.clone() };
            let bytes = postcard::to_stdvec(&entry).unwrap();
            let decoded: JobIndexEntry = postcard::from_bytes(&bytes).unwrap();

            prop_assert_eq!(decoded.metadata.viable(), meta.viable());
            prop_assert_eq!(decoded.metadata.active(), meta.active());
            prop_assert_eq!(decoded.metadata.cluster_lock(), meta.cluster_lock());
            prop_assert!(decoded.metadata.active().is_subset_of(decoded.metadata.viable()));
            prop_assert_eq!(decoded, entry);
        }
    }
}

//! Federation membership: the descriptor of every cluster and per-sibling
//! sync status.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::constants::PROTOCOL_VERSION;
use crate::constants::SYNC_RETRY_MS;
use crate::error::InvalidConfigSnafu;
use crate::error::Result;
use crate::error::UnknownClusterSnafu;
use crate::error::UnknownSiblingSnafu;
use crate::types::ClusterId;
use crate::types::ClusterState;
use crate::types::SiblingMask;

/// One member cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub id: ClusterId,
    pub name: String,
    /// Network address of the cluster's federation listener.
    pub address: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
    #[serde(default)]
    pub features: BTreeSet<String>,
    /// Partitions the cluster offers; empty means any.
    #[serde(default)]
    pub partitions: BTreeSet<String>,
    #[serde(default)]
    pub state: ClusterState,
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

impl ClusterDescriptor {
    pub fn new(id: ClusterId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            protocol_version: PROTOCOL_VERSION,
            features: BTreeSet::new(),
            partitions: BTreeSet::new(),
            state: ClusterState::Active,
        }
    }

    #[must_use]
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitions = partitions.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a job naming `partition` may run here.
    pub fn offers_partition(&self, partition: &str) -> bool {
        self.partitions.is_empty() || self.partitions.contains(partition)
    }
}

/// The federation as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationDescriptor {
    pub name: String,
    /// Bumped on every membership change.
    #[serde(default)]
    pub generation: u64,
    pub clusters: Vec<ClusterDescriptor>,
}

impl FederationDescriptor {
    /// Reject duplicate ids or names.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !ids.insert(cluster.id) {
                return InvalidConfigSnafu {
                    reason: format!("duplicate cluster id {}", cluster.id),
                }
                .fail();
            }
            if cluster.name.is_empty() {
                return InvalidConfigSnafu {
                    reason: format!("cluster {} has an empty name", cluster.id),
                }
                .fail();
            }
            if !names.insert(cluster.name.as_str()) {
                return InvalidConfigSnafu {
                    reason: format!("duplicate cluster name '{}'", cluster.name),
                }
                .fail();
            }
        }
        Ok(())
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&ClusterDescriptor> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn cluster_by_name(&self, name: &str) -> Option<&ClusterDescriptor> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn mask(&self) -> SiblingMask {
        self.clusters.iter().map(|c| c.id).collect()
    }
}

/// Result of a membership reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<ClusterId>,
    pub removed: Vec<ClusterId>,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SyncStatus {
    synced: bool,
    /// When the outstanding sync request was sent.
    requested_ms: Option<u64>,
    last_sync_ms: u64,
}

#[derive(Debug)]
struct FederationInner {
    descriptor: FederationDescriptor,
    sync: BTreeMap<ClusterId, SyncStatus>,
}

/// Owner of the federation descriptor.
#[derive(Debug)]
pub struct FederationService {
    local: ClusterId,
    inner: RwLock<FederationInner>,
}

impl FederationService {
    /// Create the service; the local cluster must be a member.
    pub fn new(descriptor: FederationDescriptor, local: ClusterId) -> Result<Self> {
        descriptor.validate()?;
        if descriptor.cluster(local).is_none() {
            return InvalidConfigSnafu {
                reason: format!("local cluster {local} is not a federation member"),
            }
            .fail();
        }
        Ok(Self {
            local,
            inner: RwLock::new(FederationInner {
                descriptor,
                sync: BTreeMap::new(),
            }),
        })
    }

    pub fn local_id(&self) -> ClusterId {
        self.local
    }

    pub fn local_name(&self) -> String {
        self.inner.read().descriptor.cluster(self.local).map(|c| c.name.clone()).unwrap_or_default()
    }

    pub fn local_cluster(&self) -> Option<ClusterDescriptor> {
        self.cluster(self.local)
    }

    pub fn federation_name(&self) -> String {
        self.inner.read().descriptor.name.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().descriptor.generation
    }

    /// Snapshot of the descriptor.
    pub fn descriptor(&self) -> FederationDescriptor {
        self.inner.read().descriptor.clone()
    }

    /// All member clusters, local included.
    pub fn clusters(&self) -> Vec<ClusterDescriptor> {
        self.inner.read().descriptor.clusters.clone()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<ClusterDescriptor> {
        self.inner.read().descriptor.cluster(id).cloned()
    }

    pub fn require_cluster(&self, id: ClusterId) -> Result<ClusterDescriptor> {
        self.cluster(id).ok_or_else(|| UnknownClusterSnafu { id: id.value() }.build())
    }

    pub fn cluster_by_name(&self, name: &str) -> Option<ClusterDescriptor> {
        self.inner.read().descriptor.cluster_by_name(name).cloned()
    }

    /// Look up a sibling (any member except the local cluster) by name.
    pub fn sibling_by_name(&self, name: &str) -> Result<ClusterDescriptor> {
        match self.cluster_by_name(name) {
            Some(cluster) if cluster.id != self.local => Ok(cluster),
            _ => UnknownSiblingSnafu { name }.fail(),
        }
    }

    pub fn contains(&self, id: ClusterId) -> bool {
        self.inner.read().descriptor.cluster(id).is_some()
    }

    /// Ids of every member except the local cluster.
    pub fn sibling_ids(&self) -> Vec<ClusterId> {
        self.inner.read().descriptor.clusters.iter().map(|c| c.id).filter(|id| *id != self.local).collect()
    }

    /// Every member cluster.
    pub fn member_mask(&self) -> SiblingMask {
        self.inner.read().descriptor.mask()
    }

    /// Clusters that accept new federated jobs.
    pub fn schedulable_mask(&self) -> SiblingMask {
        self.inner.read().descriptor.clusters.iter().filter(|c| c.state.accepts_new_jobs()).map(|c| c.id).collect()
    }

    pub fn clusters_with_feature(&self, feature: &str) -> SiblingMask {
        self.inner.read().descriptor.clusters.iter().filter(|c| c.features.contains(feature)).map(|c| c.id).collect()
    }

    pub fn clusters_offering_partition(&self, partition: &str) -> SiblingMask {
        self.inner
            .read()
            .descriptor
            .clusters
            .iter()
            .filter(|c| c.offers_partition(partition))
            .map(|c| c.id)
            .collect()
    }

    /// Feature set advertised by each cluster.
    pub fn cluster_features(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.inner.read().descriptor.clusters.iter().map(|c| (c.name.clone(), c.features.clone())).collect()
    }

    /// Resolve cluster names into a mask; fails on the first unknown name.
    pub fn mask_for_names<S: AsRef<str>>(&self, names: &[S]) -> std::result::Result<SiblingMask, String> {
        let inner = self.inner.read();
        let mut mask = SiblingMask::empty();
        for name in names {
            let name = name.as_ref().trim();
            match inner.descriptor.cluster_by_name(name) {
                Some(cluster) => mask.insert(cluster.id),
                None => return Err(name.to_string()),
            }
        }
        Ok(mask)
    }

    pub fn set_cluster_state(&self, id: ClusterId, state: ClusterState) -> Result<()> {
        let mut inner = self.inner.write();
        let cluster = inner
            .descriptor
            .clusters
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| UnknownClusterSnafu { id: id.value() }.build())?;
        cluster.state = state;
        info!(cluster = %id, state = ?state, "cluster state changed");
        Ok(())
    }

    /// Record the protocol version a sibling announced in its handshake.
    pub fn set_protocol_version(&self, id: ClusterId, version: u16) {
        let mut inner = self.inner.write();
        if let Some(cluster) = inner.descriptor.clusters.iter_mut().find(|c| c.id == id) {
            cluster.protocol_version = version;
        }
    }

    // ------------------------------------------------------------------------
    // Sync status
    // ------------------------------------------------------------------------

    pub fn is_synced(&self, id: ClusterId) -> bool {
        self.inner.read().sync.get(&id).is_some_and(|s| s.synced)
    }

    pub fn mark_synced(&self, id: ClusterId, snapshot_ms: u64) {
        let mut inner = self.inner.write();
        let status = inner.sync.entry(id).or_default();
        status.synced = true;
        status.requested_ms = None;
        status.last_sync_ms = status.last_sync_ms.max(snapshot_ms);
    }

    /// Require a fresh sync on the next connection.
    pub fn mark_unsynced(&self, id: ClusterId) {
        if let Some(status) = self.inner.write().sync.get_mut(&id) {
            status.synced = false;
            status.requested_ms = None;
        }
    }

    /// Claim the sync of an unsynced member at `now_ms`.
    ///
    /// Returns false when `id` is not a member, is already synced, or has a
    /// request outstanding for less than [`SYNC_RETRY_MS`].
    pub fn begin_sync(&self, id: ClusterId, now_ms: u64) -> bool {
        let mut inner = self.inner.write();
        if inner.descriptor.cluster(id).is_none() {
            return false;
        }
        let status = inner.sync.entry(id).or_default();
        if status.synced {
            return false;
        }
        if let Some(sent_ms) = status.requested_ms {
            if now_ms.saturating_sub(sent_ms) < SYNC_RETRY_MS {
                return false;
            }
        }
        status.requested_ms = Some(now_ms);
        true
    }

    /// Snapshot time of the last applied sync with `id`.
    pub fn last_sync_ms(&self, id: ClusterId) -> u64 {
        self.inner.read().sync.get(&id).map(|s| s.last_sync_ms).unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Replace the membership. The local cluster must remain a member.
    pub fn apply_membership(&self, mut descriptor: FederationDescriptor) -> Result<MembershipChange> {
        descriptor.validate()?;
        if descriptor.cluster(self.local).is_none() {
            return InvalidConfigSnafu {
                reason: format!("local cluster {} removed from federation", self.local),
            }
            .fail();
        }

        let mut inner = self.inner.write();
        let old = inner.descriptor.mask();
        let new = descriptor.mask();
        let change = MembershipChange {
            added: new.difference(old).iter().collect(),
            removed: old.difference(new).iter().collect(),
            generation: inner.descriptor.generation.max(descriptor.generation) + 1,
        };

        descriptor.generation = change.generation;
        for id in &change.removed {
            inner.sync.remove(id);
        }
        inner.descriptor = descriptor;

        info!(
            generation = change.generation,
            added = ?change.added,
            removed = ?change.removed,
            "federation membership updated"
        );
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(id: u32) -> ClusterId {
        ClusterId::new(id).unwrap()
    }

    fn descriptor() -> FederationDescriptor {
        FederationDescriptor {
            name: "fed".into(),
            generation: 0,
            clusters: vec![
                ClusterDescriptor::new(cid(1), "alpha", "a:1").with_features(["gpu"]),
                ClusterDescriptor::new(cid(2), "beta", "b:1").with_features(["gpu", "ib"]).with_partitions(["debug"]),
                ClusterDescriptor::new(cid(3), "gamma", "c:1"),
            ],
        }
    }

    #[test]
    fn test_rejects_duplicates_and_missing_local() {
        let mut dup = descriptor();
        dup.clusters.push(ClusterDescriptor::new(cid(4), "alpha", "d:1"));
        assert!(dup.validate().is_err());

        let mut dup_id = descriptor();
        dup_id.clusters.push(ClusterDescriptor::new(cid(1), "delta", "d:1"));
        assert!(dup_id.validate().is_err());

        assert!(FederationService::new(descriptor(), cid(9)).is_err());
    }

    #[test]
    fn test_lookups() {
        let svc = FederationService::new(descriptor(), cid(1)).unwrap();
        assert_eq!(svc.sibling_ids(), vec![cid(2), cid(3)]);
        assert!(svc.sibling_by_name("alpha").is_err());
        assert_eq!(svc.sibling_by_name("beta").unwrap().id, cid(2));
        assert_eq!(svc.clusters_with_feature("gpu").count(), 2);
        assert_eq!(svc.clusters_offering_partition("batch"), SiblingMask::single(cid(1)).with(cid(3)));
        assert_eq!(svc.mask_for_names(&["beta", "gamma"]).unwrap().count(), 2);
        assert_eq!(svc.mask_for_names(&["beta", "zeta"]), Err("zeta".to_string()));
    }

    #[test]
    fn test_draining_not_schedulable() {
        let svc = FederationService::new(descriptor(), cid(1)).unwrap();
        svc.set_cluster_state(cid(2), ClusterState::Draining).unwrap();
        assert!(!svc.schedulable_mask().contains(cid(2)));
    }

    #[test]
    fn test_membership_change() {
        let svc = FederationService::new(descriptor(), cid(1)).unwrap();
        svc.mark_synced(cid(3), 100);

        let mut next = descriptor();
        next.clusters.retain(|c| c.id != cid(3));
        next.clusters.push(ClusterDescriptor::new(cid(4), "delta", "d:1"));
        let change = svc.apply_membership(next).unwrap();

        assert_eq!(change.added, vec![cid(4)]);
        assert_eq!(change.removed, vec![cid(3)]);
        assert_eq!(svc.generation(), 1);
        assert!(!svc.is_synced(cid(3)));
    }

    #[test]
    fn test_sync_claimed_once_until_link_lost() {
        let svc = FederationService::new(descriptor(), cid(1)).unwrap();
        assert!(svc.begin_sync(cid(2), 1_000));
        assert!(!svc.begin_sync(cid(2), 1_001));
        assert!(!svc.begin_sync(cid(9), 1_000));

        svc.mark_synced(cid(2), 100);
        assert!(!svc.begin_sync(cid(2), 1_002));

        svc.mark_unsynced(cid(2));
        assert!(!svc.is_synced(cid(2)));
        assert!(svc.begin_sync(cid(2), 1_003));
        assert_eq!(svc.last_sync_ms(cid(2)), 100);
    }

    #[test]
    fn test_unanswered_sync_can_be_retried() {
        let svc = FederationService::new(descriptor(), cid(1)).unwrap();
        assert!(svc.begin_sync(cid(2), 0));
        assert!(!svc.begin_sync(cid(2), SYNC_RETRY_MS - 1));
        assert!(svc.begin_sync(cid(2), SYNC_RETRY_MS));
    }
}

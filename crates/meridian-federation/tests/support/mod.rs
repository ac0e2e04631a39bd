//! Harness running several federation managers over one in-process network.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use meridian_federation::ClusterDescriptor;
use meridian_federation::ClusterId;
use meridian_federation::FederationConfig;
use meridian_federation::FederationDescriptor;
use meridian_federation::FederationManager;
use meridian_federation::MemoryJobStore;
use meridian_federation::MemoryNetwork;
use meridian_federation::MessageHandler;
use meridian_federation::StaticAccountingProbe;
use meridian_federation::TimingConfig;
use tempfile::TempDir;

pub fn cid(id: u32) -> ClusterId {
    ClusterId::new(id).unwrap()
}

pub fn name(id: u32) -> String {
    format!("c{id}")
}

pub fn descriptor(ids: &[u32]) -> FederationDescriptor {
    FederationDescriptor {
        name: "it".into(),
        generation: 1,
        clusters: ids.iter().map(|id| ClusterDescriptor::new(cid(*id), name(*id), format!("mem://c{id}"))).collect(),
    }
}

fn timing() -> TimingConfig {
    TimingConfig {
        connect_timeout_ms: 500,
        request_timeout_ms: 500,
        rpc_agent_interval_ms: 25,
        dependency_test_interval_ms: 50,
        state_save_interval_ms: 60_000,
        ..TimingConfig::default()
    }
}

/// One cluster of the test federation.
pub struct Node {
    pub manager: Arc<FederationManager>,
    pub jobs: Arc<MemoryJobStore>,
    pub accounting: Arc<StaticAccountingProbe>,
    _handler: Arc<dyn MessageHandler>,
    _state_dir: TempDir,
}

/// Several started managers sharing a [`MemoryNetwork`].
pub struct TestFederation {
    pub network: Arc<MemoryNetwork>,
    pub nodes: BTreeMap<u32, Node>,
}

impl TestFederation {
    pub fn start(ids: &[u32]) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let network = MemoryNetwork::new();
        let mut nodes = BTreeMap::new();
        for id in ids {
            let state_dir = tempfile::tempdir().unwrap();
            let config = FederationConfig {
                cluster_name: name(*id),
                state_dir: state_dir.path().to_path_buf(),
                federation: descriptor(ids),
                timing: timing(),
                ..FederationConfig::default()
            };
            let accounting = Arc::new(StaticAccountingProbe::default());
            let jobs = Arc::new(MemoryJobStore::new(cid(*id)));
            let manager = FederationManager::new(
                config,
                jobs.clone(),
                accounting.clone(),
                Arc::new(network.transport()),
            )
            .unwrap();
            let handler: Arc<dyn MessageHandler> = manager.clone();
            network.register(format!("mem://c{id}"), Arc::downgrade(&handler));
            manager.start();
            nodes.insert(*id, Node {
                manager,
                jobs,
                accounting,
                _handler: handler,
                _state_dir: state_dir,
            });
        }
        Self { network, nodes }
    }

    pub fn manager(&self, id: u32) -> &Arc<FederationManager> {
        &self.nodes[&id].manager
    }

    pub async fn shutdown(self) {
        for node in self.nodes.values() {
            node.manager.shutdown().await.unwrap();
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub const WAIT: Duration = Duration::from_secs(10);

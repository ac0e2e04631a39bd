//! Builders shared by unit tests.

use std::sync::Arc;

use crate::accounting::AccountingProbe;
use crate::accounting::StaticAccountingProbe;
use crate::config::TimingConfig;
use crate::connection::ConnectionManager;
use crate::context::FederationContext;
use crate::federation::ClusterDescriptor;
use crate::federation::FederationDescriptor;
use crate::federation::FederationService;
use crate::job_index::JobIndexService;
use crate::job_store::MemoryJobStore;
use crate::rpc_agent::RpcAgent;
use crate::transport::memory::MemoryNetwork;
use crate::types::ClusterId;

pub(crate) fn cid(id: u32) -> ClusterId {
    ClusterId::new(id).unwrap()
}

pub(crate) fn address(id: u32) -> String {
    format!("mem://c{id}")
}

/// Federation of clusters named `c<id>`.
pub(crate) fn descriptor(ids: &[u32]) -> FederationDescriptor {
    FederationDescriptor {
        name: "test".into(),
        generation: 1,
        clusters: ids.iter().map(|id| ClusterDescriptor::new(cid(*id), format!("c{id}"), address(*id))).collect(),
    }
}

pub(crate) fn timing() -> TimingConfig {
    TimingConfig {
        connect_timeout_ms: 500,
        request_timeout_ms: 500,
        rpc_agent_interval_ms: 50,
        ..TimingConfig::default()
    }
}

pub(crate) fn context_with(
    network: &Arc<MemoryNetwork>,
    federation: FederationDescriptor,
    local: u32,
    accounting: Arc<dyn AccountingProbe>,
) -> Arc<FederationContext> {
    let timing = timing();
    let federation = Arc::new(FederationService::new(federation, cid(local)).unwrap());
    let connections = Arc::new(ConnectionManager::new(
        federation.clone(),
        Arc::new(network.transport()),
        timing.connect_timeout(),
        timing.request_timeout(),
    ));
    let rpc = Arc::new(RpcAgent::new(connections.clone(), timing.rpc_agent_interval(), timing.max_backoff_exponent));
    Arc::new(FederationContext {
        federation,
        index: Arc::new(JobIndexService::new()),
        jobs: Arc::new(MemoryJobStore::new(cid(local))),
        connections,
        rpc,
        accounting,
        timing,
    })
}

pub(crate) fn context(network: &Arc<MemoryNetwork>, ids: &[u32], local: u32) -> Arc<FederationContext> {
    context_with(network, descriptor(ids), local, Arc::new(StaticAccountingProbe::default()))
}

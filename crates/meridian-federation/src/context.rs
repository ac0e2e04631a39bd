//! Shared state handed to every federation service.

use std::sync::Arc;

use tracing::error;

use crate::accounting::AccountingProbe;
use crate::config::TimingConfig;
use crate::connection::ConnectionManager;
use crate::error::NotFederatedSnafu;
use crate::error::Result;
use crate::federation::FederationService;
use crate::job_index::JobIndexService;
use crate::job_store::JobStore;
use crate::rpc_agent::RpcAgent;
use crate::types::ClusterId;
use crate::types::FederationMetadata;
use crate::types::JobId;

/// Context for the lock, revocation, submission, reconciliation and
/// dependency services.
pub struct FederationContext {
    /// Membership and per-cluster attributes.
    pub federation: Arc<FederationService>,
    /// Federation metadata of every federated job.
    pub index: Arc<JobIndexService>,
    /// Local job table.
    pub jobs: Arc<dyn JobStore>,
    /// Synchronous request path.
    pub connections: Arc<ConnectionManager>,
    /// Asynchronous, retried request path.
    pub rpc: Arc<RpcAgent>,
    /// Accounting backend reachability, consulted by the lock fallback.
    pub accounting: Arc<dyn AccountingProbe>,
    pub timing: TimingConfig,
}

impl std::fmt::Debug for FederationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationContext")
            .field("local", &self.federation.local_name())
            .field("jobs", &self.index.len())
            .finish()
    }
}

impl FederationContext {
    pub fn local_id(&self) -> ClusterId {
        self.federation.local_id()
    }

    /// Whether the local cluster allocated `job_id`.
    pub fn is_origin(&self, job_id: JobId) -> bool {
        job_id.origin() == Some(self.local_id())
    }

    /// Federation metadata for a job, or `NotFederated`.
    pub fn metadata(&self, job_id: JobId) -> Result<FederationMetadata> {
        match self.index.get(job_id) {
            Some(metadata) => Ok(metadata),
            None => {
                error!(%job_id, "job has no federation metadata");
                NotFederatedSnafu { job_id }.fail()
            }
        }
    }

    /// Siblings currently holding a live copy, excluding the local cluster.
    pub fn remote_active(&self, job_id: JobId) -> Vec<ClusterId> {
        let local = self.local_id();
        self.index
            .get(job_id)
            .map(|metadata| metadata.active().without(local).iter().collect())
            .unwrap_or_default()
    }
}

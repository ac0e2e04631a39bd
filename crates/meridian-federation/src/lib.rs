//! Federation manager for the Meridian workload manager.
//!
//! Coordinates job execution across independently administered clusters
//! ("siblings") joined into a federation. A federated job is copied to every
//! viable sibling, runs on at most one of them, and every other copy is
//! revoked once it starts. After a partition heals, siblings exchange job
//! listings and converge.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        FederationManager                             │
//! │                                                                      │
//! │  submit ──► SubmissionRouter ──► replicate ──────────────┐           │
//! │  start  ──► JobLockService ──► RevocationPropagator ─────┤           │
//! │  sync   ──► ReconciliationEngine                         │           │
//! │  deps   ──► DependencyResolver                           ▼           │
//! │                                   ConnectionManager ◄── RpcAgent     │
//! │  inbound ─► dispatch ─► JobUpdateQueue ─► update processor          │
//! │                                                                      │
//! │  FederationService (membership)   JobIndexService (job metadata)     │
//! │  StateStore (fed_mgr_state)       JobStore / AccountingProbe (host)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The origin cluster (encoded in the high bits of every [`JobId`]) owns the
//! authoritative copy of its jobs and arbitrates their cluster lock.
//!
//! # Key Components
//!
//! | Component | Purpose | Module |
//! |-----------|---------|--------|
//! | [`FederationManager`] | Workers, inbound dispatch, job lifecycle | [`manager`] |
//! | [`ConnectionManager`] | One outbound and one inbound link per sibling | [`connection`] |
//! | [`RpcAgent`] | Batched, retried asynchronous requests | [`rpc_agent`] |
//! | [`JobLockService`] | Cluster lock with ask-everyone fallback | [`lock`] |
//! | [`RevocationPropagator`] | Revoke sibling copies on start | [`revoke`] |
//! | [`SubmissionRouter`] | Viable siblings and replication | [`submission`] |
//! | [`ReconciliationEngine`] | Post-partition convergence | [`reconcile`] |
//! | [`DependencyResolver`] | Cross-cluster job dependencies | [`dependency`] |
//! | [`StateStore`] | Persisted federation state | [`state_store`] |
//!
//! # Tiger Style Resource Bounds
//!
//! | Resource | Limit | Constant |
//! |----------|-------|----------|
//! | Clusters per federation | 63 | [`MAX_FED_CLUSTERS`] |
//! | Frame size | 16 MiB | [`MAX_MESSAGE_SIZE`] |
//! | Requests per batch | 256 | [`MAX_BATCH_SIZE`] |
//! | Queued requests per sibling | 10,000 | [`MAX_QUEUE_PER_SIBLING`] |
//! | Queued inbound job updates | 10,000 | [`MAX_PENDING_JOB_UPDATES`] |
//! | Inbound connections | 128 | [`MAX_INBOUND_CONNECTIONS`] |
//! | Jobs per sync listing | 100,000 | [`MAX_SYNC_JOBS`] |

pub mod accounting;
pub mod config;
pub mod connection;
pub mod constants;
pub mod context;
pub mod dependency;
pub mod error;
pub mod federation;
pub mod job_index;
pub mod job_store;
pub mod lock;
pub mod manager;
pub mod pure;
pub mod reconcile;
pub mod revoke;
pub mod rpc_agent;
pub mod state_store;
pub mod submission;
pub mod transport;
pub mod types;
pub mod update_queue;
pub mod wire;

#[cfg(test)]
mod testing;

pub use accounting::AccountingProbe;
pub use accounting::StaticAccountingProbe;
pub use config::ConfigError;
pub use config::FederationConfig;
pub use config::TimingConfig;
pub use connection::ConnectionManager;
pub use constants::MAX_BATCH_SIZE;
pub use constants::MAX_FED_CLUSTERS;
pub use constants::MAX_INBOUND_CONNECTIONS;
pub use constants::MAX_MESSAGE_SIZE;
pub use constants::MAX_PENDING_JOB_UPDATES;
pub use constants::MAX_QUEUE_PER_SIBLING;
pub use constants::MAX_SYNC_JOBS;
pub use constants::PROTOCOL_VERSION;
pub use context::FederationContext;
pub use dependency::DependencyResolver;
pub use error::ErrorKind;
pub use error::FederationError;
pub use error::Result;
pub use federation::ClusterDescriptor;
pub use federation::FederationDescriptor;
pub use federation::FederationService;
pub use federation::MembershipChange;
pub use job_index::JobIndexService;
pub use job_store::JobDescription;
pub use job_store::JobRecord;
pub use job_store::JobStore;
pub use job_store::JobUpdate;
pub use job_store::MemoryJobStore;
pub use lock::JobLockService;
pub use manager::FederationManager;
pub use reconcile::ReconciliationEngine;
pub use revoke::RevocationPropagator;
pub use rpc_agent::RpcAgent;
pub use state_store::PersistedState;
pub use state_store::StateStore;
pub use submission::SubmissionRouter;
pub use submission::SubmitOutcome;
pub use transport::MessageHandler;
pub use transport::SiblingLink;
pub use transport::SiblingTransport;
pub use transport::memory::MemoryNetwork;
pub use transport::tcp::FederationListener;
pub use transport::tcp::TcpTransport;
pub use types::ClusterId;
pub use types::ClusterState;
pub use types::FederationMetadata;
pub use types::JobId;
pub use types::JobState;
pub use types::SiblingMask;

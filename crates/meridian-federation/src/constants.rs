//! Fixed limits and default timings for the federation manager.
//!
//! Every queue, timeout and retry in the crate is bounded by one of these
//! values. Tunables that operators may want to change are mirrored in
//! [`crate::config::FederationConfig`], which uses these as defaults.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Highest cluster id in a federation. Ids are 1-based and map to mask bits.
pub const MAX_FED_CLUSTERS: u32 = 63;

/// Bit position of the origin cluster id inside a job id.
pub const CLUSTER_ID_SHIFT: u32 = 26;

/// Largest cluster-local job sequence number.
pub const MAX_LOCAL_JOB_ID: u32 = (1 << CLUSTER_ID_SHIFT) - 1;

// ============================================================================
// Protocol
// ============================================================================

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 2;

/// Oldest protocol version still accepted from a sibling.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum size of a single wire frame.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of requests bundled into one batch message.
pub const MAX_BATCH_SIZE: usize = 256;

/// Maximum jobs reported in a single sync listing.
pub const MAX_SYNC_JOBS: usize = 100_000;

// ============================================================================
// Connections
// ============================================================================

/// Bound on a single connect attempt (including handshake).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between repeated connection-failure errors per sibling.
pub const FAILURE_LOG_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// Maximum concurrent inbound sibling connections.
pub const MAX_INBOUND_CONNECTIONS: u32 = 128;

/// How often the connection maintainer retries closed outbound links.
pub const CONNECTION_MAINTAIN_INTERVAL: Duration = Duration::from_secs(5);

/// How long an unanswered sync request blocks another one to the same sibling.
pub const SYNC_RETRY_MS: u64 = 60 * 1000;

// ============================================================================
// Lock / updates
// ============================================================================

/// A pending update response older than this no longer blocks lock grants.
pub const PENDING_UPDATE_STALE_MS: u64 = 60 * 1000;

/// Capacity of the asynchronous job-update queue.
pub const MAX_PENDING_JOB_UPDATES: usize = 10_000;

// ============================================================================
// RPC agent
// ============================================================================

/// Period of the outbound RPC agent loop when no work arrives.
pub const RPC_AGENT_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff exponent cap: retry spacing never exceeds `2^cap` seconds.
pub const MAX_BACKOFF_EXPONENT: u32 = 8;

/// Maximum queued outbound requests per sibling.
pub const MAX_QUEUE_PER_SIBLING: usize = 10_000;

// ============================================================================
// Dependencies
// ============================================================================

/// Period of the remote dependency tester.
pub const DEPENDENCY_TEST_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum clauses accepted in one dependency expression.
pub const MAX_DEPENDENCY_CLAUSES: usize = 64;

/// Capacity of the dependency receiver/applier channels.
pub const MAX_PENDING_DEPENDENCY_MESSAGES: usize = 4_096;

// ============================================================================
// Persistence / lifecycle
// ============================================================================

/// File name of the persisted federation state inside the state directory.
pub const STATE_FILE_NAME: &str = "fed_mgr_state";

/// Magic bytes at the start of the state file.
pub const STATE_FILE_MAGIC: &[u8; 4] = b"MFED";

/// Current state file (and section) format version.
pub const STATE_FILE_VERSION: u16 = 1;

/// Period of the background state saver.
pub const STATE_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on waiting for workers during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Signal number treated as an unconditional cancel.
pub const SIGKILL: u16 = 9;

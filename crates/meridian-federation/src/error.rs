//! Error types for the federation manager.

use std::path::PathBuf;

use snafu::Snafu;

use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::JobState;

/// Result type for federation operations.
pub type Result<T, E = FederationError> = std::result::Result<T, E>;

/// Coarse classification used to decide between retrying, rejecting and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network trouble; retried with backoff.
    Transient,
    /// Version or framing mismatch; rejected, never retried.
    Protocol,
    /// Logical conflict or invalid request; returned to the caller.
    Conflict,
    /// Persisted state cannot be trusted.
    Corrupt,
}

/// Errors from federation operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FederationError {
    /// No sibling with this name exists in the federation.
    #[snafu(display("unknown sibling '{name}'"))]
    UnknownSibling { name: String },

    /// No cluster with this id exists in the federation.
    #[snafu(display("unknown cluster id {id}"))]
    UnknownCluster { id: u32 },

    /// A cluster filter named a cluster outside the federation.
    #[snafu(display("invalid cluster name '{name}' in cluster filter"))]
    InvalidClusterName { name: String },

    /// A cluster feature expression could not be parsed.
    #[snafu(display("invalid cluster feature expression '{expression}': {reason}"))]
    InvalidFeatureExpression { expression: String, reason: String },

    /// Constraints left no cluster able to run the job.
    #[snafu(display("no viable cluster for job: {reason}"))]
    NoViableCluster { reason: String },

    /// Array jobs are only scheduled on their submitting cluster.
    #[snafu(display("array jobs cannot be federated to other clusters"))]
    ArrayJobNotFederated,

    /// Another cluster currently holds the job's cluster lock.
    #[snafu(display("job {job_id} lock held elsewhere (by cluster {holder})"))]
    LockHeld { job_id: JobId, holder: ClusterId },

    /// A sibling refused an ask-everyone lock request.
    #[snafu(display("job {job_id} lock refused by cluster {cluster}: {reason}"))]
    LockRefused { job_id: JobId, cluster: ClusterId, reason: String },

    /// An update response is still outstanding, so the lock cannot be granted yet.
    #[snafu(display("job {job_id} has an update pending on cluster {cluster}"))]
    PendingUpdates { job_id: JobId, cluster: ClusterId },

    /// The cluster is not a viable sibling for the job.
    #[snafu(display("cluster {cluster} is not viable for job {job_id}"))]
    NotViable { job_id: JobId, cluster: ClusterId },

    /// The job has no federation index entry.
    #[snafu(display("job {job_id} is not federated"))]
    NotFederated { job_id: JobId },

    /// The job does not exist locally.
    #[snafu(display("job {job_id} not found"))]
    JobNotFound { job_id: JobId },

    /// A job with this id already exists locally.
    #[snafu(display("job {job_id} already exists"))]
    JobExists { job_id: JobId },

    /// The operation requires a pending job.
    #[snafu(display("job {job_id} is not pending (state {state})"))]
    JobNotPending { job_id: JobId, state: JobState },

    /// The local cluster holds no lock for a job it wants to start.
    #[snafu(display("job {job_id} is not locked by this cluster"))]
    LockNotHeld { job_id: JobId },

    /// The origin is unreachable and the fallback could not be used.
    #[snafu(display("origin cluster {origin} unreachable for job {job_id}: {reason}"))]
    OriginUnreachable { job_id: JobId, origin: ClusterId, reason: String },

    /// The local cluster refuses new federated work.
    #[snafu(display("cluster '{name}' is not accepting federated jobs"))]
    ClusterNotAccepting { name: String },

    /// Job id space of the local cluster is exhausted.
    #[snafu(display("job id space exhausted"))]
    JobIdsExhausted,

    /// Dependency expression is malformed.
    #[snafu(display("invalid dependency '{expression}': {reason}"))]
    InvalidDependency { expression: String, reason: String },

    /// Connecting to a sibling failed.
    #[snafu(display("failed to connect to cluster '{cluster}': {reason}"))]
    ConnectFailed { cluster: String, reason: String },

    /// A bounded network operation exceeded its timeout.
    #[snafu(display("operation timed out: {operation}"))]
    Timeout { operation: String },

    /// The link to a sibling is closed.
    #[snafu(display("link to cluster {cluster} is closed"))]
    LinkClosed { cluster: ClusterId },

    /// Socket I/O failed.
    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    /// A peer speaks an unsupported protocol version.
    #[snafu(display("cluster '{cluster}' speaks protocol {version}, supported {min}..={max}"))]
    ProtocolMismatch { cluster: String, version: u16, min: u16, max: u16 },

    /// A frame could not be decoded or was not expected here.
    #[snafu(display("malformed message: {reason}"))]
    MalformedMessage { reason: String },

    /// A peer answered with a reply of the wrong type.
    #[snafu(display("unexpected reply to {operation}: {reply}"))]
    UnexpectedReply { operation: String, reply: String },

    /// A peer answered with an error.
    #[snafu(display("remote error [{code}]: {message}"))]
    Remote { code: String, message: String },

    /// postcard encoding or decoding failed.
    #[snafu(display("codec error: {source}"))]
    Codec { source: postcard::Error },

    /// The persisted state file is corrupt or from an unsupported version.
    #[snafu(display("state file {} is unusable: {reason}", path.display()))]
    StateCorrupt { path: PathBuf, reason: String },

    /// A state file section does not fit its 32-bit length prefix.
    #[snafu(display("state section {section} of {size} bytes is too large"))]
    SectionTooLarge { section: String, size: usize },

    /// Reading or writing the state file failed.
    #[snafu(display("state file {} I/O error: {source}", path.display()))]
    StateIo { path: PathBuf, source: std::io::Error },

    /// Configuration is invalid.
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    /// A bounded internal queue is full.
    #[snafu(display("{queue} queue is full"))]
    QueueFull { queue: String },

    /// The manager is shutting down.
    #[snafu(display("federation manager is shutting down"))]
    ShuttingDown,
}

impl FederationError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        use FederationError::*;
        match self {
            ConnectFailed { .. } | Timeout { .. } | LinkClosed { .. } | Io { .. } | QueueFull { .. } | ShuttingDown => {
                ErrorKind::Transient
            }
            ProtocolMismatch { .. } | MalformedMessage { .. } | UnexpectedReply { .. } | Codec { .. } => {
                ErrorKind::Protocol
            }
            StateCorrupt { .. } | StateIo { .. } => ErrorKind::Corrupt,
            Remote { code, .. } if code == "transient" => ErrorKind::Transient,
            Remote { code, .. } if code == "protocol" => ErrorKind::Protocol,
            _ => ErrorKind::Conflict,
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Short code sent to peers in error replies.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Transient => "transient",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Corrupt => "corrupt",
        }
    }
}

impl From<std::io::Error> for FederationError {
    fn from(source: std::io::Error) -> Self {
        FederationError::Io { source }
    }
}

impl From<postcard::Error> for FederationError {
    fn from(source: postcard::Error) -> Self {
        FederationError::Codec { source }
    }
}

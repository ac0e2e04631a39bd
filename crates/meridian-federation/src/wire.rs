//! Sibling-to-sibling messages and their framing.
//!
//! Every exchange is one [`FederationMessage`] answered by one
//! [`FederationReply`]. Frames are a 4-byte big-endian length followed by a
//! postcard payload, bounded by [`MAX_MESSAGE_SIZE`].

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::CodecSnafu;
use crate::error::FederationError;
use crate::error::IoSnafu;
use crate::error::MalformedMessageSnafu;
use crate::error::Result;
use crate::job_store::JobDescription;
use crate::job_store::JobUpdate;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::JobState;
use crate::types::RemoteDependencyState;

// ============================================================================
// Requests
// ============================================================================

/// Envelope carried by every request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationMessage {
    pub sender: ClusterId,
    pub body: MessageBody,
}

impl FederationMessage {
    pub fn new(sender: ClusterId, body: MessageBody) -> Self {
        Self { sender, body }
    }
}

/// Replicated job copy sent by the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSibling {
    pub job_id: JobId,
    /// Job description encoded for `blob_version`.
    pub job_blob: Vec<u8>,
    pub blob_version: u16,
    pub submitting_cluster: ClusterId,
    pub interactive: bool,
    pub viable: u64,
    pub active: u64,
    pub submit_time_ms: u64,
}

/// Final or mirrored state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub state: JobState,
    pub return_code: i32,
    pub start_time_ms: u64,
}

/// One job as reported in a sync listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobInfo {
    pub job_id: JobId,
    pub state: JobState,
    pub revoked: bool,
    pub start_time_ms: Option<u64>,
    pub exit_code: i32,
    pub cluster_lock: Option<ClusterId>,
    pub running_cluster: Option<ClusterId>,
}

/// Every federated job the requester is origin of or viable for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobListing {
    pub cluster: ClusterId,
    /// When the listing was taken; later local submissions are skipped.
    pub snapshot_ms: u64,
    pub jobs: Vec<SyncJobInfo>,
}

/// Request bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// First frame on every link.
    Hello { cluster_name: String, protocol_version: u16 },
    SubmitSibling(SubmitSibling),
    JobStart {
        job_id: JobId,
        starting_cluster: ClusterId,
        start_time_ms: u64,
        lock_epoch: u64,
    },
    JobComplete(JobOutcome),
    JobRevoke(JobOutcome),
    JobCancel { job_id: JobId, signal: u16, uid: u32 },
    JobRequeue { job_id: JobId, flags: u32 },
    JobLock { job_id: JobId, cluster: ClusterId },
    JobUnlock { job_id: JobId, cluster: ClusterId },
    /// Ask for the full listing of jobs shared with the sender.
    SyncRequest,
    SyncJobs(SyncJobListing),
    UpdateJob { job_id: JobId, update: JobUpdate, uid: u32 },
    UpdateJobAck { job_id: JobId, return_code: i32 },
    DependencySubmit { job_id: JobId, dependency: String, user_id: u32 },
    DependencyUpdateToOrigin { job_id: JobId, state: RemoteDependencyState },
    Batch(Vec<MessageBody>),
}

impl MessageBody {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Hello { .. } => "hello",
            MessageBody::SubmitSibling(_) => "submit_sibling",
            MessageBody::JobStart { .. } => "job_start",
            MessageBody::JobComplete(_) => "job_complete",
            MessageBody::JobRevoke(_) => "job_revoke",
            MessageBody::JobCancel { .. } => "job_cancel",
            MessageBody::JobRequeue { .. } => "job_requeue",
            MessageBody::JobLock { .. } => "job_lock",
            MessageBody::JobUnlock { .. } => "job_unlock",
            MessageBody::SyncRequest => "sync_request",
            MessageBody::SyncJobs(_) => "sync_jobs",
            MessageBody::UpdateJob { .. } => "update_job",
            MessageBody::UpdateJobAck { .. } => "update_job_ack",
            MessageBody::DependencySubmit { .. } => "dependency_submit",
            MessageBody::DependencyUpdateToOrigin { .. } => "dependency_update",
            MessageBody::Batch(_) => "batch",
        }
    }

    /// Job the message is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            MessageBody::SubmitSibling(submit) => Some(submit.job_id),
            MessageBody::JobComplete(outcome) | MessageBody::JobRevoke(outcome) => Some(outcome.job_id),
            MessageBody::JobStart { job_id, .. }
            | MessageBody::JobCancel { job_id, .. }
            | MessageBody::JobRequeue { job_id, .. }
            | MessageBody::JobLock { job_id, .. }
            | MessageBody::JobUnlock { job_id, .. }
            | MessageBody::UpdateJob { job_id, .. }
            | MessageBody::UpdateJobAck { job_id, .. }
            | MessageBody::DependencySubmit { job_id, .. }
            | MessageBody::DependencyUpdateToOrigin { job_id, .. } => Some(*job_id),
            MessageBody::Hello { .. }
            | MessageBody::SyncRequest
            | MessageBody::SyncJobs(_)
            | MessageBody::Batch(_) => None,
        }
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Reply bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederationReply {
    Ack,
    HelloAck { cluster_name: String, protocol_version: u16 },
    LockGranted { epoch: u64 },
    LockDenied { holder: Option<ClusterId>, reason: String },
    /// One reply per batched request, in order.
    Batch(Vec<FederationReply>),
    Error { code: String, message: String },
}

impl FederationReply {
    pub fn from_error(err: &FederationError) -> Self {
        FederationReply::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Whether the request was processed.
    pub fn is_success(&self) -> bool {
        !matches!(self, FederationReply::Error { .. })
    }

    /// Turn an error reply into a [`FederationError::Remote`].
    pub fn into_result(self) -> Result<FederationReply> {
        match self {
            FederationReply::Error { code, message } => Err(FederationError::Remote { code, message }),
            other => Ok(other),
        }
    }
}

// ============================================================================
// Job blobs
// ============================================================================

/// Job description as understood by protocol version 1 peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDescriptionV1 {
    name: String,
    user_id: u32,
    partition: Option<String>,
    is_array: bool,
    time_limit_mins: Option<u32>,
    script: String,
}

/// Encode a job description for a peer speaking `version`.
pub fn encode_job(description: &JobDescription, version: u16) -> Result<Vec<u8>> {
    if version <= 1 {
        let legacy = JobDescriptionV1 {
            name: description.name.clone(),
            user_id: description.user_id,
            partition: description.partition.clone(),
            is_array: description.is_array,
            time_limit_mins: description.time_limit_mins,
            script: description.script.clone(),
        };
        return postcard::to_stdvec(&legacy).context(CodecSnafu);
    }
    postcard::to_stdvec(description).context(CodecSnafu)
}

/// Decode a job description encoded for `version`.
pub fn decode_job(blob: &[u8], version: u16) -> Result<JobDescription> {
    if version <= 1 {
        let legacy: JobDescriptionV1 = postcard::from_bytes(blob).context(CodecSnafu)?;
        return Ok(JobDescription {
            name: legacy.name,
            user_id: legacy.user_id,
            partition: legacy.partition,
            is_array: legacy.is_array,
            time_limit_mins: legacy.time_limit_mins,
            script: legacy.script,
            ..Default::default()
        });
    }
    postcard::from_bytes(blob).context(CodecSnafu)
}

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_stdvec(value).context(CodecSnafu)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return MalformedMessageSnafu {
            reason: format!("frame of {} bytes exceeds limit", payload.len()),
        }
        .fail();
    }

    let len_bytes = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len_bytes).await.context(IoSnafu)?;
    writer.write_all(&payload).await.context(IoSnafu)?;
    writer.flush().await.context(IoSnafu)?;
    Ok(())
}

/// Read one raw frame payload.
pub async fn read_frame_bytes<R>(reader: &mut R) -> Result<Vec<u8>>
where R: AsyncRead + Unpin {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await.context(IoSnafu)?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return MalformedMessageSnafu {
            reason: format!("frame of {len} bytes exceeds limit"),
        }
        .fail();
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.context(IoSnafu)?;
    Ok(buf)
}

/// Read and decode one frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let buf = read_frame_bytes(reader).await?;
    postcard::from_bytes(&buf).context(CodecSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(id: u32) -> ClusterId {
        ClusterId::new(id).unwrap()
    }

    fn description() -> JobDescription {
        JobDescription {
            name: "train".into(),
            user_id: 1000,
            partition: Some("gpu".into()),
            clusters: Some(vec!["alpha".into(), "beta".into()]),
            cluster_features: Some("gpu".into()),
            dependency: None,
            is_array: false,
            time_limit_mins: Some(60),
            script: "#!/bin/sh\ntrue\n".into(),
        }
    }

    #[test]
    fn test_legacy_blob_drops_new_fields() {
        let blob = encode_job(&description(), 1).unwrap();
        let decoded = decode_job(&blob, 1).unwrap();
        assert_eq!(decoded.name, "train");
        assert_eq!(decoded.partition.as_deref(), Some("gpu"));
        assert_eq!(decoded.clusters, None);
        assert_eq!(decoded.cluster_features, None);

        let current = encode_job(&description(), 2).unwrap();
        assert_eq!(decode_job(&current, 2).unwrap(), description());
    }

    #[test]
    fn test_message_job_id() {
        let body = MessageBody::JobLock {
            job_id: JobId::from_raw(42),
            cluster: cid(2),
        };
        assert_eq!(body.job_id(), Some(JobId::from_raw(42)));
        assert_eq!(body.kind(), "job_lock");
        assert_eq!(MessageBody::SyncRequest.job_id(), None);
    }

    #[test]
    fn test_error_reply_into_result() {
        let reply = FederationReply::Error {
            code: "conflict".into(),
            message: "nope".into(),
        };
        assert!(!reply.is_success());
        assert!(reply.into_result().is_err());
        assert!(FederationReply::Ack.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let msg = FederationMessage::new(cid(1), MessageBody::Batch(vec![
            MessageBody::SyncRequest,
            MessageBody::JobUnlock {
                job_id: JobId::from_raw(7),
                cluster: cid(1),
            },
        ]));
        write_frame(&mut client, &msg).await.unwrap();
        let decoded: FederationMessage = read_frame(&mut server).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();
        let err = read_frame_bytes(&mut server).await.unwrap_err();
        assert!(matches!(err, FederationError::MalformedMessage { .. }));
    }
}

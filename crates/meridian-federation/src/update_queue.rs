//! Asynchronous job-update queue.
//!
//! Inbound notifications that mutate local jobs are acknowledged
//! immediately and applied later, in arrival order, by a single consumer.
//! This keeps the network handler short and serializes all job mutations
//! coming from siblings.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::error::QueueFullSnafu;
use crate::error::Result;
use crate::error::ShuttingDownSnafu;
use crate::job_store::JobUpdate;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::wire::JobOutcome;
use crate::wire::SubmitSibling;
use crate::wire::SyncJobListing;

/// One queued mutation, tagged with the sibling that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingJobUpdate {
    Start {
        sender: ClusterId,
        job_id: JobId,
        starting_cluster: ClusterId,
        start_time_ms: u64,
        lock_epoch: u64,
    },
    Cancel {
        sender: ClusterId,
        job_id: JobId,
        signal: u16,
        uid: u32,
    },
    Complete {
        sender: ClusterId,
        outcome: JobOutcome,
    },
    Revoke {
        sender: ClusterId,
        outcome: JobOutcome,
    },
    Requeue {
        sender: ClusterId,
        job_id: JobId,
        flags: u32,
    },
    Submit {
        sender: ClusterId,
        submit: SubmitSibling,
    },
    Sync {
        sender: ClusterId,
        listing: SyncJobListing,
    },
    UpdateResponse {
        sender: ClusterId,
        job_id: JobId,
        return_code: i32,
    },
    UpdateJob {
        sender: ClusterId,
        job_id: JobId,
        update: JobUpdate,
        uid: u32,
    },
}

impl PendingJobUpdate {
    pub fn sender(&self) -> ClusterId {
        match self {
            PendingJobUpdate::Start { sender, .. }
            | PendingJobUpdate::Cancel { sender, .. }
            | PendingJobUpdate::Complete { sender, .. }
            | PendingJobUpdate::Revoke { sender, .. }
            | PendingJobUpdate::Requeue { sender, .. }
            | PendingJobUpdate::Submit { sender, .. }
            | PendingJobUpdate::Sync { sender, .. }
            | PendingJobUpdate::UpdateResponse { sender, .. }
            | PendingJobUpdate::UpdateJob { sender, .. } => *sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PendingJobUpdate::Start { .. } => "start",
            PendingJobUpdate::Cancel { .. } => "cancel",
            PendingJobUpdate::Complete { .. } => "complete",
            PendingJobUpdate::Revoke { .. } => "revoke",
            PendingJobUpdate::Requeue { .. } => "requeue",
            PendingJobUpdate::Submit { .. } => "submit",
            PendingJobUpdate::Sync { .. } => "sync",
            PendingJobUpdate::UpdateResponse { .. } => "update_response",
            PendingJobUpdate::UpdateJob { .. } => "update_job",
        }
    }
}

/// Bounded FIFO with exactly one consumer.
#[derive(Debug)]
pub struct JobUpdateQueue {
    tx: mpsc::Sender<PendingJobUpdate>,
    rx: Mutex<Option<mpsc::Receiver<PendingJobUpdate>>>,
}

impl JobUpdateQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue an update without waiting.
    pub fn push(&self, update: PendingJobUpdate) -> Result<()> {
        match self.tx.try_send(update) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(update)) => {
                warn!(kind = update.kind(), cluster = %update.sender(), "job update queue full");
                QueueFullSnafu { queue: "job update" }.fail()
            }
            Err(TrySendError::Closed(_)) => ShuttingDownSnafu.fail(),
        }
    }

    /// Hand the receiving end to the consumer. Only the first call succeeds.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<PendingJobUpdate>> {
        self.rx.lock().take()
    }

    /// Updates waiting to be applied.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

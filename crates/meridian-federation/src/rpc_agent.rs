//! Outbound RPC agent.
//!
//! Fire-and-forget requests (revocations, job-state notifications, sync
//! listings, dependency reports) are queued per sibling and delivered by a
//! single background loop. Each pass bundles every due request for a sibling
//! into one [`MessageBody::Batch`]. Delivered requests leave the queue;
//! failed ones stay at the front and back off exponentially up to
//! `2^max_backoff_exponent` seconds.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::connection::ConnectionManager;
use crate::constants::MAX_BATCH_SIZE;
use crate::constants::MAX_QUEUE_PER_SIBLING;
use crate::pure::backoff::is_rpc_due;
use crate::pure::backoff::next_backoff_exponent;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::now_unix_ms;
use crate::wire::FederationReply;
use crate::wire::MessageBody;

/// One queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRpc {
    pub target: ClusterId,
    pub job_id: Option<JobId>,
    pub body: MessageBody,
    pub enqueued_ms: u64,
    /// 0 until the first attempt.
    pub last_attempt_ms: u64,
    pub backoff_exponent: u32,
}

/// Per-entry delivery result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Retry,
    Rejected,
}

fn classify(reply: Option<&FederationReply>) -> Delivery {
    match reply {
        None => Delivery::Retry,
        Some(FederationReply::Error { code, .. }) if code == "transient" => Delivery::Retry,
        Some(FederationReply::Error { .. }) => Delivery::Rejected,
        Some(_) => Delivery::Delivered,
    }
}

/// Per-sibling outbound queues and their delivery loop.
#[derive(Debug)]
pub struct RpcAgent {
    connections: Arc<ConnectionManager>,
    queues: Mutex<HashMap<ClusterId, VecDeque<OutboundRpc>>>,
    notify: Notify,
    interval: Duration,
    max_backoff_exponent: u32,
}

impl RpcAgent {
    pub fn new(connections: Arc<ConnectionManager>, interval: Duration, max_backoff_exponent: u32) -> Self {
        Self {
            connections,
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            interval,
            max_backoff_exponent,
        }
    }

    /// Queue `body` for `target` and wake the loop.
    ///
    /// Returns false when the sibling's queue is full and the request was
    /// dropped.
    pub fn enqueue(&self, target: ClusterId, body: MessageBody) -> bool {
        let rpc = OutboundRpc {
            target,
            job_id: body.job_id(),
            body,
            enqueued_ms: now_unix_ms(),
            last_attempt_ms: 0,
            backoff_exponent: 0,
        };
        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(target).or_default();
            if queue.len() >= MAX_QUEUE_PER_SIBLING {
                warn!(
                    cluster = %target,
                    kind = rpc.body.kind(),
                    job_id = ?rpc.job_id,
                    limit = MAX_QUEUE_PER_SIBLING,
                    "outbound queue full, dropping request"
                );
                return false;
            }
            debug!(cluster = %target, kind = rpc.body.kind(), job_id = ?rpc.job_id, "queued outbound request");
            queue.push_back(rpc);
        }
        self.notify.notify_one();
        true
    }

    /// Number of requests waiting for `target`.
    pub fn pending_for(&self, target: ClusterId) -> usize {
        self.queues.lock().get(&target).map(VecDeque::len).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    /// Snapshot of the queue for `target`.
    pub fn queued(&self, target: ClusterId) -> Vec<OutboundRpc> {
        self.queues.lock().get(&target).map(|q| q.iter().cloned().collect()).unwrap_or_default()
    }

    /// Discard the queue of a departed sibling.
    pub fn remove_sibling(&self, target: ClusterId) {
        if let Some(queue) = self.queues.lock().remove(&target) {
            if !queue.is_empty() {
                warn!(cluster = %target, discarded = queue.len(), "discarding requests for departed sibling");
            }
        }
    }

    /// Take the due prefix of `target`'s queue.
    fn take_due(&self, target: ClusterId, now_ms: u64) -> Vec<OutboundRpc> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(&target) else {
            return Vec::new();
        };
        match queue.front() {
            Some(front) if is_rpc_due(front.last_attempt_ms, front.backoff_exponent, now_ms) => {}
            _ => return Vec::new(),
        }
        let count = queue.len().min(MAX_BATCH_SIZE);
        queue.drain(..count).collect()
    }

    /// Put undelivered entries back at the front, preserving order.
    fn requeue_front(&self, target: ClusterId, entries: Vec<OutboundRpc>) {
        if entries.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(target).or_default();
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
    }

    /// Run one delivery pass over every sibling; returns the number delivered.
    ///
    /// Siblings are served concurrently, so an unreachable one does not
    /// hold up the rest.
    pub async fn process_once(&self) -> usize {
        let targets: Vec<ClusterId> = self.queues.lock().iter().filter(|(_, q)| !q.is_empty()).map(|(id, _)| *id).collect();
        let now_ms = now_unix_ms();
        join_all(targets.into_iter().map(|target| self.deliver_to(target, now_ms))).await.into_iter().sum()
    }

    async fn deliver_to(&self, target: ClusterId, now_ms: u64) -> usize {
        let entries = self.take_due(target, now_ms);
        if entries.is_empty() {
            return 0;
        }

        let body = if entries.len() == 1 {
            entries[0].body.clone()
        } else {
            MessageBody::Batch(entries.iter().map(|e| e.body.clone()).collect())
        };
        let batched = entries.len() > 1;

        let replies: Vec<Option<FederationReply>> = match self.connections.call(target, body).await {
            Ok(FederationReply::Batch(replies)) if batched => {
                let mut replies: Vec<Option<FederationReply>> = replies.into_iter().map(Some).collect();
                replies.resize(entries.len(), None);
                replies
            }
            Ok(reply) if !batched => vec![Some(reply)],
            Ok(other) => {
                warn!(cluster = %target, reply = ?other, "unexpected reply to batch");
                vec![None; entries.len()]
            }
            Err(err) => {
                let reply = (!err.is_retryable()).then(|| FederationReply::from_error(&err));
                if reply.is_none() {
                    debug!(cluster = %target, error = %err, pending = entries.len(), "outbound delivery failed");
                }
                vec![reply; entries.len()]
            }
        };

        let mut delivered = 0;
        let mut retry = Vec::new();
        for (mut entry, reply) in entries.into_iter().zip(replies) {
            match classify(reply.as_ref()) {
                Delivery::Delivered => delivered += 1,
                Delivery::Rejected => {
                    warn!(
                        cluster = %target,
                        kind = entry.body.kind(),
                        job_id = ?entry.job_id,
                        reply = ?reply,
                        "sibling rejected request, dropping"
                    );
                }
                Delivery::Retry => {
                    let (next, reached_cap) = next_backoff_exponent(entry.backoff_exponent, self.max_backoff_exponent);
                    if reached_cap {
                        warn!(
                            cluster = %target,
                            kind = entry.body.kind(),
                            job_id = ?entry.job_id,
                            waited_ms = now_ms.saturating_sub(entry.enqueued_ms),
                            "outbound request reached maximum backoff"
                        );
                    }
                    entry.backoff_exponent = next;
                    entry.last_attempt_ms = now_ms;
                    retry.push(entry);
                }
            }
        }
        self.requeue_front(target, retry);
        delivered
    }

    /// Deliver until `cancel` fires, then drain.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "outbound rpc agent started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.process_once().await;
        }
        self.shutdown();
    }

    /// Log and discard everything still queued.
    pub fn shutdown(&self) {
        let queues = std::mem::take(&mut *self.queues.lock());
        for (target, queue) in queues {
            for rpc in queue {
                info!(
                    cluster = %target,
                    kind = rpc.body.kind(),
                    job_id = ?rpc.job_id,
                    attempts_backoff = rpc.backoff_exponent,
                    "discarding undelivered request at shutdown"
                );
            }
        }
    }
}

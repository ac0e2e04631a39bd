//! In-process sibling network.
//!
//! Handlers register under their cluster address. Links call the target
//! handler directly. Pairs of clusters can be partitioned and healed to
//! simulate network failures; a partition fails new connects and every
//! call on existing links between the pair.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Connected;
use super::LocalIdentity;
use super::MessageHandler;
use super::SiblingLink;
use super::SiblingTransport;
use super::parse_hello_reply;
use crate::constants::PROTOCOL_VERSION;
use crate::error::ConnectFailedSnafu;
use crate::error::LinkClosedSnafu;
use crate::error::Result;
use crate::federation::ClusterDescriptor;
use crate::types::ClusterId;
use crate::wire::FederationMessage;
use crate::wire::FederationReply;

fn pair(a: ClusterId, b: ClusterId) -> (ClusterId, ClusterId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Shared in-process network.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    handlers: RwLock<HashMap<String, Weak<dyn MessageHandler>>>,
    partitions: RwLock<HashSet<(ClusterId, ClusterId)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `handler` reachable at `address`.
    pub fn register(&self, address: impl Into<String>, handler: Weak<dyn MessageHandler>) {
        self.handlers.write().insert(address.into(), handler);
    }

    pub fn unregister(&self, address: &str) {
        self.handlers.write().remove(address);
    }

    /// Cut traffic between two clusters in both directions.
    pub fn partition(&self, a: ClusterId, b: ClusterId) {
        debug!(a = %a, b = %b, "partitioning memory network");
        self.partitions.write().insert(pair(a, b));
    }

    pub fn heal(&self, a: ClusterId, b: ClusterId) {
        debug!(a = %a, b = %b, "healing memory network");
        self.partitions.write().remove(&pair(a, b));
    }

    pub fn heal_all(&self) {
        self.partitions.write().clear();
    }

    pub fn is_partitioned(&self, a: ClusterId, b: ClusterId) -> bool {
        self.partitions.read().contains(&pair(a, b))
    }

    fn handler(&self, address: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(address).and_then(Weak::upgrade)
    }

    /// Transport speaking the current protocol version.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            network: Arc::clone(self),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// [`SiblingTransport`] over a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    protocol_version: u16,
}

impl MemoryTransport {
    /// Announce a different protocol version in handshakes.
    #[must_use]
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }
}

#[async_trait]
impl SiblingTransport for MemoryTransport {
    async fn connect(&self, local: &LocalIdentity, target: &ClusterDescriptor) -> Result<Connected> {
        if self.network.is_partitioned(local.id, target.id) {
            return ConnectFailedSnafu {
                cluster: target.name.clone(),
                reason: "network partitioned",
            }
            .fail();
        }
        let Some(handler) = self.network.handler(&target.address) else {
            return ConnectFailedSnafu {
                cluster: target.name.clone(),
                reason: format!("nothing listening at {}", target.address),
            }
            .fail();
        };

        let session = handler.accept_inbound(local.id, &local.name, self.protocol_version)?;
        let peer_protocol_version = parse_hello_reply(target, session.ack)?;

        let link = MemoryLink {
            network: Arc::clone(&self.network),
            from: local.id,
            to: target.id,
            handler: Arc::downgrade(&handler),
            closed: AtomicBool::new(false),
            remote_closed: session.closed,
        };
        Ok(Connected {
            link: Arc::new(link),
            peer_protocol_version,
        })
    }
}

/// Link to a handler on the same [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryLink {
    network: Arc<MemoryNetwork>,
    from: ClusterId,
    to: ClusterId,
    handler: Weak<dyn MessageHandler>,
    closed: AtomicBool,
    remote_closed: CancellationToken,
}

#[async_trait]
impl SiblingLink for MemoryLink {
    async fn call(&self, message: FederationMessage) -> Result<FederationReply> {
        if self.is_closed() || self.network.is_partitioned(self.from, self.to) {
            self.close();
            return LinkClosedSnafu { cluster: self.to }.fail();
        }
        let Some(handler) = self.handler.upgrade() else {
            self.close();
            return LinkClosedSnafu { cluster: self.to }.fail();
        };
        Ok(handler.handle_message(message).await)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.remote_closed.is_cancelled()
    }
}

//! Sibling links.
//!
//! The connection manager only sees the [`SiblingTransport`] and
//! [`SiblingLink`] traits; inbound traffic is handed to a
//! [`MessageHandler`]. Two implementations are provided:
//!
//! - [`tcp`]: tokio TCP with length-prefixed postcard frames, plus the
//!   [`tcp::FederationListener`] accepting peer-initiated links.
//! - [`memory`]: an in-process network for tests and for embedding several
//!   clusters in one process, with partition injection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::constants::MIN_PROTOCOL_VERSION;
use crate::constants::PROTOCOL_VERSION;
use crate::error::MalformedMessageSnafu;
use crate::error::ProtocolMismatchSnafu;
use crate::error::Result;
use crate::error::UnexpectedReplySnafu;
use crate::federation::ClusterDescriptor;
use crate::types::ClusterId;
use crate::wire::FederationMessage;
use crate::wire::FederationReply;

pub mod memory;
pub mod tcp;

/// Who is connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: ClusterId,
    pub name: String,
}

/// An established, handshaken request/response link.
#[async_trait]
pub trait SiblingLink: Send + Sync + fmt::Debug {
    /// Send one request and wait for its reply.
    async fn call(&self, message: FederationMessage) -> Result<FederationReply>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A freshly opened outbound link.
#[derive(Debug, Clone)]
pub struct Connected {
    pub link: Arc<dyn SiblingLink>,
    /// Protocol version the peer announced in its handshake reply.
    pub peer_protocol_version: u16,
}

/// Opens outbound links to siblings.
#[async_trait]
pub trait SiblingTransport: Send + Sync {
    /// Connect to `target` and complete the handshake.
    async fn connect(&self, local: &LocalIdentity, target: &ClusterDescriptor) -> Result<Connected>;
}

/// Accepted peer-initiated link.
#[derive(Debug, Clone)]
pub struct InboundSession {
    /// Reply to the peer's hello.
    pub ack: FederationReply,
    /// Cancelled when the local side tears the link down.
    pub closed: CancellationToken,
}

/// Receiver of inbound traffic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Validate a peer's hello and register the inbound link.
    fn accept_inbound(&self, sender: ClusterId, cluster_name: &str, protocol_version: u16) -> Result<InboundSession>;

    /// Process one request.
    async fn handle_message(&self, message: FederationMessage) -> FederationReply;
}

/// Reject peers outside the supported protocol range.
pub fn check_protocol_version(cluster: &str, version: u16) -> Result<()> {
    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return ProtocolMismatchSnafu {
            cluster,
            version,
            min: MIN_PROTOCOL_VERSION,
            max: PROTOCOL_VERSION,
        }
        .fail();
    }
    Ok(())
}

/// Interpret the reply to a hello.
pub(crate) fn parse_hello_reply(target: &ClusterDescriptor, reply: FederationReply) -> Result<u16> {
    match reply.into_result()? {
        FederationReply::HelloAck {
            cluster_name,
            protocol_version,
        } => {
            if cluster_name != target.name {
                return MalformedMessageSnafu {
                    reason: format!("expected cluster '{}', reached '{cluster_name}'", target.name),
                }
                .fail();
            }
            check_protocol_version(&target.name, protocol_version)?;
            Ok(protocol_version)
        }
        other => UnexpectedReplySnafu {
            operation: "hello",
            reply: format!("{other:?}"),
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_range() {
        assert!(check_protocol_version("beta", PROTOCOL_VERSION).is_ok());
        assert!(check_protocol_version("beta", MIN_PROTOCOL_VERSION).is_ok());
        assert!(check_protocol_version("beta", PROTOCOL_VERSION + 1).is_err());
        assert!(check_protocol_version("beta", 0).is_err());
    }

    #[test]
    fn test_hello_reply_checks_name() {
        let target = ClusterDescriptor::new(ClusterId::new(2).unwrap(), "beta", "b:1");
        let ok = FederationReply::HelloAck {
            cluster_name: "beta".into(),
            protocol_version: PROTOCOL_VERSION,
        };
        assert_eq!(parse_hello_reply(&target, ok).unwrap(), PROTOCOL_VERSION);

        let wrong = FederationReply::HelloAck {
            cluster_name: "gamma".into(),
            protocol_version: PROTOCOL_VERSION,
        };
        assert!(parse_hello_reply(&target, wrong).is_err());
        assert!(parse_hello_reply(&target, FederationReply::Ack).is_err());
    }
}

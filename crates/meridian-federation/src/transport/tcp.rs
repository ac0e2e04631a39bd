//! TCP sibling links and the inbound listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::Connected;
use super::LocalIdentity;
use super::MessageHandler;
use super::SiblingLink;
use super::SiblingTransport;
use super::parse_hello_reply;
use crate::constants::CONNECT_TIMEOUT;
use crate::constants::MAX_INBOUND_CONNECTIONS;
use crate::constants::PROTOCOL_VERSION;
use crate::constants::REQUEST_TIMEOUT;
use crate::error::FederationError;
use crate::error::IoSnafu;
use crate::error::LinkClosedSnafu;
use crate::error::MalformedMessageSnafu;
use crate::error::Result;
use crate::error::TimeoutSnafu;
use crate::federation::ClusterDescriptor;
use crate::types::ClusterId;
use crate::wire::FederationMessage;
use crate::wire::FederationReply;
use crate::wire::MessageBody;
use crate::wire::read_frame;
use crate::wire::read_frame_bytes;
use crate::wire::write_frame;

// ============================================================================
// Outbound
// ============================================================================

/// Opens TCP links to sibling listeners.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl SiblingTransport for TcpTransport {
    #[instrument(skip(self, local, target), fields(cluster = %target.name, address = %target.address))]
    async fn connect(&self, local: &LocalIdentity, target: &ClusterDescriptor) -> Result<Connected> {
        let handshake = async {
            let mut stream = TcpStream::connect(&target.address).await.context(IoSnafu)?;
            stream.set_nodelay(true).context(IoSnafu)?;

            let hello = FederationMessage::new(local.id, MessageBody::Hello {
                cluster_name: local.name.clone(),
                protocol_version: PROTOCOL_VERSION,
            });
            write_frame(&mut stream, &hello).await?;
            let reply: FederationReply = read_frame(&mut stream).await?;
            let version = parse_hello_reply(target, reply)?;
            Ok::<_, FederationError>((stream, version))
        };

        let (stream, peer_protocol_version) = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                return TimeoutSnafu {
                    operation: format!("connect to {}", target.name),
                }
                .fail();
            }
        };

        debug!(version = peer_protocol_version, "sibling link established");
        Ok(Connected {
            link: Arc::new(TcpLink {
                cluster: target.id,
                stream: Mutex::new(stream),
                closed: AtomicBool::new(false),
            }),
            peer_protocol_version,
        })
    }
}

/// Request/response link over one TCP stream.
#[derive(Debug)]
pub struct TcpLink {
    cluster: ClusterId,
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
}

#[async_trait]
impl SiblingLink for TcpLink {
    async fn call(&self, message: FederationMessage) -> Result<FederationReply> {
        if self.is_closed() {
            return LinkClosedSnafu { cluster: self.cluster }.fail();
        }

        let mut stream = self.stream.lock().await;
        let result = async {
            write_frame(&mut *stream, &message).await?;
            read_frame::<_, FederationReply>(&mut *stream).await
        }
        .await;

        if result.is_err() {
            self.close();
        }
        result
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Accepts peer-initiated links and dispatches their requests.
#[derive(Debug)]
pub struct FederationListener {
    listener: TcpListener,
    connection_semaphore: Arc<Semaphore>,
}

impl FederationListener {
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await.context(IoSnafu)?;
        Ok(Self {
            listener,
            connection_semaphore: Arc::new(Semaphore::new(MAX_INBOUND_CONNECTIONS as usize)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context(IoSnafu)
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, handler: Arc<dyn MessageHandler>, cancel: CancellationToken) {
        info!(address = ?self.listener.local_addr().ok(), "federation listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("federation listener shutting down");
                    self.connection_semaphore.close();
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "failed to accept federation connection");
                            continue;
                        }
                    };

                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                remote = %remote,
                                limit = MAX_INBOUND_CONNECTIONS,
                                "federation connection limit reached, rejecting"
                            );
                            continue;
                        }
                    };

                    let handler = Arc::clone(&handler);
                    let shutdown = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, handler, shutdown).await {
                            debug!(remote = %remote, error = %err, "federation connection ended");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }
}

/// Serve one inbound connection: hello first, then request/reply frames.
#[instrument(skip(stream, handler, shutdown))]
async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let first = match tokio::time::timeout(REQUEST_TIMEOUT, read_frame_bytes(&mut stream)).await {
        Ok(frame) => frame?,
        Err(_) => return TimeoutSnafu { operation: "hello" }.fail(),
    };

    let hello = match postcard::from_bytes::<FederationMessage>(&first) {
        Ok(message) => message,
        Err(err) => {
            let err = FederationError::from(err);
            write_frame(&mut stream, &FederationReply::from_error(&err)).await?;
            return Err(err);
        }
    };
    let sender = hello.sender;
    let (cluster_name, protocol_version) = match hello.body {
        MessageBody::Hello {
            cluster_name,
            protocol_version,
        } => (cluster_name, protocol_version),
        other => {
            let err = MalformedMessageSnafu {
                reason: format!("expected hello, got {}", other.kind()),
            }
            .build();
            write_frame(&mut stream, &FederationReply::from_error(&err)).await?;
            return Err(err);
        }
    };

    let session = match handler.accept_inbound(sender, &cluster_name, protocol_version) {
        Ok(session) => session,
        Err(err) => {
            warn!(cluster = %cluster_name, error = %err, "rejected sibling handshake");
            write_frame(&mut stream, &FederationReply::from_error(&err)).await?;
            return Err(err);
        }
    };
    write_frame(&mut stream, &session.ack).await?;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = session.closed.cancelled() => break,
            frame = read_frame_bytes(&mut stream) => frame?,
        };

        let reply = match postcard::from_bytes::<FederationMessage>(&frame) {
            Ok(message) if message.sender != sender => {
                warn!(cluster = %cluster_name, claimed = %message.sender, "sender changed mid-connection");
                FederationReply::from_error(
                    &MalformedMessageSnafu {
                        reason: "sender does not match handshake",
                    }
                    .build(),
                )
            }
            Ok(message) => handler.handle_message(message).await,
            Err(err) => {
                warn!(cluster = %cluster_name, error = %err, "malformed federation frame");
                FederationReply::from_error(&FederationError::from(err))
            }
        };
        write_frame(&mut stream, &reply).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundSession;
    use crate::transport::check_protocol_version;

    struct Counter;

    #[async_trait]
    impl MessageHandler for Counter {
        fn accept_inbound(&self, _sender: ClusterId, _name: &str, version: u16) -> Result<InboundSession> {
            check_protocol_version("peer", version)?;
            Ok(InboundSession {
                ack: FederationReply::HelloAck {
                    cluster_name: "beta".into(),
                    protocol_version: PROTOCOL_VERSION,
                },
                closed: CancellationToken::new(),
            })
        }

        async fn handle_message(&self, message: FederationMessage) -> FederationReply {
            match message.body {
                MessageBody::JobLock { .. } => FederationReply::LockGranted { epoch: 1 },
                _ => FederationReply::Ack,
            }
        }
    }

    fn cid(id: u32) -> ClusterId {
        ClusterId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = FederationListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(Arc::new(Counter), cancel.clone()));

        let local = LocalIdentity {
            id: cid(1),
            name: "alpha".into(),
        };
        let target = ClusterDescriptor::new(cid(2), "beta", addr.to_string());
        let connected = TcpTransport::default().connect(&local, &target).await.unwrap();
        assert_eq!(connected.peer_protocol_version, PROTOCOL_VERSION);

        let reply = connected
            .link
            .call(FederationMessage::new(cid(1), MessageBody::JobLock {
                job_id: crate::types::JobId::from_raw(5),
                cluster: cid(1),
            }))
            .await
            .unwrap();
        assert_eq!(reply, FederationReply::LockGranted { epoch: 1 });

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient() {
        let local = LocalIdentity {
            id: cid(1),
            name: "alpha".into(),
        };
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap()
        };
        let target = ClusterDescriptor::new(cid(2), "beta", addr.to_string());
        let err = TcpTransport::default().connect(&local, &target).await.unwrap_err();
        assert!(err.is_retryable());
    }
}

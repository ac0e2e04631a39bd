//! Sibling connection management.
//!
//! Keeps at most one outbound and one inbound link per sibling. Outbound
//! links are opened on demand through the injected [`SiblingTransport`] and
//! dropped after any failed call. Repeated connection failures to the same
//! sibling log at `error` at most once per [`FAILURE_LOG_INTERVAL_MS`]; the
//! rest go to `debug`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::constants::FAILURE_LOG_INTERVAL_MS;
use crate::error::FederationError;
use crate::error::Result;
use crate::error::TimeoutSnafu;
use crate::error::UnknownClusterSnafu;
use crate::error::UnknownSiblingSnafu;
use crate::federation::FederationService;
use crate::pure::backoff::should_log_failure;
use crate::transport::LocalIdentity;
use crate::transport::SiblingLink;
use crate::transport::SiblingTransport;
use crate::transport::check_protocol_version;
use crate::types::ClusterId;
use crate::types::now_unix_ms;
use crate::wire::FederationMessage;
use crate::wire::FederationReply;
use crate::wire::MessageBody;

/// Runtime attachments of one sibling.
#[derive(Debug, Default)]
struct SiblingLinks {
    outbound: Option<Arc<dyn SiblingLink>>,
    inbound: Option<CancellationToken>,
    resolved_address: Option<String>,
    last_failure_ms: u64,
    last_failure_logged_ms: u64,
    suppressed_failures: u32,
}

/// Result of registering a peer-initiated link.
#[derive(Debug, Clone)]
pub struct InboundRegistration {
    pub cluster: ClusterId,
    /// Cancelled when the link is torn down locally.
    pub closed: CancellationToken,
    /// The sibling has not been reconciled since it last connected.
    pub needs_sync: bool,
}

/// Owner of every sibling link.
pub struct ConnectionManager {
    identity: LocalIdentity,
    federation: Arc<FederationService>,
    transport: Arc<dyn SiblingTransport>,
    connect_timeout: Duration,
    request_timeout: Duration,
    links: Mutex<HashMap<ClusterId, SiblingLinks>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.identity.name)
            .field("links", &self.links.lock().len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        federation: Arc<FederationService>,
        transport: Arc<dyn SiblingTransport>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let identity = LocalIdentity {
            id: federation.local_id(),
            name: federation.local_name(),
        };
        Self {
            identity,
            federation,
            transport,
            connect_timeout,
            request_timeout,
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> ClusterId {
        self.identity.id
    }

    /// Return the open outbound link to `id`, connecting if needed.
    #[instrument(skip(self), fields(local = %self.identity.name))]
    pub async fn open(&self, id: ClusterId) -> Result<Arc<dyn SiblingLink>> {
        if id == self.identity.id {
            return UnknownClusterSnafu { id: id.value() }.fail();
        }
        if let Some(link) = self.open_link(id) {
            return Ok(link);
        }

        let target = self.federation.require_cluster(id)?;
        let connected = match tokio::time::timeout(self.connect_timeout, self.transport.connect(&self.identity, &target))
            .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => {
                self.record_failure(id, &err);
                return Err(err);
            }
            Err(_) => {
                let err = TimeoutSnafu {
                    operation: format!("connect to {}", target.name),
                }
                .build();
                self.record_failure(id, &err);
                return Err(err);
            }
        };

        self.federation.set_protocol_version(id, connected.peer_protocol_version);
        let existing = {
            let mut links = self.links.lock();
            let entry = links.entry(id).or_default();
            // A concurrent open may have won while we were connecting.
            if let Some(live) = entry.outbound.as_ref().filter(|link| !link.is_closed()) {
                Some(Arc::clone(live))
            } else {
                if entry.suppressed_failures > 0 {
                    info!(
                        cluster = %target.name,
                        suppressed = entry.suppressed_failures,
                        "sibling reachable again"
                    );
                }
                entry.outbound = Some(Arc::clone(&connected.link));
                entry.resolved_address = Some(target.address.clone());
                entry.last_failure_ms = 0;
                entry.last_failure_logged_ms = 0;
                entry.suppressed_failures = 0;
                None
            }
        };
        if let Some(live) = existing {
            connected.link.close();
            debug!(cluster = %target.name, "dropped redundant sibling link");
            return Ok(live);
        }
        info!(
            cluster = %target.name,
            protocol_version = connected.peer_protocol_version,
            "opened sibling link"
        );
        Ok(connected.link)
    }

    /// Open the outbound link to a sibling named `name`.
    pub async fn open_by_name(&self, name: &str) -> Result<Arc<dyn SiblingLink>> {
        let sibling = self.federation.sibling_by_name(name)?;
        self.open(sibling.id).await
    }

    fn open_link(&self, id: ClusterId) -> Option<Arc<dyn SiblingLink>> {
        let links = self.links.lock();
        links.get(&id).and_then(|entry| entry.outbound.as_ref()).filter(|link| !link.is_closed()).cloned()
    }

    /// Drop the outbound link after a failure. The sibling may have missed
    /// updates meanwhile, so it must be re-synced once reachable.
    fn record_failure(&self, id: ClusterId, err: &FederationError) {
        let now = now_unix_ms();
        {
            let mut links = self.links.lock();
            let entry = links.entry(id).or_default();
            entry.outbound = None;
            entry.last_failure_ms = now;
            if should_log_failure(entry.last_failure_logged_ms, now, FAILURE_LOG_INTERVAL_MS) {
                entry.last_failure_logged_ms = now;
                let suppressed = std::mem::take(&mut entry.suppressed_failures);
                error!(cluster = %id, error = %err, suppressed, "failed to reach sibling");
            } else {
                entry.suppressed_failures = entry.suppressed_failures.saturating_add(1);
                debug!(cluster = %id, error = %err, "failed to reach sibling");
            }
        }
        self.federation.mark_unsynced(id);
    }

    /// Tear down both links to `id`. The sibling must be re-synced afterwards.
    pub fn close(&self, id: ClusterId) {
        let removed = {
            let mut links = self.links.lock();
            links.get_mut(&id).map(|entry| {
                entry.resolved_address = None;
                (entry.outbound.take(), entry.inbound.take())
            })
        };
        if let Some((outbound, inbound)) = removed {
            if let Some(link) = outbound {
                link.close();
            }
            if let Some(token) = inbound {
                token.cancel();
            }
            debug!(cluster = %id, "closed sibling links");
        }
        self.federation.mark_unsynced(id);
    }

    /// Close every link, e.g. at shutdown.
    pub fn close_all(&self) {
        let ids: Vec<ClusterId> = self.links.lock().keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    /// Forget a sibling that left the federation.
    pub fn remove(&self, id: ClusterId) {
        self.close(id);
        self.links.lock().remove(&id);
    }

    /// Register a link a sibling opened to us.
    pub fn add_inbound(&self, sender: ClusterId, name: &str, protocol_version: u16) -> Result<InboundRegistration> {
        let sibling = self.federation.sibling_by_name(name)?;
        if sibling.id != sender {
            warn!(cluster = %name, claimed = %sender, expected = %sibling.id, "sibling id mismatch in handshake");
            return UnknownSiblingSnafu { name }.fail();
        }
        check_protocol_version(name, protocol_version)?;
        self.federation.set_protocol_version(sender, protocol_version);

        let closed = CancellationToken::new();
        let previous = {
            let mut links = self.links.lock();
            links.entry(sender).or_default().inbound.replace(closed.clone())
        };
        // A replaced session means the sibling lost its link to us.
        if let Some(previous) = previous {
            previous.cancel();
            self.federation.mark_unsynced(sender);
        }

        info!(cluster = %name, protocol_version, "accepted sibling link");
        Ok(InboundRegistration {
            cluster: sender,
            closed,
            needs_sync: !self.federation.is_synced(sender),
        })
    }

    /// Send one request to `id` and wait for the reply.
    ///
    /// Error replies are returned as [`FederationError::Remote`]. Any
    /// transport failure drops the outbound link.
    pub async fn call(&self, id: ClusterId, body: MessageBody) -> Result<FederationReply> {
        let link = self.open(id).await?;
        let kind = body.kind();
        let message = FederationMessage::new(self.identity.id, body);

        match tokio::time::timeout(self.request_timeout, link.call(message)).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(err)) => {
                link.close();
                self.record_failure(id, &err);
                Err(err)
            }
            Err(_) => {
                link.close();
                let err = TimeoutSnafu {
                    operation: format!("{kind} to cluster {id}"),
                }
                .build();
                self.record_failure(id, &err);
                Err(err)
            }
        }
    }

    /// Whether an outbound link to `id` is currently open.
    pub fn is_connected(&self, id: ClusterId) -> bool {
        self.open_link(id).is_some()
    }

    /// Whether `id` has a live peer-initiated link.
    pub fn has_inbound(&self, id: ClusterId) -> bool {
        self.links.lock().get(&id).and_then(|entry| entry.inbound.as_ref()).is_some_and(|token| !token.is_cancelled())
    }

    /// Unix ms of the last failed connect or call, 0 if none.
    pub fn last_failure_ms(&self, id: ClusterId) -> u64 {
        self.links.lock().get(&id).map(|entry| entry.last_failure_ms).unwrap_or(0)
    }

    pub fn resolved_address(&self, id: ClusterId) -> Option<String> {
        self.links.lock().get(&id).and_then(|entry| entry.resolved_address.clone())
    }
}

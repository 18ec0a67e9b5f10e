//! Connection Coordinator
//!
//! Drives the broker and peer sessions through the handoff:
//!
//! ```text
//! Idle -> BrokerConnecting -> BrokerRegistered -> PeerPending -> PeerActive
//! ```
//!
//! The phase is never stored; it is derived from the two link statuses. The
//! coordinator is the only component that releases the broker link or
//! promotes a pending peer link, and it always does the former first.
//!
//! Provider events are queued on an unbounded channel owned by the
//! coordinator. Callers drain it with [`Coordinator::process_pending`],
//! [`Coordinator::next_event`] or [`Coordinator::run`].

use crate::broker::{BrokerLink, BrokerSession, BrokerStatus};
use crate::broker_api::BrokerApi;
use crate::callbacks::Callbacks;
use crate::config::{validate_broker_address, TetherConfig};
use crate::error::{TetherError, TetherResult};
use crate::identity::IdentityStore;
use crate::peer::{AdmissionDecision, PeerLink, PeerSession, PeerStatus};
use crate::transport::{
    BrokerAddress, LinkEvent, LinkEventSender, LinkId, PeerChannel, TransportProvider,
};
use crate::whitelist::Whitelist;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Externally visible connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Neither link is up
    Idle,
    /// Broker registration in flight
    BrokerConnecting,
    /// Registered and discoverable
    BrokerRegistered,
    /// Peer link admitted or opening, broker not yet released
    PeerPending,
    /// Live peer session, broker released
    PeerActive,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Idle => "idle",
            Self::BrokerConnecting => "broker-connecting",
            Self::BrokerRegistered => "broker-registered",
            Self::PeerPending => "peer-pending",
            Self::PeerActive => "peer-active",
        };
        f.write_str(phase)
    }
}

/// Both ends of the current or most recent peer session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIds {
    /// Our own identifier
    pub self_id: String,
    /// Current remote, or the last connected one when no link is active
    pub other: Option<String>,
}

/// Owner of one node's connection lifecycle
pub struct Coordinator {
    identity: Mutex<IdentityStore>,
    broker: BrokerSession,
    peer: PeerSession,
    callbacks: Mutex<Callbacks>,
    events_tx: LinkEventSender,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl Coordinator {
    /// Create a coordinator from validated configuration
    pub fn new(
        config: &TetherConfig,
        transport: Arc<dyn TransportProvider>,
        api: Arc<dyn BrokerApi>,
        identity: IdentityStore,
    ) -> TetherResult<Self> {
        config.validate()?;
        let address = config.broker_address.as_deref().map(BrokerAddress::new);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            identity: Mutex::new(identity),
            broker: BrokerSession::new(transport, api, address, config.broker_timeout()),
            peer: PeerSession::new(),
            callbacks: Mutex::new(Callbacks::default()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        })
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Called with the remote id once a peer session is live
    pub fn on_connected(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.lock().on_connected = Some(Arc::new(handler));
    }

    /// Called with the remote id and payload of every message on the live session
    pub fn on_data(&self, handler: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        self.callbacks.lock().on_data = Some(Arc::new(handler));
    }

    /// Called with the remote id when the live session closes
    pub fn on_peer_disconnect(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.lock().on_peer_disconnect = Some(Arc::new(handler));
    }

    /// Called when the broker link drops without being released
    pub fn on_broker_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().on_broker_disconnect = Some(Arc::new(handler));
    }

    /// Handlers are invoked on a snapshot so they may re-register freely
    fn callbacks(&self) -> Callbacks {
        self.callbacks.lock().clone()
    }

    // ========================================================================
    // Identity & configuration
    // ========================================================================

    /// Point the broker session at a different broker
    pub fn set_broker_address(&self, address: &str) -> TetherResult<()> {
        validate_broker_address(address)?;
        self.broker.set_address(BrokerAddress::new(address))
    }

    /// Our identifier, generated and persisted on first use
    pub fn self_id(&self) -> TetherResult<String> {
        self.identity.lock().self_id()
    }

    /// Set our identifier; `None` asks the prompt, then falls back to a fresh one
    pub fn set_self_id(&self, id: Option<&str>) -> TetherResult<String> {
        self.identity.lock().set_self_id(id)
    }

    /// Current admission whitelist
    pub fn whitelist(&self) -> TetherResult<Whitelist> {
        self.identity.lock().whitelist()
    }

    /// Replace the admission whitelist from comma-separated input
    ///
    /// Takes effect for the next inbound attempt. The broker only learns of it
    /// on the next registration.
    pub fn set_whitelist(&self, list: Option<&str>) -> TetherResult<Whitelist> {
        self.identity.lock().set_whitelist(list)
    }

    // ========================================================================
    // Broker
    // ========================================================================

    /// Register with the broker, resolving with the currently active peers
    pub async fn connect_to_broker(&self) -> TetherResult<Vec<String>> {
        if self.peer.status().is_busy() {
            return Err(TetherError::PeerSessionActive {
                remote_id: self.peer.remote_id().unwrap_or_default(),
            });
        }
        let self_id = self.self_id()?;
        let whitelist = self.whitelist()?;

        self.broker
            .connect(&self_id, &whitelist, self.events_tx.clone())
            .await
    }

    /// Ask the broker which peers are visible to us
    pub async fn list_active_peers(&self) -> TetherResult<Vec<String>> {
        let self_id = self.self_id()?;
        self.broker.list_active_peers(&self_id).await
    }

    /// Post a chat message to the broker lobby
    pub async fn post_lobby_message(&self, message: &str) -> TetherResult<serde_json::Value> {
        let self_id = self.self_id()?;
        self.broker.post_lobby_message(&self_id, message).await
    }

    // ========================================================================
    // Peer
    // ========================================================================

    /// Open a direct session to `remote_id` through the registered broker
    ///
    /// On success the broker link has been released and the connected
    /// callback has fired. On transport failure the node stays registered.
    pub async fn connect_to_peer(&self, remote_id: &str) -> TetherResult<()> {
        let self_id = self.self_id()?;
        PeerSession::validate_target(&self_id, remote_id)?;

        let broker = self.broker.channel().ok_or(TetherError::NotRegistered)?;
        self.peer.begin_outbound(remote_id)?;
        info!(remote_id, "Connecting to peer");

        match broker.connect(remote_id).await {
            Ok(channel) => {
                if !self.peer.attach(channel.clone()) {
                    channel.close().await;
                    return Err(TetherError::TransportRejected {
                        remote_id: remote_id.to_string(),
                        reason: "link closed before it opened".to_string(),
                    });
                }
                self.complete_handoff().await
            }
            Err(e) => {
                warn!(remote_id, error = %e, "Peer connection rejected by transport");
                self.peer.abort_pending();
                Err(TetherError::TransportRejected {
                    remote_id: remote_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Release the broker, then make the pending peer link live
    async fn complete_handoff(&self) -> TetherResult<()> {
        self.broker.release_intentionally().await;

        match self.peer.promote() {
            Some(remote_id) => {
                info!(remote_id = %remote_id, "Peer session active");
                self.callbacks().connected(&remote_id);
                Ok(())
            }
            None => {
                let remote_id = self.peer.link().remote_id.unwrap_or_default();
                warn!(remote_id = %remote_id, "Peer link closed during handoff");
                Err(TetherError::TransportRejected {
                    remote_id,
                    reason: "link closed during handoff".to_string(),
                })
            }
        }
    }

    /// Send `data` on the live session; a no-op without one
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> TetherResult<()> {
        self.peer.send(data.into()).await
    }

    /// Close the current peer link, if any
    pub async fn close_peer(&self) {
        if let Some(closed) = self.peer.close().await {
            if closed.was_open {
                self.callbacks().peer_disconnected(&closed.remote_id);
            }
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Our id and the current or last connected remote
    pub fn peer_ids(&self) -> TetherResult<PeerIds> {
        let self_id = self.self_id()?;
        let other = self.peer.remote_id().or_else(|| self.peer.last_known());
        Ok(PeerIds { self_id, other })
    }

    /// Phase derived from the broker and peer link statuses
    pub fn phase(&self) -> Phase {
        match self.peer.status() {
            PeerStatus::Open => return Phase::PeerActive,
            PeerStatus::Pending => return Phase::PeerPending,
            PeerStatus::Idle | PeerStatus::Closed => {}
        }
        match self.broker.status() {
            BrokerStatus::Connecting => Phase::BrokerConnecting,
            BrokerStatus::Registered => Phase::BrokerRegistered,
            BrokerStatus::Disconnected | BrokerStatus::Lost => Phase::Idle,
        }
    }

    /// Snapshot of the broker link
    pub fn broker_link(&self) -> BrokerLink {
        self.broker.link()
    }

    /// Snapshot of the peer link
    pub fn peer_link(&self) -> PeerLink {
        self.peer.link()
    }

    // ========================================================================
    // Event processing
    // ========================================================================

    /// Handle every queued provider event without waiting, returning how many ran
    pub async fn process_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let event = self.events_rx.lock().await.try_recv();
            match event {
                Ok(event) => {
                    self.handle_event(event).await;
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    /// Wait for one provider event and handle it
    ///
    /// Returns `false` once the queue can deliver nothing more.
    pub async fn next_event(&self) -> bool {
        let event = self.events_rx.lock().await.recv().await;
        match event {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Handle provider events until the queue closes
    pub async fn run(&self) {
        while self.next_event().await {}
    }

    async fn handle_event(&self, event: LinkEvent) {
        debug!(event = ?event, "Handling link event");
        match event {
            LinkEvent::Incoming { broker, channel } => self.handle_incoming(broker, channel).await,
            LinkEvent::BrokerDisconnected { broker } => {
                if let Some(channel) = self.broker.handle_lost(broker) {
                    channel.destroy().await;
                    self.callbacks().broker_disconnected();
                }
            }
            LinkEvent::PeerData { link, data } => match self.peer.data_source(link) {
                Some(remote_id) => self.callbacks().data(&remote_id, &data),
                None => debug!(link = %link, "Ignoring data from unbound link"),
            },
            LinkEvent::PeerClosed { link } => {
                if let Some(closed) = self.peer.handle_closed(link) {
                    if closed.was_open {
                        info!(remote_id = %closed.remote_id, "Peer session closed");
                        self.callbacks().peer_disconnected(&closed.remote_id);
                    } else {
                        debug!(remote_id = %closed.remote_id, "Pending peer link closed");
                    }
                }
            }
        }
    }

    async fn handle_incoming(&self, broker: LinkId, channel: Arc<dyn PeerChannel>) {
        if !self.broker.is_current(broker) {
            debug!(
                broker = %broker,
                remote_id = channel.remote_id(),
                "Closing inbound attempt from a stale broker link"
            );
            channel.close().await;
            return;
        }

        let (self_id, whitelist) = match (self.self_id(), self.whitelist()) {
            (Ok(self_id), Ok(whitelist)) => (self_id, whitelist),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Cannot evaluate inbound attempt, closing it");
                channel.close().await;
                return;
            }
        };

        match self.peer.accept_incoming(channel.clone(), &self_id, &whitelist) {
            AdmissionDecision::Admit => {
                if let Err(e) = self.complete_handoff().await {
                    warn!(error = %e, "Inbound handoff failed");
                }
            }
            AdmissionDecision::Reject(_) => channel.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::store::MemoryStore;
    use crate::error::TransportError;
    use crate::transport::{BrokerChannel, TransportResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider whose peer channels are reported closed before `connect` returns them
    struct ClosingTransport;

    struct ClosingBroker {
        link: LinkId,
        events: LinkEventSender,
    }

    struct DeadChannel {
        link: LinkId,
        remote_id: String,
    }

    #[async_trait]
    impl TransportProvider for ClosingTransport {
        async fn register(
            &self,
            _self_id: &str,
            _address: &BrokerAddress,
            events: LinkEventSender,
        ) -> TransportResult<Arc<dyn BrokerChannel>> {
            Ok(Arc::new(ClosingBroker {
                link: LinkId::new(),
                events,
            }))
        }

        fn transport_type(&self) -> &'static str {
            "closing"
        }
    }

    #[async_trait]
    impl BrokerChannel for ClosingBroker {
        fn link_id(&self) -> LinkId {
            self.link
        }

        async fn connect(&self, remote_id: &str) -> TransportResult<Arc<dyn PeerChannel>> {
            let channel = DeadChannel {
                link: LinkId::new(),
                remote_id: remote_id.to_string(),
            };
            self.events
                .send(LinkEvent::PeerClosed { link: channel.link })
                .map_err(|_| TransportError::Closed)?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Arc::new(channel))
        }

        async fn disconnect(&self) {}

        async fn destroy(&self) {}
    }

    #[async_trait]
    impl PeerChannel for DeadChannel {
        fn link_id(&self) -> LinkId {
            self.link
        }

        fn remote_id(&self) -> &str {
            &self.remote_id
        }

        async fn send(&self, _data: Vec<u8>) -> TransportResult<()> {
            Err(TransportError::Closed)
        }

        async fn close(&self) {}
    }

    fn node(network: &MemoryNetwork, id: &str) -> Coordinator {
        let store = Arc::new(MemoryStore::with_entries([(crate::store::USER_ID_KEY, id)]));
        let config = TetherConfig {
            broker_address: Some("http://memory".to_string()),
            ..TetherConfig::default()
        };
        Coordinator::new(
            &config,
            Arc::new(network.clone()),
            Arc::new(network.clone()),
            IdentityStore::new(store),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let network = MemoryNetwork::new();
        let config = TetherConfig {
            broker_timeout_secs: 0,
            ..TetherConfig::default()
        };
        let result = Coordinator::new(
            &config,
            Arc::new(network.clone()),
            Arc::new(network),
            IdentityStore::new(Arc::new(MemoryStore::new())),
        );
        assert!(matches!(result, Err(TetherError::Config(_))));
    }

    #[test]
    fn test_set_broker_address_validates() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        assert!(matches!(
            alice.set_broker_address("ftp://broker"),
            Err(TetherError::Config(_))
        ));
        alice.set_broker_address("https://broker.example.org").unwrap();
        assert_eq!(
            alice.broker_link().address,
            Some(BrokerAddress::new("https://broker.example.org"))
        );
    }

    #[tokio::test]
    async fn test_outbound_handoff() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        let bob = node(&network, "bob");
        bob.connect_to_broker().await.unwrap();
        let peers = alice.connect_to_broker().await.unwrap();
        assert_eq!(peers, vec!["bob".to_string()]);

        let connected = Arc::new(AtomicUsize::new(0));
        let counter = connected.clone();
        alice.on_connected(move |remote| {
            assert_eq!(remote, "bob");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        alice.connect_to_peer("bob").await.unwrap();
        assert_eq!(alice.phase(), Phase::PeerActive);
        assert_eq!(alice.broker_link().status, BrokerStatus::Disconnected);
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        bob.process_pending().await;
        assert_eq!(bob.phase(), Phase::PeerActive);
        assert_eq!(
            bob.peer_ids().unwrap(),
            PeerIds {
                self_id: "bob".to_string(),
                other: Some("alice".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_connect_to_peer_requires_broker() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        assert!(matches!(
            alice.connect_to_peer("bob").await,
            Err(TetherError::NotRegistered)
        ));
        assert_eq!(alice.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_broker_connect_refused_while_peer_active() {
        let network = MemoryNetwork::new();
        let alice = node(&network, "alice");
        let bob = node(&network, "bob");
        bob.connect_to_broker().await.unwrap();
        alice.connect_to_broker().await.unwrap();
        alice.connect_to_peer("bob").await.unwrap();

        assert!(matches!(
            alice.connect_to_broker().await,
            Err(TetherError::PeerSessionActive { remote_id }) if remote_id == "bob"
        ));

        alice.close_peer().await;
        assert_eq!(alice.phase(), Phase::Idle);
        alice.connect_to_broker().await.unwrap();
        assert_eq!(alice.phase(), Phase::BrokerRegistered);
    }

    /// A close drained while the outbound connect is still in flight is not lost
    #[tokio::test(start_paused = true)]
    async fn test_outbound_link_closed_before_open_is_rejected() {
        let network = MemoryNetwork::new();
        let store = Arc::new(MemoryStore::with_entries([(crate::store::USER_ID_KEY, "me")]));
        let config = TetherConfig {
            broker_address: Some("http://memory".to_string()),
            ..TetherConfig::default()
        };
        let me = Coordinator::new(
            &config,
            Arc::new(ClosingTransport),
            Arc::new(network),
            IdentityStore::new(store),
        )
        .unwrap();
        let connected = Arc::new(AtomicUsize::new(0));
        let counter = connected.clone();
        me.on_connected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        me.connect_to_broker().await.unwrap();

        let (result, ()) = tokio::join!(me.connect_to_peer("bob"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            me.process_pending().await;
        });

        assert!(matches!(
            result,
            Err(TetherError::TransportRejected { ref remote_id, .. }) if remote_id == "bob"
        ));
        assert_eq!(me.peer_link().status, PeerStatus::Idle);
        assert_eq!(me.phase(), Phase::BrokerRegistered);
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        // The slot is free again, so the broker state is what blocks a reconnect
        assert!(matches!(
            me.connect_to_broker().await,
            Err(TetherError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::PeerActive.to_string(), "peer-active");
        assert_eq!(Phase::Idle.to_string(), "idle");
    }
}

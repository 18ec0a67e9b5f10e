//! In-memory broker and transport
//!
//! Every node registered on the same [`MemoryNetwork`] can reach every other
//! one. The network also answers the broker HTTP surface, so a single value
//! stands in for both collaborators. Useful for tests and local demos; fault
//! knobs let callers stall registration, refuse connections, delay opens,
//! fail HTTP requests and drop broker links.

use crate::broker_api::BrokerApi;
use crate::error::{TetherError, TetherResult, TransportError};
use crate::transport::{
    BrokerAddress, BrokerChannel, LinkEvent, LinkEventSender, LinkId, PeerChannel,
    TransportProvider, TransportResult,
};
use crate::whitelist::Whitelist;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One end of a peer channel
#[derive(Debug, Clone)]
struct LinkEnd {
    owner: String,
    counterpart: LinkId,
}

#[derive(Default)]
struct NetworkState {
    /// Registered node id -> its live broker link
    brokers: HashMap<String, LinkId>,
    /// Event sinks, kept after broker release so peer traffic still flows
    sinks: HashMap<String, LinkEventSender>,
    links: HashMap<LinkId, LinkEnd>,
    stalled: bool,
    refusing: bool,
    connect_delay: Option<Duration>,
    connect_attempts: usize,
    /// Whitelists registered over the HTTP surface
    whitelists: HashMap<String, Whitelist>,
    lobby: Vec<(String, String)>,
    api_offline: bool,
    api_requests: usize,
}

impl NetworkState {
    fn emit(&self, node: &str, event: LinkEvent) {
        match self.sinks.get(node) {
            Some(sink) => {
                if sink.send(event).is_err() {
                    tracing::debug!(node, "Dropping event for node with closed event queue");
                }
            }
            None => tracing::debug!(node, "Dropping event for unknown node"),
        }
    }
}

/// In-process rendezvous network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Never report registrations as open while set
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Refuse every outbound peer connection while set
    pub fn set_refusing(&self, refusing: bool) {
        self.state.lock().refusing = refusing;
    }

    /// Delay before an outbound peer connection reports open
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// Number of outbound peer connections attempted so far
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Whether `node` currently holds a broker link
    pub fn is_registered(&self, node: &str) -> bool {
        self.state.lock().brokers.contains_key(node)
    }

    /// Number of open peer channel ends
    pub fn open_links(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Fail every HTTP-surface request while set
    pub fn set_api_offline(&self, offline: bool) {
        self.state.lock().api_offline = offline;
    }

    /// Number of HTTP-surface requests served or failed so far
    pub fn api_requests(&self) -> usize {
        self.state.lock().api_requests
    }

    /// Whitelist `node` registered with the broker, if any
    pub fn registered_whitelist(&self, node: &str) -> Option<Whitelist> {
        self.state.lock().whitelists.get(node).cloned()
    }

    /// Lobby messages in posting order as `(sender, message)`
    pub fn lobby_messages(&self) -> Vec<(String, String)> {
        self.state.lock().lobby.clone()
    }

    fn api_request(&self, endpoint: &'static str) -> TetherResult<parking_lot::MutexGuard<'_, NetworkState>> {
        let mut state = self.state.lock();
        state.api_requests += 1;
        if state.api_offline {
            return Err(TetherError::BrokerRequest {
                endpoint,
                reason: "memory broker offline".to_string(),
            });
        }
        Ok(state)
    }

    /// Drop `node`'s broker link as if the connection failed
    ///
    /// Returns `false` if the node was not registered.
    pub fn drop_broker(&self, node: &str) -> bool {
        let mut state = self.state.lock();
        match state.brokers.remove(node) {
            Some(broker) => {
                tracing::info!(node, "Simulating broker link loss");
                state.emit(node, LinkEvent::BrokerDisconnected { broker });
                true
            }
            None => false,
        }
    }

    /// Open a peer channel from `from` to `to` without `from` being registered
    ///
    /// Mirrors an attempt arriving at `to` from a node we do not control.
    pub fn inject_incoming(&self, from: &str, to: &str) -> TransportResult<Arc<dyn PeerChannel>> {
        let mut state = self.state.lock();
        let broker = *state
            .brokers
            .get(to)
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;
        Ok(self.open_pair(&mut state, from, to, broker))
    }

    fn open_pair(
        &self,
        state: &mut NetworkState,
        from: &str,
        to: &str,
        to_broker: LinkId,
    ) -> Arc<dyn PeerChannel> {
        let local = LinkId::new();
        let remote = LinkId::new();
        state.links.insert(
            local,
            LinkEnd {
                owner: from.to_string(),
                counterpart: remote,
            },
        );
        state.links.insert(
            remote,
            LinkEnd {
                owner: to.to_string(),
                counterpart: local,
            },
        );

        let incoming = Arc::new(MemoryPeerChannel {
            network: self.clone(),
            link: remote,
            remote_id: from.to_string(),
        });
        state.emit(
            to,
            LinkEvent::Incoming {
                broker: to_broker,
                channel: incoming,
            },
        );

        Arc::new(MemoryPeerChannel {
            network: self.clone(),
            link: local,
            remote_id: to.to_string(),
        })
    }
}

#[async_trait]
impl TransportProvider for MemoryNetwork {
    async fn register(
        &self,
        self_id: &str,
        address: &BrokerAddress,
        events: LinkEventSender,
    ) -> TransportResult<Arc<dyn BrokerChannel>> {
        let stalled = self.state.lock().stalled;
        if stalled {
            tracing::debug!(self_id, "Memory broker stalled, registration never opens");
            std::future::pending::<()>().await;
        }

        let link = LinkId::new();
        {
            let mut state = self.state.lock();
            if state.brokers.contains_key(self_id) {
                return Err(TransportError::Refused(format!("id {self_id} is taken")));
            }
            state.brokers.insert(self_id.to_string(), link);
            state.sinks.insert(self_id.to_string(), events);
        }

        tracing::debug!(self_id, broker = %address, link = %link, "Memory broker registration open");
        Ok(Arc::new(MemoryBrokerChannel {
            network: self.clone(),
            self_id: self_id.to_string(),
            link,
        }))
    }

    fn transport_type(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl BrokerApi for MemoryNetwork {
    /// Registered nodes, other than the caller, whose whitelist admits it
    async fn active_peers(&self, _address: &BrokerAddress, self_id: &str) -> TetherResult<Vec<String>> {
        let state = self.api_request("/peers")?;
        let mut peers: Vec<String> = state
            .brokers
            .keys()
            .filter(|node| node.as_str() != self_id)
            .filter(|node| {
                state
                    .whitelists
                    .get(node.as_str())
                    .map_or(true, |list| list.admits(self_id))
            })
            .cloned()
            .collect();
        peers.sort();
        Ok(peers)
    }

    async fn post_lobby(
        &self,
        _address: &BrokerAddress,
        self_id: &str,
        message: &str,
    ) -> TetherResult<serde_json::Value> {
        let mut state = self.api_request("/lobby")?;
        state.lobby.push((self_id.to_string(), message.to_string()));
        Ok(serde_json::json!({ "ok": true, "count": state.lobby.len() }))
    }

    async fn register_whitelist(
        &self,
        _address: &BrokerAddress,
        self_id: &str,
        whitelist: &Whitelist,
    ) -> TetherResult<()> {
        let mut state = self.api_request("/whitelist")?;
        state.whitelists.insert(self_id.to_string(), whitelist.clone());
        Ok(())
    }
}

/// Broker link on a [`MemoryNetwork`]
pub struct MemoryBrokerChannel {
    network: MemoryNetwork,
    self_id: String,
    link: LinkId,
}

#[async_trait]
impl BrokerChannel for MemoryBrokerChannel {
    fn link_id(&self) -> LinkId {
        self.link
    }

    async fn connect(&self, remote_id: &str) -> TransportResult<Arc<dyn PeerChannel>> {
        let delay = {
            let mut state = self.network.state.lock();
            state.connect_attempts += 1;
            if state.refusing {
                return Err(TransportError::Refused(format!("{remote_id} refused")));
            }
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.network.state.lock();
        if state.brokers.get(&self.self_id) != Some(&self.link) {
            return Err(TransportError::Closed);
        }
        let remote_broker = *state
            .brokers
            .get(remote_id)
            .ok_or_else(|| TransportError::Unreachable(remote_id.to_string()))?;

        Ok(self
            .network
            .open_pair(&mut state, &self.self_id, remote_id, remote_broker))
    }

    async fn disconnect(&self) {
        let mut state = self.network.state.lock();
        if state.brokers.get(&self.self_id) == Some(&self.link) {
            state.brokers.remove(&self.self_id);
            // Like a real signaling client, teardown is reported as a disconnect
            state.emit(
                &self.self_id,
                LinkEvent::BrokerDisconnected { broker: self.link },
            );
        }
    }

    async fn destroy(&self) {
        let mut state = self.network.state.lock();
        if state.brokers.get(&self.self_id) == Some(&self.link) {
            state.brokers.remove(&self.self_id);
        }
    }
}

/// Peer channel on a [`MemoryNetwork`]
pub struct MemoryPeerChannel {
    network: MemoryNetwork,
    link: LinkId,
    remote_id: String,
}

#[async_trait]
impl PeerChannel for MemoryPeerChannel {
    fn link_id(&self) -> LinkId {
        self.link
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn send(&self, data: Vec<u8>) -> TransportResult<()> {
        let state = self.network.state.lock();
        let end = state.links.get(&self.link).ok_or(TransportError::Closed)?;
        let peer_end = state
            .links
            .get(&end.counterpart)
            .ok_or(TransportError::Closed)?;
        state.emit(
            &peer_end.owner,
            LinkEvent::PeerData {
                link: end.counterpart,
                data,
            },
        );
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.network.state.lock();
        let Some(end) = state.links.remove(&self.link) else {
            return;
        };
        let peer_end = state.links.remove(&end.counterpart);

        state.emit(&end.owner, LinkEvent::PeerClosed { link: self.link });
        if let Some(peer_end) = peer_end {
            state.emit(
                &peer_end.owner,
                LinkEvent::PeerClosed {
                    link: end.counterpart,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn address() -> BrokerAddress {
        BrokerAddress::new("http://memory")
    }

    #[tokio::test]
    async fn test_connect_delivers_incoming_and_data() {
        let network = MemoryNetwork::new();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();

        let alice = network.register("alice", &address(), alice_tx).await.unwrap();
        let bob = network.register("bob", &address(), bob_tx).await.unwrap();

        let outbound = alice.connect("bob").await.unwrap();
        assert_eq!(outbound.remote_id(), "bob");
        assert_eq!(network.connect_attempts(), 1);

        let incoming = match bob_rx.try_recv().unwrap() {
            LinkEvent::Incoming { broker, channel } => {
                assert_eq!(broker, bob.link_id());
                channel
            }
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(incoming.remote_id(), "alice");

        incoming.send(b"ping".to_vec()).await.unwrap();
        match alice_rx.try_recv().unwrap() {
            LinkEvent::PeerData { link, data } => {
                assert_eq!(link, outbound.link_id());
                assert_eq!(data, b"ping");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_notifies_both_ends() {
        let network = MemoryNetwork::new();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let alice = network.register("alice", &address(), alice_tx).await.unwrap();
        network.register("bob", &address(), bob_tx).await.unwrap();

        let outbound = alice.connect("bob").await.unwrap();
        let _incoming = bob_rx.try_recv().unwrap();
        assert_eq!(network.open_links(), 2);

        outbound.close().await;
        assert_eq!(network.open_links(), 0);
        assert!(matches!(alice_rx.try_recv().unwrap(), LinkEvent::PeerClosed { .. }));
        assert!(matches!(bob_rx.try_recv().unwrap(), LinkEvent::PeerClosed { .. }));
        assert_eq!(outbound.send(vec![1]).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_unknown_and_refused_targets() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let alice = network.register("alice", &address(), tx).await.unwrap();

        assert!(matches!(
            alice.connect("nobody").await,
            Err(TransportError::Unreachable(_))
        ));

        network.set_refusing(true);
        assert!(matches!(
            alice.connect("alice").await,
            Err(TransportError::Refused(_))
        ));
        assert_eq!(network.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_reports_and_destroy_is_silent() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = network.register("alice", &address(), tx.clone()).await.unwrap();

        broker.disconnect().await;
        assert!(!network.is_registered("alice"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            LinkEvent::BrokerDisconnected { .. }
        ));

        let broker = network.register("alice", &address(), tx).await.unwrap();
        broker.destroy().await;
        assert!(!network.is_registered("alice"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_http_surface_filters_by_whitelist() {
        let network = MemoryNetwork::new();
        for node in ["alice", "bob", "carol"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            network.register(node, &address(), tx).await.unwrap();
        }
        network
            .register_whitelist(&address(), "carol", &Whitelist::only(["bob"]))
            .await
            .unwrap();

        let peers = network.active_peers(&address(), "alice").await.unwrap();
        assert_eq!(peers, vec!["bob".to_string()]);
        let peers = network.active_peers(&address(), "bob").await.unwrap();
        assert_eq!(peers, vec!["alice".to_string(), "carol".to_string()]);

        let ack = network.post_lobby(&address(), "alice", "hello").await.unwrap();
        assert_eq!(ack["ok"], serde_json::json!(true));
        assert_eq!(
            network.lobby_messages(),
            vec![("alice".to_string(), "hello".to_string())]
        );

        network.set_api_offline(true);
        assert!(network.active_peers(&address(), "alice").await.is_err());
        assert_eq!(network.api_requests(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_registration_refused() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        network.register("alice", &address(), tx.clone()).await.unwrap();
        assert!(network.register("alice", &address(), tx).await.is_err());
    }
}

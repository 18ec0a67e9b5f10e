//! Lifecycle callback slots
//!
//! Each slot is optional; firing an empty slot does nothing.

use std::sync::Arc;

/// Invoked with the remote id once a peer session is live
pub type ConnectedHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked with the remote id and payload for each message on the live session
pub type DataHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Invoked with the remote id when the live session closes
pub type PeerDisconnectHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked when the broker link drops unintentionally
pub type BrokerDisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Registered handlers
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Peer session became live
    pub on_connected: Option<ConnectedHandler>,
    /// Data arrived on the live session
    pub on_data: Option<DataHandler>,
    /// Live session closed
    pub on_peer_disconnect: Option<PeerDisconnectHandler>,
    /// Broker link lost without being released
    pub on_broker_disconnect: Option<BrokerDisconnectHandler>,
}

impl Callbacks {
    pub(crate) fn connected(&self, remote_id: &str) {
        if let Some(handler) = &self.on_connected {
            handler(remote_id);
        }
    }

    pub(crate) fn data(&self, remote_id: &str, data: &[u8]) {
        if let Some(handler) = &self.on_data {
            handler(remote_id, data);
        }
    }

    pub(crate) fn peer_disconnected(&self, remote_id: &str) {
        if let Some(handler) = &self.on_peer_disconnect {
            handler(remote_id);
        }
    }

    pub(crate) fn broker_disconnected(&self) {
        if let Some(handler) = &self.on_broker_disconnect {
            handler();
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_peer_disconnect", &self.on_peer_disconnect.is_some())
            .field("on_broker_disconnect", &self.on_broker_disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_slots_are_noops() {
        let callbacks = Callbacks::default();
        callbacks.connected("alice");
        callbacks.data("alice", b"x");
        callbacks.peer_disconnected("alice");
        callbacks.broker_disconnected();
    }

    #[test]
    fn test_registered_handler_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let callbacks = Callbacks {
            on_data: Some(Arc::new(move |remote, data| {
                assert_eq!(remote, "bob");
                counter.fetch_add(data.len(), Ordering::SeqCst);
            })),
            ..Default::default()
        };

        callbacks.data("bob", b"abc");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(format!("{callbacks:?}").contains("on_data: true"));
    }
}

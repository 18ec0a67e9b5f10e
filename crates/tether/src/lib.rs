//! Tether - broker-to-peer connection handoff
//!
//! A node registers with a rendezvous broker to become discoverable, admits
//! exactly one whitelisted peer, and releases the broker once the direct
//! session is live.
//!
//! The transport itself (signaling, NAT traversal, encryption) is supplied by
//! a [`TransportProvider`]; the broker's HTTP surface by a [`BrokerApi`];
//! identity persistence by a [`KeyValueStore`]. [`MemoryNetwork`] implements
//! the first two in-process for tests and demos.

pub mod broker;
pub mod broker_api;
pub mod callbacks;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod memory;
pub mod peer;
pub mod store;
pub mod transport;
pub mod whitelist;

pub use broker::{BrokerLink, BrokerSession, BrokerStatus};
pub use broker_api::{BrokerApi, HttpBrokerApi};
pub use callbacks::Callbacks;
pub use config::TetherConfig;
pub use coordinator::{Coordinator, PeerIds, Phase};
pub use error::{StoreError, TetherError, TetherResult, TransportError};
pub use identity::{generate_self_id, IdentityStore, NoPrompt, ValuePrompt};
pub use memory::MemoryNetwork;
pub use peer::{AdmissionDecision, PeerLink, PeerSession, PeerStatus, RejectReason};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{
    BrokerAddress, BrokerChannel, LinkEvent, LinkEventSender, LinkId, PeerChannel,
    TransportProvider,
};
pub use whitelist::Whitelist;

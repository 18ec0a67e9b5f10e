//! Transport provider interface
//!
//! The point-to-point machinery (signaling, NAT traversal, encryption) lives
//! outside this crate. A provider hands back channel objects and reports
//! asynchronous happenings as [`LinkEvent`]s on the sender it was given when
//! the broker link was registered.

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Result alias for provider operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sender side of the coordinator's event queue
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Identity of one broker or peer channel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(Uuid);

impl LinkId {
    /// Generate a fresh link identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base URL of a rendezvous broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerAddress {
    url: String,
}

impl BrokerAddress {
    /// Create a broker address; a trailing slash is dropped
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
        }
    }

    /// The base URL
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Host part without scheme, e.g. `broker.example.org:9000`
    pub fn host(&self) -> &str {
        self.url
            .split_once("//")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url)
    }

    /// Whether the broker is reached over TLS
    pub fn is_secure(&self) -> bool {
        self.url.starts_with("https://")
    }

    /// Default port implied by the scheme
    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            443
        } else {
            80
        }
    }

    /// Full URL of an endpoint below the base, e.g. `/peers`
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }
}

impl From<&str> for BrokerAddress {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for BrokerAddress {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Asynchronous happenings reported by a provider
pub enum LinkEvent {
    /// A remote node opened a channel to us through the broker
    Incoming {
        /// Broker link the attempt arrived on
        broker: LinkId,
        /// Raw, not yet admitted channel
        channel: Arc<dyn PeerChannel>,
    },
    /// The broker link dropped
    BrokerDisconnected {
        /// Broker link that dropped
        broker: LinkId,
    },
    /// Data arrived on a peer channel
    PeerData {
        /// Channel the data arrived on
        link: LinkId,
        /// Payload as sent by the remote
        data: Vec<u8>,
    },
    /// A peer channel closed
    PeerClosed {
        /// Channel that closed
        link: LinkId,
    },
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming { broker, channel } => f
                .debug_struct("Incoming")
                .field("broker", broker)
                .field("link", &channel.link_id())
                .field("remote_id", &channel.remote_id())
                .finish(),
            Self::BrokerDisconnected { broker } => f
                .debug_struct("BrokerDisconnected")
                .field("broker", broker)
                .finish(),
            Self::PeerData { link, data } => f
                .debug_struct("PeerData")
                .field("link", link)
                .field("len", &data.len())
                .finish(),
            Self::PeerClosed { link } => {
                f.debug_struct("PeerClosed").field("link", link).finish()
            }
        }
    }
}

/// Producer of broker and peer channels
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Register `self_id` at the broker; resolves once the broker reports open
    ///
    /// Every later event for this node, including those of peer channels
    /// created through the returned broker channel, goes to `events`.
    async fn register(
        &self,
        self_id: &str,
        address: &BrokerAddress,
        events: LinkEventSender,
    ) -> TransportResult<Arc<dyn BrokerChannel>>;

    /// Get transport type identifier
    fn transport_type(&self) -> &'static str;
}

/// Signaling connection to the broker
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Identity of this broker link
    fn link_id(&self) -> LinkId;

    /// Open a direct channel to `remote_id`; resolves once it reports open
    async fn connect(&self, remote_id: &str) -> TransportResult<Arc<dyn PeerChannel>>;

    /// Tear the link down; providers may still report it as disconnected
    async fn disconnect(&self);

    /// Release every resource held for this link
    async fn destroy(&self);
}

/// Direct data channel to one remote node
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Identity of this channel
    fn link_id(&self) -> LinkId;

    /// Identifier of the remote node
    fn remote_id(&self) -> &str;

    /// Send a payload to the remote node
    async fn send(&self, data: Vec<u8>) -> TransportResult<()>;

    /// Close the channel
    async fn close(&self);
}

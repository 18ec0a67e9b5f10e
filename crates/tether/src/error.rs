//! Tether error types
//!
//! Every fallible operation in the crate returns [`TetherResult`]. Lifecycle
//! notifications (broker loss, peer close) are not errors; they are delivered
//! through the coordinator callbacks instead.

use std::time::Duration;

/// Result alias used throughout the crate
pub type TetherResult<T> = Result<T, TetherError>;

/// Errors surfaced by the coordinator and its sessions
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Broker registration did not complete within the configured bound
    #[error("Broker registration timed out after {}s", timeout.as_secs())]
    BrokerTimeout {
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// A broker connection attempt is already in flight
    #[error("A broker connection attempt is already in progress")]
    AlreadyConnecting,

    /// The broker link is already registered
    #[error("Already registered with the broker")]
    AlreadyRegistered,

    /// Attempted to open a peer link to our own identifier
    #[error("Cannot connect to yourself ({self_id})")]
    SelfConnection {
        /// Our own identifier
        self_id: String,
    },

    /// No peer identifier was given for a connection attempt
    #[error("No peer id given for connection attempt")]
    MissingTarget,

    /// Outbound peer connection requires a registered broker link
    #[error("Not registered with a broker")]
    NotRegistered,

    /// Operation not allowed while a peer link is pending or open
    #[error("A peer session with {remote_id} is pending or active")]
    PeerSessionActive {
        /// Remote end of the current link
        remote_id: String,
    },

    /// The transport refused or failed an outbound peer connection
    #[error("Transport rejected connection to {remote_id}: {reason}")]
    TransportRejected {
        /// Target of the attempt
        remote_id: String,
        /// Transport-provided reason
        reason: String,
    },

    /// The transport could not open the broker link
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// An HTTP request to the broker failed
    #[error("Broker request to {endpoint} failed: {reason}")]
    BrokerRequest {
        /// Endpoint path, e.g. `/peers`
        endpoint: &'static str,
        /// Underlying failure
        reason: String,
    },

    /// No broker address has been configured
    #[error("No broker address configured")]
    MissingBrokerAddress,

    /// Identity persistence failed
    #[error("Identity store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Sending on the active link failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration is invalid or unreadable
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Key-value store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backing storage could not be read or written
    #[error("I/O error on {key}: {reason}")]
    Io {
        /// Key being accessed
        key: String,
        /// Underlying failure
        reason: String,
    },

    /// Stored data could not be decoded
    #[error("Corrupt store contents: {0}")]
    Corrupt(String),

    /// The store is not reachable at all
    #[error("Store offline")]
    Offline,
}

/// Failures reported by a transport provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The remote end refused the connection
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The remote end is not known to the broker
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// The channel is already closed
    #[error("Channel closed")]
    Closed,

    /// Any other provider failure
    #[error("{0}")]
    Other(String),
}

impl TetherError {
    /// Whether the caller may reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerTimeout { .. }
                | Self::BrokerUnavailable(_)
                | Self::BrokerRequest { .. }
                | Self::TransportRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_reports_seconds() {
        let err = TetherError::BrokerTimeout {
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "Broker registration timed out after 30s");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_target_is_not_retryable() {
        assert!(!TetherError::MissingTarget.is_retryable());
        let err = TetherError::SelfConnection {
            self_id: "abc".to_string(),
        };
        assert!(err.to_string().contains("abc"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_store_error_converts() {
        let err: TetherError = StoreError::Offline.into();
        assert!(matches!(err, TetherError::StoreUnavailable(StoreError::Offline)));
    }
}

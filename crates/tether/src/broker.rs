//! Broker Session
//!
//! Owns the single logical connection to the rendezvous service:
//! registration under a bounded timeout, loss detection, and intentional
//! release during handoff.
//!
//! Loss and release are kept apart by two checks. While a release is in
//! progress the `releasing` flag swallows loss reports; afterwards the link is
//! no longer current, so late reports for it are dropped as stale.

use crate::broker_api::BrokerApi;
use crate::error::{TetherError, TetherResult};
use crate::transport::{BrokerAddress, BrokerChannel, LinkEventSender, LinkId, TransportProvider};
use crate::whitelist::Whitelist;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of the broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerStatus {
    /// No link, never opened or intentionally released
    Disconnected,
    /// Registration in flight
    Connecting,
    /// Registered and discoverable
    Registered,
    /// Dropped without being released
    Lost,
}

/// Snapshot of the broker link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerLink {
    /// Broker base URL
    pub address: Option<BrokerAddress>,
    /// Current status
    pub status: BrokerStatus,
}

struct BrokerState {
    link: BrokerLink,
    channel: Option<Arc<dyn BrokerChannel>>,
    releasing: bool,
    /// Losses reported while a registration had not finished yet
    lost_while_connecting: HashSet<LinkId>,
}

/// Resets an abandoned `Connecting` status, e.g. when the connect future is dropped
struct ConnectingGuard<'a> {
    state: &'a Mutex<BrokerState>,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.link.status == BrokerStatus::Connecting {
            state.link.status = BrokerStatus::Disconnected;
        }
    }
}

/// Connection to the rendezvous broker
pub struct BrokerSession {
    state: Mutex<BrokerState>,
    transport: Arc<dyn TransportProvider>,
    api: Arc<dyn BrokerApi>,
    timeout: Duration,
}

impl BrokerSession {
    /// Create a disconnected session
    pub fn new(
        transport: Arc<dyn TransportProvider>,
        api: Arc<dyn BrokerApi>,
        address: Option<BrokerAddress>,
        timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                link: BrokerLink {
                    address,
                    status: BrokerStatus::Disconnected,
                },
                channel: None,
                releasing: false,
                lost_while_connecting: HashSet::new(),
            }),
            transport,
            api,
            timeout,
        }
    }

    /// Snapshot of the link
    pub fn link(&self) -> BrokerLink {
        self.state.lock().link.clone()
    }

    /// Current status
    pub fn status(&self) -> BrokerStatus {
        self.state.lock().link.status
    }

    /// Whether an intentional release is in progress
    pub fn is_releasing(&self) -> bool {
        self.state.lock().releasing
    }

    /// Change the broker address; refused while an attempt is in flight
    pub fn set_address(&self, address: BrokerAddress) -> TetherResult<()> {
        let mut state = self.state.lock();
        if state.link.status == BrokerStatus::Connecting {
            return Err(TetherError::AlreadyConnecting);
        }
        debug!(broker = %address, "Broker address set");
        state.link.address = Some(address);
        Ok(())
    }

    fn address(&self) -> TetherResult<BrokerAddress> {
        self.state
            .lock()
            .link
            .address
            .clone()
            .ok_or(TetherError::MissingBrokerAddress)
    }

    /// Register with the broker and return the currently active peers
    ///
    /// Opening the link and registering the whitelist share one timeout;
    /// whitelist registration itself is best-effort. The peer list is fetched
    /// afterwards and its failure tears the fresh link down again.
    pub async fn connect(
        &self,
        self_id: &str,
        whitelist: &Whitelist,
        events: LinkEventSender,
    ) -> TetherResult<Vec<String>> {
        let address = {
            let mut state = self.state.lock();
            match state.link.status {
                BrokerStatus::Connecting => return Err(TetherError::AlreadyConnecting),
                BrokerStatus::Registered => return Err(TetherError::AlreadyRegistered),
                BrokerStatus::Disconnected | BrokerStatus::Lost => {}
            }
            let address = state
                .link
                .address
                .clone()
                .ok_or(TetherError::MissingBrokerAddress)?;
            state.link.status = BrokerStatus::Connecting;
            state.lost_while_connecting.clear();
            address
        };
        let _guard = ConnectingGuard { state: &self.state };

        info!(
            broker = %address,
            self_id,
            transport = self.transport.transport_type(),
            "Connecting to broker"
        );
        let started = Instant::now();

        let channel = match timeout(
            self.timeout,
            self.transport.register(self_id, &address, events),
        )
        .await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                warn!(broker = %address, error = %e, "Broker registration failed");
                return Err(TetherError::BrokerUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!(broker = %address, timeout_secs = self.timeout.as_secs(), "Broker registration timed out");
                return Err(TetherError::BrokerTimeout {
                    timeout: self.timeout,
                });
            }
        };

        let remaining = self.timeout.saturating_sub(started.elapsed());
        match timeout(
            remaining,
            self.api.register_whitelist(&address, self_id, whitelist),
        )
        .await
        {
            Ok(Ok(())) => debug!(whitelist = %whitelist, "Whitelist registered with broker"),
            Ok(Err(e)) => warn!(error = %e, "Whitelist registration failed, continuing"),
            Err(_) => {
                warn!(broker = %address, "Broker registration timed out during whitelist upload");
                channel.destroy().await;
                return Err(TetherError::BrokerTimeout {
                    timeout: self.timeout,
                });
            }
        }

        let peers = match self.api.active_peers(&address, self_id).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Fetching active peers failed, abandoning registration");
                channel.destroy().await;
                return Err(e);
            }
        };

        let lost = {
            let mut state = self.state.lock();
            let lost = state.lost_while_connecting.remove(&channel.link_id());
            state.lost_while_connecting.clear();
            if lost {
                state.link.status = BrokerStatus::Lost;
                true
            } else {
                state.link.status = BrokerStatus::Registered;
                state.channel = Some(channel.clone());
                false
            }
        };
        if lost {
            channel.destroy().await;
            return Err(TetherError::BrokerUnavailable(
                "link dropped during registration".to_string(),
            ));
        }

        info!(
            broker = %address,
            link = %channel.link_id(),
            active_peers = peers.len(),
            "Registered with broker"
        );
        Ok(peers)
    }

    /// Broker channel, if registered
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        let state = self.state.lock();
        match state.link.status {
            BrokerStatus::Registered => state.channel.clone(),
            _ => None,
        }
    }

    /// Whether `link` is the live registered broker link
    pub fn is_current(&self, link: LinkId) -> bool {
        self.channel().is_some_and(|channel| channel.link_id() == link)
    }

    /// Tear the link down without it counting as a loss
    pub async fn release_intentionally(&self) {
        let channel = {
            let mut state = self.state.lock();
            let Some(channel) = state.channel.take() else {
                return;
            };
            state.releasing = true;
            state.link.status = BrokerStatus::Disconnected;
            channel
        };

        channel.disconnect().await;
        self.state.lock().releasing = false;
        info!(link = %channel.link_id(), "Released broker link");
    }

    /// Record a loss report, returning the channel to destroy if it was live
    pub fn handle_lost(&self, link: LinkId) -> Option<Arc<dyn BrokerChannel>> {
        let mut state = self.state.lock();
        if state.releasing {
            debug!(link = %link, "Ignoring broker disconnect during intentional release");
            return None;
        }
        if state.link.status == BrokerStatus::Connecting {
            state.lost_while_connecting.insert(link);
            return None;
        }

        let is_live = state
            .channel
            .as_ref()
            .is_some_and(|channel| channel.link_id() == link);
        if !is_live {
            debug!(link = %link, "Ignoring disconnect of stale broker link");
            return None;
        }

        warn!(link = %link, "Broker link lost");
        state.link.status = BrokerStatus::Lost;
        state.channel.take()
    }

    /// Ask the broker which peers are visible to us
    pub async fn list_active_peers(&self, self_id: &str) -> TetherResult<Vec<String>> {
        let address = self.address()?;
        self.api.active_peers(&address, self_id).await
    }

    /// Post a chat message to the broker lobby
    pub async fn post_lobby_message(&self, self_id: &str, message: &str) -> TetherResult<serde_json::Value> {
        let address = self.address()?;
        self.api.post_lobby(&address, self_id, message).await
    }
}

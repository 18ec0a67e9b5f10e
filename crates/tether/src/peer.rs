//! Peer Session
//!
//! The single direct link to a remote node. Admission of inbound attempts is
//! decided here; promotion to the live session is left to the coordinator so
//! that the broker can be released first.

use crate::error::{TetherError, TetherResult};
use crate::transport::{LinkId, PeerChannel};
use crate::whitelist::Whitelist;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of the peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// No link yet
    Idle,
    /// Attempt admitted or in flight, not yet live
    Pending,
    /// Live session
    Open,
    /// Previous link closed
    Closed,
}

impl PeerStatus {
    /// Whether the slot is taken
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Pending | Self::Open)
    }
}

/// Snapshot of the peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLink {
    /// Remote end, set once per link
    pub remote_id: Option<String>,
    /// Current status
    pub status: PeerStatus,
}

/// Why an inbound attempt was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Remote id is not on the whitelist
    NotWhitelisted,
    /// Remote claims our own id
    SelfConnection,
    /// Another link is pending or open
    Busy,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NotWhitelisted => "not whitelisted",
            Self::SelfConnection => "self connection",
            Self::Busy => "session busy",
        };
        f.write_str(reason)
    }
}

/// Outcome of admission control for an inbound attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Bound as the pending link
    Admit,
    /// Never bound; the caller closes the handle
    Reject(RejectReason),
}

/// A link that went away, as reported by [`PeerSession::handle_closed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedLink {
    /// Remote end of the closed link
    pub remote_id: String,
    /// Whether the link had been live
    pub was_open: bool,
}

struct PeerState {
    link: PeerLink,
    channel: Option<Arc<dyn PeerChannel>>,
    last_known: Option<String>,
    /// Links reported closed while an outbound attempt had nothing bound yet
    closed_before_attach: HashSet<LinkId>,
}

impl PeerState {
    fn bound_to(&self, link: LinkId) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.link_id() == link)
    }
}

/// Single-slot direct session
pub struct PeerSession {
    state: Mutex<PeerState>,
}

impl Default for PeerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSession {
    /// Create an idle session
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PeerState {
                link: PeerLink {
                    remote_id: None,
                    status: PeerStatus::Idle,
                },
                channel: None,
                last_known: None,
                closed_before_attach: HashSet::new(),
            }),
        }
    }

    /// Reject empty and self targets before any network action
    pub fn validate_target(self_id: &str, remote_id: &str) -> TetherResult<()> {
        if remote_id.trim().is_empty() {
            return Err(TetherError::MissingTarget);
        }
        if remote_id == self_id {
            return Err(TetherError::SelfConnection {
                self_id: self_id.to_string(),
            });
        }
        Ok(())
    }

    /// Snapshot of the link
    pub fn link(&self) -> PeerLink {
        self.state.lock().link.clone()
    }

    /// Current status
    pub fn status(&self) -> PeerStatus {
        self.state.lock().link.status
    }

    /// Remote end of the pending or open link
    pub fn remote_id(&self) -> Option<String> {
        let state = self.state.lock();
        if state.link.status.is_busy() {
            state.link.remote_id.clone()
        } else {
            None
        }
    }

    /// Remote end of the most recent live session
    pub fn last_known(&self) -> Option<String> {
        self.state.lock().last_known.clone()
    }

    /// Claim the slot for an outbound attempt to `remote_id`
    pub fn begin_outbound(&self, remote_id: &str) -> TetherResult<()> {
        let mut state = self.state.lock();
        if state.link.status.is_busy() {
            return Err(TetherError::PeerSessionActive {
                remote_id: state.link.remote_id.clone().unwrap_or_default(),
            });
        }
        state.link = PeerLink {
            remote_id: Some(remote_id.to_string()),
            status: PeerStatus::Pending,
        };
        state.channel = None;
        state.closed_before_attach.clear();
        debug!(remote_id, "Outbound peer attempt pending");
        Ok(())
    }

    /// Bind the opened outbound channel to the pending slot
    ///
    /// Returns `false` and frees the slot if the channel was already reported
    /// closed while the attempt was in flight.
    pub fn attach(&self, channel: Arc<dyn PeerChannel>) -> bool {
        let mut state = self.state.lock();
        let link = channel.link_id();
        let closed = state.closed_before_attach.remove(&link);
        state.closed_before_attach.clear();
        if closed || state.link.status != PeerStatus::Pending {
            warn!(remote_id = channel.remote_id(), link = %link, "Outbound peer channel closed before it was bound");
            Self::reset_pending(&mut state);
            return false;
        }

        debug!(remote_id = channel.remote_id(), link = %link, "Outbound peer channel open");
        state.channel = Some(channel);
        true
    }

    /// Free a pending slot whose attempt failed
    pub fn abort_pending(&self) {
        Self::reset_pending(&mut self.state.lock());
    }

    fn reset_pending(state: &mut PeerState) {
        if state.link.status == PeerStatus::Pending {
            state.link = PeerLink {
                remote_id: None,
                status: PeerStatus::Idle,
            };
            state.channel = None;
        }
        state.closed_before_attach.clear();
    }

    /// Decide on an inbound attempt, binding it as pending on admission
    pub fn accept_incoming(
        &self,
        channel: Arc<dyn PeerChannel>,
        self_id: &str,
        whitelist: &Whitelist,
    ) -> AdmissionDecision {
        let remote_id = channel.remote_id().to_string();
        let mut state = self.state.lock();

        let reason = if remote_id == self_id {
            Some(RejectReason::SelfConnection)
        } else if state.link.status.is_busy() {
            Some(RejectReason::Busy)
        } else if !whitelist.admits(&remote_id) {
            Some(RejectReason::NotWhitelisted)
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(remote_id = %remote_id, reason = %reason, "Rejected inbound peer attempt");
            return AdmissionDecision::Reject(reason);
        }

        info!(remote_id = %remote_id, link = %channel.link_id(), "Admitted inbound peer attempt");
        state.link = PeerLink {
            remote_id: Some(remote_id),
            status: PeerStatus::Pending,
        };
        state.channel = Some(channel);
        AdmissionDecision::Admit
    }

    /// Make the pending link live, returning its remote id
    ///
    /// `None` if the link closed before it could be promoted.
    pub fn promote(&self) -> Option<String> {
        let mut state = self.state.lock();
        if state.link.status != PeerStatus::Pending || state.channel.is_none() {
            return None;
        }
        state.link.status = PeerStatus::Open;
        state.last_known = state.link.remote_id.clone();
        state.link.remote_id.clone()
    }

    /// Remote id to attribute data on `link` to, if it is the live session
    pub fn data_source(&self, link: LinkId) -> Option<String> {
        let state = self.state.lock();
        if state.link.status == PeerStatus::Open && state.bound_to(link) {
            state.link.remote_id.clone()
        } else {
            None
        }
    }

    /// Free the slot if `link` is the bound channel
    ///
    /// While an outbound attempt is pending with nothing bound, the link is
    /// remembered so that [`PeerSession::attach`] can refuse it.
    pub fn handle_closed(&self, link: LinkId) -> Option<ClosedLink> {
        let mut state = self.state.lock();
        if !state.bound_to(link) {
            if state.link.status == PeerStatus::Pending && state.channel.is_none() {
                debug!(link = %link, "Peer link closed before outbound attach");
                state.closed_before_attach.insert(link);
            }
            return None;
        }
        Some(Self::mark_closed(&mut state))
    }

    fn mark_closed(state: &mut PeerState) -> ClosedLink {
        let was_open = state.link.status == PeerStatus::Open;
        let remote_id = state.link.remote_id.clone().unwrap_or_default();
        if was_open {
            state.last_known = Some(remote_id.clone());
        }
        state.link.status = PeerStatus::Closed;
        state.channel = None;
        ClosedLink { remote_id, was_open }
    }

    /// Forward `data` on the live session; a no-op without one
    pub async fn send(&self, data: Vec<u8>) -> TetherResult<()> {
        let channel = {
            let state = self.state.lock();
            match (&state.channel, state.link.status) {
                (Some(channel), PeerStatus::Open) => channel.clone(),
                _ => {
                    debug!(len = data.len(), "No open peer link, dropping payload");
                    return Ok(());
                }
            }
        };
        channel.send(data).await?;
        Ok(())
    }

    /// Close the bound channel, if any
    pub async fn close(&self) -> Option<ClosedLink> {
        let (channel, closed) = {
            let mut state = self.state.lock();
            let channel = state.channel.clone()?;
            (channel, Self::mark_closed(&mut state))
        };
        info!(remote_id = %closed.remote_id, "Closing peer link");
        channel.close().await;
        Some(closed)
    }
}

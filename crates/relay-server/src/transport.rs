//! Media transport capability
//!
//! The relay engine never talks to webrtc-rs directly. Each member owns one
//! [`Transport`], created by a [`TransportFactory`]; everything the transport
//! observes (new inbound sources, connection state, gathered candidates) is
//! pushed into an unbounded event queue so the transport's callbacks never
//! wait on the relay.

use async_trait::async_trait;
use relay_protocol::{IceCandidate, MemberId, SessionId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::sfu::MediaSource;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport is closed")]
    Closed,
}

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the member is torn down
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// The remote side started publishing a source
    NewSource(MediaSource),
    /// The connection moved to a new state
    StateChanged(ConnectionState),
    /// A local ICE candidate was gathered and should be trickled to the client
    LocalCandidate(IceCandidate),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Everything a factory needs to wire a new transport into the relay
pub struct TransportContext {
    pub session_id: SessionId,
    pub member_id: MemberId,
    /// Sink for transport events; never blocks
    pub events: mpsc::UnboundedSender<TransportEvent>,
    /// Cancelled when this transport generation is torn down; background
    /// tasks started by the transport must stop on it
    pub cancel: CancellationToken,
    /// Tracker every background task is spawned on
    pub tasks: TaskTracker,
}

/// One negotiated media connection of one member
#[async_trait]
pub trait Transport: Send + Sync {
    /// Apply a remote offer and return the local answer
    async fn negotiate(&self, offer_sdp: String) -> Result<String, TransportError>;

    /// Apply a remote answer to an offer we created
    async fn accept_answer(&self, answer_sdp: String) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Start sending `source` over this connection
    async fn attach_source(&self, source: &MediaSource) -> Result<(), TransportError>;

    /// Create and apply a local offer (server-initiated renegotiation)
    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, ctx: TransportContext) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::New.is_terminal());
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}

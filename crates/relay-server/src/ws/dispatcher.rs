//! Signaling dispatcher
//!
//! One dispatcher per WebSocket connection. It resolves the connection to a
//! member, drives negotiation and applies the client's messages to the
//! member's session.

use relay_protocol::{ClientMessage, IceCandidate, MediaKind, MemberId, ServerMessage, SessionId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::sfu::{Member, Registry};

/// Candidates held per connection before a transport exists
pub const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Socket open, no negotiated transport yet
    Connecting,
    /// An offer is being answered
    Negotiating,
    /// Transport negotiated and member joined
    Active,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Connecting => write!(f, "connecting"),
            SignalingState::Negotiating => write!(f, "negotiating"),
            SignalingState::Active => write!(f, "active"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    session_id: SessionId,
    member_id: MemberId,
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    member: Arc<Member>,
    state: SignalingState,
    /// Candidates that arrived before negotiation finished
    pending: VecDeque<(Instant, IceCandidate)>,
    candidate_grace: Duration,
}

impl Dispatcher {
    /// Bind a new connection to its member
    ///
    /// A live member with the same id takes over this connection; the
    /// previous connection is superseded.
    pub async fn connect(
        registry: Arc<Registry>,
        session_id: SessionId,
        member_id: MemberId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        candidate_grace: Duration,
    ) -> Self {
        let connection_id = Uuid::new_v4();

        let existing = registry
            .find_member(&session_id, &member_id)
            .await
            .filter(|member| !member.is_removed());

        let member = match existing {
            Some(member) => {
                member.replace_signal(connection_id, outbound.clone()).await;
                member
            }
            None => registry.create_member(
                session_id.clone(),
                member_id.clone(),
                connection_id,
                outbound.clone(),
            ),
        };

        tracing::info!(
            "Connection {} opened for member {} in session {}",
            connection_id,
            member_id,
            session_id
        );

        Self {
            registry,
            session_id,
            member_id,
            connection_id,
            outbound,
            member,
            state: SignalingState::Connecting,
            pending: VecDeque::new(),
            candidate_grace,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn member(&self) -> &Arc<Member> {
        &self.member
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Handle one text frame
    pub async fn handle_text(&mut self, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                let err = RelayError::MalformedMessage(e.to_string());
                tracing::warn!("Ignoring message from member {}: {}", self.member_id, err);
                return;
            }
        };

        if let Err(e) = self.handle_message(message).await {
            if e.is_rejection() {
                let _ = self.outbound.send(ServerMessage::Error {
                    message: e.to_string(),
                });
            }
            tracing::warn!("Message from member {} failed: {}", self.member_id, e);
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Result<()> {
        if self.state == SignalingState::Closed {
            return Ok(());
        }

        if !self.member.is_current_connection(self.connection_id).await {
            tracing::debug!(
                "Ignoring message on superseded connection {} of member {}",
                self.connection_id,
                self.member_id
            );
            return Ok(());
        }

        match message {
            ClientMessage::Offer { sdp } => self.handle_offer(sdp).await,
            ClientMessage::Answer { sdp } => self.handle_answer(sdp).await,
            ClientMessage::Candidate { candidate } => self.handle_candidate(candidate).await,
            ClientMessage::ToggleVideo { enabled } => {
                self.handle_toggle(MediaKind::Video, enabled).await
            }
            ClientMessage::ToggleAudio { enabled } => {
                self.handle_toggle(MediaKind::Audio, enabled).await
            }
        }
    }

    async fn handle_offer(&mut self, sdp: String) -> Result<()> {
        if self.member.is_removed() {
            // The previous member on this connection was torn down (e.g. its
            // transport failed); the connection starts over as a new member
            self.member = self.registry.create_member(
                self.session_id.clone(),
                self.member_id.clone(),
                self.connection_id,
                self.outbound.clone(),
            );
            self.state = SignalingState::Connecting;
        }

        if self.state == SignalingState::Active {
            if let Some(transport) = self.member.transport().await {
                let answer = transport
                    .negotiate(sdp)
                    .await
                    .map_err(RelayError::NegotiationFailure)?;
                let _ = self.outbound.send(ServerMessage::Answer { sdp: answer });
                tracing::debug!("Renegotiated with member {}", self.member_id);
                return Ok(());
            }
        }

        self.state = SignalingState::Negotiating;
        match self.negotiate(sdp).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = SignalingState::Connecting;
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self, sdp: String) -> Result<()> {
        let (transport, events, cancel) = self.registry.open_transport(&self.member).await?;

        let answer = match transport.negotiate(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                cancel.cancel();
                if let Err(close_err) = transport.close().await {
                    tracing::debug!("Error closing rejected transport: {}", close_err);
                }
                return Err(RelayError::NegotiationFailure(e));
            }
        };

        self.member.install_transport(transport, events, cancel).await;
        let _ = self.outbound.send(ServerMessage::Answer { sdp: answer });

        let joined = if self.member.is_joined() {
            self.registry.rejoin(&self.member).await
        } else {
            self.registry.join(&self.member).await
        };
        let session = match joined {
            Ok(session) => session,
            Err(e) => {
                self.member.discard_transport().await;
                return Err(e);
            }
        };

        self.state = SignalingState::Active;
        self.flush_candidates().await;

        let shared = self.registry.share_sources(&session, &self.member).await;
        tracing::info!(
            "Member {} active in session {} with {} existing sources",
            self.member_id,
            self.session_id,
            shared
        );

        Ok(())
    }

    async fn handle_answer(&mut self, sdp: String) -> Result<()> {
        let Some(transport) = self.member.transport().await else {
            tracing::warn!("Answer from member {} without a transport", self.member_id);
            return Ok(());
        };

        transport
            .accept_answer(sdp)
            .await
            .map_err(RelayError::NegotiationFailure)
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.state != SignalingState::Active {
            self.buffer_candidate(candidate);
            return Ok(());
        }

        let Some(transport) = self.member.transport().await else {
            self.buffer_candidate(candidate);
            return Ok(());
        };

        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::warn!("Dropping ICE candidate from member {}: {}", self.member_id, e);
        }
        Ok(())
    }

    /// Hold a candidate until a transport exists
    ///
    /// Stale entries are pruned on every push and the buffer keeps at most
    /// `MAX_PENDING_CANDIDATES`, dropping the oldest first.
    fn buffer_candidate(&mut self, candidate: IceCandidate) {
        let grace = self.candidate_grace;
        self.pending
            .retain(|(received_at, _)| received_at.elapsed() <= grace);

        if self.pending.len() >= MAX_PENDING_CANDIDATES {
            self.pending.pop_front();
            tracing::warn!(
                "Candidate buffer of member {} is full, dropping the oldest",
                self.member_id
            );
        }
        self.pending.push_back((Instant::now(), candidate));
    }

    /// Number of candidates waiting for a transport
    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Apply buffered candidates, discarding those older than the grace period
    async fn flush_candidates(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let Some(transport) = self.member.transport().await else {
            return;
        };

        let mut applied = 0;
        let mut stale = 0;
        for (received_at, candidate) in std::mem::take(&mut self.pending) {
            if received_at.elapsed() > self.candidate_grace {
                stale += 1;
                continue;
            }
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!("Dropping ICE candidate from member {}: {}", self.member_id, e)
                }
            }
        }

        tracing::debug!(
            "Flushed candidates of member {}: {} applied, {} stale",
            self.member_id,
            applied,
            stale
        );
    }

    async fn handle_toggle(&mut self, kind: MediaKind, enabled: bool) -> Result<()> {
        if self.member.is_removed() {
            tracing::debug!(
                "Ignoring {} toggle from removed member {} on connection {}",
                kind,
                self.member_id,
                self.connection_id
            );
            return Ok(());
        }

        if !self.member.is_joined() {
            tracing::debug!(
                "Ignoring {} toggle from member {} before it joined",
                kind,
                self.member_id
            );
            return Ok(());
        }

        let session = self
            .registry
            .get(&self.session_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound(self.session_id.clone()))?;
        session.set_member_presence(&self.member, kind, enabled).await
    }

    /// The socket is gone; remove the member unless another connection took it over
    pub async fn close(&mut self) {
        if self.state == SignalingState::Closed {
            return;
        }
        self.state = SignalingState::Closed;
        self.pending.clear();

        if !self.member.is_current_connection(self.connection_id).await {
            tracing::info!(
                "Superseded connection {} of member {} closed",
                self.connection_id,
                self.member_id
            );
            return;
        }

        tracing::info!(
            "Connection {} of member {} closed",
            self.connection_id,
            self.member_id
        );
        self.registry.remove_member(&self.member).await;
    }
}

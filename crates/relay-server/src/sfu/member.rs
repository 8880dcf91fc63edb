//! Member state
//!
//! A member is one participant of a session: its signaling socket, its media
//! transport, the sources it publishes and the sources it receives.

use relay_protocol::{MediaKind, MemberId, ServerMessage, SessionId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::MediaSource;
use crate::error::{RelayError, Result};
use crate::transport::{Transport, TransportEvents};

/// Audio/video presence flags of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub audio: bool,
    pub video: bool,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Presence {
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    pub fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio = enabled,
            MediaKind::Video => self.video = enabled,
        }
    }
}

/// The signaling socket currently bound to a member
struct SignalChannel {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

/// One generation of a member's media transport
struct TransportSlot {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    /// Handed to the fanout task when it starts
    events: Option<TransportEvents>,
}

pub struct Member {
    id: MemberId,
    session_id: SessionId,
    signal: RwLock<SignalChannel>,
    transport: RwLock<Option<TransportSlot>>,
    /// Sources this member publishes, in arrival order
    published: RwLock<Vec<MediaSource>>,
    /// (publisher, source id) pairs already attached to our transport
    attached: Mutex<HashSet<(MemberId, String)>>,
    presence: RwLock<Presence>,
    joined: AtomicBool,
    removed: AtomicBool,
    cancel: CancellationToken,
}

impl Member {
    pub fn new(
        session_id: SessionId,
        id: MemberId,
        connection_id: Uuid,
        sender: mpsc::UnboundedSender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            session_id,
            signal: RwLock::new(SignalChannel {
                connection_id,
                sender,
            }),
            transport: RwLock::new(None),
            published: RwLock::new(Vec::new()),
            attached: Mutex::new(HashSet::new()),
            presence: RwLock::new(Presence::default()),
            joined: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Send a signaling message to the member's current socket
    pub async fn send(&self, message: ServerMessage) -> bool {
        let signal = self.signal.read().await;
        if let Err(e) = signal.sender.send(message) {
            tracing::debug!(
                "Signaling channel of member {} is closed, dropping {:?}",
                self.id,
                e.0
            );
            return false;
        }
        true
    }

    /// Bind a newly connected socket, superseding the previous one
    pub async fn replace_signal(
        &self,
        connection_id: Uuid,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let mut signal = self.signal.write().await;
        tracing::info!(
            "Member {} in session {}: signaling connection {} superseded by {}",
            self.id,
            self.session_id,
            signal.connection_id,
            connection_id
        );
        *signal = SignalChannel {
            connection_id,
            sender,
        };
    }

    pub async fn is_current_connection(&self, connection_id: Uuid) -> bool {
        self.signal.read().await.connection_id == connection_id
    }

    /// Install a freshly negotiated transport
    ///
    /// A previous transport is cancelled and closed; its sources and
    /// attachments go with it.
    pub async fn install_transport(
        &self,
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        cancel: CancellationToken,
    ) {
        let previous = self.transport.write().await.replace(TransportSlot {
            transport,
            cancel,
            events: Some(events),
        });

        if let Some(previous) = previous {
            previous.cancel.cancel();
            self.published.write().await.clear();
            self.attached.lock().await.clear();
            if let Err(e) = previous.transport.close().await {
                tracing::warn!("Error closing replaced transport of member {}: {}", self.id, e);
            }
            tracing::info!("Replaced transport of member {}", self.id);
        }
    }

    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .await
            .as_ref()
            .map(|slot| slot.transport.clone())
    }

    /// Take the event queue of the current transport, once
    pub async fn take_events(&self) -> Option<(TransportEvents, CancellationToken)> {
        let mut slot = self.transport.write().await;
        let slot = slot.as_mut()?;
        let events = slot.events.take()?;
        Some((events, slot.cancel.clone()))
    }

    /// Token for a new transport generation; cancelled with the member
    pub fn transport_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Record a source this member started publishing
    pub async fn publish(&self, source: MediaSource) {
        let mut published = self.published.write().await;
        if published.iter().any(|s| s.id() == source.id()) {
            return;
        }
        tracing::info!(
            "Member {} publishes {} source {}",
            self.id,
            source.kind(),
            source.id()
        );
        published.push(source);
    }

    pub async fn sources(&self) -> Vec<MediaSource> {
        self.published.read().await.clone()
    }

    /// Attach other members' sources to this member's transport
    ///
    /// Sources already attached are skipped, so overlapping deliveries
    /// (join-time sharing racing a fanout) attach each source once. A failed
    /// attachment is logged and skipped. When anything was attached the
    /// client is sent a renegotiation offer. Returns the number attached.
    pub async fn receive_sources(&self, sources: &[MediaSource]) -> usize {
        let Some(transport) = self.transport().await else {
            tracing::debug!("Member {} has no transport, skipping delivery", self.id);
            return 0;
        };

        let mut attached = 0;
        for source in sources {
            if source.publisher() == &self.id {
                continue;
            }
            match self.attach(&transport, source).await {
                Ok(true) => attached += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("{}", e),
            }
        }

        if attached > 0 {
            if let Err(e) = self.renegotiate(&transport).await {
                tracing::warn!("Failed to renegotiate with member {}: {}", self.id, e);
            }
        }

        attached
    }

    async fn attach(&self, transport: &Arc<dyn Transport>, source: &MediaSource) -> Result<bool> {
        let key = (source.publisher().clone(), source.id().to_string());
        if !self.attached.lock().await.insert(key.clone()) {
            return Ok(false);
        }

        if let Err(cause) = transport.attach_source(source).await {
            self.attached.lock().await.remove(&key);
            return Err(RelayError::DeliveryFailure {
                member_id: self.id.clone(),
                source_id: source.id().to_string(),
                cause,
            });
        }

        tracing::debug!(
            "Attached {} source {} from {} to member {}",
            source.kind(),
            source.id(),
            source.publisher(),
            self.id
        );
        Ok(true)
    }

    /// Forget attachments from `publisher` so its next sources are delivered again
    pub async fn forget_publisher(&self, publisher: &MemberId) {
        self.attached
            .lock()
            .await
            .retain(|(attached_from, _)| attached_from != publisher);
    }

    async fn renegotiate(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        let sdp = transport.create_offer().await?;
        self.send(ServerMessage::Offer { sdp }).await;
        Ok(())
    }

    pub async fn presence(&self) -> Presence {
        *self.presence.read().await
    }

    pub async fn set_presence(&self, kind: MediaKind, enabled: bool) {
        self.presence.write().await.set(kind, enabled);
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_joined(&self) {
        self.joined.store(true, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Returns true only for the first caller
    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::SeqCst)
    }

    /// Close the transport of a member that never made it into a session
    pub async fn discard_transport(&self) {
        if let Some(slot) = self.transport.write().await.take() {
            slot.cancel.cancel();
            if let Err(e) = slot.transport.close().await {
                tracing::warn!("Error closing transport of member {}: {}", self.id, e);
            }
        }
    }

    /// Stop every task of this member and close its transport
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(slot) = self.transport.write().await.take() {
            if let Err(e) = slot.transport.close().await {
                tracing::warn!("Error closing transport of member {}: {}", self.id, e);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> (Member, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = Member::new(
            SessionId::from("room1"),
            MemberId::from(id),
            Uuid::new_v4(),
            tx,
            CancellationToken::new(),
        );
        (member, rx)
    }

    #[test]
    fn test_presence_defaults_to_enabled() {
        let mut presence = Presence::default();
        assert!(presence.is_enabled(MediaKind::Audio));
        assert!(presence.is_enabled(MediaKind::Video));

        presence.set(MediaKind::Video, false);
        assert!(!presence.video);
        assert!(presence.audio);
    }

    #[tokio::test]
    async fn test_superseded_socket_stops_receiving() {
        let (member, mut old_rx) = member("1");
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let new_connection = Uuid::new_v4();

        member.replace_signal(new_connection, new_tx).await;
        assert!(member.is_current_connection(new_connection).await);

        let message = ServerMessage::MemberLeft {
            member_id: MemberId::from("2"),
        };
        assert!(member.send(message.clone()).await);
        assert_eq!(new_rx.recv().await, Some(message));
        // The old sender was dropped with the superseded channel
        assert_eq!(old_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_to_closed_socket_reports_failure() {
        let (member, rx) = member("1");
        drop(rx);
        assert!(
            !member
                .send(ServerMessage::Error {
                    message: "gone".into()
                })
                .await
        );
    }

    #[tokio::test]
    async fn test_delivery_without_transport_is_skipped() {
        let (member, _rx) = member("1");
        assert_eq!(member.receive_sources(&[]).await, 0);
        assert!(member.transport().await.is_none());
        assert!(member.take_events().await.is_none());
    }

    #[tokio::test]
    async fn test_removal_is_marked_once() {
        let (member, _rx) = member("1");
        assert!(member.mark_removed());
        assert!(!member.mark_removed());
        assert!(member.is_removed());

        member.shutdown().await;
        assert!(member.is_shut_down());
    }

    #[tokio::test]
    async fn test_transport_token_follows_member() {
        let (member, _rx) = member("1");
        let token = member.transport_token();
        assert!(!token.is_cancelled());
        member.shutdown().await;
        assert!(token.is_cancelled());
    }
}

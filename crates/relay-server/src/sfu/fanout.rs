//! Per-member relay task
//!
//! Consumes the events of one transport generation and turns them into
//! deliveries to the rest of the session.

use relay_protocol::ServerMessage;
use std::slice;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Member, Registry, Session};
use crate::transport::{TransportEvent, TransportEvents};

pub(crate) async fn run(
    registry: Arc<Registry>,
    session: Arc<Session>,
    member: Arc<Member>,
    mut events: TransportEvents,
    cancel: CancellationToken,
) {
    tracing::debug!("Fanout started for member {}", member.id());

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::NewSource(source) => {
                member.publish(source.clone()).await;
                let targets = session
                    .broadcast(member.id(), |target| {
                        let source = source.clone();
                        let cancel = cancel.clone();
                        async move {
                            // A replaced generation must not re-attach after a rejoin
                            if cancel.is_cancelled() {
                                return;
                            }
                            target.receive_sources(slice::from_ref(&source)).await;
                        }
                    })
                    .await;
                tracing::debug!(
                    "Relayed {} source {} of member {} to {} members",
                    source.kind(),
                    source.id(),
                    member.id(),
                    targets
                );
            }
            TransportEvent::LocalCandidate(candidate) => {
                member.send(ServerMessage::Candidate { candidate }).await;
            }
            TransportEvent::StateChanged(state) => {
                tracing::info!("Transport of member {} is {}", member.id(), state);
                if state.is_terminal() {
                    registry.remove_member(&member).await;
                    break;
                }
            }
        }
    }

    tracing::debug!("Fanout stopped for member {}", member.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::MediaSource;
    use crate::transport::{Transport, TransportContext, TransportError, TransportFactory};
    use async_trait::async_trait;
    use relay_protocol::{IceCandidate, MediaKind, MemberId, SessionId};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use uuid::Uuid;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

    struct Unreachable;

    #[async_trait]
    impl TransportFactory for Unreachable {
        async fn connect(
            &self,
            _ctx: TransportContext,
        ) -> std::result::Result<Arc<dyn Transport>, TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    /// Records attachments; optionally cancels a token on the first one
    #[derive(Default)]
    struct Recording {
        attached: Mutex<Vec<String>>,
        cancel_on_attach: Option<CancellationToken>,
    }

    #[async_trait]
    impl Transport for Recording {
        async fn negotiate(&self, _offer: String) -> std::result::Result<String, TransportError> {
            Ok("v=0".into())
        }

        async fn accept_answer(&self, _answer: String) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn add_ice_candidate(
            &self,
            _candidate: IceCandidate,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn attach_source(
            &self,
            source: &MediaSource,
        ) -> std::result::Result<(), TransportError> {
            self.attached.lock().unwrap().push(source.id().to_string());
            if let Some(cancel) = &self.cancel_on_attach {
                cancel.cancel();
            }
            Ok(())
        }

        async fn create_offer(&self) -> std::result::Result<String, TransportError> {
            Ok("v=0".into())
        }

        async fn close(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn member(id: &str) -> (Arc<Member>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = Member::new(
            SessionId::from("room1"),
            MemberId::from(id),
            Uuid::new_v4(),
            tx,
            CancellationToken::new(),
        );
        (Arc::new(member), rx)
    }

    async fn with_transport(member: &Member, transport: Arc<Recording>) {
        let (_events_tx, events) = mpsc::unbounded_channel();
        member
            .install_transport(transport, events, CancellationToken::new())
            .await;
    }

    fn source(publisher: &str, id: &str) -> MediaSource {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".into(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.to_string(),
            format!("stream-{}", publisher),
        ));
        MediaSource::new(id, MediaKind::Video, MemberId::from(publisher), track)
    }

    #[tokio::test]
    async fn test_new_source_reaches_every_other_member() {
        let registry = Arc::new(Registry::new(Arc::new(Unreachable)));
        let session = Arc::new(Session::new(SessionId::from("room1")));
        let (publisher, _rx1) = member("1");
        let (two, mut rx2) = member("2");
        let (three, _rx3) = member("3");
        let two_transport = Arc::new(Recording::default());
        let three_transport = Arc::new(Recording::default());
        with_transport(&two, two_transport.clone()).await;
        with_transport(&three, three_transport.clone()).await;
        for m in [publisher.clone(), two, three] {
            session.add_member(m).await.unwrap();
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx
            .send(TransportEvent::NewSource(source("1", "cam-1")))
            .unwrap();
        drop(events_tx);
        run(registry, session, publisher.clone(), events, CancellationToken::new()).await;

        assert_eq!(*two_transport.attached.lock().unwrap(), vec!["cam-1"]);
        assert_eq!(*three_transport.attached.lock().unwrap(), vec!["cam-1"]);
        assert_eq!(publisher.sources().await.len(), 1);
        assert!(matches!(rx2.try_recv(), Ok(ServerMessage::Offer { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_generation_stops_mid_broadcast() {
        let registry = Arc::new(Registry::new(Arc::new(Unreachable)));
        let session = Arc::new(Session::new(SessionId::from("room1")));
        let generation = CancellationToken::new();
        let (publisher, _rx1) = member("1");
        let (two, _rx2) = member("2");
        let (three, _rx3) = member("3");

        // The transport is replaced while the first target is being served
        let two_transport = Arc::new(Recording {
            cancel_on_attach: Some(generation.clone()),
            ..Default::default()
        });
        let three_transport = Arc::new(Recording::default());
        with_transport(&two, two_transport.clone()).await;
        with_transport(&three, three_transport.clone()).await;
        for m in [publisher.clone(), two, three] {
            session.add_member(m).await.unwrap();
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx
            .send(TransportEvent::NewSource(source("1", "cam-1")))
            .unwrap();
        run(registry, session, publisher, events, generation).await;

        assert_eq!(*two_transport.attached.lock().unwrap(), vec!["cam-1"]);
        assert!(three_transport.attached.lock().unwrap().is_empty());
    }
}

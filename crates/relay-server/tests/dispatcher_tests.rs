//! Dispatcher tests without a network
//!
//! Drives `Dispatcher` directly against a registry with in-memory
//! transports, so ordering and timing are deterministic.

use relay_protocol::{ClientMessage, IceCandidate, MediaKind, MemberId, ServerMessage, SessionId};
use relay_server::sfu::Registry;
use relay_server::transport::ConnectionState;
use relay_server::ws::{Dispatcher, SignalingState, MAX_PENDING_CANDIDATES};
use relay_test_utils::{sample_source, wait_until, FakeTransportFactory, EVENTUAL_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const GRACE: Duration = Duration::from_secs(10);

struct Fixture {
    registry: Arc<Registry>,
    transports: Arc<FakeTransportFactory>,
}

impl Fixture {
    fn new() -> Self {
        let transports = Arc::new(FakeTransportFactory::new());
        let registry = Arc::new(Registry::new(transports.clone()));
        Self {
            registry,
            transports,
        }
    }

    async fn connect(
        &self,
        member_id: &str,
    ) -> (Dispatcher, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::connect(
            self.registry.clone(),
            SessionId::from("room1"),
            MemberId::from(member_id),
            tx,
            GRACE,
        )
        .await;
        (dispatcher, rx)
    }

    async fn join(&self, member_id: &str) -> (Dispatcher, mpsc::UnboundedReceiver<ServerMessage>) {
        let (mut dispatcher, mut rx) = self.connect(member_id).await;
        dispatcher.handle_message(offer()).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Answer { .. })));
        (dispatcher, rx)
    }
}

fn offer() -> ClientMessage {
    ClientMessage::Offer {
        sdp: "v=0 offer".to_string(),
    }
}

fn candidate(n: u8) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 50000 typ host", n, n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[tokio::test]
async fn test_offer_moves_connection_to_active() {
    let fixture = Fixture::new();
    let (mut dispatcher, mut rx) = fixture.connect("1").await;
    assert_eq!(dispatcher.state(), SignalingState::Connecting);
    assert!(!dispatcher.member().is_joined());

    dispatcher.handle_message(offer()).await.unwrap();

    assert_eq!(dispatcher.state(), SignalingState::Active);
    assert!(dispatcher.member().is_joined());
    assert_eq!(
        rx.try_recv().unwrap(),
        ServerMessage::Answer {
            sdp: "v=0 answer 1 1".to_string()
        }
    );
    assert_eq!(fixture.registry.stats().await.members, 1);
}

#[tokio::test]
async fn test_second_offer_renegotiates_in_place() {
    let fixture = Fixture::new();
    let (mut dispatcher, mut rx) = fixture.join("1").await;

    dispatcher.handle_message(offer()).await.unwrap();

    assert_eq!(
        rx.try_recv().unwrap(),
        ServerMessage::Answer {
            sdp: "v=0 answer 1 2".to_string()
        }
    );
    assert_eq!(fixture.transports.created_count(), 1);
    let transport = fixture.transports.latest("room1", "1").unwrap();
    assert_eq!(transport.remote_offers().len(), 2);
}

#[tokio::test]
async fn test_joiner_receives_existing_sources_at_join() {
    let fixture = Fixture::new();
    let (_one, _rx1) = fixture.join("1").await;

    let publisher = fixture
        .registry
        .find_member(&SessionId::from("room1"), &MemberId::from("1"))
        .await
        .unwrap();
    publisher
        .publish(sample_source("1", "cam-1", MediaKind::Video))
        .await;
    publisher
        .publish(sample_source("1", "mic-1", MediaKind::Audio))
        .await;

    let (_two, mut rx2) = fixture.join("2").await;

    // Shared synchronously while handling the offer
    let transport = fixture.transports.latest("room1", "2").unwrap();
    assert_eq!(transport.attached_source_ids(), vec!["cam-1", "mic-1"]);
    assert_eq!(transport.offers_created(), 1);
    assert!(matches!(rx2.try_recv(), Ok(ServerMessage::Offer { .. })));
}

#[tokio::test]
async fn test_publish_racing_join_is_delivered_once() {
    let fixture = Fixture::new();
    let (_one, _rx1) = fixture.join("1").await;
    let publisher = fixture.transports.latest("room1", "1").unwrap();

    // Queued for member 1's fanout while member 2 joins
    publisher.publish("cam-1", MediaKind::Video);
    let (_two, _rx2) = fixture.join("2").await;

    let transport = fixture.transports.latest("room1", "2").unwrap();
    wait_until(EVENTUAL_TIMEOUT, || !transport.attached_sources().is_empty())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.attached_source_ids(), vec!["cam-1"]);
}

#[tokio::test]
async fn test_candidates_are_buffered_until_active() {
    let fixture = Fixture::new();
    let (mut dispatcher, _rx) = fixture.connect("1").await;

    dispatcher
        .handle_message(ClientMessage::Candidate {
            candidate: candidate(1),
        })
        .await
        .unwrap();
    dispatcher.handle_message(offer()).await.unwrap();
    dispatcher
        .handle_message(ClientMessage::Candidate {
            candidate: candidate(2),
        })
        .await
        .unwrap();

    let transport = fixture.transports.latest("room1", "1").unwrap();
    assert_eq!(transport.remote_candidates(), vec![candidate(1), candidate(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_candidates_are_discarded() {
    let fixture = Fixture::new();
    let (mut dispatcher, _rx) = fixture.connect("1").await;

    dispatcher
        .handle_message(ClientMessage::Candidate {
            candidate: candidate(1),
        })
        .await
        .unwrap();
    tokio::time::advance(GRACE + Duration::from_secs(1)).await;
    dispatcher
        .handle_message(ClientMessage::Candidate {
            candidate: candidate(2),
        })
        .await
        .unwrap();

    dispatcher.handle_message(offer()).await.unwrap();

    let transport = fixture.transports.latest("room1", "1").unwrap();
    assert_eq!(transport.remote_candidates(), vec![candidate(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_candidate_buffer_is_pruned_without_offer() {
    let fixture = Fixture::new();
    let (mut dispatcher, _rx) = fixture.connect("1").await;

    for n in 0..5 {
        dispatcher
            .handle_message(ClientMessage::Candidate {
                candidate: candidate(n),
            })
            .await
            .unwrap();
    }
    assert_eq!(dispatcher.pending_candidates(), 5);

    tokio::time::advance(GRACE + Duration::from_secs(1)).await;
    dispatcher
        .handle_message(ClientMessage::Candidate {
            candidate: candidate(9),
        })
        .await
        .unwrap();

    assert_eq!(dispatcher.pending_candidates(), 1);
}

#[tokio::test]
async fn test_candidate_buffer_keeps_the_newest() {
    let fixture = Fixture::new();
    let (mut dispatcher, _rx) = fixture.connect("1").await;

    let total = MAX_PENDING_CANDIDATES + 20;
    for n in 0..total {
        dispatcher
            .handle_message(ClientMessage::Candidate {
                candidate: candidate(n as u8),
            })
            .await
            .unwrap();
    }
    assert_eq!(dispatcher.pending_candidates(), MAX_PENDING_CANDIDATES);

    dispatcher.handle_message(offer()).await.unwrap();

    let transport = fixture.transports.latest("room1", "1").unwrap();
    let expected: Vec<_> = (20..total).map(|n| candidate(n as u8)).collect();
    assert_eq!(transport.remote_candidates(), expected);
    assert_eq!(dispatcher.pending_candidates(), 0);
}

#[tokio::test]
async fn test_invalid_candidate_is_dropped() {
    let fixture = Fixture::new();
    let (mut dispatcher, mut rx) = fixture.join("1").await;

    let empty = IceCandidate {
        candidate: String::new(),
        ..candidate(1)
    };
    dispatcher
        .handle_message(ClientMessage::Candidate { candidate: empty })
        .await
        .unwrap();

    let transport = fixture.transports.latest("room1", "1").unwrap();
    assert!(transport.remote_candidates().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_failure_is_a_rejection() {
    let fixture = Fixture::new();
    fixture.transports.set_fail_connect(true);
    let (mut dispatcher, mut rx) = fixture.connect("1").await;

    dispatcher.handle_text(r#"{"type":"offer","sdp":"v=0"}"#).await;

    assert!(matches!(rx.try_recv(), Ok(ServerMessage::Error { .. })));
    assert_eq!(dispatcher.state(), SignalingState::Connecting);
    assert_eq!(fixture.registry.stats().await.sessions, 0);
}

#[tokio::test]
async fn test_toggle_reaches_other_members() {
    let fixture = Fixture::new();
    let (mut one, mut rx1) = fixture.join("1").await;
    let (_two, mut rx2) = fixture.join("2").await;

    one.handle_message(ClientMessage::ToggleAudio { enabled: false })
        .await
        .unwrap();
    one.handle_message(ClientMessage::ToggleAudio { enabled: false })
        .await
        .unwrap();

    let expected = ServerMessage::ToggleAudio {
        member_id: MemberId::from("1"),
        enabled: false,
    };
    assert_eq!(rx2.try_recv().unwrap(), expected);
    assert_eq!(rx2.try_recv().unwrap(), expected);
    assert!(rx2.try_recv().is_err());
    assert!(rx1.try_recv().is_err());
    assert!(!one.member().presence().await.audio);
}

#[tokio::test]
async fn test_close_removes_member_and_session() {
    let fixture = Fixture::new();
    let (mut one, _rx1) = fixture.join("1").await;
    let (mut two, mut rx2) = fixture.join("2").await;

    one.close().await;
    assert_eq!(one.state(), SignalingState::Closed);
    assert_eq!(
        rx2.try_recv().unwrap(),
        ServerMessage::MemberLeft {
            member_id: MemberId::from("1")
        }
    );
    assert!(fixture.transports.latest("room1", "1").unwrap().is_closed());

    two.close().await;
    assert!(fixture.registry.get(&SessionId::from("room1")).await.is_none());

    // Closed connections ignore further input
    one.handle_message(offer()).await.unwrap();
    assert_eq!(fixture.transports.created_count(), 2);
}

#[tokio::test]
async fn test_superseded_connection_neither_acts_nor_removes() {
    let fixture = Fixture::new();
    let (mut old, mut old_rx) = fixture.join("1").await;
    let (_two, mut rx2) = fixture.join("2").await;

    let (new, mut new_rx) = fixture.connect("1").await;
    assert!(Arc::ptr_eq(old.member(), new.member()));

    old.handle_message(ClientMessage::ToggleVideo { enabled: false })
        .await
        .unwrap();
    assert!(rx2.try_recv().is_err());

    old.close().await;
    assert!(rx2.try_recv().is_err());
    assert_eq!(fixture.registry.stats().await.members, 2);

    // Notices for member 1 now go to the new connection only
    fixture
        .transports
        .latest("room1", "2")
        .unwrap()
        .set_state(ConnectionState::Closed);
    wait_until(EVENTUAL_TIMEOUT, || new_rx.try_recv().is_ok())
        .await
        .unwrap();
    assert!(old_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_removed_member_cannot_toggle_its_replacement() {
    let fixture = Fixture::new();
    let (mut old, _old_rx) = fixture.join("1").await;
    let (_two, mut rx2) = fixture.join("2").await;

    fixture
        .transports
        .latest("room1", "1")
        .unwrap()
        .set_state(ConnectionState::Failed);
    wait_until(EVENTUAL_TIMEOUT, || old.member().is_removed())
        .await
        .unwrap();
    assert_eq!(
        rx2.recv().await.unwrap(),
        ServerMessage::MemberLeft {
            member_id: MemberId::from("1")
        }
    );

    let (new, _new_rx) = fixture.join("1").await;
    assert!(!Arc::ptr_eq(old.member(), new.member()));

    old.handle_message(ClientMessage::ToggleVideo { enabled: false })
        .await
        .unwrap();

    assert!(new.member().presence().await.video);
    assert!(rx2.try_recv().is_err());
}

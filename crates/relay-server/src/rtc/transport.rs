//! Peer connection backed transport

use async_trait::async_trait;
use relay_protocol::{IceCandidate, MediaKind, MemberId};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::recorder::{Recorder, RECORDER_QUEUE};
use super::track_router::TrackRouter;
use crate::sfu::MediaSource;
use crate::transport::{
    ConnectionState, Transport, TransportContext, TransportError, TransportEvent,
};

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    member_id: MemberId,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl WebRtcTransport {
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        ctx: TransportContext,
        pli_interval: Duration,
        recorder: Option<Arc<dyn Recorder>>,
    ) -> Self {
        let TransportContext {
            member_id,
            events,
            cancel,
            tasks,
            ..
        } = ctx;

        let state_events = events.clone();
        let state_member = member_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!("Peer connection of member {} is {}", state_member, state);
            let _ = state_events.send(TransportEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = from_candidate_init(init);
                        let _ = events.send(TransportEvent::LocalCandidate(candidate));
                    }
                    Err(e) => tracing::error!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let weak_pc = Arc::downgrade(&pc);
        let track_member = member_id.clone();
        let track_tasks = tasks.clone();
        let track_cancel = cancel.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let mut router = TrackRouter::new(track.clone(), track_member.clone());

                if let Some(recorder) = &recorder {
                    let (tap, packets) = mpsc::channel(RECORDER_QUEUE);
                    router = router.with_tap(tap);
                    let recorder = recorder.clone();
                    let publisher = track_member.clone();
                    let kind = router.kind();
                    track_tasks.spawn(async move {
                        recorder.record(publisher, kind, packets).await;
                    });
                }

                if router.kind() == MediaKind::Video {
                    track_tasks.spawn(request_keyframes(
                        weak_pc.clone(),
                        track.ssrc(),
                        pli_interval,
                        track_cancel.clone(),
                    ));
                }

                let source = router.source();
                track_tasks.spawn(router.run(track_cancel.clone()));

                tracing::info!(
                    "Member {} started publishing {} track {}",
                    track_member,
                    source.kind(),
                    source.id()
                );
                let _ = events.send(TransportEvent::NewSource(source));

                Box::pin(async {})
            },
        ));

        Self {
            pc,
            member_id,
            cancel,
            tasks,
        }
    }
}

/// Periodically ask the publisher for a keyframe so late subscribers can
/// start decoding
async fn request_keyframes(
    pc: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pc) = pc.upgrade() else {
            break;
        };
        if let Err(e) = pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await
        {
            tracing::debug!("Failed to send PLI for ssrc {}: {}", media_ssrc, e);
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn negotiate(&self, offer_sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        tracing::debug!("Answered offer of member {}", self.member_id);
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, answer_sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await?;
        Ok(())
    }

    async fn attach_source(&self, source: &MediaSource) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let track: Arc<dyn TrackLocal + Send + Sync> = source.track();
        let sender = self.pc.add_track(track).await?;

        // Incoming RTCP must be read for interceptors (NACK, reports) to work
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    read = sender.read(&mut buf) => {
                        if read.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.pc.close().await?;
        Ok(())
    }
}

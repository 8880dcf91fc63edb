//! In-memory transport
//!
//! Records everything the relay asks of it and lets a test inject the events
//! a real peer connection would produce.

use async_trait::async_trait;
use relay_protocol::{IceCandidate, MediaKind, MemberId, SessionId};
use relay_server::sfu::MediaSource;
use relay_server::transport::{
    ConnectionState, Transport, TransportContext, TransportError, TransportEvent, TransportFactory,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Build a source as if `publisher` had started sending a track
pub fn sample_source(publisher: &str, id: &str, kind: MediaKind) -> MediaSource {
    let mime_type = match kind {
        MediaKind::Audio => "audio/opus",
        MediaKind::Video => "video/VP8",
    };
    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: if kind == MediaKind::Audio { 48000 } else { 90000 },
            ..Default::default()
        },
        id.to_string(),
        format!("stream-{}", publisher),
    ));
    MediaSource::new(id, kind, MemberId::from(publisher), track)
}

#[derive(Default)]
struct Recorded {
    remote_offers: Vec<String>,
    remote_answers: Vec<String>,
    candidates: Vec<IceCandidate>,
    attached: Vec<(MemberId, String)>,
    offers_created: usize,
}

pub struct FakeTransport {
    session_id: SessionId,
    member_id: MemberId,
    events: mpsc::UnboundedSender<TransportEvent>,
    recorded: Mutex<Recorded>,
    fail_attach: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    fn new(ctx: TransportContext) -> Self {
        Self {
            session_id: ctx.session_id,
            member_id: ctx.member_id,
            events: ctx.events,
            recorded: Mutex::new(Recorded::default()),
            fail_attach: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// Simulate the remote side starting a track
    pub fn publish(&self, id: &str, kind: MediaKind) -> MediaSource {
        let source = sample_source(self.member_id.as_str(), id, kind);
        self.emit(TransportEvent::NewSource(source.clone()));
        source
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    /// Simulate a gathered local candidate
    pub fn emit_candidate(&self, candidate: &str) {
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    fn emit(&self, event: TransportEvent) {
        // The relay may already have dropped the queue
        let _ = self.events.send(event);
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    /// (publisher, source id) of every attached source, in order
    pub fn attached_sources(&self) -> Vec<(MemberId, String)> {
        self.recorded.lock().unwrap().attached.clone()
    }

    pub fn attached_source_ids(&self) -> Vec<String> {
        self.attached_sources()
            .into_iter()
            .map(|(_, id)| id)
            .collect()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.recorded.lock().unwrap().candidates.clone()
    }

    pub fn remote_offers(&self) -> Vec<String> {
        self.recorded.lock().unwrap().remote_offers.clone()
    }

    pub fn remote_answers(&self) -> Vec<String> {
        self.recorded.lock().unwrap().remote_answers.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.recorded.lock().unwrap().offers_created
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn negotiate(&self, offer_sdp: String) -> Result<String, TransportError> {
        self.ensure_open()?;
        if !offer_sdp.starts_with("v=0") {
            return Err(TransportError::InvalidDescription(
                "missing version line".to_string(),
            ));
        }
        let mut recorded = self.recorded.lock().unwrap();
        recorded.remote_offers.push(offer_sdp);
        Ok(format!(
            "v=0 answer {} {}",
            self.member_id,
            recorded.remote_offers.len()
        ))
    }

    async fn accept_answer(&self, answer_sdp: String) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !answer_sdp.starts_with("v=0") {
            return Err(TransportError::InvalidDescription(
                "missing version line".to_string(),
            ));
        }
        self.recorded.lock().unwrap().remote_answers.push(answer_sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if candidate.candidate.is_empty() {
            return Err(TransportError::InvalidDescription(
                "empty candidate".to_string(),
            ));
        }
        self.recorded.lock().unwrap().candidates.push(candidate);
        Ok(())
    }

    async fn attach_source(&self, source: &MediaSource) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.recorded
            .lock()
            .unwrap()
            .attached
            .push((source.publisher().clone(), source.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        let mut recorded = self.recorded.lock().unwrap();
        recorded.offers_created += 1;
        Ok(format!(
            "v=0 offer {} {}",
            self.member_id, recorded.offers_created
        ))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`FakeTransport`]s and keeping every one it created
#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    fail_connect: AtomicBool,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Every transport created for `member_id` of `session_id`, oldest first
    pub fn transports_for(&self, session_id: &str, member_id: &str) -> Vec<Arc<FakeTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.session_id.as_str() == session_id && t.member_id.as_str() == member_id)
            .cloned()
            .collect()
    }

    /// The most recent transport of a member
    pub fn latest(&self, session_id: &str, member_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports_for(session_id, member_id).pop()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(&self, ctx: TransportContext) -> Result<Arc<dyn Transport>, TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let transport = Arc::new(FakeTransport::new(ctx));
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

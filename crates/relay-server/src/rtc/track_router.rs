//! Track Router for RTP forwarding
//!
//! Copies RTP packets from one remote track into a local track that every
//! subscriber's peer connection shares. Packets are forwarded untouched, so
//! codec packetization survives.

use relay_protocol::{MediaKind, MemberId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::sfu::MediaSource;

pub struct TrackRouter {
    remote: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    publisher: MemberId,
    kind: MediaKind,
    /// Copy of the stream for a recorder; never awaited
    tap: Option<mpsc::Sender<Packet>>,
}

impl TrackRouter {
    pub fn new(remote: Arc<TrackRemote>, publisher: MemberId) -> Self {
        let kind = media_kind(remote.kind());
        // Same codec as the publisher so packets need no rewriting
        let local = Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability,
            remote.id(),
            remote.stream_id(),
        ));

        Self {
            remote,
            local,
            publisher,
            kind,
            tap: None,
        }
    }

    pub fn with_tap(mut self, tap: mpsc::Sender<Packet>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The shareable side of this router
    pub fn source(&self) -> MediaSource {
        MediaSource::new(
            self.remote.id(),
            self.kind,
            self.publisher.clone(),
            self.local.clone(),
        )
    }

    /// Forward until the remote track ends or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let track_id = self.remote.id();
        tracing::info!(
            "Forwarding {} track {} from member {}",
            self.kind,
            track_id,
            self.publisher
        );

        let mut forwarded = 0u64;
        let mut dropped = 0u64;

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = self.remote.read_rtp() => read,
            };

            let packet = match read {
                Ok((packet, _attributes)) => packet,
                Err(e) => {
                    tracing::info!("Source track {} ended: {}", track_id, e);
                    break;
                }
            };

            if let Some(tap) = &self.tap {
                if tap.try_send(packet.clone()).is_err() {
                    dropped += 1;
                }
            }

            match self.local.write_rtp(&packet).await {
                Ok(_) => forwarded += 1,
                // No subscriber bound yet
                Err(webrtc::Error::ErrClosedPipe) => {}
                Err(e) => {
                    tracing::warn!("Failed to forward RTP on track {}: {}", track_id, e);
                }
            }
        }

        tracing::info!(
            "Stopped forwarding track {} ({} packets, {} dropped by recorder)",
            track_id,
            forwarded,
            dropped
        );
    }
}

pub fn media_kind(codec_type: RTPCodecType) -> MediaKind {
    match codec_type {
        RTPCodecType::Video => MediaKind::Video,
        _ => MediaKind::Audio,
    }
}

use relay_protocol::{MediaKind, MemberId};
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// One inbound media stream published by a member
///
/// The local track is shared: attaching it to several peer connections
/// fans the same RTP stream out to all of them.
#[derive(Clone)]
pub struct MediaSource {
    id: String,
    kind: MediaKind,
    publisher: MemberId,
    track: Arc<TrackLocalStaticRTP>,
}

impl MediaSource {
    pub fn new(
        id: impl Into<String>,
        kind: MediaKind,
        publisher: MemberId,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            publisher,
            track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Member that publishes this source
    pub fn publisher(&self) -> &MemberId {
        &self.publisher
    }

    pub fn track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("publisher", &self.publisher)
            .finish()
    }
}

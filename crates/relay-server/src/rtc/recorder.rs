//! Recording hook for published sources

use async_trait::async_trait;
use relay_protocol::{MediaKind, MemberId};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

/// Packets queued per source before the forwarding loop starts dropping
pub const RECORDER_QUEUE: usize = 512;

/// Consumer of a published source's RTP stream
///
/// `record` runs on its own task and returns when `packets` is closed.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(&self, publisher: MemberId, kind: MediaKind, packets: mpsc::Receiver<Packet>);
}

/// Counts packets and payload bytes of every recorded source
#[derive(Default)]
pub struct PacketStatsRecorder {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl PacketStatsRecorder {
    /// Totals across all sources: (packets, payload bytes)
    pub fn totals(&self) -> (u64, u64) {
        (
            self.packets.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Recorder for PacketStatsRecorder {
    async fn record(
        &self,
        publisher: MemberId,
        kind: MediaKind,
        mut packets: mpsc::Receiver<Packet>,
    ) {
        let mut count = 0u64;
        let mut bytes = 0u64;

        while let Some(packet) = packets.recv().await {
            let size = packet.payload.len() as u64;
            count += 1;
            bytes += size;
            self.packets.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(size, Ordering::Relaxed);
        }

        tracing::info!(
            "Recorded {} source of member {}: {} packets, {} bytes",
            kind,
            publisher,
            count,
            bytes
        );
    }
}

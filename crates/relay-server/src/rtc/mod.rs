//! WebRTC media plane
//!
//! One peer connection per member transport, built from a shared API with
//! the default codecs and interceptors.

mod recorder;
mod track_router;
mod transport;

pub use recorder::{PacketStatsRecorder, Recorder};
pub use track_router::TrackRouter;
pub use transport::WebRtcTransport;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::state::Config;
use crate::transport::{Transport, TransportContext, TransportError, TransportFactory};

pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    pli_interval: Duration,
    recorder: Option<Arc<dyn Recorder>>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &Config) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut interceptors = InterceptorRegistry::new();
        interceptors = register_default_interceptors(interceptors, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .with_setting_engine(SettingEngine::default())
            .build();

        let recorder: Option<Arc<dyn Recorder>> = if config.record {
            tracing::info!("Recording published sources");
            Some(Arc::new(PacketStatsRecorder::default()))
        } else {
            None
        };

        Ok(Self {
            api,
            ice_servers: ice_servers(config),
            pli_interval: config.pli_interval(),
            recorder,
        })
    }
}

fn ice_servers(config: &Config) -> Vec<RTCIceServer> {
    let mut ice_servers = vec![];

    for stun_url in &config.stun_servers {
        ice_servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in &config.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    ice_servers
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn connect(&self, ctx: TransportContext) -> Result<Arc<dyn Transport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        tracing::info!(
            "Created peer connection for member {} in session {}",
            ctx.member_id,
            ctx.session_id
        );

        Ok(Arc::new(WebRtcTransport::new(
            pc,
            ctx,
            self.pli_interval,
            self.recorder.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TurnServer;
    use relay_protocol::{MemberId, SessionId};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    #[test]
    fn test_ice_servers_from_config() {
        let config = Config {
            stun_servers: vec!["stun:stun.example.org:3478".into()],
            turn_servers: vec![TurnServer {
                url: "turn:turn.example.org:3478".into(),
                username: "relay".into(),
                credential: "secret".into(),
            }],
            ..Config::default()
        };

        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "relay");
    }

    #[tokio::test]
    async fn test_garbage_offer_is_rejected() {
        let config = Config {
            stun_servers: vec![],
            ..Config::default()
        };
        let factory = WebRtcTransportFactory::new(&config).unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        let ctx = TransportContext {
            session_id: SessionId::from("room1"),
            member_id: MemberId::from("1"),
            events,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        let transport = factory.connect(ctx).await.unwrap();
        let err = transport.negotiate("not an sdp".into()).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidDescription(_)));
        transport.close().await.unwrap();
    }
}

//! Relay Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod rtc;
pub mod sfu;
pub mod state;
pub mod transport;
pub mod ws;

use anyhow::Result;
use std::sync::Arc;

use crate::sfu::Registry;
use crate::transport::TransportFactory;

/// Create the server application with the WebRTC media plane
pub fn create_app(config: state::Config) -> Result<(axum::Router, Arc<Registry>)> {
    let transports = Arc::new(rtc::WebRtcTransportFactory::new(&config)?);
    Ok(create_app_with_transport(config, transports))
}

/// Create the server application on top of any transport factory
pub fn create_app_with_transport(
    config: state::Config,
    transports: Arc<dyn TransportFactory>,
) -> (axum::Router, Arc<Registry>) {
    let registry = Arc::new(Registry::new(transports));
    let app_state = state::AppState::new(config, registry.clone());
    let router = api::create_router(app_state);
    (router, registry)
}

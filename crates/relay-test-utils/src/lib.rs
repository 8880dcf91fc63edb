//! # Relay Test Utilities
//!
//! Shared test utilities for the relay server.
//!
//! This crate provides:
//! - An in-memory transport (`FakeTransportFactory`) standing in for WebRTC
//! - Server test harness (`TestRelayServer`) and a signaling client (`TestClient`)
//! - Polling assertions for asynchronous effects (`assert_eventually`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestRelayServer::spawn().await?;
//!     let mut client = server.connect("room1", "1").await?;
//!     client.send(&ClientMessage::Offer { sdp: "v=0".into() }).await?;
//!     assert!(matches!(client.recv().await?, ServerMessage::Answer { .. }));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod eventual;
pub mod fake_transport;
pub mod server_harness;

// Re-export commonly used items
pub use client::*;
pub use eventual::*;
pub use fake_transport::*;
pub use server_harness::*;

pub use relay_protocol::{ClientMessage, IceCandidate, MediaKind, MemberId, ServerMessage, SessionId};

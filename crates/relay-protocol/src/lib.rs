//! Signaling protocol shared by the relay server and its clients
//!
//! Every WebSocket frame carries one JSON message tagged by `"type"`.

pub mod messages;
pub mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::{IceCandidate, MediaKind, MemberId, SessionId, StatsData};

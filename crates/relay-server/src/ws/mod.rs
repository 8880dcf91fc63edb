//! WebSocket signaling

mod dispatcher;
pub mod handler;

pub use dispatcher::{Dispatcher, SignalingState, MAX_PENDING_CANDIDATES};

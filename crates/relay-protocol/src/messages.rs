use serde::{Deserialize, Serialize};

use crate::types::{IceCandidate, MemberId};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session description offer (initial negotiation or client renegotiation)
    Offer { sdp: String },

    /// Answer to a server-initiated renegotiation
    Answer { sdp: String },

    /// Trickled ICE candidate
    Candidate { candidate: IceCandidate },

    /// Camera switched on or off
    ToggleVideo { enabled: bool },

    /// Microphone switched on or off
    ToggleAudio { enabled: bool },
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to the client's offer
    Answer { sdp: String },

    /// Server-initiated renegotiation after new sources were attached
    Offer { sdp: String },

    /// Trickled ICE candidate gathered by the server
    Candidate { candidate: IceCandidate },

    /// Another member left the session
    MemberLeft { member_id: MemberId },

    /// Another member's camera state changed
    ToggleVideo { member_id: MemberId, enabled: bool },

    /// Another member's microphone state changed
    ToggleAudio { member_id: MemberId, enabled: bool },

    /// A request from this client was rejected
    Error { message: String },
}

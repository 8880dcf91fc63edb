use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_protocol::{MemberId, SessionId};
use serde_json::json;
use thiserror::Error;

use crate::transport::TransportError;

/// Failures of the relay engine
///
/// None of these are fatal: the unit of failure is one message, one
/// connection or one delivery.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Member {member_id} is already in session {session_id}")]
    AlreadyMember {
        session_id: SessionId,
        member_id: MemberId,
    },

    #[error("Member not found: {0}")]
    MemberNotFound(MemberId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {0} was closed")]
    SessionClosed(SessionId),

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(#[source] TransportError),

    #[error("Could not deliver source {source_id} to member {member_id}: {cause}")]
    DeliveryFailure {
        member_id: MemberId,
        source_id: String,
        #[source]
        cause: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RelayError {
    /// Whether the client should be told about this failure
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::AlreadyMember { .. } | RelayError::NegotiationFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors returned by the HTTP surface
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

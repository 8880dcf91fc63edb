use crate::error::AppError;
use crate::state::AppState;
use crate::ws::Dispatcher;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{MemberId, ServerMessage, SessionId};
use tokio::sync::mpsc;

const MAX_ID_LEN: usize = 64;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((session_id, member_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let session_id = SessionId::new(validate_id("session", session_id)?);
    let member_id = MemberId::new(validate_id("member", member_id)?);

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, member_id)))
}

fn validate_id(what: &str, id: String) -> Result<String, AppError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(AppError::BadRequest(format!(
            "{} id must be 1 to {} characters",
            what, MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::BadRequest(format!(
            "{} id may only contain letters, digits, '-' and '_'",
            what
        )));
    }
    Ok(id)
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: SessionId,
    member_id: MemberId,
) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut dispatcher = Dispatcher::connect(
        state.registry.clone(),
        session_id,
        member_id.clone(),
        tx,
        state.config.candidate_grace(),
    )
    .await;

    // Forward messages from the channel to the socket
    let shutdown = state.registry.shutdown_token();
    let send_task = state.registry.tasks().spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize {:?}: {}", message, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatcher.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("WebSocket error for member {}: {}", member_id, e);
                break;
            }
            _ => {}
        }
    }

    dispatcher.close().await;
    send_task.abort();
}

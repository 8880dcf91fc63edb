//! Signaling client for tests

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// How long `recv` waits before failing
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (ws, _response) = connect_async(url).await?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), anyhow::Error> {
        let text = serde_json::to_string(message)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.ws.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    /// Next server message, skipping control frames
    pub async fn recv(&mut self) -> Result<ServerMessage, anyhow::Error> {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for a server message"))?
                .ok_or_else(|| anyhow::anyhow!("Connection closed"))??;

            match frame {
                Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
                Message::Close(_) => anyhow::bail!("Connection closed"),
                _ => continue,
            }
        }
    }

    /// Next message that is not a trickled candidate
    pub async fn recv_signal(&mut self) -> Result<ServerMessage, anyhow::Error> {
        loop {
            match self.recv().await? {
                ServerMessage::Candidate { .. } => continue,
                message => return Ok(message),
            }
        }
    }

    /// Assert nothing but candidates arrives within `within`
    pub async fn expect_silence(&mut self, within: Duration) -> Result<(), anyhow::Error> {
        match timeout(within, self.recv_signal()).await {
            Err(_) => Ok(()),
            Ok(Err(_)) => Ok(()),
            Ok(Ok(message)) => anyhow::bail!("Unexpected message: {:?}", message),
        }
    }

    /// Send an offer and wait for the answer
    pub async fn offer(&mut self) -> Result<String, anyhow::Error> {
        self.send(&ClientMessage::Offer {
            sdp: "v=0 offer".to_string(),
        })
        .await?;
        match self.recv_signal().await? {
            ServerMessage::Answer { sdp } => Ok(sdp),
            other => anyhow::bail!("Expected answer, got {:?}", other),
        }
    }

    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.ws.close(None).await?;
        Ok(())
    }
}

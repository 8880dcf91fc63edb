//! Test server harness for E2E testing
//!
//! Provides `TestRelayServer` for spawning a real relay server backed by
//! [`FakeTransportFactory`].

use relay_server::sfu::Registry;
use relay_server::state::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::client::TestClient;
use crate::fake_transport::FakeTransportFactory;

pub struct TestRelayServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
    transports: Arc<FakeTransportFactory>,
    handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a server on a random local port with default settings
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(Config::default()).await
    }

    /// Spawn a server with a custom candidate grace period
    pub async fn spawn_with_grace(grace: Duration) -> Result<Self, anyhow::Error> {
        Self::spawn_with(Config {
            candidate_grace_secs: grace.as_secs(),
            ..Config::default()
        })
        .await
    }

    pub async fn spawn_with(config: Config) -> Result<Self, anyhow::Error> {
        let transports = Arc::new(FakeTransportFactory::new());
        let (app, registry) =
            relay_server::create_app_with_transport(config, transports.clone());

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            registry,
            transports,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, session_id: &str, member_id: &str) -> String {
        format!("ws://{}/ws/{}/{}", self.addr, session_id, member_id)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn transports(&self) -> &Arc<FakeTransportFactory> {
        &self.transports
    }

    /// Open a signaling connection for a member
    pub async fn connect(
        &self,
        session_id: &str,
        member_id: &str,
    ) -> Result<TestClient, anyhow::Error> {
        TestClient::connect(&self.ws_url(session_id, member_id)).await
    }

    /// Connect and complete the first offer/answer exchange
    pub async fn join(
        &self,
        session_id: &str,
        member_id: &str,
    ) -> Result<TestClient, anyhow::Error> {
        let mut client = self.connect(session_id, member_id).await?;
        client.offer().await?;
        Ok(client)
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

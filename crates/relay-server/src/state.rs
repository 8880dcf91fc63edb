use crate::sfu::Registry;
use config::{Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Server configuration
///
/// Read from an optional `relay.toml`, then `RELAY_*` environment variables
/// (e.g. `RELAY_BIND_ADDRESS`, `RELAY_STUN_SERVERS=stun:a,stun:b`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    /// Only settable from the config file
    pub turn_servers: Vec<TurnServer>,
    /// How long a candidate may wait for negotiation before it is discarded
    pub candidate_grace_secs: u64,
    pub pli_interval_ms: u64,
    /// Attach the packet statistics recorder to every published source
    pub record: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4004".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            candidate_grace_secs: 10,
            pli_interval_ms: 3000,
            record: false,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::build(Environment::with_prefix("RELAY"))
    }

    /// Load with `vars` standing in for the process environment
    pub fn from_env_map(vars: HashMap<String, String>) -> anyhow::Result<Self> {
        Self::build(Environment::with_prefix("RELAY").source(Some(vars)))
    }

    fn build(env: Environment) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::with_name("relay").required(false))
            .add_source(
                env.try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        if config.stun_servers.is_empty() && config.turn_servers.is_empty() {
            tracing::warn!("No ICE servers configured, only host candidates will be gathered");
        }

        Ok(config)
    }

    pub fn candidate_grace(&self) -> Duration {
        Duration::from_secs(self.candidate_grace_secs)
    }

    pub fn pli_interval(&self) -> Duration {
        Duration::from_millis(self.pli_interval_ms)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<Registry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }
}

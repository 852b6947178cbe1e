use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Liveness sweep cadence in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    /// Idle timeout in seconds (evict if no ping within this window)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // .env first, so the Environment source below sees its variables
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Baseline defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("hub.sweep_interval", 30)?
            .set_default("hub.idle_timeout", 60)?
            // Optional file layers: shared, then RUN_MODE-specific
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Environment wins last: SERVER_PORT, AUTH_SECRET, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

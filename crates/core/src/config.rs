use std::time::Duration;

use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `WAYPOINT__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Namespace that journey references belong to.
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

// ─── Client Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientBackend {
    #[default]
    Memory,
    Sqlite,
    BatchedSqlite,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub backend: ClientBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// Journeys buffered before the batched backend writes through.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Retry a failed connection once after `retry_delay_secs`.
    #[serde(default = "default_retry")]
    pub retry: bool,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_sqlite_path() -> String {
    "waypoint.db".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_retry() -> bool {
    true
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: ClientBackend::default(),
            sqlite_path: default_sqlite_path(),
            batch_size: default_batch_size(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: None,
            password: None,
            retry: default_retry(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

// ─── Broker Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    #[default]
    Memory,
    Sqlite,
    BatchedSqlite,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    #[serde(default = "default_broker_sqlite_path")]
    pub sqlite_path: String,
    /// Distinct references buffered before the batched broker writes through.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Upper bound on establishing each Redis connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_broker_sqlite_path() -> String {
    "waypoint-broker.db".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            sqlite_path: default_broker_sqlite_path(),
            batch_size: default_batch_size(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

// ─── Engine Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// SQLite file holding the source tables read by database-backed sources.
    #[serde(default = "default_data_path")]
    pub data_path: String,
    /// Message data types that restart a journey from the step of the same name.
    #[serde(default)]
    pub watch_messages: Vec<String>,
}

fn default_source() -> String {
    "admissions".to_string()
}

fn default_data_path() -> String {
    "data.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            watch_messages: Vec::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            client: ClientConfig::default(),
            broker: BrokerConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then environment
    /// variables (`WAYPOINT__CLIENT__BACKEND=sqlite`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("WAYPOINT")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("engine.watch_messages"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

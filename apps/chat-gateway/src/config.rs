use crate::gateway::redis::DEFAULT_CHANNEL_PREFIX;
use crate::gateway::DEFAULT_OUTBOUND_BUFFER;
use crate::store::DEFAULT_PAGE_SIZE;

/// Chat gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// HS256 secret shared with the identity provider.
    pub jwt_signing_key: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    pub broker: BrokerBackend,
    /// Upper bound on concurrent connections. `None` is unbounded.
    pub max_connections: Option<usize>,
    /// Per-connection outbound queue depth.
    pub outbound_buffer: usize,
    pub history_page_size: usize,
    pub ping_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

/// Room broker selected at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerBackend {
    /// Single-process fan-out.
    InProcess,
    Redis { url: String, channel_prefix: String },
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let broker = match optional_var("REDIS_URL") {
            Some(url) => BrokerBackend::Redis {
                url,
                channel_prefix: optional_var("REDIS_CHANNEL_PREFIX")
                    .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string()),
            },
            None => BrokerBackend::InProcess,
        };

        Self {
            database_url: required_var("DATABASE_URL"),
            jwt_signing_key: required_var("JWT_SIGNING_KEY"),
            port: parsed_var("PORT").unwrap_or(8000),
            broker,
            max_connections: parsed_var("MAX_CONNECTIONS"),
            outbound_buffer: parsed_var("OUTBOUND_BUFFER").unwrap_or(DEFAULT_OUTBOUND_BUFFER),
            history_page_size: parsed_var("HISTORY_PAGE_SIZE").unwrap_or(DEFAULT_PAGE_SIZE),
            ping_interval_secs: parsed_var("PING_INTERVAL_SECS").unwrap_or(30),
            shutdown_grace_secs: parsed_var("SHUTDOWN_GRACE_SECS").unwrap_or(10),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    optional_var(name).and_then(|v| v.parse().ok())
}

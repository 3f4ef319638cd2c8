//! Configuration management for the tankobon service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tankobon_delivery::{ClientConfig, DeliveryConfig, RetryPolicy};
use tankobon_discovery::DiscoveryConfig;

const CONFIG_FILE: &str = "tankobon.toml";

/// One source provider served by an HTTP sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name. The registry identifier is `"[LANG] name"`.
    pub name: String,
    /// Language code, e.g. `"en"`.
    #[serde(default = "default_provider_language")]
    pub language: String,
    /// Sidecar base URL.
    pub base_url: String,
    /// Hostnames whose series this provider owns.
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`tankobon.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Without a database URL the service runs on an in-memory store.
///
/// # Example
///
/// ```no_run
/// use tankobon_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Command surface will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL. Unset means in-memory storage.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default, alias = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Server
    /// Command surface bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Command surface bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Delivery
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Upper bound on one job in seconds. 0 disables the bound.
    ///
    /// Environment variable: `JOB_TIMEOUT_SECS`
    #[serde(default, alias = "JOB_TIMEOUT_SECS")]
    pub job_timeout_secs: u64,
    /// Time allowed for workers to finish on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,

    // Retry
    /// Longest single rate-limit wait in seconds.
    ///
    /// Environment variable: `RETRY_MAX_WAIT_SECS`
    #[serde(default = "default_retry_max_wait", alias = "RETRY_MAX_WAIT_SECS")]
    pub retry_max_wait_secs: u64,
    /// Cumulative wait budget per call in seconds. 0 means unbounded.
    ///
    /// Environment variable: `RETRY_MAX_TOTAL_WAIT_SECS`
    #[serde(default, alias = "RETRY_MAX_TOTAL_WAIT_SECS")]
    pub retry_max_total_wait_secs: u64,
    /// Extra random wait on top of the declared one (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default, alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Discovery
    /// Seconds between discovery cycle starts.
    ///
    /// Environment variable: `DISCOVERY_INTERVAL_SECS`
    #[serde(default = "default_discovery_interval", alias = "DISCOVERY_INTERVAL_SECS")]
    pub discovery_interval_secs: u64,
    /// Most new chapters taken from one series per cycle.
    ///
    /// Environment variable: `DISCOVERY_MAX_ITEMS`
    #[serde(default = "default_discovery_max_items", alias = "DISCOVERY_MAX_ITEMS")]
    pub discovery_max_items: usize,
    /// Pause after each polled series, in milliseconds.
    ///
    /// Environment variable: `DISCOVERY_COURTESY_DELAY_MS`
    #[serde(default = "default_courtesy_delay_ms", alias = "DISCOVERY_COURTESY_DELAY_MS")]
    pub discovery_courtesy_delay_ms: u64,
    /// Extra pause after seeding a new series, in seconds.
    ///
    /// Environment variable: `DISCOVERY_SEED_DELAY_SECS`
    #[serde(default = "default_seed_delay", alias = "DISCOVERY_SEED_DELAY_SECS")]
    pub discovery_seed_delay_secs: u64,

    // Gateway
    /// Base URL of the chat gateway and render sidecar.
    ///
    /// Environment variable: `GATEWAY_URL`
    #[serde(default = "default_gateway_url", alias = "GATEWAY_URL")]
    pub gateway_url: String,
    /// Gateway request timeout in seconds.
    ///
    /// Environment variable: `GATEWAY_TIMEOUT_SECS`
    #[serde(default = "default_gateway_timeout", alias = "GATEWAY_TIMEOUT_SECS")]
    pub gateway_timeout_secs: u64,
    /// Whether the gateway accepts several documents in one send.
    ///
    /// Environment variable: `GATEWAY_SUPPORTS_BATCH`
    #[serde(default = "default_true", alias = "GATEWAY_SUPPORTS_BATCH")]
    pub gateway_supports_batch: bool,

    // Providers
    /// Source provider sidecars.
    ///
    /// Environment variable: `PROVIDERS` (inline TOML array)
    #[serde(default, alias = "PROVIDERS")]
    pub providers: Vec<ProviderConfig>,
    /// Provider identifiers registered but not polled.
    ///
    /// Environment variable: `PAUSED_PROVIDERS`
    #[serde(default, alias = "PAUSED_PROVIDERS")]
    pub paused_providers: Vec<String>,

    // Command surface
    /// Most live tokens held for search results and listings.
    ///
    /// Environment variable: `TOKEN_CAPACITY`
    #[serde(default = "default_token_capacity", alias = "TOKEN_CAPACITY")]
    pub token_capacity: usize,
    /// Token lifetime in seconds.
    ///
    /// Environment variable: `TOKEN_TTL_SECS`
    #[serde(default = "default_token_ttl", alias = "TOKEN_TTL_SECS")]
    pub token_ttl_secs: u64,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Fails when a source cannot be parsed or a value is out of range.
    pub fn load() -> Result<Self> {
        Self::figment().extract::<Self>().context("Failed to load configuration").and_then(
            |config| {
                config.validate()?;
                Ok(config)
            },
        )
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Delivery engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_pool_size,
            retry_policy: self.to_retry_policy(),
            job_timeout: (self.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.job_timeout_secs)),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Retry policy for outbound channel calls.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_wait: Duration::from_secs(self.retry_max_wait_secs),
            max_total_wait: (self.retry_max_total_wait_secs > 0)
                .then(|| Duration::from_secs(self.retry_max_total_wait_secs)),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Discovery loop timing.
    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            period: Duration::from_secs(self.discovery_interval_secs),
            max_items: self.discovery_max_items,
            courtesy_delay: Duration::from_millis(self.discovery_courtesy_delay_ms),
            seed_delay: Duration::from_secs(self.discovery_seed_delay_secs),
        }
    }

    /// Gateway client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.gateway_url.clone(),
            timeout: Duration::from_secs(self.gateway_timeout_secs),
            supports_batch: self.gateway_supports_batch,
            ..ClientConfig::default()
        }
    }

    /// Token registry lifetime.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Fails when host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> Option<String> {
        let url = self.database_url.as_ref()?;
        if let Some(at_pos) = url.find('@') {
            if let Some(colon_pos) = url[..at_pos].rfind(':') {
                if !url[..colon_pos].ends_with('/') {
                    let mut masked = url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return Some(masked);
                }
            }
        }
        Some(url.clone())
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Names the first value that is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.discovery_interval_secs == 0 {
            anyhow::bail!("discovery_interval_secs must be greater than 0");
        }

        if self.discovery_max_items == 0 {
            anyhow::bail!("discovery_max_items must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.token_capacity == 0 {
            anyhow::bail!("token_capacity must be greater than 0");
        }

        if self.token_ttl_secs == 0 {
            anyhow::bail!("token_ttl_secs must be greater than 0");
        }

        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                anyhow::bail!("provider name must not be empty");
            }
            if provider.domains.is_empty() {
                anyhow::bail!("provider {} must list at least one domain", provider.name);
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            worker_pool_size: default_worker_count(),
            job_timeout_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
            retry_max_wait_secs: default_retry_max_wait(),
            retry_max_total_wait_secs: 0,
            retry_jitter_factor: 0.0,
            discovery_interval_secs: default_discovery_interval(),
            discovery_max_items: default_discovery_max_items(),
            discovery_courtesy_delay_ms: default_courtesy_delay_ms(),
            discovery_seed_delay_secs: default_seed_delay(),
            gateway_url: default_gateway_url(),
            gateway_timeout_secs: default_gateway_timeout(),
            gateway_supports_batch: true,
            providers: Vec::new(),
            paused_providers: Vec::new(),
            token_capacity: default_token_capacity(),
            token_ttl_secs: default_token_ttl(),
            rust_log: default_log_level(),
        }
    }
}

fn default_provider_language() -> String {
    "en".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_count() -> usize {
    tankobon_delivery::DEFAULT_WORKER_COUNT
}

fn default_shutdown_timeout() -> u64 {
    tankobon_delivery::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS
}

fn default_retry_max_wait() -> u64 {
    tankobon_delivery::DEFAULT_MAX_RETRY_WAIT_SECONDS
}

fn default_discovery_interval() -> u64 {
    300
}

fn default_discovery_max_items() -> usize {
    20
}

fn default_courtesy_delay_ms() -> u64 {
    1000
}

fn default_seed_delay() -> u64 {
    10
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_gateway_timeout() -> u64 {
    tankobon_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_true() -> bool {
    true
}

fn default_token_capacity() -> usize {
    10_000
}

fn default_token_ttl() -> u64 {
    86_400
}

fn default_log_level() -> String {
    "info".to_string()
}

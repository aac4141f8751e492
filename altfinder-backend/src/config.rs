use std::collections::HashSet;
use std::env::var;
use std::path::PathBuf;
use std::time::Duration;

use altfinder_db::{StoreConfig, StoreOptions};
use dotenvy::dotenv;
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::sync::MessagingConfig;
use crate::validation::Lookup;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{variable} must be one of {expected}, got {value:?}")]
    UnknownMethod {
        variable: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{0} is required by the selected backend")]
    Missing(&'static str),

    #[error("invalid value for {variable}: {value:?}")]
    Invalid {
        variable: &'static str,
        value: String,
    },
}

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    /// Env: PORT (default: 3000)
    pub port: u16,

    /// Label recorded for logins that do not name a server
    /// Env: SERVER_NAME (default: "default")
    pub server_name: String,

    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 65536)
    pub request_body_limit: usize,

    /// Request timeout in seconds
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,

    /// Durable store
    /// Env: STORAGE_METHOD (sqlite | mysql, default: sqlite), DATABASE_PATH
    /// (default: "altfinder.db"), MYSQL_URL, MYSQL_POOL_SIZE (default: 4),
    /// MYSQL_CONNECT_TIMEOUT_SECS (default: 5)
    pub store: StoreConfig,

    /// Env: TABLE_PREFIX (default: "altfinder_"), QUEUE_TTL_SECS (default: 120)
    pub store_options: StoreOptions,

    /// Env: CACHE_METHOD (memory | redis | disabled, default: memory), REDIS_URL
    pub cache: CacheConfig,

    /// Env: MESSAGING_METHOD (redis | rabbitmq | disabled, default: disabled),
    /// REDIS_URL, RABBITMQ_URL
    pub messaging: MessagingConfig,

    /// How often the write-behind queue is replayed
    /// Env: RECONCILE_INTERVAL_SECS (default: 10)
    pub reconcile_interval: Duration,

    /// IPs and player UUIDs whose logins are acknowledged but not recorded
    /// Env: IGNORED (comma separated, default: empty)
    pub ignored: HashSet<Lookup>,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv(); //for debugging mostly
        Self::from_vars(|key| var(key).ok())
    }

    /// Build configuration from any variable source.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let redis_url = || get("REDIS_URL").ok_or(ConfigError::Missing("REDIS_URL"));

        let store = match method(&get, "STORAGE_METHOD", "sqlite").as_str() {
            "sqlite" => StoreConfig::Sqlite {
                path: PathBuf::from(env_or_default_string(&get, "DATABASE_PATH", "altfinder.db")),
            },
            "mysql" => StoreConfig::MySql {
                url: get("MYSQL_URL").ok_or(ConfigError::Missing("MYSQL_URL"))?,
                max_connections: env_or_default(&get, "MYSQL_POOL_SIZE", 4),
                connect_timeout: Duration::from_secs(env_or_default(
                    &get,
                    "MYSQL_CONNECT_TIMEOUT_SECS",
                    5,
                )),
            },
            other => {
                return Err(ConfigError::UnknownMethod {
                    variable: "STORAGE_METHOD",
                    value: other.to_string(),
                    expected: "sqlite, mysql",
                });
            }
        };

        let cache = match method(&get, "CACHE_METHOD", "memory").as_str() {
            "memory" => CacheConfig::Memory,
            "redis" => CacheConfig::Redis { url: redis_url()? },
            "disabled" => CacheConfig::Disabled,
            other => {
                return Err(ConfigError::UnknownMethod {
                    variable: "CACHE_METHOD",
                    value: other.to_string(),
                    expected: "memory, redis, disabled",
                });
            }
        };

        let messaging = match method(&get, "MESSAGING_METHOD", "disabled").as_str() {
            "redis" => MessagingConfig::Redis { url: redis_url()? },
            "rabbitmq" => MessagingConfig::RabbitMq {
                url: get("RABBITMQ_URL").ok_or(ConfigError::Missing("RABBITMQ_URL"))?,
            },
            "disabled" => MessagingConfig::Disabled,
            other => {
                return Err(ConfigError::UnknownMethod {
                    variable: "MESSAGING_METHOD",
                    value: other.to_string(),
                    expected: "redis, rabbitmq, disabled",
                });
            }
        };

        let reconcile_secs: u64 = env_or_default(&get, "RECONCILE_INTERVAL_SECS", 10);
        if reconcile_secs == 0 {
            return Err(ConfigError::Invalid {
                variable: "RECONCILE_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        let server_name = env_or_default_string(&get, "SERVER_NAME", &defaults.server_name);
        if crate::validation::validate_server(&server_name).is_err() {
            return Err(ConfigError::Invalid {
                variable: "SERVER_NAME",
                value: server_name,
            });
        }

        Ok(Self {
            port: env_or_default(&get, "PORT", defaults.port),
            server_name,
            request_body_limit: env_or_default(
                &get,
                "REQUEST_BODY_LIMIT",
                defaults.request_body_limit,
            ),
            request_timeout: Duration::from_secs(env_or_default(&get, "REQUEST_TIMEOUT_SECS", 30)),
            store,
            store_options: StoreOptions {
                table_prefix: env_or_default_string(
                    &get,
                    "TABLE_PREFIX",
                    &defaults.store_options.table_prefix,
                ),
                queue_ttl: Duration::from_secs(env_or_default(&get, "QUEUE_TTL_SECS", 120)),
            },
            cache,
            messaging,
            reconcile_interval: Duration::from_secs(reconcile_secs),
            ignored: parse_ignored(get("IGNORED").as_deref().unwrap_or_default())?,
        })
    }

    /// Create configuration with all default values
    pub fn default() -> Self {
        Self {
            port: 3000,
            server_name: "default".to_string(),
            request_body_limit: 64 * 1024, // 64 KB
            request_timeout: Duration::from_secs(30),
            store: StoreConfig::Sqlite {
                path: PathBuf::from("altfinder.db"),
            },
            store_options: StoreOptions::default(),
            cache: CacheConfig::Memory,
            messaging: MessagingConfig::Disabled,
            reconcile_interval: Duration::from_secs(10),
            ignored: HashSet::new(),
        }
    }
}

/// Lowercased backend selector
fn method(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    get(key)
        .map(|val| val.trim().to_ascii_lowercase())
        .unwrap_or_else(|| default.to_string())
}

fn parse_ignored(list: &str) -> Result<HashSet<Lookup>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            Lookup::parse(entry).map_err(|_| ConfigError::Invalid {
                variable: "IGNORED",
                value: entry.to_string(),
            })
        })
        .collect()
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    get(key)
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> String {
    get(key).unwrap_or_else(|| default.to_string())
}

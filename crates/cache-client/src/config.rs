//! Instance configuration.
//!
//! An `InstanceConfig` describes one logical store instance. It can be built
//! in code or loaded from environment variables. The credential is held in a
//! `SecretString` and is redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default port for data endpoints.
pub const DEFAULT_PORT: u16 = 6379;

/// Default port for sentinel endpoints.
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE_SECONDS: u64 = 180;

/// Default number of logical databases exposed by the store.
pub const DEFAULT_DATABASE_COUNT: u8 = 16;

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default response (sync) timeout in milliseconds.
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required option: {0}")]
    Missing(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// A store endpoint (host and port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port` or `[v6addr]:port`.
    ///
    /// `default_port` applies when no port is given.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidValue("empty endpoint".to_string()));
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                ConfigError::InvalidValue(format!("unterminated IPv6 endpoint: {raw}"))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, raw)?,
                None if tail.is_empty() => default_port,
                None => {
                    return Err(ConfigError::InvalidValue(format!(
                        "invalid endpoint: {raw}"
                    )))
                }
            };
            return Ok(Self::new(host, port));
        }

        match raw.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(ConfigError::InvalidValue(format!(
                        "endpoint has no host: {raw}"
                    )));
                }
                Ok(Self::new(host, parse_port(port, raw)?))
            }
            // Bare hostname, or an IPv6 address without brackets (no port)
            _ => Ok(Self::new(raw, default_port)),
        }
    }
}

fn parse_port(port: &str, raw: &str) -> Result<u16, ConfigError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidValue(format!(
            "invalid port in endpoint: {raw}"
        ))),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Wire protocol hint passed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolHint {
    #[default]
    Resp2,
    Resp3,
}

impl std::str::FromStr for ProtocolHint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resp2" | "2" => Ok(ProtocolHint::Resp2),
            "resp3" | "3" => Ok(ProtocolHint::Resp3),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// Configuration for one logical store instance.
#[derive(Clone)]
pub struct InstanceConfig {
    /// Unique instance name; also sent as the connection client name.
    pub instance_name: String,

    /// Endpoints in priority order (first is preferred). In sentinel mode
    /// these are the sentinel nodes.
    pub endpoints: Vec<Endpoint>,

    /// Store credential. Protected by `SecretString` to prevent accidental logging.
    pub password: Option<SecretString>,

    /// Keep-alive (heartbeat) interval (default: 180s).
    pub keep_alive: Duration,

    /// Whether admin commands (e.g. FLUSHDB) are permitted.
    pub allow_admin: bool,

    /// Database used by `Client::database()` (default: 0).
    pub default_database: u8,

    /// Number of logical databases; bounds `Client::database_at` (default: 16).
    pub database_count: u8,

    /// Resolve the master through sentinels before connecting.
    pub sentinel: bool,

    /// Sentinel master name; required when `sentinel` is set.
    pub master_name: Option<String>,

    /// Connect timeout (default: 5s).
    pub connect_timeout: Duration,

    /// Response timeout for individual commands (default: 5s).
    pub sync_timeout: Duration,

    /// Protocol hint (default: RESP2).
    pub protocol: ProtocolHint,
}

/// Custom Debug implementation that redacts the credential.
impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("instance_name", &self.instance_name)
            .field("endpoints", &self.endpoints)
            .field(
                "password",
                &self.password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("keep_alive", &self.keep_alive)
            .field("allow_admin", &self.allow_admin)
            .field("default_database", &self.default_database)
            .field("database_count", &self.database_count)
            .field("sentinel", &self.sentinel)
            .field("master_name", &self.master_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("sync_timeout", &self.sync_timeout)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl InstanceConfig {
    /// Create a config with defaults for everything but name and endpoints.
    #[must_use]
    pub fn new(instance_name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            instance_name: instance_name.into(),
            endpoints,
            password: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECONDS),
            allow_admin: false,
            default_database: 0,
            database_count: DEFAULT_DATABASE_COUNT,
            sentinel: false,
            master_name: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            sync_timeout: Duration::from_millis(DEFAULT_SYNC_TIMEOUT_MS),
            protocol: ProtocolHint::default(),
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    #[must_use]
    pub fn with_sentinel(mut self, master_name: impl Into<String>) -> Self {
        self.sentinel = true;
        self.master_name = Some(master_name.into());
        self
    }

    #[must_use]
    pub fn with_default_database(mut self, index: u8) -> Self {
        self.default_database = index;
        self
    }

    #[must_use]
    pub fn with_database_count(mut self, count: u8) -> Self {
        self.database_count = count;
        self
    }

    #[must_use]
    pub fn with_allow_admin(mut self, allow: bool) -> Self {
        self.allow_admin = allow;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, sync: Duration) -> Self {
        self.connect_timeout = connect;
        self.sync_timeout = sync;
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: ProtocolHint) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sentinel master name, if sentinel mode is configured.
    #[must_use]
    pub fn sentinel_master(&self) -> Option<&str> {
        if self.sentinel {
            self.master_name.as_deref()
        } else {
            None
        }
    }

    /// Check the invariants that must hold before any connection attempt.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_name.trim().is_empty() {
            return Err(ConfigError::Missing("instance name".to_string()));
        }

        if self.endpoints.is_empty() {
            return Err(ConfigError::Missing("endpoint list".to_string()));
        }

        if self.sentinel
            && self
                .master_name
                .as_deref()
                .map_or(true, |name| name.trim().is_empty())
        {
            return Err(ConfigError::Missing("sentinel master name".to_string()));
        }

        if self.database_count == 0 {
            return Err(ConfigError::InvalidValue(
                "database count must be at least 1".to_string(),
            ));
        }

        if self.default_database >= self.database_count {
            return Err(ConfigError::InvalidValue(format!(
                "default database {} is outside 0..{}",
                self.default_database, self.database_count
            )));
        }

        if self.keep_alive.is_zero() {
            return Err(ConfigError::InvalidValue(
                "keep-alive must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let instance_name = vars
            .get("CACHE_INSTANCE_NAME")
            .ok_or_else(|| ConfigError::MissingEnvVar("CACHE_INSTANCE_NAME".to_string()))?
            .clone();

        let sentinel = parse_var(vars, "CACHE_SENTINEL", parse_bool)?.unwrap_or(false);
        let default_port = if sentinel {
            DEFAULT_SENTINEL_PORT
        } else {
            DEFAULT_PORT
        };

        let endpoints = vars
            .get("CACHE_ENDPOINTS")
            .ok_or_else(|| ConfigError::MissingEnvVar("CACHE_ENDPOINTS".to_string()))?
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| Endpoint::parse(s, default_port))
            .collect::<Result<Vec<_>, _>>()?;

        let mut config = InstanceConfig::new(instance_name, endpoints);

        config.password = vars
            .get("CACHE_PASSWORD")
            .filter(|p| !p.is_empty())
            .map(|p| SecretString::from(p.clone()));

        if let Some(secs) = parse_var(vars, "CACHE_KEEP_ALIVE_SECONDS", parse_num::<u64>)? {
            config.keep_alive = Duration::from_secs(secs);
        }

        config.allow_admin = parse_var(vars, "CACHE_ALLOW_ADMIN", parse_bool)?.unwrap_or(false);

        if let Some(index) = parse_var(vars, "CACHE_DEFAULT_DATABASE", parse_num::<u8>)? {
            config.default_database = index;
        }

        if let Some(count) = parse_var(vars, "CACHE_DATABASE_COUNT", parse_num::<u8>)? {
            config.database_count = count;
        }

        config.sentinel = sentinel;
        config.master_name = vars
            .get("CACHE_SENTINEL_MASTER_NAME")
            .filter(|name| !name.is_empty())
            .cloned();

        if let Some(ms) = parse_var(vars, "CACHE_CONNECT_TIMEOUT_MS", parse_num::<u64>)? {
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var(vars, "CACHE_SYNC_TIMEOUT_MS", parse_num::<u64>)? {
            config.sync_timeout = Duration::from_millis(ms);
        }

        if let Some(protocol) = parse_var(vars, "CACHE_PROTOCOL", |s| s.parse::<ProtocolHint>())? {
            config.protocol = protocol;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(
    vars: &HashMap<String, String>,
    name: &str,
    parse: impl FnOnce(&str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    match vars.get(name) {
        Some(raw) if !raw.trim().is_empty() => parse(raw.trim())
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{name}: {e}"))),
        _ => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(format!("not a boolean: {other}"))),
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(format!("not a number: {raw}")))
}

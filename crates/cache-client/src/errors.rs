//! Cache client error types.
//!
//! Lock contention and ownership mismatch are not errors: `lock`, `unlock`
//! and `extend` report them as `Ok(false)`.

use crate::config::ConfigError;
use thiserror::Error;

/// Cache client error type.
///
/// - `Config`: invalid or incomplete `InstanceConfig`, raised before any I/O
/// - `Connection`: transport could not be established or was lost
/// - `Operation`: an individual store command failed (timeout, server error)
/// - `Closed`: the owning client was disposed
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A store command failed.
    #[error("Operation error: {0}")]
    Operation(String),

    /// Value encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Caller passed an argument the store would reject.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database index outside `0..count`.
    #[error("Database index {index} out of range (database count is {count})")]
    DatabaseOutOfRange { index: u8, count: u8 },

    /// Admin command attempted without `allow_admin`.
    #[error("Admin command not allowed: {0}")]
    AdminDisabled(String),

    /// The client owning this handle has been disposed.
    #[error("Client is closed")]
    Closed,
}

impl ClientError {
    /// Whether a caller-side retry could reasonably succeed.
    ///
    /// Nothing in this crate retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Operation(_))
    }

    /// Short bounded label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Config(_) => "config",
            ClientError::Connection(_) => "connection",
            ClientError::Operation(_) => "operation",
            ClientError::Codec(_) => "codec",
            ClientError::InvalidArgument(_) => "invalid_argument",
            ClientError::DatabaseOutOfRange { .. } => "database_out_of_range",
            ClientError::AdminDisabled(_) => "admin_disabled",
            ClientError::Closed => "closed",
        }
    }
}

impl From<redis::RedisError> for ClientError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            ClientError::Connection(err.to_string())
        } else {
            ClientError::Operation(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Codec(err.to_string())
    }
}

/// Result type alias using `ClientError`.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Connection("refused".to_string()).is_retryable());
        assert!(ClientError::Operation("timeout".to_string()).is_retryable());

        assert!(!ClientError::Closed.is_retryable());
        assert!(!ClientError::Codec("bad json".to_string()).is_retryable());
        assert!(!ClientError::Config(ConfigError::MissingEnvVar("X".to_string())).is_retryable());
        assert!(!ClientError::DatabaseOutOfRange { index: 20, count: 16 }.is_retryable());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", ClientError::Connection("refused".to_string())),
            "Connection error: refused"
        );
        assert_eq!(
            format!("{}", ClientError::DatabaseOutOfRange { index: 16, count: 16 }),
            "Database index 16 out of range (database count is 16)"
        );
        assert_eq!(format!("{}", ClientError::Closed), "Client is closed");
    }

    #[test]
    fn test_config_error_conversion() {
        let err: ClientError = ConfigError::Missing("instance name".to_string()).into();
        assert!(matches!(err, ClientError::Config(_)));
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_redis_error_mapping() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(ClientError::from(io), ClientError::Connection(_)));

        let server = redis::RedisError::from((redis::ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(matches!(ClientError::from(server), ClientError::Operation(_)));
    }

    #[test]
    fn test_json_error_maps_to_codec() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(matches!(ClientError::from(err), ClientError::Codec(_)));
    }
}

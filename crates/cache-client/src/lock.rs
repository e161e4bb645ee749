//! Token-owned distributed locks.
//!
//! A lock is a key whose value is the owner token and whose TTL bounds the
//! hold time. Locks are cooperative, non-reentrant and never renewed
//! automatically.
//!
//! # Operations
//!
//! - `lock`: `SET name token NX PX ttl`, true only when newly acquired
//! - `unlock`: compare-and-delete script, true only for the owning token
//! - `extend`: compare-and-PEXPIRE script, true only for the owning token
//!
//! Contention and ownership mismatch are `Ok(false)`. Nothing here blocks
//! or retries.
//!
//! # Tokens
//!
//! Tokens are always supplied by the caller. `LockToken::random()` gives
//! strict per-holder exclusivity; `LockToken::host()` shares one identity
//! across every holder on the machine, so any of them can release the lock.

use crate::database::validate_key;
use crate::errors::ClientError;
use crate::observability::{record_lock_attempt, timed};
use crate::registry::ConnectionLease;
use crate::types::Ttl;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Owner identity stored as a lock's value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Fresh UUID v4 token.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Machine-wide token taken from `HOSTNAME`.
    #[must_use]
    pub fn host() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self(host)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for LockToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Lock operations against one logical database.
#[derive(Clone)]
pub struct LockManager {
    lease: Arc<ConnectionLease>,
    index: u8,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("instance", &self.lease.instance_name())
            .field("index", &self.index)
            .finish()
    }
}

fn validate_token(token: &LockToken) -> Result<(), ClientError> {
    if token.as_str().is_empty() {
        return Err(ClientError::InvalidArgument(
            "lock token must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_ttl(ttl: Ttl) -> Result<u64, ClientError> {
    if ttl.is_zero() {
        return Err(ClientError::InvalidArgument(
            "lock ttl must be positive".to_string(),
        ));
    }
    Ok(ttl.as_millis())
}

impl LockManager {
    pub(crate) fn new(lease: Arc<ConnectionLease>, index: u8) -> Self {
        Self { lease, index }
    }

    /// Try to take `name` for `token` for `ttl`.
    ///
    /// Returns true only when the lock was newly acquired. A lock already
    /// held (by any token, including this one) returns false.
    #[instrument(skip_all, fields(db = self.index, lock = %name))]
    pub async fn lock(
        &self,
        name: &str,
        token: &LockToken,
        ttl: impl Into<Ttl>,
    ) -> Result<bool, ClientError> {
        self.lease.ensure_open()?;
        validate_key(name, "lock name")?;
        validate_token(token)?;
        let ttl_ms = validate_ttl(ttl.into())?;

        let result = timed(
            "lock",
            self.lease
                .transport()
                .set_if_absent(self.index, name, token.as_str(), ttl_ms),
        )
        .await;

        let outcome = match &result {
            Ok(true) => "acquired",
            Ok(false) => "contended",
            Err(_) => "error",
        };
        record_lock_attempt("lock", outcome);
        debug!(target: "cache.lock", outcome = outcome, ttl_ms = ttl_ms, "Lock attempt");

        result
    }

    /// Release `name` if `token` holds it.
    ///
    /// Returns false if the lock is absent or held by another token.
    #[instrument(skip_all, fields(db = self.index, lock = %name))]
    pub async fn unlock(&self, name: &str, token: &LockToken) -> Result<bool, ClientError> {
        self.lease.ensure_open()?;
        validate_key(name, "lock name")?;
        validate_token(token)?;

        let result = timed(
            "unlock",
            self.lease
                .transport()
                .delete_if_equals(self.index, name, token.as_str()),
        )
        .await;

        let outcome = match &result {
            Ok(true) => "released",
            Ok(false) => "not_owner",
            Err(_) => "error",
        };
        record_lock_attempt("unlock", outcome);
        debug!(target: "cache.lock", outcome = outcome, "Unlock attempt");

        result
    }

    /// Reset the TTL of `name` to `ttl` if `token` holds it.
    #[instrument(skip_all, fields(db = self.index, lock = %name))]
    pub async fn extend(
        &self,
        name: &str,
        token: &LockToken,
        ttl: impl Into<Ttl>,
    ) -> Result<bool, ClientError> {
        self.lease.ensure_open()?;
        validate_key(name, "lock name")?;
        validate_token(token)?;
        let ttl_ms = validate_ttl(ttl.into())?;

        let result = timed(
            "extend",
            self.lease.transport().expire_if_equals(
                self.index,
                name,
                token.as_str(),
                ttl_ms,
            ),
        )
        .await;

        let outcome = match &result {
            Ok(true) => "extended",
            Ok(false) => "not_owner",
            Err(_) => "error",
        };
        record_lock_attempt("extend", outcome);
        debug!(target: "cache.lock", outcome = outcome, ttl_ms = ttl_ms, "Extend attempt");

        result
    }

    /// Current holder of `name`, if any.
    #[instrument(skip_all, fields(db = self.index, lock = %name))]
    pub async fn owner(&self, name: &str) -> Result<Option<LockToken>, ClientError> {
        self.lease.ensure_open()?;
        validate_key(name, "lock name")?;

        let holder = timed("owner", self.lease.transport().get(self.index, name)).await?;
        Ok(holder.map(LockToken::from))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_random_tokens_are_distinct() {
        let a = LockToken::random();
        let b = LockToken::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_host_token_is_stable() {
        assert_eq!(LockToken::host(), LockToken::host());
        assert!(!LockToken::host().as_str().is_empty());
    }

    #[test]
    fn test_token_conversions() {
        assert_eq!(LockToken::from("worker-1"), LockToken::new("worker-1"));
        assert_eq!(LockToken::from("w".to_string()).to_string(), "w");
    }

    #[test]
    fn test_argument_checks() {
        assert!(validate_token(&LockToken::new("t")).is_ok());
        assert!(matches!(
            validate_token(&LockToken::new("")),
            Err(ClientError::InvalidArgument(_))
        ));

        assert_eq!(validate_ttl(Ttl::from(3_u64)).unwrap(), 3000);
        assert!(matches!(
            validate_ttl(Ttl::from(Duration::ZERO)),
            Err(ClientError::InvalidArgument(_))
        ));
    }
}

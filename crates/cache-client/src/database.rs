//! Key-value façade over one logical database.
//!
//! Every operation is exactly one store command. Values are strings on the
//! wire; typed values go through caller-supplied encode/decode closures, or
//! through the `serde_json` helpers built on top of them.
//!
//! Checks run in a fixed order before any I/O: closed handle, then key, then
//! expiry. Encode closures run only after those checks pass.

use crate::errors::ClientError;
use crate::lock::LockManager;
use crate::observability::timed;
use crate::registry::ConnectionLease;
use crate::types::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Handle to one logical database of one instance.
///
/// Cheap to clone; clones share the owning client's lease.
#[derive(Clone)]
pub struct Database {
    lease: Arc<ConnectionLease>,
    index: u8,
    allow_admin: bool,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("instance", &self.lease.instance_name())
            .field("index", &self.index)
            .finish()
    }
}

/// Reject keys the store would treat as malformed.
pub(crate) fn validate_key(key: &str, what: &str) -> Result<(), ClientError> {
    if key.is_empty() {
        return Err(ClientError::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Milliseconds for the expiry, rejecting zero TTLs.
fn expiry_millis(expiry: Expiry) -> Result<Option<u64>, ClientError> {
    match expiry.ttl() {
        Some(ttl) if ttl.is_zero() => Err(ClientError::InvalidArgument(
            "ttl must be positive".to_string(),
        )),
        Some(ttl) => Ok(Some(ttl.as_millis())),
        None => Ok(None),
    }
}

/// Decode a stored JSON value. Absent and blank values decode to `None`.
fn decode_json<T: DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, ClientError> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
        _ => Ok(None),
    }
}

impl Database {
    pub(crate) fn new(lease: Arc<ConnectionLease>, index: u8, allow_admin: bool) -> Self {
        Self {
            lease,
            index,
            allow_admin,
        }
    }

    /// Logical database index this handle is bound to.
    #[must_use]
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Lock manager bound to this database.
    #[must_use]
    pub fn locks(&self) -> LockManager {
        LockManager::new(Arc::clone(&self.lease), self.index)
    }

    /// Store `value` under `key`.
    ///
    /// Returns whether the store accepted the write.
    ///
    /// # Errors
    ///
    /// - `ClientError::Closed` if the owning client was disposed
    /// - `ClientError::InvalidArgument` for an empty key or a zero TTL
    /// - `ClientError::Connection` / `ClientError::Operation` from the store
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<String>,
        expiry: impl Into<Expiry>,
    ) -> Result<bool, ClientError> {
        let value = value.into();
        self.set_encoded(key, move || Ok(value), expiry.into()).await
    }

    /// Store the value produced by `encode` under `key`.
    ///
    /// `encode` runs at most once, and only after the handle and arguments
    /// have been checked.
    pub async fn set_with<F>(
        &self,
        key: &str,
        encode: F,
        expiry: impl Into<Expiry>,
    ) -> Result<bool, ClientError>
    where
        F: FnOnce() -> String,
    {
        self.set_encoded(key, move || Ok(encode()), expiry.into())
            .await
    }

    /// Store `value` serialized as JSON.
    pub async fn set_json<T>(
        &self,
        key: &str,
        value: &T,
        expiry: impl Into<Expiry>,
    ) -> Result<bool, ClientError>
    where
        T: Serialize + ?Sized,
    {
        self.set_encoded(
            key,
            || serde_json::to_string(value).map_err(ClientError::from),
            expiry.into(),
        )
        .await
    }

    #[instrument(skip_all, fields(db = self.index))]
    async fn set_encoded<F>(&self, key: &str, encode: F, expiry: Expiry) -> Result<bool, ClientError>
    where
        F: FnOnce() -> Result<String, ClientError>,
    {
        self.lease.ensure_open()?;
        validate_key(key, "key")?;
        let ttl_ms = expiry_millis(expiry)?;

        let value = encode()?;
        timed(
            "set",
            self.lease
                .transport()
                .set(self.index, key, value, ttl_ms),
        )
        .await
    }

    /// Fetch the raw value stored under `key`.
    #[instrument(skip_all, fields(db = self.index))]
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        self.lease.ensure_open()?;
        validate_key(key, "key")?;

        timed("get", self.lease.transport().get(self.index, key)).await
    }

    /// Fetch the value under `key` and hand it to `decode`.
    ///
    /// `decode` sees `None` for an absent key and decides what that means.
    pub async fn get_with<T, F>(&self, key: &str, decode: F) -> Result<T, ClientError>
    where
        F: FnOnce(Option<String>) -> T,
    {
        let raw = self.get(key).await?;
        Ok(decode(raw))
    }

    /// Fetch and deserialize a JSON value.
    ///
    /// Absent and blank values yield `None`.
    ///
    /// # Errors
    ///
    /// `ClientError::Codec` if the stored value is not valid JSON for `T`.
    pub async fn get_json<T>(&self, key: &str) -> Result<Option<T>, ClientError>
    where
        T: DeserializeOwned,
    {
        self.get_with(key, decode_json::<T>).await?
    }

    /// Remove `key`. Returns whether a key was removed.
    #[instrument(skip_all, fields(db = self.index))]
    pub async fn delete(&self, key: &str) -> Result<bool, ClientError> {
        self.lease.ensure_open()?;
        validate_key(key, "key")?;

        timed("del", self.lease.transport().delete(self.index, key)).await
    }

    #[instrument(skip_all, fields(db = self.index))]
    pub async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        self.lease.ensure_open()?;
        validate_key(key, "key")?;

        timed("exists", self.lease.transport().exists(self.index, key)).await
    }

    /// Set or clear the TTL of `key`.
    ///
    /// `Expiry::Persist` removes an existing TTL. Returns whether the key's
    /// TTL changed (false for an absent key).
    #[instrument(skip_all, fields(db = self.index))]
    pub async fn set_expire(
        &self,
        key: &str,
        expiry: impl Into<Expiry>,
    ) -> Result<bool, ClientError> {
        self.lease.ensure_open()?;
        validate_key(key, "key")?;
        let ttl_ms = expiry_millis(expiry.into())?;

        timed(
            "pexpire",
            self.lease
                .transport()
                .expire(self.index, key, ttl_ms),
        )
        .await
    }

    /// Remove every key in this database.
    ///
    /// # Errors
    ///
    /// `ClientError::AdminDisabled` unless the client was configured with
    /// `allow_admin`.
    #[instrument(skip_all, fields(db = self.index))]
    pub async fn flush(&self) -> Result<(), ClientError> {
        self.lease.ensure_open()?;
        if !self.allow_admin {
            return Err(ClientError::AdminDisabled(
                "FLUSHDB requires allow_admin".to_string(),
            ));
        }

        timed("flushdb", self.lease.transport().flush(self.index)).await?;
        debug!(
            target: "cache.client",
            instance = %self.lease.instance_name(),
            db = self.index,
            "Database flushed"
        );
        Ok(())
    }
}

//! Value types shared by the key-value façade and the lock manager.

use std::fmt;
use std::time::Duration;

/// A time-to-live.
///
/// Built from a `Duration` or from a count of whole seconds; both forms are
/// equivalent (`Ttl::from(60)` == `Ttl::from(Duration::from_secs(60))`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ttl(Duration);

impl Ttl {
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Ttl(Duration::from_secs(secs))
    }

    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        self.0
    }

    /// Milliseconds for PX / PEXPIRE.
    ///
    /// Sub-millisecond remainders round up so a non-zero TTL never becomes 0.
    #[must_use]
    pub fn as_millis(&self) -> u64 {
        let millis = u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX);
        if self.0.subsec_nanos() % 1_000_000 != 0 {
            millis.saturating_add(1)
        } else {
            millis
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Ttl(duration)
    }
}

impl From<u64> for Ttl {
    fn from(secs: u64) -> Self {
        Ttl::from_secs(secs)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

/// Expiry applied by `set` and `set_expire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// No TTL. For `set_expire` this removes an existing TTL.
    #[default]
    Persist,
    /// Expire after the given TTL.
    After(Ttl),
}

impl Expiry {
    #[must_use]
    pub fn ttl(&self) -> Option<Ttl> {
        match self {
            Expiry::Persist => None,
            Expiry::After(ttl) => Some(*ttl),
        }
    }
}

impl From<Ttl> for Expiry {
    fn from(ttl: Ttl) -> Self {
        Expiry::After(ttl)
    }
}

impl From<Duration> for Expiry {
    fn from(duration: Duration) -> Self {
        Expiry::After(Ttl::from(duration))
    }
}

impl From<u64> for Expiry {
    fn from(secs: u64) -> Self {
        Expiry::After(Ttl::from_secs(secs))
    }
}

impl From<Option<Duration>> for Expiry {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Expiry::Persist, Expiry::from)
    }
}

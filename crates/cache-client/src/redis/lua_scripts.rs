//! Lua scripts for owner-checked lock operations.
//!
//! Each script compares the stored owner token with the caller's token and
//! acts only on a match, in one atomic server-side step.
//!
//! # Properties
//!
//! - Only the owning token can release or extend a lock
//! - Absent keys are reported as "not owned", never as errors

/// Lua script for releasing a lock.
///
/// Arguments:
/// - KEYS[1]: Lock name
/// - ARGV[1]: Caller's owner token
///
/// Returns:
/// - 1: Released (token matched, key deleted)
/// - 0: Not released (absent, or held by another token)
pub const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lua script for extending a held lock.
///
/// Arguments:
/// - KEYS[1]: Lock name
/// - ARGV[1]: Caller's owner token
/// - ARGV[2]: New TTL in milliseconds
///
/// Returns:
/// - 1: Extended (token matched, TTL reset)
/// - 0: Not extended (absent, or held by another token)
pub const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

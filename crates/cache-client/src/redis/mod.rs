//! Redis-backed transport.
//!
//! This module provides:
//! - `RedisConnector` - opens transports and sentinel links with redis-rs
//! - `RedisTransport` - multiplexed per-database connections plus keep-alive
//! - `RedisSubscriberLink` - subscriber connection driven by a background task
//! - `RedisSentinelLink` - master discovery via `SENTINEL get-master-addr-by-name`
//! - Lua scripts for owner-checked lock release and extension

pub mod client;
pub mod lua_scripts;
pub mod pubsub;
pub mod sentinel;

pub use client::{RedisConnector, RedisTransport};
pub use pubsub::RedisSubscriberLink;
pub use sentinel::RedisSentinelLink;

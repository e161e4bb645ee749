//! Key-value façade integration tests.
//!
//! Uses tokio's paused clock so TTL expiry in the mock store is exact.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use cache_client::errors::ClientError;
use cache_client::types::{Expiry, Ttl};
use cache_client::{Client, Database};
use cache_test_utils::{test_config, TestHarness};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Session {
    user: String,
    visits: u32,
}

async fn connect(harness: &TestHarness) -> Client {
    Client::connect_with(
        test_config("sessions", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await
    .unwrap()
}

async fn database(harness: &TestHarness) -> Database {
    connect(harness).await.database().unwrap()
}

#[tokio::test]
async fn test_set_get_exists_delete() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;

    assert!(db.set("greeting", "hello", Expiry::Persist).await?);
    assert_eq!(db.get("greeting").await?.as_deref(), Some("hello"));
    assert!(db.exists("greeting").await?);

    assert!(db.delete("greeting").await?);
    assert!(!db.delete("greeting").await?);
    assert!(!db.exists("greeting").await?);
    assert_eq!(db.get("greeting").await?, None);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_value_expires_after_ttl() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;

    db.set("token", "abc", 10_u64).await?;

    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(db.get("token").await?.as_deref(), Some("abc"));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(db.get("token").await?, None);
    assert!(!db.exists("token").await?);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_seconds_and_duration_expiry_are_equivalent() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;

    db.set("a", "1", 30_u64).await?;
    db.set("b", "1", Duration::from_secs(30)).await?;
    db.set("c", "1", Ttl::from_secs(30)).await?;

    let ttl_a = harness.store.ttl(0, "a");
    assert_eq!(ttl_a, Some(Duration::from_secs(30)));
    assert_eq!(harness.store.ttl(0, "b"), ttl_a);
    assert_eq!(harness.store.ttl(0, "c"), ttl_a);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_set_expire_and_persist() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;

    db.set("k", "v", Expiry::Persist).await?;
    assert!(db.set_expire("k", 5_u64).await?);
    assert_eq!(harness.store.ttl(0, "k"), Some(Duration::from_secs(5)));

    assert!(db.set_expire("k", Expiry::Persist).await?);
    assert_eq!(harness.store.ttl(0, "k"), None);

    // Persisted key survives past the old deadline
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(db.get("k").await?.as_deref(), Some("v"));

    assert!(!db.set_expire("missing", 5_u64).await?);

    Ok(())
}

#[tokio::test]
async fn test_set_with_invokes_encoder_once() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;
    let calls = AtomicUsize::new(0);

    db.set_with(
        "encoded",
        || {
            calls.fetch_add(1, Ordering::SeqCst);
            "payload".to_string()
        },
        Expiry::Persist,
    )
    .await?;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.store.value(0, "encoded").as_deref(), Some("payload"));

    Ok(())
}

#[tokio::test]
async fn test_get_with_passes_absence_to_decoder() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;

    let missing = db
        .get_with("missing", |raw| raw.map_or(-1, |v| v.len() as i64))
        .await?;
    assert_eq!(missing, -1);

    db.set("present", "four", Expiry::Persist).await?;
    let present = db
        .get_with("present", |raw| raw.map_or(-1, |v| v.len() as i64))
        .await?;
    assert_eq!(present, 4);

    Ok(())
}

#[tokio::test]
async fn test_json_helpers() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;

    let session = Session {
        user: "ada".to_string(),
        visits: 3,
    };
    db.set_json("session", &session, Expiry::Persist).await?;
    assert_eq!(db.get_json::<Session>("session").await?, Some(session));

    assert_eq!(db.get_json::<Session>("missing").await?, None);

    db.set("blank", "  ", Expiry::Persist).await?;
    assert_eq!(db.get_json::<Session>("blank").await?, None);

    db.set("garbage", "{oops", Expiry::Persist).await?;
    assert!(matches!(
        db.get_json::<Session>("garbage").await,
        Err(ClientError::Codec(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_invalid_arguments_rejected_without_io() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;
    let before = harness.store.command_count();
    let encoded = AtomicUsize::new(0);

    assert!(matches!(
        db.get("").await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        db.set("k", "v", Duration::ZERO).await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        db.set_with(
            "",
            || {
                encoded.fetch_add(1, Ordering::SeqCst);
                String::new()
            },
            Expiry::Persist
        )
        .await,
        Err(ClientError::InvalidArgument(_))
    ));

    assert_eq!(encoded.load(Ordering::SeqCst), 0);
    assert_eq!(harness.store.command_count(), before);

    Ok(())
}

#[tokio::test]
async fn test_store_errors_propagate() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;

    harness.store.set_unavailable(true);
    let err = db.get("k").await.unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)));
    assert!(err.is_retryable());

    harness.store.set_unavailable(false);
    assert_eq!(db.get("k").await?, None);

    Ok(())
}

#[tokio::test]
async fn test_databases_are_isolated() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;

    let default = client.database()?;
    let other = client.database_at(3)?;
    assert_eq!(default.index(), 0);
    assert_eq!(other.index(), 3);

    other.set("k", "in-three", Expiry::Persist).await?;
    assert_eq!(default.get("k").await?, None);
    assert_eq!(harness.store.value(3, "k").as_deref(), Some("in-three"));

    Ok(())
}

#[tokio::test]
async fn test_flush_requires_allow_admin() -> Result<()> {
    let harness = TestHarness::new();
    let db = database(&harness).await;
    db.set("k", "v", Expiry::Persist).await?;
    let before = harness.store.command_count();

    assert!(matches!(
        db.flush().await,
        Err(ClientError::AdminDisabled(_))
    ));
    assert_eq!(harness.store.command_count(), before);
    assert!(db.exists("k").await?);

    let admin_harness = TestHarness::new();
    let admin = Client::connect_with(
        test_config("admin", &["primary"]).with_allow_admin(true),
        Arc::clone(&admin_harness.registry),
    )
    .await?
    .database()?;
    admin.set("k", "v", Expiry::Persist).await?;
    admin.flush().await?;
    assert!(!admin.exists("k").await?);

    Ok(())
}

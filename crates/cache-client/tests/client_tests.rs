//! Client facade lifecycle tests.
//!
//! Covers connect, database selection bounds and disposal.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use cache_client::errors::ClientError;
use cache_client::lock::LockToken;
use cache_client::types::Expiry;
use cache_client::Client;
use cache_test_utils::{endpoint, test_config, TestHarness};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cache=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_connect_exposes_instance_and_default_database() -> Result<()> {
    let harness = TestHarness::new();
    let client = Client::connect_with(
        test_config("orders", &["primary"]).with_default_database(2),
        Arc::clone(&harness.registry),
    )
    .await?;

    assert_eq!(client.instance_name(), "orders");
    assert_eq!(client.database()?.index(), 2);
    assert!(!client.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_yields_no_client_and_no_io() {
    let harness = TestHarness::new();

    let result = Client::connect_with(
        test_config("orders", &["primary"])
            .with_database_count(4)
            .with_default_database(4),
        Arc::clone(&harness.registry),
    )
    .await;

    assert!(matches!(result, Err(ClientError::Config(_))));
    assert!(harness.connector.attempts().is_empty());
}

#[tokio::test]
async fn test_unreachable_instance_is_connection_error() {
    let harness = TestHarness::with_connector(|c| c.with_failing_endpoint(endpoint("primary")));

    let result = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await;

    assert!(matches!(result, Err(ClientError::Connection(_))));
    assert!(harness.registry.is_empty().await);
}

#[tokio::test]
async fn test_database_at_bounds() -> Result<()> {
    let harness = TestHarness::new();
    let client = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;

    assert_eq!(client.database_at(0)?.index(), 0);
    assert_eq!(client.database_at(15)?.index(), 15);
    assert!(matches!(
        client.database_at(16),
        Err(ClientError::DatabaseOutOfRange {
            index: 16,
            count: 16
        })
    ));

    let small = Client::connect_with(
        test_config("small", &["primary"]).with_database_count(2),
        Arc::clone(&harness.registry),
    )
    .await?;
    assert!(small.database_at(1).is_ok());
    assert!(matches!(
        small.database_at(2),
        Err(ClientError::DatabaseOutOfRange { index: 2, count: 2 })
    ));
    Ok(())
}

#[tokio::test]
async fn test_clients_for_same_instance_share_connection() -> Result<()> {
    let harness = TestHarness::new();

    let a = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;
    let b = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;

    a.database()?.set("shared", "yes", Expiry::Persist).await?;
    assert_eq!(b.database()?.get("shared").await?.as_deref(), Some("yes"));
    assert_eq!(harness.connector.connect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_closes_once() -> Result<()> {
    init_logging();
    let harness = TestHarness::new();
    let client = Arc::new(
        Client::connect_with(
            test_config("orders", &["primary"]),
            Arc::clone(&harness.registry),
        )
        .await?,
    );

    tokio::join!(client.dispose(), client.dispose());
    client.dispose().await;

    assert!(client.is_closed());
    assert!(harness.registry.is_empty().await);
    let transports = harness.connector.transports();
    assert_eq!(transports.len(), 1);
    assert_eq!(transports.first().unwrap().close_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_handles_fail_closed_after_dispose() -> Result<()> {
    let harness = TestHarness::new();
    let client = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;

    let db = client.database()?;
    let locks = client.locks()?;
    let pubsub = client.pubsub()?;
    client.dispose().await;
    let before = harness.store.command_count();

    let encoded = AtomicBool::new(false);
    let result = db
        .set_with(
            "k",
            || {
                encoded.store(true, Ordering::SeqCst);
                "v".to_string()
            },
            Expiry::Persist,
        )
        .await;
    assert!(matches!(result, Err(ClientError::Closed)));
    assert!(!encoded.load(Ordering::SeqCst));

    assert!(matches!(db.get("k").await, Err(ClientError::Closed)));
    assert!(matches!(
        locks.lock("job", &LockToken::new("t"), 30_u64).await,
        Err(ClientError::Closed)
    ));
    assert!(matches!(
        pubsub.publish("news", "x").await,
        Err(ClientError::Closed)
    ));
    assert_eq!(harness.store.command_count(), before);

    assert!(matches!(client.database(), Err(ClientError::Closed)));
    assert!(matches!(client.database_at(1), Err(ClientError::Closed)));
    assert!(matches!(client.pubsub(), Err(ClientError::Closed)));
    assert!(matches!(client.locks(), Err(ClientError::Closed)));
    Ok(())
}

#[tokio::test]
async fn test_reconnect_after_dispose_creates_new_connection() -> Result<()> {
    let harness = TestHarness::new();

    let first = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;
    first.dispose().await;

    let second = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;

    assert!(!second.is_closed());
    assert_eq!(harness.connector.connect_count(), 2);
    second.database()?.set("k", "v", Expiry::Persist).await?;
    Ok(())
}

#[tokio::test]
async fn test_shared_connection_keeps_per_client_settings() -> Result<()> {
    let harness = TestHarness::new();
    let a = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;
    let b = Client::connect_with(
        test_config("orders", &["primary"])
            .with_default_database(3)
            .with_database_count(4)
            .with_allow_admin(true),
        Arc::clone(&harness.registry),
    )
    .await?;
    assert_eq!(harness.connector.connect_count(), 1);

    assert_eq!(a.database()?.index(), 0);
    assert_eq!(b.database()?.index(), 3);
    assert!(a.database_at(10).is_ok());
    assert!(matches!(
        b.database_at(10),
        Err(ClientError::DatabaseOutOfRange { index: 10, count: 4 })
    ));

    b.database()?.set("k", "in-three", Expiry::Persist).await?;
    assert_eq!(harness.store.value(3, "k").as_deref(), Some("in-three"));
    assert_eq!(harness.store.value(0, "k"), None);

    assert!(matches!(
        a.database()?.flush().await,
        Err(ClientError::AdminDisabled(_))
    ));
    b.database()?.flush().await?;
    assert_eq!(harness.store.value(3, "k"), None);
    Ok(())
}

#[tokio::test]
async fn test_shared_connection_closes_after_last_dispose() -> Result<()> {
    let harness = TestHarness::new();
    let a = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;
    let b = Client::connect_with(
        test_config("orders", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await?;
    let a_db = a.database()?;
    let a_pubsub = a.pubsub()?;

    a.dispose().await;
    a.dispose().await;

    assert!(a.is_closed());
    assert!(matches!(a_db.get("k").await, Err(ClientError::Closed)));
    assert!(matches!(
        a_pubsub.publish("news", "x").await,
        Err(ClientError::Closed)
    ));

    assert!(!b.is_closed());
    b.database()?.set("k", "v", Expiry::Persist).await?;
    assert_eq!(b.database()?.get("k").await?.as_deref(), Some("v"));
    assert_eq!(b.pubsub()?.publish("news", "x").await?, 0);

    let transport = harness.connector.transports().first().cloned().unwrap();
    assert_eq!(transport.close_calls(), 0);
    assert_eq!(harness.registry.len().await, 1);

    b.dispose().await;

    assert!(b.is_closed());
    assert_eq!(transport.close_calls(), 1);
    assert!(harness.registry.is_empty().await);
    Ok(())
}

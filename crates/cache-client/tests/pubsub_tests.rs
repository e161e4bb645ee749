//! Pub/sub dispatcher integration tests.
//!
//! Callbacks forward into an unbounded channel so tests can await
//! deliveries with a timeout.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use cache_client::errors::ClientError;
use cache_client::pubsub::Dispatcher;
use cache_client::Client;
use cache_test_utils::{test_config, TestHarness};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Received = mpsc::UnboundedReceiver<(String, String)>;

async fn connect(harness: &TestHarness) -> Client {
    Client::connect_with(
        test_config("events", &["primary"]),
        Arc::clone(&harness.registry),
    )
    .await
    .unwrap()
}

/// Subscribe with a callback that forwards every delivery.
async fn subscribe_forwarding(dispatcher: &Dispatcher, channel: &str) -> Result<Received> {
    let (tx, rx) = mpsc::unbounded_channel();
    dispatcher
        .subscribe(channel, move |channel: &str, message: &str| {
            let _ = tx.send((channel.to_string(), message.to_string()));
        })
        .await?;
    Ok(rx)
}

async fn next(rx: &mut Received) -> Option<(String, String)> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn nothing_arrives(rx: &mut Received) -> bool {
    tokio::time::timeout(Duration::from_millis(50), rx.recv())
        .await
        .is_err()
}

#[tokio::test]
async fn test_subscribe_then_publish_delivers() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;

    let mut rx = subscribe_forwarding(&pubsub, "news").await?;
    let receivers = pubsub.publish("news", "hello").await?;

    assert_eq!(receivers, 1);
    assert_eq!(
        next(&mut rx).await,
        Some(("news".to_string(), "hello".to_string()))
    );
    Ok(())
}

#[tokio::test]
async fn test_duplicate_subscribe_fans_out_over_one_store_subscription() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;

    let mut first = subscribe_forwarding(&pubsub, "news").await?;
    let mut second = subscribe_forwarding(&pubsub, "news").await?;

    assert_eq!(harness.store.subscribe_calls("news"), 1);
    assert_eq!(pubsub.publish("news", "both").await?, 1);

    assert_eq!(next(&mut first).await.unwrap().1, "both");
    assert_eq!(next(&mut second).await.unwrap().1, "both");
    Ok(())
}

#[tokio::test]
async fn test_per_channel_order_is_preserved() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;
    let mut rx = subscribe_forwarding(&pubsub, "ticks").await?;

    for i in 0..50 {
        pubsub.publish("ticks", &i.to_string()).await?;
    }

    for i in 0..50 {
        assert_eq!(next(&mut rx).await.unwrap().1, i.to_string());
    }
    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = pubsub
        .subscribe("news", move |_channel: &str, message: &str| {
            let _ = tx.send(("news".to_string(), message.to_string()));
        })
        .await?;
    assert!(subscription.is_active());
    assert_eq!(subscription.channel(), "news");

    assert!(pubsub.unsubscribe("news").await?);
    assert!(!subscription.is_active());
    assert!(!pubsub.unsubscribe("news").await?);
    assert!(pubsub.channels().await.is_empty());
    assert_eq!(harness.store.subscriber_count("news"), 0);

    assert_eq!(pubsub.publish("news", "late").await?, 0);
    assert!(nothing_arrives(&mut rx).await);
    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_all_clears_every_channel() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;

    let mut a = subscribe_forwarding(&pubsub, "a").await?;
    let mut b = subscribe_forwarding(&pubsub, "b").await?;
    assert_eq!(pubsub.channels().await, vec!["a".to_string(), "b".to_string()]);

    pubsub.unsubscribe_all().await?;

    assert!(pubsub.channels().await.is_empty());
    pubsub.publish("a", "x").await?;
    pubsub.publish("b", "y").await?;
    assert!(nothing_arrives(&mut a).await);
    assert!(nothing_arrives(&mut b).await);
    Ok(())
}

#[tokio::test]
async fn test_dead_link_is_replaced_and_channels_restored() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;
    let mut rx = subscribe_forwarding(&pubsub, "news").await?;

    let before = pubsub.publisher().await?;
    harness.store.kill_subscriber_links();
    assert!(!before.is_alive());
    assert_eq!(pubsub.publish("news", "lost").await?, 0);

    let after = pubsub.publisher().await?;
    assert!(after.is_alive());
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(harness.store.links_opened(), 2);
    assert_eq!(harness.store.subscribe_calls("news"), 2);

    assert_eq!(pubsub.publish("news", "back").await?, 1);
    assert_eq!(next(&mut rx).await.unwrap().1, "back");
    Ok(())
}

#[tokio::test]
async fn test_publish_variants() -> Result<()> {
    #[derive(Serialize)]
    struct Event {
        kind: &'static str,
        id: u32,
    }

    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;
    let mut rx = subscribe_forwarding(&pubsub, "events").await?;

    pubsub.publish_with("events", || "encoded".to_string()).await?;
    pubsub
        .publish_json("events", &Event { kind: "created", id: 7 })
        .await?;

    assert_eq!(next(&mut rx).await.unwrap().1, "encoded");
    assert_eq!(
        next(&mut rx).await.unwrap().1,
        r#"{"kind":"created","id":7}"#
    );
    Ok(())
}

#[tokio::test]
async fn test_publish_without_subscribers_reports_zero() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;

    assert_eq!(client.pubsub()?.publish("nobody", "hi").await?, 0);
    // Publishing alone never opens a subscriber connection
    assert_eq!(harness.store.links_opened(), 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_channel_rejected() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;

    assert!(matches!(
        pubsub.publish("", "x").await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        pubsub.subscribe("", |_: &str, _: &str| {}).await,
        Err(ClientError::InvalidArgument(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_closed_dispatcher_rejects_operations() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;
    let mut rx = subscribe_forwarding(&pubsub, "news").await?;

    pubsub.close().await;
    pubsub.close().await;

    assert!(pubsub.is_closed());
    assert!(matches!(
        pubsub.publish("news", "x").await,
        Err(ClientError::Closed)
    ));
    assert!(matches!(
        pubsub.subscribe("news", |_: &str, _: &str| {}).await,
        Err(ClientError::Closed)
    ));

    harness.store.publish("news", "after close");
    assert!(nothing_arrives(&mut rx).await);
    Ok(())
}

#[tokio::test]
#[allow(clippy::panic)]
async fn test_panicking_callback_keeps_channel_delivering() -> Result<()> {
    let harness = TestHarness::new();
    let client = connect(&harness).await;
    let pubsub = client.pubsub()?;

    let faulty = pubsub
        .subscribe("news", |_channel: &str, message: &str| {
            panic!("cannot handle {message}");
        })
        .await?;
    pubsub.publish("news", "first").await?;

    let mut rx = subscribe_forwarding(&pubsub, "news").await?;
    assert_eq!(harness.store.subscribe_calls("news"), 1);
    pubsub.publish("news", "second").await?;

    assert_eq!(next(&mut rx).await.unwrap().1, "second");
    assert!(faulty.is_active());

    pubsub.publish("news", "third").await?;
    assert_eq!(next(&mut rx).await.unwrap().1, "third");
    Ok(())
}

#[tokio::test]
async fn test_two_clients_on_one_channel_each_receive_once() -> Result<()> {
    let harness = TestHarness::new();
    let first = connect(&harness).await;
    let second = connect(&harness).await;

    let mut a = subscribe_forwarding(&*first.pubsub()?, "news").await?;
    let mut b = subscribe_forwarding(&*second.pubsub()?, "news").await?;

    // One store subscription per dispatcher, each on its own link
    assert_eq!(harness.store.subscribe_calls("news"), 2);
    assert_eq!(harness.store.subscriber_count("news"), 2);
    assert_eq!(first.pubsub()?.publish("news", "hello").await?, 2);

    assert_eq!(next(&mut a).await.unwrap().1, "hello");
    assert_eq!(next(&mut b).await.unwrap().1, "hello");
    assert!(nothing_arrives(&mut a).await);
    assert!(nothing_arrives(&mut b).await);

    // Leaving on one client does not affect the other
    first.pubsub()?.unsubscribe("news").await?;
    assert_eq!(second.pubsub()?.publish("news", "again").await?, 1);
    assert_eq!(next(&mut b).await.unwrap().1, "again");
    assert!(nothing_arrives(&mut a).await);
    Ok(())
}

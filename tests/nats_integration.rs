//! NATS integration tests
//!
//! These tests require a running NATS server:
//!   nats-server
//!
//! Tests are skipped automatically if NATS is not available.

use agent_bus::{
    AgentInbox, BusConfig, Channel, HistoryQuery, InboxOptions, Message, MessageBus,
    MessageDraft, NatsTransport, NatsTransportConfig, SendOptions, SubscribeOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Try to connect to NATS. Returns None if server is unavailable.
async fn try_nats_transport() -> Option<NatsTransport> {
    let config = NatsTransportConfig {
        connect_timeout_secs: 1,
        ..Default::default()
    };

    match NatsTransport::connect(config).await {
        Ok(transport) => Some(transport),
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

/// Topic prefix unique to one test run
fn isolated_config(suffix: &str) -> BusConfig {
    BusConfig {
        topic_prefix: format!("test.{}.{}.", suffix, uuid::Uuid::new_v4().simple()),
        ..Default::default()
    }
}

/// Helper to create a MessageBus over NATS, or skip the test
macro_rules! nats_bus {
    ($config:expr) => {
        match try_nats_transport().await {
            Some(t) => MessageBus::connect(t, $config.clone()).await.unwrap(),
            None => return,
        }
    };
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for NATS delivery")
        .unwrap()
}

#[tokio::test]
async fn test_nats_send_and_history() {
    let config = isolated_config("send");
    let bus = nats_bus!(config);

    assert!(bus.is_connected());
    assert_eq!(bus.transport_name(), "nats");

    assert!(
        bus.send_message(MessageDraft::new("research-agent", "hello").priority(3))
            .await
    );

    let latest = bus.get_message_history(&HistoryQuery::channel(Channel::Broadcast).limit(1));
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].content, "hello");

    assert!(bus.health().await.unwrap());
    bus.cleanup().await;
}

#[tokio::test]
async fn test_nats_echo_reaches_local_listener_once() {
    let config = isolated_config("echo");
    let bus = nats_bus!(config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = bus
        .subscribe_to_messages(SubscribeOptions::recipient("writer"), move |m| {
            let _ = tx.send(m.clone());
        })
        .await;

    let sent = bus
        .publish(MessageDraft::new("research", "draft ready").to("writer").channel(Channel::Direct))
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await.id, sent.id);
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "message delivered more than once");

    assert_eq!(bus.get_message_history(&HistoryQuery::default()).len(), 1);
    bus.cleanup().await;
}

#[tokio::test]
async fn test_nats_two_connections() {
    let config = isolated_config("tabs");
    let tab_a = nats_bus!(config);
    let tab_b = nats_bus!(config);

    let writer = AgentInbox::attach(&tab_b, InboxOptions::new("writer", "Writer")).await;
    let mut changes = writer.changes();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = tab_b
        .subscribe_to_messages(SubscribeOptions::channel(Channel::Direct), move |m| {
            let _ = tx.send(m.clone());
        })
        .await;

    let reader = AgentInbox::attach(&tab_a, InboxOptions::new("research", "Researcher")).await;
    assert!(reader.send_message("sources attached", SendOptions::to("writer")).await);

    let got = next(&mut rx).await;
    assert_eq!(got.content, "sources attached");

    tokio::time::timeout(Duration::from_secs(2), changes.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(writer.messages()[0].content, "sources attached");

    tab_a.cleanup().await;
    tab_b.cleanup().await;
}

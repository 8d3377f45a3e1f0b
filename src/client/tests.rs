use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tungstenite::protocol::Message as WsMessage;

use super::connection::{Connection, Endpoint};
use super::relay::Relay;
use crate::auth::Identity;
use crate::broker::{
    Delivery, DeliveryMode, ExchangeKind, MemoryBroker, MessageBroker, Subscription, Topology,
    TopologyDeclarer, ensure_topology,
};
use crate::transport::message::ServerMessage;
use crate::utils::error::BrokerError;

fn identity(user_id: i64) -> Identity {
    Identity {
        user_id,
        role: "mentee".to_string(),
    }
}

async fn broker() -> (MemoryBroker, Topology) {
    let broker = MemoryBroker::new();
    let topology = Topology::default();
    ensure_topology(&broker, &topology).await.unwrap();
    (broker, topology)
}

async fn recv_text(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> String {
    match timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(WsMessage::Text(text))) => text.as_str().to_string(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Hands out `dead` subscriptions whose stream has already ended, then
/// either delegates or refuses.
struct FlakyBroker {
    inner: MemoryBroker,
    dead: AtomicUsize,
    refuse_after_dead: bool,
    subscribes: AtomicUsize,
}

impl FlakyBroker {
    fn new(inner: MemoryBroker, dead: usize, refuse_after_dead: bool) -> Self {
        Self {
            inner,
            dead: AtomicUsize::new(dead),
            refuse_after_dead,
            subscribes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TopologyDeclarer for FlakyBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.inner.declare_exchange(name, kind).await
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.declare_queue(name).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
        self.inner.bind_queue(queue, exchange, key).await
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), BrokerError> {
        self.inner.publish(exchange, routing_key, payload, mode).await
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        self.inner.consume(queue, prefetch).await
    }

    async fn subscribe(&self, exchange: &str, key: &str) -> Result<Subscription, BrokerError> {
        let n = self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.dead.load(Ordering::SeqCst) > 0 {
            self.dead.fetch_sub(1, Ordering::SeqCst);
            let (_tx, rx) = mpsc::unbounded_channel();
            return Ok(Subscription::new(format!("dead-{n}"), "dead", rx));
        }
        if self.refuse_after_dead {
            return Err(BrokerError::Unavailable("broker is gone".to_string()));
        }
        self.inner.subscribe(exchange, key).await
    }

    async fn cancel(&self, subscription: Subscription) -> Result<(), BrokerError> {
        self.inner.cancel(subscription).await
    }
}

/// Keeps every subscription stream open until `sever` drops its sender.
#[derive(Default)]
struct SeveringBroker {
    inner: MemoryBroker,
    live: Mutex<Vec<mpsc::UnboundedSender<Delivery>>>,
    subscribes: AtomicUsize,
}

impl SeveringBroker {
    fn sever(&self) {
        self.live.lock().unwrap().clear();
    }

    async fn wait_for_subscribes(&self, n: usize) {
        for _ in 0..100 {
            if self.subscribes.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never reached {n} subscribes");
    }
}

#[async_trait]
impl TopologyDeclarer for SeveringBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.inner.declare_exchange(name, kind).await
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.declare_queue(name).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
        self.inner.bind_queue(queue, exchange, key).await
    }
}

#[async_trait]
impl MessageBroker for SeveringBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), BrokerError> {
        self.inner.publish(exchange, routing_key, payload, mode).await
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        self.inner.consume(queue, prefetch).await
    }

    async fn subscribe(&self, _exchange: &str, _key: &str) -> Result<Subscription, BrokerError> {
        let n = self.subscribes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.live.lock().unwrap().push(tx);
        Ok(Subscription::new(format!("live-{n}"), "live", rx))
    }

    async fn cancel(&self, _subscription: Subscription) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[test]
fn test_endpoint_from_path() {
    assert_eq!(Endpoint::from_path("/chat"), Some(Endpoint::Chat));
    assert_eq!(Endpoint::from_path("/chat/"), Some(Endpoint::Chat));
    assert_eq!(Endpoint::from_path("/discussions"), Some(Endpoint::Discussions));
    assert_eq!(Endpoint::from_path("/"), None);
    assert_eq!(Endpoint::from_path("/admin"), None);
}

#[test]
fn test_connection_new() {
    let (tx, _rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn = Connection::new(identity(1), Endpoint::Discussions, tx);
    assert!(conn.id.starts_with("conn-"));
    assert!(conn.chat.is_none());
    assert_eq!(conn.joined_community(), None);
}

#[tokio::test]
async fn test_send_frame_reports_closed_socket() {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn = Connection::new(identity(1), Endpoint::Discussions, tx);

    assert!(conn.send_frame(&ServerMessage::Left));
    assert_eq!(recv_text(&mut rx).await, r#"{"type":"left"}"#);

    drop(rx);
    assert!(!conn.send_frame(&ServerMessage::Left));
}

#[tokio::test]
async fn test_relay_forwards_payload_verbatim() {
    let (broker, topology) = broker().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let relay = Relay::start(
        Arc::new(broker.clone()),
        &topology.discussions_exchange,
        &topology.community_key(7),
        tx,
        "conn-test",
    )
    .await
    .unwrap();
    assert_eq!(relay.routing_key(), "community.7");

    let body = r#"{"type":"community.message","content":"hi"}"#;
    broker
        .publish(
            &topology.discussions_exchange,
            "community.7",
            body.as_bytes(),
            DeliveryMode::Transient,
        )
        .await
        .unwrap();

    assert_eq!(recv_text(&mut rx).await, body);
    relay.stop().await;
}

#[tokio::test]
async fn test_relay_stop_releases_binding() {
    let (broker, topology) = broker().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let relay = Relay::start(
        Arc::new(broker.clone()),
        &topology.discussions_exchange,
        "community.3",
        tx,
        "conn-test",
    )
    .await
    .unwrap();
    assert_eq!(
        broker.binding_keys(&topology.discussions_exchange),
        vec!["community.3".to_string()]
    );

    relay.stop().await;
    assert!(broker.binding_keys(&topology.discussions_exchange).is_empty());
}

#[tokio::test]
async fn test_take_relays_empties_connection() {
    let (broker, topology) = broker().await;
    let broker: Arc<dyn MessageBroker> = Arc::new(broker);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conn = Connection::new(identity(5), Endpoint::Chat, tx.clone());
    conn.chat = Some(
        Relay::start(
            broker.clone(),
            &topology.direct_exchange,
            &topology.reply_key(5),
            tx,
            &conn.id,
        )
        .await
        .unwrap(),
    );

    let relays = conn.take_relays();
    assert_eq!(relays.len(), 1);
    assert!(conn.take_relays().is_empty());
    for relay in relays {
        relay.stop().await;
    }
}

#[tokio::test]
async fn test_relay_resubscribes_once_after_stream_end() {
    let (inner, topology) = broker().await;
    let flaky = Arc::new(FlakyBroker::new(inner.clone(), 1, false));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let relay = Relay::start(
        flaky.clone(),
        &topology.direct_exchange,
        &topology.reply_key(8),
        tx,
        "conn-test",
    )
    .await
    .unwrap();

    // wait for the replacement binding to show up
    for _ in 0..50 {
        if inner
            .binding_keys(&topology.direct_exchange)
            .contains(&"bot-reply.8".to_string())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(flaky.subscribes.load(Ordering::SeqCst), 2);

    inner
        .publish(
            &topology.direct_exchange,
            "bot-reply.8",
            br#"{"type":"ai.reply"}"#,
            DeliveryMode::Transient,
        )
        .await
        .unwrap();
    assert_eq!(recv_text(&mut rx).await, r#"{"type":"ai.reply"}"#);
    relay.stop().await;
}

#[tokio::test]
async fn test_relay_reports_error_and_closes_when_resubscribe_fails() {
    let (inner, topology) = broker().await;
    let flaky = Arc::new(FlakyBroker::new(inner, 1, true));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _relay = Relay::start(flaky, &topology.direct_exchange, "bot-reply.8", tx, "conn-test")
        .await
        .unwrap();

    let frame: ServerMessage = serde_json::from_str(&recv_text(&mut rx).await).unwrap();
    assert!(matches!(frame, ServerMessage::Error { .. }));
    let close = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert!(matches!(close, Some(WsMessage::Close(_))));
}

#[tokio::test]
async fn test_relay_gives_up_when_replacement_also_ends() {
    let (inner, topology) = broker().await;
    let flaky = Arc::new(FlakyBroker::new(inner, 2, false));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _relay = Relay::start(flaky.clone(), &topology.direct_exchange, "bot-reply.8", tx, "c")
        .await
        .unwrap();

    let frame: ServerMessage = serde_json::from_str(&recv_text(&mut rx).await).unwrap();
    assert!(matches!(frame, ServerMessage::Error { .. }));
    assert_eq!(flaky.subscribes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_relay_survives_outages_spaced_past_the_window() {
    let broker = Arc::new(SeveringBroker::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let relay = Relay::start_with_window(
        broker.clone(),
        "mentorbridge.direct",
        "bot-reply.8",
        tx,
        "conn-test",
        Duration::from_millis(50),
    )
    .await
    .unwrap();

    broker.sever();
    broker.wait_for_subscribes(2).await;

    // no delivery in between, only quiet time
    tokio::time::sleep(Duration::from_millis(150)).await;
    broker.sever();
    broker.wait_for_subscribes(3).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "relay gave up on a quiet stream");
    relay.stop().await;
}

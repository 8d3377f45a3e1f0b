//! Broker client.
//!
//! A thin, confirmation-aware abstraction over an AMQP-style broker. The
//! gateway and the AI worker only see the [`MessageBroker`] trait; the
//! production implementation is [`AmqpBroker`] (lapin) and [`MemoryBroker`]
//! provides the same exchange/queue semantics in-process.
//!
//! Consumers never settle messages from inside a callback. Each delivery is
//! handed out by a [`Subscription`] and settled explicitly with a
//! [`Decision`], so acknowledge / requeue / discard can be exercised without a
//! live broker.

pub mod amqp;
pub mod engine;
pub mod message;
pub mod topic;
pub mod topology;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::error::BrokerError;

pub use amqp::AmqpBroker;
pub use engine::MemoryBroker;
pub use topology::{Topology, ensure_topology};

/// Exchange matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Binding key is a dotted pattern with `*` and `#` wildcards.
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Topic => f.write_str("topic"),
        }
    }
}

/// Whether a published message should survive a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value.
    pub fn amqp_value(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// How a consumer settles one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed; put it back for another attempt.
    Requeue,
    /// Not processed and never will be; drop it.
    Discard,
}

/// Settles a delivery on the broker it came from.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn settle(&self, decision: Decision) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// A delivery that needs no settlement (auto-ack consumers).
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            redelivered: false,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Acknowledge or reject this delivery. No-op for auto-ack deliveries.
    pub async fn settle(self, decision: Decision) -> Result<(), BrokerError> {
        match self.acker {
            Some(acker) => acker.settle(decision).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

/// A push-driven stream of deliveries for one consumer.
///
/// The stream ends (`next` returns `None`) when the consumer is cancelled or
/// the broker connection behind it goes away.
#[derive(Debug)]
pub struct Subscription {
    consumer_tag: String,
    queue: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(
        consumer_tag: impl Into<String>,
        queue: impl Into<String>,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            queue: queue.into(),
            deliveries,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Next delivery if one is already buffered.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }
}

/// Durable declarations used by the topology manager.
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageBroker: TopologyDeclarer {
    /// Publish and wait for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), BrokerError>;

    /// Manual-ack consumer on a shared queue. Several consumers on the same
    /// queue compete: each message goes to exactly one of them.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError>;

    /// Auto-ack consumer on a private queue bound to `exchange` with
    /// `routing_key`. The queue lives as long as the subscription.
    async fn subscribe(&self, exchange: &str, routing_key: &str)
    -> Result<Subscription, BrokerError>;

    /// Cancel the consumer and release its private queue and binding.
    async fn cancel(&self, subscription: Subscription) -> Result<(), BrokerError>;
}

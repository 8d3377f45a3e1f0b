//! AMQP broker client (RabbitMQ) on top of `lapin`.
//!
//! One connection and one confirm-mode channel are shared by every publisher
//! and consumer of the process. When the channel is found closed the next
//! operation reconnects with bounded exponential backoff and re-declares the
//! topology before doing anything else. Consumers opened on the old channel
//! simply end; their owners decide whether to open new ones.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::topology::{Topology, ensure_topology};
use crate::broker::{
    Acknowledger, Decision, Delivery, DeliveryMode, ExchangeKind, MessageBroker, Subscription,
    TopologyDeclarer,
};
use crate::config::BrokerSettings;
use crate::utils::backoff::Backoff;
use crate::utils::error::BrokerError;

struct Link {
    _connection: Connection,
    channel: Channel,
}

pub struct AmqpBroker {
    url: String,
    topology: Topology,
    backoff: Backoff,
    link: Mutex<Option<Link>>,
}

impl AmqpBroker {
    /// Connect and declare the topology. Any failure here is fatal for the
    /// caller: the process must not run against a broker without topology.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let broker = Self {
            url: settings.url.clone(),
            topology: Topology::from_settings(settings),
            backoff: settings.backoff(),
            link: Mutex::new(None),
        };
        broker.channel().await?;
        Ok(broker)
    }

    /// Live channel, reconnecting first if the current one is closed.
    async fn channel(&self) -> Result<Channel, BrokerError> {
        let mut slot = self.link.lock().await;
        if let Some(link) = slot.as_ref() {
            if link.channel.status().connected() {
                return Ok(link.channel.clone());
            }
            warn!("broker channel closed, reconnecting");
        }

        let link = self.reconnect().await?;
        let channel = link.channel.clone();
        *slot = Some(link);
        Ok(channel)
    }

    async fn reconnect(&self) -> Result<Link, BrokerError> {
        let mut last_error = String::new();
        for attempt in self.backoff.attempts() {
            match self.open().await {
                Ok(link) => {
                    info!(attempt, "connected to broker");
                    return Ok(link);
                }
                Err(BrokerError::Unavailable(reason)) => {
                    warn!(
                        attempt,
                        max_attempts = self.backoff.max_attempts,
                        error = %reason,
                        "broker connection failed"
                    );
                    last_error = reason;
                    if attempt < self.backoff.max_attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
                // a broker that refuses our topology will not change its mind
                Err(other) => return Err(other),
            }
        }
        Err(BrokerError::Unavailable(format!(
            "gave up after {} attempts: {last_error}",
            self.backoff.max_attempts
        )))
    }

    async fn open(&self) -> Result<Link, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(unavailable)?;
        let channel = connection.create_channel().await.map_err(unavailable)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(unavailable)?;

        ensure_topology(&channel, &self.topology).await?;

        Ok(Link {
            _connection: connection,
            channel,
        })
    }
}

fn unavailable(err: lapin::Error) -> BrokerError {
    BrokerError::Unavailable(err.to_string())
}

fn declaration(object: String, err: lapin::Error) -> BrokerError {
    BrokerError::Declaration {
        object,
        reason: err.to_string(),
    }
}

/// Pump a lapin consumer into a `Subscription` channel until either side ends.
async fn forward(
    tag: String,
    mut consumer: Consumer,
    tx: UnboundedSender<Delivery>,
    manual_ack: bool,
) {
    while let Some(item) = consumer.next().await {
        match item {
            Ok(raw) => {
                let mut delivery = Delivery::new(
                    raw.exchange.as_str(),
                    raw.routing_key.as_str(),
                    raw.data.clone(),
                )
                .redelivered(raw.redelivered);
                if manual_ack {
                    delivery = delivery.with_acker(Box::new(AmqpAcker(raw.acker.clone())));
                }
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "consumer stream failed");
                break;
            }
        }
    }
    debug!(consumer = %tag, "consumer stream closed");
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn settle(&self, decision: Decision) -> Result<(), BrokerError> {
        let result = match decision {
            Decision::Ack => self.0.ack(BasicAckOptions::default()).await,
            Decision::Requeue => self.0.reject(BasicRejectOptions { requeue: true }).await,
            Decision::Discard => self.0.reject(BasicRejectOptions { requeue: false }).await,
        };
        result
            .map(|_| ())
            .map_err(|e| BrokerError::Settle(e.to_string()))
    }
}

#[async_trait]
impl TopologyDeclarer for Channel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let amqp_kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.exchange_declare(
            name,
            amqp_kind,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration(format!("{kind} exchange '{name}'"), e))
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
        .map_err(|e| declaration(format!("queue '{name}'"), e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration(format!("binding {queue} <- {exchange} ({routing_key})"), e))
    }
}

#[async_trait]
impl TopologyDeclarer for AmqpBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.channel().await?.declare_exchange(name, kind).await
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.channel().await?.declare_queue(name).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel()
            .await?
            .bind_queue(queue, exchange, routing_key)
            .await
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), BrokerError> {
        let publish_error = |e: lapin::Error| BrokerError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason: e.to_string(),
        };

        let channel = self.channel().await?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(mode.amqp_value());

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        if confirmation.is_nack() {
            return Err(BrokerError::Nacked {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        let consume_error = |e: lapin::Error| BrokerError::Consume {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let channel = self.channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(consume_error)?;

        let tag = format!("ai-worker-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(consume_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(tag.clone(), consumer, tx, true));
        Ok(Subscription::new(tag, queue, rx))
    }

    async fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Subscription, BrokerError> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration("private queue".to_string(), e))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .bind_queue(&queue_name, exchange, routing_key)
            .await?;

        let tag = format!("gateway-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &queue_name,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue_name.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(tag.clone(), consumer, tx, false));
        Ok(Subscription::new(tag, queue_name, rx))
    }

    async fn cancel(&self, subscription: Subscription) -> Result<(), BrokerError> {
        let slot = self.link.lock().await;
        // a dead channel already took its consumers and private queues with it
        let Some(link) = slot.as_ref().filter(|l| l.channel.status().connected()) else {
            return Ok(());
        };
        // the private queue is auto-delete and goes away with its consumer
        link.channel
            .basic_cancel(subscription.consumer_tag(), BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::Consume {
                queue: subscription.queue().to_string(),
                reason: e.to_string(),
            })
    }
}

//! Broker-to-socket relay.
//!
//! A `Relay` owns one broker subscription and forwards every delivery, as a
//! text frame, to the outbound channel of a single connection. Stopping the
//! relay cancels the subscription, which releases its private queue and
//! binding on the broker.
//!
//! When the stream ends the relay resubscribes. A replacement that ends
//! again before it delivered anything or stayed up for `STABLE_AFTER` means
//! the broker is not coming back, and the client is told to reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Delivery, MessageBroker, Subscription};
use crate::transport::message::ServerMessage;
use crate::utils::error::BrokerError;

const STABLE_AFTER: Duration = Duration::from_secs(30);

pub struct Relay {
    routing_key: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Pump {
    broker: Arc<dyn MessageBroker>,
    exchange: String,
    routing_key: String,
    sender: UnboundedSender<WsMessage>,
    connection_id: String,
    stable_after: Duration,
}

enum Step {
    Stop,
    Deliver(Delivery),
    Ended,
}

impl Relay {
    /// Subscribe `routing_key` on `exchange` and start forwarding.
    pub async fn start(
        broker: Arc<dyn MessageBroker>,
        exchange: &str,
        routing_key: &str,
        sender: UnboundedSender<WsMessage>,
        connection_id: &str,
    ) -> Result<Self, BrokerError> {
        Self::start_with_window(
            broker,
            exchange,
            routing_key,
            sender,
            connection_id,
            STABLE_AFTER,
        )
        .await
    }

    pub(crate) async fn start_with_window(
        broker: Arc<dyn MessageBroker>,
        exchange: &str,
        routing_key: &str,
        sender: UnboundedSender<WsMessage>,
        connection_id: &str,
        stable_after: Duration,
    ) -> Result<Self, BrokerError> {
        let subscription = broker.subscribe(exchange, routing_key).await?;
        debug!(
            connection_id,
            routing_key,
            queue = subscription.queue(),
            "relay subscribed"
        );

        let pump = Pump {
            broker,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            sender,
            connection_id: connection_id.to_string(),
            stable_after,
        };
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(pump.run(subscription, stopped));

        Ok(Self {
            routing_key: routing_key.to_string(),
            stop,
            task,
        })
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Cancel the subscription and wait until the broker released it.
    pub async fn stop(self) {
        // the pump may already be gone if its socket or stream died first
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!(routing_key = %self.routing_key, error = %e, "relay task failed");
        }
    }
}

impl Pump {
    async fn run(self, mut subscription: Subscription, mut stopped: oneshot::Receiver<()>) {
        let mut resubscribed_at: Option<Instant> = None;

        loop {
            let step = tokio::select! {
                _ = &mut stopped => Step::Stop,
                delivery = subscription.next() => match delivery {
                    Some(delivery) => Step::Deliver(delivery),
                    None => Step::Ended,
                },
            };

            match step {
                Step::Stop => break,
                Step::Deliver(delivery) => {
                    resubscribed_at = None;
                    if !self.forward(delivery) {
                        break;
                    }
                }
                Step::Ended => {
                    if self.sender.is_closed() {
                        return;
                    }
                    if resubscribed_at.is_some_and(|at| at.elapsed() < self.stable_after) {
                        self.fail("relay stream ended right after resubscribing");
                        return;
                    }
                    warn!(
                        connection_id = %self.connection_id,
                        routing_key = %self.routing_key,
                        "relay stream ended, resubscribing"
                    );
                    match self.broker.subscribe(&self.exchange, &self.routing_key).await {
                        Ok(fresh) => {
                            info!(
                                connection_id = %self.connection_id,
                                routing_key = %self.routing_key,
                                "relay resubscribed"
                            );
                            subscription = fresh;
                            resubscribed_at = Some(Instant::now());
                        }
                        Err(e) => {
                            self.fail(&e.to_string());
                            return;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.broker.cancel(subscription).await {
            warn!(
                connection_id = %self.connection_id,
                routing_key = %self.routing_key,
                error = %e,
                "failed to cancel relay subscription"
            );
        }
    }

    /// Returns `false` once the socket side is gone.
    fn forward(&self, delivery: Delivery) -> bool {
        debug!(
            connection_id = %self.connection_id,
            routing_key = %delivery.routing_key,
            "relaying delivery"
        );
        match String::from_utf8(delivery.payload) {
            Ok(text) => self.sender.send(WsMessage::Text(text.into())).is_ok(),
            Err(_) => {
                warn!(
                    connection_id = %self.connection_id,
                    routing_key = %delivery.routing_key,
                    "dropping non-UTF-8 delivery"
                );
                true
            }
        }
    }

    /// Tell the client its stream is gone and close the socket.
    fn fail(&self, reason: &str) {
        warn!(
            connection_id = %self.connection_id,
            routing_key = %self.routing_key,
            error = reason,
            "relay lost, closing connection"
        );
        let frame = ServerMessage::error("message stream lost, please reconnect");
        let _ = self.sender.send(WsMessage::Text(frame.to_json().into()));
        let _ = self.sender.send(WsMessage::Close(None));
    }
}

//! In-process broker engine.
//!
//! `MemoryBroker` mirrors the AMQP semantics the rest of the crate relies on:
//! - exchanges route by direct or topic matching to bound queues
//! - a queue with several consumers hands each message to exactly one of
//!   them, round-robin, respecting each consumer's prefetch window
//! - manual-ack deliveries stay unacked until settled; `Requeue` puts the
//!   message back at the head of the queue
//! - when a consumer is cancelled or its receiver is dropped, everything it
//!   still held goes back to the head of the queue as redelivered
//! - private (auto-delete) queues disappear with their last consumer
//! - unroutable messages are dropped, publishing to an unknown exchange fails
//!
//! All state sits behind one `std::sync::Mutex`; no lock is held across an
//! await point and every operation is a short in-memory update.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::topic::Exchange;
use crate::broker::{
    Acknowledger, Decision, Delivery, DeliveryMode, ExchangeKind, MessageBroker, Subscription,
    TopologyDeclarer,
};
use crate::utils::error::BrokerError;

#[derive(Debug, Clone)]
struct Pending {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    sender: UnboundedSender<Delivery>,
    manual_ack: bool,
    prefetch: u16,
    /// Unsettled deliveries by delivery id.
    in_flight: BTreeMap<u64, Pending>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        !self.manual_ack || self.prefetch == 0 || self.in_flight.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct Queue {
    durable: bool,
    auto_delete: bool,
    ready: VecDeque<Pending>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: usize,
}

impl Queue {
    fn next_available(&self) -> Option<usize> {
        let n = self.consumers.len();
        (0..n)
            .map(|i| (self.next_consumer + i) % n)
            .find(|&i| self.consumers[i].has_capacity())
    }

    /// Remove a consumer and requeue what it held, oldest first.
    fn remove_consumer(&mut self, idx: usize) -> ConsumerSlot {
        let mut gone = self.consumers.remove(idx);
        let held = std::mem::take(&mut gone.in_flight);
        self.unacked = self.unacked.saturating_sub(held.len());
        for (_, mut message) in held.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
        gone
    }

    fn prune_closed(&mut self, queue_name: &str) {
        while let Some(idx) = self.consumers.iter().position(|c| c.sender.is_closed()) {
            let gone = self.remove_consumer(idx);
            debug!(consumer = %gone.tag, queue = %queue_name, "dropping closed consumer");
        }
    }
}

/// Snapshot of one queue, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub durable: bool,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    next_delivery: u64,
}

impl State {
    /// Hand ready messages of `queue_name` to consumers with free capacity.
    fn dispatch(&mut self, queue_name: &str, home: &Weak<Mutex<State>>) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.prune_closed(queue_name);

        while !queue.ready.is_empty() {
            let Some(idx) = queue.next_available() else {
                break;
            };
            let Some(pending) = queue.ready.pop_front() else {
                break;
            };

            self.next_delivery += 1;
            let delivery_id = self.next_delivery;
            let consumer = &mut queue.consumers[idx];
            let manual_ack = consumer.manual_ack;
            let mut delivery = Delivery::new(
                pending.exchange.clone(),
                pending.routing_key.clone(),
                pending.payload.clone(),
            )
            .redelivered(pending.redelivered);
            if manual_ack {
                delivery = delivery.with_acker(Box::new(MemoryAcker {
                    home: home.clone(),
                    queue: queue_name.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    delivery_id,
                }));
            }

            match consumer.sender.send(delivery) {
                Ok(()) => {
                    if manual_ack {
                        consumer.in_flight.insert(delivery_id, pending);
                        queue.unacked += 1;
                    }
                    queue.next_consumer = idx + 1;
                }
                Err(_) => {
                    queue.ready.push_front(pending);
                    let gone = queue.remove_consumer(idx);
                    debug!(consumer = %gone.tag, queue = %queue_name, "dropping closed consumer");
                }
            }
        }

        self.reap(queue_name);
    }

    /// Delete an auto-delete queue once its last consumer is gone.
    fn reap(&mut self, queue_name: &str) {
        let abandoned = self
            .queues
            .get(queue_name)
            .is_some_and(|q| q.auto_delete && q.consumers.is_empty());
        if abandoned {
            self.queues.remove(queue_name);
            for exchange in self.exchanges.values_mut() {
                exchange.unbind_queue(queue_name);
            }
            debug!(queue = %queue_name, "auto-deleted private queue");
        }
    }

    fn settle(
        &mut self,
        queue_name: &str,
        consumer_tag: &str,
        delivery_id: u64,
        decision: Decision,
        home: &Weak<Mutex<State>>,
    ) -> Result<(), BrokerError> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::Settle(format!("queue '{queue_name}' no longer exists")))?;

        let held = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == consumer_tag)
            .and_then(|c| c.in_flight.remove(&delivery_id));
        let Some(mut message) = held else {
            // the consumer went away first and its deliveries were requeued
            debug!(consumer = %consumer_tag, queue = %queue_name, "ignoring settle of requeued delivery");
            return Ok(());
        };

        queue.unacked = queue.unacked.saturating_sub(1);
        if decision == Decision::Requeue {
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        self.dispatch(queue_name, home);
        Ok(())
    }

    fn add_consumer(
        &mut self,
        queue_name: &str,
        manual_ack: bool,
        prefetch: u16,
        home: &Weak<Mutex<State>>,
    ) -> Result<Subscription, BrokerError> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue_name}'")))?;

        let tag = format!("ctag-{}", Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            sender: tx,
            manual_ack,
            prefetch,
            in_flight: BTreeMap::new(),
        });

        self.dispatch(queue_name, home);
        Ok(Subscription::new(tag, queue_name, rx))
    }
}

struct MemoryAcker {
    home: Weak<Mutex<State>>,
    queue: String,
    consumer_tag: String,
    delivery_id: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn settle(&self, decision: Decision) -> Result<(), BrokerError> {
        let state = self
            .home
            .upgrade()
            .ok_or_else(|| BrokerError::Settle("broker has shut down".to_string()))?;
        let mut state = lock(&state);
        state.settle(
            &self.queue,
            &self.consumer_tag,
            self.delivery_id,
            decision,
            &self.home,
        )
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn home(&self) -> Weak<Mutex<State>> {
        Arc::downgrade(&self.state)
    }

    pub fn queue_depth(&self, queue: &str) -> Option<QueueDepth> {
        lock(&self.state).queues.get(queue).map(|q| QueueDepth {
            ready: q.ready.len(),
            unacked: q.unacked,
            consumers: q.consumers.len(),
            durable: q.durable,
        })
    }

    /// Binding keys currently attached to `exchange`.
    pub fn binding_keys(&self, exchange: &str) -> Vec<String> {
        lock(&self.state)
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().map(|b| b.binding_key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        lock(&self.state).exchanges.get(exchange).map(|e| e.kind)
    }
}

#[async_trait]
impl TopologyDeclarer for MemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!(
                    "exchange '{name}' exists as {} and cannot be redeclared as {kind}",
                    existing.kind
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), Exchange::new(name, kind));
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.queues.entry(name.to_string()).or_insert_with(|| Queue {
            durable: true,
            ..Queue::default()
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?;
        exchange.bind(queue, routing_key);
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _mode: DeliveryMode,
    ) -> Result<(), BrokerError> {
        let home = self.home();
        let mut state = lock(&self.state);
        let targets = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?
            .route(routing_key);

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "unroutable message dropped");
        }

        for queue_name in &targets {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.ready.push_back(Pending {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            } else {
                warn!(queue = %queue_name, "binding points at a missing queue");
                continue;
            }
            state.dispatch(queue_name, &home);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        let home = self.home();
        let mut state = lock(&self.state);
        state.add_consumer(queue, true, prefetch, &home)
    }

    async fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Subscription, BrokerError> {
        let home = self.home();
        let mut state = lock(&self.state);
        let queue_name = format!("amq.gen-{}", Uuid::new_v4());

        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?;
        target.bind(&queue_name, routing_key);

        state.queues.insert(
            queue_name.clone(),
            Queue {
                auto_delete: true,
                ..Queue::default()
            },
        );
        state.add_consumer(&queue_name, false, 0, &home)
    }

    async fn cancel(&self, subscription: Subscription) -> Result<(), BrokerError> {
        let home = self.home();
        let mut state = lock(&self.state);
        let queue_name = subscription.queue().to_string();
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            let position = queue
                .consumers
                .iter()
                .position(|c| c.tag == subscription.consumer_tag());
            if let Some(idx) = position {
                queue.remove_consumer(idx);
            }
        }
        // hand requeued messages to the remaining consumers, then reap
        state.dispatch(&queue_name, &home);
        state.reap(&queue_name);
        Ok(())
    }
}

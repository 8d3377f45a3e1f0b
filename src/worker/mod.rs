//! AI worker.
//!
//! Consumes `AiQuestion`s from the AI-question queue one at a time, asks the
//! language model, appends the pair to the AI log and publishes an `ai.reply`
//! envelope to `bot-reply.<userId>`. The request is acknowledged only after
//! the reply was confirmed by the broker.
//!
//! Every failure (undecodable payload, model error, log error, publish
//! error) rejects the request without requeue: it is logged and lost, never
//! redelivered. Replies are transient; a user with no open chat socket
//! simply does not get one.
//!
//! Several workers, in one process or many, compete on the same queue.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::message::{AiQuestion, Envelope, UserId};
use crate::broker::{Decision, DeliveryMode, MessageBroker, Topology};
use crate::llm::LanguageModel;
use crate::persistence::{AiLogEntry, AiLogStore};
use crate::utils::backoff::Backoff;
use crate::utils::error::{BrokerError, WorkerError};

#[derive(Clone)]
pub struct AiWorker {
    broker: Arc<dyn MessageBroker>,
    topology: Arc<Topology>,
    model: Arc<dyn LanguageModel>,
    log: Arc<dyn AiLogStore>,
    prefetch: u16,
    backoff: Backoff,
}

impl AiWorker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topology: Arc<Topology>,
        model: Arc<dyn LanguageModel>,
        log: Arc<dyn AiLogStore>,
    ) -> Self {
        Self {
            broker,
            topology,
            model,
            log,
            prefetch: 1,
            backoff: Backoff::default(),
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Policy for re-opening the consumer after it closes.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Process one request payload and decide how to settle it.
    pub async fn handle(&self, payload: &[u8]) -> Decision {
        match self.process(payload).await {
            Ok(user_id) => {
                info!(user_id, "AI reply published");
                Decision::Ack
            }
            Err(e) => {
                warn!(error = %e, "discarding AI request");
                Decision::Discard
            }
        }
    }

    async fn process(&self, payload: &[u8]) -> Result<UserId, WorkerError> {
        let request = AiQuestion::from_payload(payload)
            .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
        debug!(user_id = request.user_id, "AI request received");

        let answer = self.model.answer(&request.question).await?;

        // the log may end up holding an answer whose reply never went out
        self.log
            .record(&AiLogEntry::new(request.user_id, &request.question, &answer))
            .await?;

        let reply = Envelope::ai_reply(request.user_id, answer);
        let body = reply
            .to_payload()
            .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
        self.broker
            .publish(
                &self.topology.direct_exchange,
                &self.topology.reply_key(request.user_id),
                &body,
                DeliveryMode::Transient,
            )
            .await?;

        Ok(request.user_id)
    }

    /// Consume until the broker is gone for good.
    ///
    /// A closed consumer is re-opened with backoff; the attempt counter resets
    /// whenever a delivery gets through.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let queue = self.topology.ai_question_queue.as_str();
        let mut attempt = 0;

        loop {
            let mut consumer = self.broker.consume(queue, self.prefetch).await?;
            info!(queue, consumer = consumer.consumer_tag(), "AI worker consuming");

            while let Some(delivery) = consumer.next().await {
                attempt = 0;
                let decision = self.handle(&delivery.payload).await;
                if let Err(e) = delivery.settle(decision).await {
                    warn!(error = %e, ?decision, "failed to settle AI request");
                }
            }

            attempt += 1;
            if attempt > self.backoff.max_attempts {
                return Err(BrokerError::Unavailable(format!(
                    "consumer on '{queue}' closed {attempt} times in a row"
                )));
            }
            warn!(queue, attempt, "AI question consumer closed, re-consuming");
            tokio::time::sleep(self.backoff.delay(attempt)).await;
        }
    }
}

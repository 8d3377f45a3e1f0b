//! The `persistence` module stores the prompt/response pairs produced by the
//! AI worker.
//!
//! The AI log belongs to the platform; the worker only appends to it through
//! [`AiLogStore`]. `SledAiLog` keeps the log in an embedded `sled` database.

pub mod sled_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::message::UserId;
use crate::utils::error::PersistenceError;

pub use sled_store::SledAiLog;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiLogEntry {
    pub mentee_id: UserId,
    pub prompt: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl AiLogEntry {
    pub fn new(mentee_id: UserId, prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            mentee_id,
            prompt: prompt.into(),
            response: response.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AiLogStore: Send + Sync {
    async fn record(&self, entry: &AiLogEntry) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests;

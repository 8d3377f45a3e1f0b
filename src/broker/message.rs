//! Message definitions carried over the broker.
//!
//! `AiQuestion` is what the REST layer enqueues for the AI worker.
//! `Envelope` is everything the gateway relays to sockets; it is serialized
//! once and never modified afterwards. Field names are camelCase on the wire
//! and timestamps are RFC 3339 UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type CommunityId = i64;

/// Request consumed from the AI-question queue. Both fields are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQuestion {
    pub user_id: UserId,
    pub question: String,
}

impl AiQuestion {
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "ai.reply", rename_all = "camelCase")]
    AiReply {
        user_id: UserId,
        answer: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "community.message", rename_all = "camelCase")]
    Discussion {
        sender_id: UserId,
        sender_role: String,
        community_id: CommunityId,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl Envelope {
    pub fn ai_reply(user_id: UserId, answer: impl Into<String>) -> Self {
        Envelope::AiReply {
            user_id,
            answer: answer.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn discussion(
        sender_id: UserId,
        sender_role: impl Into<String>,
        community_id: CommunityId,
        content: impl Into<String>,
    ) -> Self {
        Envelope::Discussion {
            sender_id,
            sender_role: sender_role.into(),
            community_id,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

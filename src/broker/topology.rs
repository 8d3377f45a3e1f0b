//! Topology manager.
//!
//! `Topology` is the immutable descriptor of every exchange, queue and
//! routing-key template the system uses. Routing keys are only ever built
//! through its methods.

use tracing::info;

use crate::broker::message::{CommunityId, UserId};
use crate::broker::{ExchangeKind, TopologyDeclarer};
use crate::config::BrokerSettings;
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Direct exchange carrying AI requests and per-user replies.
    pub direct_exchange: String,
    /// Topic exchange carrying community discussions.
    pub discussions_exchange: String,
    /// Durable queue the AI workers compete on.
    pub ai_question_queue: String,
    /// Key binding `ai_question_queue` to `direct_exchange`.
    pub ai_question_key: String,
    reply_key_prefix: String,
    community_key_prefix: String,
}

impl Topology {
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            direct_exchange: settings.direct_exchange.clone(),
            discussions_exchange: settings.discussions_exchange.clone(),
            ai_question_queue: settings.ai_question_queue.clone(),
            ai_question_key: settings.ai_question_key.clone(),
            reply_key_prefix: settings.reply_key_prefix.clone(),
            community_key_prefix: settings.community_key_prefix.clone(),
        }
    }

    /// `bot-reply.<user>`: the chat-reply audience of one user.
    pub fn reply_key(&self, user_id: UserId) -> String {
        format!("{}.{}", self.reply_key_prefix, user_id)
    }

    /// `community.<id>`: the discussion audience of one community.
    pub fn community_key(&self, community_id: CommunityId) -> String {
        format!("{}.{}", self.community_key_prefix, community_id)
    }

    /// `community.*`: every community, for wildcard consumers.
    pub fn community_pattern(&self) -> String {
        format!("{}.*", self.community_key_prefix)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_settings(&crate::config::Settings::default().broker)
    }
}

/// Declare both exchanges and the AI-question queue, and bind the queue.
///
/// Idempotent; runs on every new broker connection. An error here means the
/// broker disagrees with our topology and the process must not start.
pub async fn ensure_topology<D>(declarer: &D, topology: &Topology) -> Result<(), BrokerError>
where
    D: TopologyDeclarer + ?Sized,
{
    declarer
        .declare_exchange(&topology.direct_exchange, ExchangeKind::Direct)
        .await?;
    declarer
        .declare_exchange(&topology.discussions_exchange, ExchangeKind::Topic)
        .await?;
    declarer.declare_queue(&topology.ai_question_queue).await?;
    declarer
        .bind_queue(
            &topology.ai_question_queue,
            &topology.direct_exchange,
            &topology.ai_question_key,
        )
        .await?;

    info!(
        direct_exchange = %topology.direct_exchange,
        discussions_exchange = %topology.discussions_exchange,
        queue = %topology.ai_question_queue,
        "broker topology declared"
    );
    Ok(())
}

//! The `error` module defines the error types used within `mentorbridge`.
//!
//! Each concern owns one enum. Per-message failures are absorbed where they
//! happen (an ack/nack decision or an error frame to a single socket) and
//! never travel further than that message or connection.

use thiserror::Error;

use crate::broker::message::CommunityId;

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached, or reconnecting gave up.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// An exchange, queue or binding declaration was refused.
    #[error("failed to declare {object}: {reason}")]
    Declaration { object: String, reason: String },

    /// A declaration conflicts with an existing object of another shape.
    #[error("precondition failed for {0}")]
    PreconditionFailed(String),

    /// The referenced exchange or queue does not exist.
    #[error("{0} not found")]
    NotFound(String),

    #[error("publish to '{exchange}' with key '{routing_key}' failed: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// The broker negatively confirmed a publish.
    #[error("broker nacked publish to '{exchange}' with key '{routing_key}'")]
    Nacked {
        exchange: String,
        routing_key: String,
    },

    #[error("failed to start consumer on '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    #[error("failed to settle delivery: {0}")]
    Settle(String),
}

/// Connection-time credential failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    MissingToken,

    #[error("invalid credential: {0}")]
    InvalidToken(String),
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership lookup failed: {0}")]
    Lookup(String),

    #[error("membership service answered with status {0}")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("language model request failed: {0}")]
    Request(String),

    #[error("language model returned no answer")]
    EmptyAnswer,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons the AI worker discards a request. Every variant is logged and the
/// delivery is rejected without requeue.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("malformed AI request: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Publish(#[from] BrokerError),
}

/// Failures of a discussion action, rendered to the client as an error frame.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("join a community first")]
    NotJoined,

    #[error("message content must not be empty")]
    EmptyContent,

    #[error("not a member of community {0}")]
    NotMember(CommunityId),

    #[error("membership could not be verified")]
    Membership(#[from] MembershipError),

    #[error("message could not be delivered")]
    Broker(#[from] BrokerError),

    #[error("unsupported action on this endpoint")]
    Unsupported,
}

use serde::{Deserialize, Serialize};

use crate::broker::message::CommunityId;

/// Frames a client may send on `/discussions`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "communityId")]
        community_id: CommunityId,
    },
    #[serde(rename = "send")]
    Send { content: String },
    #[serde(rename = "leave")]
    Leave,
}

/// Control frames written by the gateway. Relayed broker envelopes are
/// forwarded verbatim and never go through this type.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "joined")]
    Joined {
        #[serde(rename = "communityId")]
        community_id: CommunityId,
    },
    #[serde(rename = "left")]
    Left,
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // plain enum of strings and integers; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"error"}"#))
    }
}

//! Connection record
//!
//! `Connection` models one authenticated socket. It holds the sending side of
//! the per-connection channel drained by the socket writer task, plus the
//! broker relays the connection owns: the chat-reply relay on `/chat`, at
//! most one community relay on `/discussions`.

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::auth::Identity;
use crate::broker::message::CommunityId;
use crate::client::relay::Relay;
use crate::transport::message::ServerMessage;

/// Which gateway endpoint a socket was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Discussions,
}

impl Endpoint {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/chat" => Some(Endpoint::Chat),
            "/discussions" => Some(Endpoint::Discussions),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Chat => f.write_str("chat"),
            Endpoint::Discussions => f.write_str("discussions"),
        }
    }
}

/// The community a discussion socket currently listens to.
pub struct DiscussionBinding {
    pub community_id: CommunityId,
    pub relay: Relay,
}

pub struct Connection {
    pub id: String,
    pub identity: Identity,
    pub endpoint: Endpoint,
    pub sender: UnboundedSender<WsMessage>,
    pub chat: Option<Relay>,
    pub discussion: Option<DiscussionBinding>,
}

impl Connection {
    pub fn new(identity: Identity, endpoint: Endpoint, sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            identity,
            endpoint,
            sender,
            chat: None,
            discussion: None,
        }
    }

    pub fn joined_community(&self) -> Option<CommunityId> {
        self.discussion.as_ref().map(|binding| binding.community_id)
    }

    /// Queue a control frame for the writer task. Returns `false` if the
    /// socket is already gone.
    pub fn send_frame(&self, frame: &ServerMessage) -> bool {
        self.sender
            .send(WsMessage::Text(frame.to_json().into()))
            .is_ok()
    }

    /// Hand over every relay the connection owns, leaving it unbound.
    pub fn take_relays(&mut self) -> Vec<Relay> {
        let mut relays: Vec<Relay> = self.chat.take().into_iter().collect();
        relays.extend(self.discussion.take().map(|binding| binding.relay));
        relays
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("chat", &self.chat.as_ref().map(Relay::routing_key))
            .field("discussion", &self.joined_community())
            .finish()
    }
}

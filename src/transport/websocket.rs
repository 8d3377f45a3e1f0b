//! WebSocket gateway
//!
//! This file implements the socket side of the bridge. Responsibilities:
//! - Authenticate every socket during the HTTP upgrade (`token` query
//!   parameter or `Authorization: Bearer` header) and route it by path to
//!   `/chat` or `/discussions`
//! - Give each connection a writer task fed by an unbounded channel
//! - Bind `/chat` sockets to their user's reply key and `/discussions`
//!   sockets to at most one community at a time
//! - Publish discussion messages to the topic exchange; sockets only ever
//!   receive what the broker relays back
//! - Release every broker subscription of a connection exactly once when it
//!   closes

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::protocol::Message as WsMessage;
use url::form_urlencoded;

use crate::auth::{Authenticator, Identity};
use crate::broker::message::{CommunityId, Envelope};
use crate::broker::{DeliveryMode, MessageBroker, Topology};
use crate::client::{Connection, DiscussionBinding, Endpoint, Relay};
use crate::community::MembershipChecker;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{AuthError, BrokerError, GatewayError};

/// Everything a socket needs besides the socket itself.
#[derive(Clone)]
pub struct Gateway {
    broker: Arc<dyn MessageBroker>,
    topology: Arc<Topology>,
    authenticator: Arc<dyn Authenticator>,
    membership: Arc<dyn MembershipChecker>,
}

impl Gateway {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topology: Arc<Topology>,
        authenticator: Arc<dyn Authenticator>,
        membership: Arc<dyn MembershipChecker>,
    ) -> Self {
        Self {
            broker,
            topology,
            authenticator,
            membership,
        }
    }

    /// Decide whether an upgrade request may become a socket.
    pub fn admit(&self, request: &Request) -> Result<(Endpoint, Identity), ErrorResponse> {
        let Some(endpoint) = Endpoint::from_path(request.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint"));
        };
        let token = bearer_token(request).unwrap_or_default();
        match self.authenticator.verify(&token) {
            Ok(identity) => Ok((endpoint, identity)),
            Err(e) => {
                debug!(error = %e, %endpoint, "rejecting upgrade");
                let message = match e {
                    AuthError::MissingToken => "missing token",
                    AuthError::InvalidToken(_) => "invalid token",
                };
                Err(reject(StatusCode::UNAUTHORIZED, message))
            }
        }
    }

    /// Create the connection record and its endpoint-level binding.
    pub async fn open(
        &self,
        identity: Identity,
        endpoint: Endpoint,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) -> Result<Connection, GatewayError> {
        let mut conn = Connection::new(identity, endpoint, sender);
        if endpoint == Endpoint::Chat {
            let relay = Relay::start(
                self.broker.clone(),
                &self.topology.direct_exchange,
                &self.topology.reply_key(conn.identity.user_id),
                conn.sender.clone(),
                &conn.id,
            )
            .await?;
            conn.chat = Some(relay);
        }
        info!(
            connection_id = %conn.id,
            user_id = conn.identity.user_id,
            %endpoint,
            "connection opened"
        );
        Ok(conn)
    }

    /// Handle one text frame. Failures are reported to the sender only.
    pub async fn handle_text(&self, conn: &mut Connection, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    connection_id = %conn.id,
                    error = %err,
                    frame = %text.chars().take(100).collect::<String>(),
                    "invalid client message"
                );
                conn.send_frame(&ServerMessage::error("invalid message"));
                return;
            }
        };

        let result = match message {
            ClientMessage::Join { community_id } => self.join(conn, community_id).await,
            ClientMessage::Send { content } => self.send(conn, &content).await,
            ClientMessage::Leave => self.leave(conn).await,
        };
        if let Err(e) = result {
            conn.send_frame(&ServerMessage::error(e.to_string()));
        }
    }

    /// Bind the connection to `community_id`, replacing any prior binding.
    pub async fn join(
        &self,
        conn: &mut Connection,
        community_id: CommunityId,
    ) -> Result<(), GatewayError> {
        if conn.endpoint != Endpoint::Discussions {
            return Err(GatewayError::Unsupported);
        }
        let user_id = conn.identity.user_id;
        let is_member = self
            .membership
            .is_member(user_id, community_id)
            .await
            .inspect_err(|e| {
                warn!(connection_id = %conn.id, user_id, community_id, error = %e, "membership lookup failed");
            })?;
        if !is_member {
            info!(connection_id = %conn.id, user_id, community_id, "join refused, not a member");
            return Err(GatewayError::NotMember(community_id));
        }

        if let Some(previous) = conn.discussion.take() {
            debug!(connection_id = %conn.id, community_id = previous.community_id, "releasing previous community");
            previous.relay.stop().await;
        }

        let relay = Relay::start(
            self.broker.clone(),
            &self.topology.discussions_exchange,
            &self.topology.community_key(community_id),
            conn.sender.clone(),
            &conn.id,
        )
        .await
        .inspect_err(|e| {
            warn!(connection_id = %conn.id, community_id, error = %e, "community subscription failed");
        })?;
        conn.discussion = Some(DiscussionBinding {
            community_id,
            relay,
        });

        info!(connection_id = %conn.id, user_id, community_id, "joined community");
        conn.send_frame(&ServerMessage::Joined { community_id });
        Ok(())
    }

    /// Publish a discussion message to the joined community.
    pub async fn send(&self, conn: &mut Connection, content: &str) -> Result<(), GatewayError> {
        if conn.endpoint != Endpoint::Discussions {
            return Err(GatewayError::Unsupported);
        }
        let community_id = conn.joined_community().ok_or(GatewayError::NotJoined)?;
        if content.trim().is_empty() {
            return Err(GatewayError::EmptyContent);
        }

        let envelope = Envelope::discussion(
            conn.identity.user_id,
            conn.identity.role.clone(),
            community_id,
            content,
        );
        let routing_key = self.topology.community_key(community_id);
        let payload = envelope.to_payload().map_err(|e| {
            GatewayError::Broker(BrokerError::Publish {
                exchange: self.topology.discussions_exchange.clone(),
                routing_key: routing_key.clone(),
                reason: e.to_string(),
            })
        })?;

        self.broker
            .publish(
                &self.topology.discussions_exchange,
                &routing_key,
                &payload,
                DeliveryMode::Transient,
            )
            .await
            .inspect_err(|e| {
                warn!(connection_id = %conn.id, %routing_key, error = %e, "discussion publish failed");
            })?;

        debug!(connection_id = %conn.id, %routing_key, "discussion message published");
        Ok(())
    }

    /// Drop the community binding, if any.
    pub async fn leave(&self, conn: &mut Connection) -> Result<(), GatewayError> {
        if conn.endpoint != Endpoint::Discussions {
            return Err(GatewayError::Unsupported);
        }
        if let Some(binding) = conn.discussion.take() {
            info!(connection_id = %conn.id, community_id = binding.community_id, "left community");
            binding.relay.stop().await;
        }
        conn.send_frame(&ServerMessage::Left);
        Ok(())
    }

    /// Release every subscription the connection owns. Safe to call twice;
    /// the second call finds nothing left to release.
    pub async fn close(&self, conn: &mut Connection) {
        for relay in conn.take_relays() {
            relay.stop().await;
        }
        info!(connection_id = %conn.id, user_id = conn.identity.user_id, "connection closed");
    }

    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) {
        let mut admitted = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let (endpoint, identity) = self.admit(request)?;
            admitted = Some((endpoint, identity));
            Ok(response)
        };
        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let Some((endpoint, identity)) = admitted else {
            return;
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let mut conn = match self.open(identity, endpoint, tx).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer, error = %e, "could not bind connection");
                let frame = ServerMessage::error(e.to_string());
                let _ = ws_sender.send(WsMessage::Text(frame.to_json().into())).await;
                let _ = ws_sender.close().await;
                return;
            }
        };

        let writer_gone = Arc::new(Notify::new());
        {
            let connection_id = conn.id.clone();
            let writer_gone = writer_gone.clone();

            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    let closing = matches!(msg, WsMessage::Close(_));
                    if let Err(e) = ws_sender.send(msg).await {
                        debug!(%connection_id, error = %e, "failed to write to socket");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                writer_gone.notify_one();
                debug!(%connection_id, "send loop closed");
            });
        }

        loop {
            let frame = tokio::select! {
                _ = writer_gone.notified() => break,
                frame = ws_receiver.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => self.handle_text(&mut conn, text.as_str()).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %conn.id, error = %e, "socket read failed");
                    break;
                }
            }
        }

        self.close(&mut conn).await;
    }
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

/// Token from `?token=` or, failing that, `Authorization: Bearer`.
fn bearer_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    });
    from_query.or_else(|| {
        request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
    })
}

/// Bind `addr` and serve until the listener fails.
pub async fn start_websocket_server(addr: &str, gateway: Gateway) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, gateway).await
}

/// Serve sockets accepted from an already bound listener.
pub async fn serve(listener: TcpListener, gateway: Gateway) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "WebSocket gateway listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway.handle_socket(stream, peer).await;
        });
    }
}

//! The `transport` module is responsible for the socket side of the bridge.
//!
//! It defines the frames exchanged with clients and implements the WebSocket
//! gateway itself: upgrade-time authentication, per-connection broker
//! bindings, relaying broker deliveries to sockets and publishing socket
//! messages back onto the broker.

pub mod message;
pub mod websocket;

pub use websocket::{Gateway, serve, start_websocket_server};

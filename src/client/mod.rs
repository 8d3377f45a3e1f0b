//! The `client` module defines the gateway's view of a connected socket.
//!
//! It provides the `Connection` record, which encapsulates the identity of
//! the user behind the socket, the channel for sending frames to it and the
//! broker relays it owns.

pub mod connection;
pub mod relay;

pub use connection::{Connection, DiscussionBinding, Endpoint};
pub use relay::Relay;

#[cfg(test)]
mod tests;

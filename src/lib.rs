//! # mentorbridge
//!
//! `mentorbridge` is the realtime pub/sub bridge of a mentorship Q&A
//! platform. It sits between browsers connected over WebSockets and an AMQP
//! broker, and runs the workers that answer "ask the AI" requests.
//!
//! ## Core Modules
//!
//! - `broker`: broker client abstraction (AMQP via lapin, or in-memory),
//!   the broker topology and the message envelopes.
//! - `worker`: the AI worker consuming the AI-question queue.
//! - `transport`: the WebSocket gateway (`/chat` and `/discussions`).
//! - `client`: per-socket connection records and broker relays.
//! - `auth`, `community`, `llm`, `persistence`: collaborators behind traits
//!   (token verification, membership lookup, language model, AI log).
//! - `config`: layered settings loading.
//! - `utils`: logging, errors and backoff.

pub mod auth;
pub mod broker;
pub mod client;
pub mod community;
pub mod config;
pub mod llm;
pub mod persistence;
pub mod transport;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod test_support;

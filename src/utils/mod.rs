//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `mentorbridge` application.
//!
//! This module centralizes reusable components such as the error types, the
//! tracing setup and the reconnect backoff policy.

pub mod backoff;
pub mod error;
pub mod logging;

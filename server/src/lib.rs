//! Plaza server library.
//!
//! Peer registry, positions tick, signal relay and the websocket session
//! handler, exposed for the binaries and integration tests.

pub mod broadcaster;
pub mod config;
pub mod hub;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod ws;

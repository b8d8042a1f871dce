//! Client library for the plaza.
//!
//! The session logic is transport-agnostic and free of I/O: feed it server
//! messages and media-transport callbacks, then drain what it wants sent.
//! [`connection::ServerConnection`] provides a ready-made websocket link.

pub mod connection;
pub mod handshake;
pub mod interpolator;
pub mod lifecycle;
pub mod session;

pub use session::{ClientEvent, ClientSession};

//! Types shared between the plaza server and its clients.
//!
//! Everything that crosses the websocket lives here so both ends agree on
//! the JSON shape. TypeScript bindings for the browser client are exported
//! with `ts-rs`.

pub mod config;
pub mod peer_id;
pub mod pose;
pub mod protocol;

pub use peer_id::PeerId;

use std::time::Duration;

/// Period of the server's positions broadcast.
pub const NETWORK_TICK: Duration = Duration::from_millis(100);

/// Spawn point for freshly connected peers.
pub const SPAWN_POSITION: [f64; 3] = [0.0, 0.5, 0.0];

/// Identity quaternion, XYZW order.
pub const IDENTITY_ROTATION: [f64; 4] = [0.0, 0.0, 0.0, 1.0];

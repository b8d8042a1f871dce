use plaza_shared::config::WorldConfig;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Positions broadcasts per second
    pub tick_rate_hz: u32,
    pub max_connections: usize,
    /// Larger text frames close the session
    pub max_message_bytes: usize,
    /// Excess moves are dropped, the session stays open
    pub max_moves_per_sec: u32,
    /// Display names are "<prefix> <n>"
    pub name_prefix: String,
    /// Directory served for non-websocket requests, if any
    pub static_dir: Option<String>,
    pub world: WorldConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            tick_rate_hz: 10,
            max_connections: 256,
            max_message_bytes: 64 * 1024,
            max_moves_per_sec: 30,
            name_prefix: "User".to_string(),
            static_dir: Some("public".to_string()),
            world: WorldConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, overridden by `PORT` and `PLAZA_STATIC_DIR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("PORT") {
            config.listen_addr = format!("0.0.0.0:{}", port.trim());
        }
        if let Ok(dir) = std::env::var("PLAZA_STATIC_DIR") {
            config.static_dir = if dir.is_empty() { None } else { Some(dir) };
        }
        config
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate_hz.max(1)))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("listen_addr {:?} is not a socket address", self.listen_addr));
        }
        if self.tick_rate_hz == 0 || self.tick_rate_hz > 1000 {
            return Err("tick_rate_hz must be in 1..=1000".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.max_message_bytes < 256 {
            return Err("max_message_bytes must be >= 256".to_string());
        }
        if self.max_moves_per_sec == 0 {
            return Err("max_moves_per_sec must be > 0".to_string());
        }
        self.world.validate()
    }
}

//! Runtime configuration for the authority.

use std::time::Duration;

/// Human inputs applied per client per tick; the rest wait for later ticks.
pub const MAX_INPUTS_PER_TICK: usize = 8;
/// Inputs buffered per client before new ones are dropped.
pub const MAX_BUFFERED_INPUTS: usize = 64;
/// Outgoing snapshots queued before further ones are dropped.
pub const SNAPSHOT_QUEUE_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub bot_count: usize,
    pub world_seed: u64,
    /// How long a silent or disconnected player's tank survives.
    pub reconnect_grace: Duration,
    /// Silence after which a client counts as disconnected.
    pub client_timeout: Duration,
    pub resend_interval: Duration,
    pub interest_enter_deg: f64,
    pub interest_leave_deg: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tick_rate: 20,
            max_clients: 32,
            bot_count: 48,
            world_seed: 1,
            reconnect_grace: Duration::from_secs(10),
            client_timeout: Duration::from_secs(5),
            resend_interval: Duration::from_millis(200),
            interest_enter_deg: 35.0,
            interest_leave_deg: 45.0,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    /// Ticks between periodic stats lines.
    pub fn stats_every(&self) -> u32 {
        self.tick_rate.max(1) * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.stats_every(), 60);
        assert!(config.interest_leave_deg > config.interest_enter_deg);
    }
}

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a live session. Every field has a default, so a config file
/// only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveConfig {
    /// WebSocket URL of the signaling hub.
    pub hub_url: String,
    /// Base URL of the REST API used for room listings.
    pub api_base: String,
    pub access_token: Option<String>,
    pub keepalive_interval_ms: u64,
    pub health_interval_ms: u64,
    pub reaction_ttl_ms: u64,
    pub dedup_window: usize,
    pub max_video_bitrate_bps: u32,
    pub handshake_timeout_ms: u64,
    pub room_setup_timeout_ms: u64,
    /// Delays between automatic hub reconnect attempts; exhausted means closed.
    pub reconnect_delays_ms: Vec<u64>,
    pub max_rejoin_attempts: u32,
    pub ice_servers: Vec<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:5000/hubs/livestream".to_string(),
            api_base: "http://127.0.0.1:5000/api".to_string(),
            access_token: None,
            keepalive_interval_ms: 25_000,
            health_interval_ms: 30_000,
            reaction_ttl_ms: 3_000,
            dedup_window: 256,
            max_video_bitrate_bps: 1_500_000,
            handshake_timeout_ms: 10_000,
            room_setup_timeout_ms: 20_000,
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            max_rejoin_attempts: 3,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl LiveConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn reaction_ttl(&self) -> Duration {
        Duration::from_millis(self.reaction_ttl_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn room_setup_timeout(&self) -> Duration {
        Duration::from_millis(self.room_setup_timeout_ms)
    }

    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

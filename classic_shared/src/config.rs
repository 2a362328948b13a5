//! Configuration system.
//!
//! Loads server configuration from JSON strings/files. Every field has a
//! default, so a partial file only overrides what it names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rank::Rank;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Root server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name shown in the identification packet.
    pub name: String,
    pub motd: String,
    /// Listen address, e.g. `0.0.0.0`.
    pub ip: String,
    pub port: u16,
    /// Listen backlog passed to `listen(2)`.
    pub backlog: u32,
    pub default_world: String,
    pub default_rank: String,
    /// Check verification keys against the salted MD5 digest.
    pub verify_names: bool,
    /// Time allowed between accept and a completed login.
    pub login_timeout_ms: u64,
    pub max_players: usize,
    /// Interval between keep-alive pings to spawned players.
    pub ping_interval_ms: u64,
    /// Autosave period for loaded worlds; 0 disables autosave.
    pub save_interval_secs: u64,
    pub tcp_no_delay: bool,
    /// Directory holding `<name>.world` files.
    pub worlds_dir: PathBuf,
    /// Ranks registered at startup in addition to the default rank.
    pub ranks: Vec<Rank>,
    /// Player name to rank name.
    pub player_ranks: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Classic Server".to_string(),
            motd: "Welcome!".to_string(),
            ip: "0.0.0.0".to_string(),
            port: 25565,
            backlog: 50,
            default_world: "main".to_string(),
            default_rank: "guest".to_string(),
            verify_names: true,
            login_timeout_ms: 10_000,
            max_players: 64,
            ping_interval_ms: 1_000,
            save_interval_secs: 300,
            tcp_no_delay: true,
            worlds_dir: PathBuf::from("worlds"),
            ranks: Vec::new(),
            player_ranks: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// `ip:port` as configured.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn save_interval(&self) -> Option<Duration> {
        (self.save_interval_secs > 0).then(|| Duration::from_secs(self.save_interval_secs))
    }

    /// Path of the file backing the named world.
    pub fn world_path(&self, world: &str) -> PathBuf {
        self.worlds_dir.join(format!("{world}.world"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = ServerConfig::from_json_str(r#"{ "port": 4000, "verify_names": false }"#).unwrap();
        assert_eq!(cfg.port, 4000);
        assert!(!cfg.verify_names);
        assert_eq!(cfg.default_world, "main");
        assert_eq!(cfg.listen_addr(), "0.0.0.0:4000");
    }

    #[test]
    fn ranks_and_player_mapping_parse() {
        let cfg = ServerConfig::from_json_str(
            r#"{
                "ranks": [{ "name": "admin", "color": "c", "permission_level": 100, "operator": true }],
                "player_ranks": { "Notch": "admin" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.ranks.len(), 1);
        assert!(cfg.ranks[0].operator);
        assert_eq!(cfg.player_ranks.get("Notch").map(String::as_str), Some("admin"));
    }

    #[test]
    fn zero_save_interval_disables_autosave() {
        let cfg = ServerConfig {
            save_interval_secs: 0,
            ..Default::default()
        };
        assert!(cfg.save_interval().is_none());
        assert_eq!(cfg.world_path("main"), PathBuf::from("worlds/main.world"));
    }
}

//! Configuration loading and persistence.
//!
//! Reads `config.json` from the convo-sync config directory and applies
//! `CONVO_SYNC_*` environment overrides. The bearer token is never written
//! to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::backoff::Backoff;
use crate::constants;
use crate::session::SessionSettings;
use crate::transport::{ConnectionSettings, Credentials};

const CONFIG_FILE: &str = "config.json";

/// Configuration for the convo-sync client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// WebSocket endpoint of the chat backend.
    pub server_url: String,
    /// Bearer token - NOT serialized to disk (from `CONVO_SYNC_TOKEN`).
    #[serde(skip)]
    pub token: String,
    /// Identity stamped on locally sent messages.
    pub sender_id: String,
    /// Delay before the first reconnection attempt.
    pub backoff_initial_ms: u64,
    /// Cap for the exponential reconnection delay.
    pub backoff_max_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub backoff_jitter_ms: u64,
    /// How long a send waits for its ack before it is marked failed.
    pub send_timeout_ms: u64,
    /// Inbound silence before the channel is considered dead. 0 disables.
    pub stale_timeout_secs: u64,
    /// Enables best-effort matching of echoes that lack `clientMessageId`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo_match_window_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: constants::DEFAULT_SERVER_URL.to_string(),
            token: String::new(),
            sender_id: "me".to_string(),
            backoff_initial_ms: duration_ms(constants::BACKOFF_INITIAL),
            backoff_max_ms: duration_ms(constants::BACKOFF_MAX),
            backoff_jitter_ms: duration_ms(constants::BACKOFF_JITTER),
            send_timeout_ms: duration_ms(constants::SEND_ACK_TIMEOUT),
            stale_timeout_secs: constants::CONNECTION_STALE_TIMEOUT.as_secs(),
            echo_match_window_ms: None,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CONVO_SYNC_CONFIG_DIR` overrides the platform config directory
    /// (Linux: `~/.config/convo-sync`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CONVO_SYNC_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("convo-sync")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir` without applying overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply `CONVO_SYNC_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("CONVO_SYNC_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(token) = lookup("CONVO_SYNC_TOKEN") {
            self.token = token;
        }

        if let Some(sender_id) = lookup("CONVO_SYNC_SENDER_ID") {
            self.sender_id = sender_id;
        }

        if let Some(timeout) = lookup("CONVO_SYNC_SEND_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.send_timeout_ms = ms,
                Err(_) => log::warn!("Ignoring invalid CONVO_SYNC_SEND_TIMEOUT_MS: {}", timeout),
            }
        }
    }

    /// Persists the current configuration to the config directory.
    /// Note: the token is NOT saved.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir/config.json`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Check if a bearer token is configured.
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Handshake credentials built from the token.
    pub fn credentials(&self) -> Credentials {
        if self.has_token() {
            Credentials::bearer_token(self.token.clone())
        } else {
            Credentials::default()
        }
    }

    /// Ack timeout for sends.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Transport tunables derived from this config.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            backoff: Backoff {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                jitter: Duration::from_millis(self.backoff_jitter_ms),
            },
            stale_timeout: (self.stale_timeout_secs > 0)
                .then(|| Duration::from_secs(self.stale_timeout_secs)),
        }
    }

    /// Session policy derived from this config.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            sender_id: self.sender_id.clone(),
            echo_match_window: self.echo_match_window_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_url, constants::DEFAULT_SERVER_URL);
        assert_eq!(config.backoff_initial_ms, 1000);
        assert_eq!(config.backoff_max_ms, 30_000);
        assert_eq!(config.send_timeout_ms, 10_000);
        assert!(config.echo_match_window_ms.is_none());
        assert!(!config.has_token());
    }

    #[test]
    fn test_config_serialization_excludes_token() {
        let config = Config {
            token: "secret_token".to_string(),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();

        assert!(!json.contains("secret_token"));
        assert!(!json.contains("\"token\""));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            server_url: "wss://chat.example.com/ws".to_string(),
            sender_id: "ana".to_string(),
            echo_match_window_ms: Some(2000),
            token: "dropped".to_string(),
            ..Config::default()
        };
        config.save_to(dir.path()).unwrap();

        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded.server_url, "wss://chat.example.com/ws");
        assert_eq!(loaded.sender_id, "ana");
        assert_eq!(loaded.echo_match_window_ms, Some(2000));
        assert!(loaded.token.is_empty());

        #[cfg(unix)]
        {
            let mode = fs::metadata(dir.path().join(CONFIG_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"sender_id":"bo"}"#).unwrap();
        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded.sender_id, "bo");
        assert_eq!(loaded.server_url, constants::DEFAULT_SERVER_URL);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(Config::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CONVO_SYNC_SERVER_URL", "ws://override/ws"),
            ("CONVO_SYNC_TOKEN", "tok"),
            ("CONVO_SYNC_SENDER_ID", "cy"),
            ("CONVO_SYNC_SEND_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.server_url, "ws://override/ws");
        assert_eq!(config.sender_id, "cy");
        assert_eq!(config.send_timeout(), Duration::from_millis(250));
        assert_eq!(config.credentials().bearer().as_deref(), Some("Bearer tok"));
    }

    #[test]
    fn test_invalid_timeout_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == "CONVO_SYNC_SEND_TIMEOUT_MS").then(|| "soon".to_string()));
        assert_eq!(config.send_timeout_ms, 10_000);
    }

    #[test]
    fn test_stale_timeout_zero_disables_check() {
        let config = Config {
            stale_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.connection_settings().stale_timeout.is_none());
        assert_eq!(
            Config::default().connection_settings().stale_timeout,
            Some(Duration::from_secs(45))
        );
    }
}

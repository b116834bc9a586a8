// Session configuration.
// Logging is on by default only in development builds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peer::types::{MediaRequest, ServerConfig};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Upper bound for a decompressed blob (zip-bomb guard).
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024;

/// Largest file a peer may announce. Received files are buffered in memory.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Empty means the default STUN pair.
    pub ice_servers: Vec<ServerConfig>,
    pub ice_gathering_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub chunk_size: usize,
    pub chunk_pacing_ms: u64,
    pub compression: bool,
    pub max_blob_bytes: usize,
    pub max_file_bytes: u64,
    /// What the session asks for when it acquires local media.
    pub media: MediaRequest,
    /// What capture devices the webrtc transport may hand out.
    pub capabilities: MediaRequest,
    pub download_dir: PathBuf,
    pub log: LogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_gathering_timeout_ms: 3_000,
            disconnect_grace_ms: 3_000,
            chunk_size: 16 * 1024,
            chunk_pacing_ms: 10,
            compression: true,
            max_blob_bytes: MAX_DECOMPRESSED_SIZE,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            media: MediaRequest::audio_video(),
            capabilities: MediaRequest::audio_video(),
            download_dir: PathBuf::from("downloads"),
            log: LogConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// Filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            level: "info".into(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::Config(format!(
                    "ICE server '{}' has an empty URL",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::Config(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.max_blob_bytes == 0 {
            return Err(Error::Config("max_blob_bytes must be positive".into()));
        }
        if self.max_file_bytes == 0 {
            return Err(Error::Config("max_file_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_size, 16384);
        assert_eq!(config.ice_gathering_timeout(), Duration::from_secs(3));
        assert_eq!(config.disconnect_grace(), Duration::from_secs(3));
        assert!(config.compression);
        assert_eq!(config.max_file_bytes, DEFAULT_MAX_FILE_BYTES);
    }

    #[test]
    fn zero_file_limit_is_rejected() {
        let err = SessionConfig::from_toml_str("max_file_bytes = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            disconnect_grace_ms = 5000
            [media]
            audio = true
            video = false
            "#,
        )
        .unwrap();
        assert_eq!(config.disconnect_grace(), Duration::from_secs(5));
        assert_eq!(config.ice_gathering_timeout_ms, 3_000);
        assert!(!config.media.video);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = SessionConfig::from_toml_str(
            r#"
            [[ice_servers]]
            id = "relay"
            type = "turn"
            url = "turn.example.org:3478"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(SessionConfig::from_toml_str("chunk_size = 0").is_err());
    }
}

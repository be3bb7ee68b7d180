//! Configuration system for Spool.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SPOOL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/spool/config.toml
//!   3. ~/.config/spool/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::MAX_DATA_LEN;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub transfer: TransferSettings,
    pub engine: EngineSettings,
    pub server: ServerSettings,
}

/// Per-transfer protocol parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Largest data payload this side sends or accepts. Clamped to the window.
    pub max_chunk_size_bytes: u32,
    /// Credit a receiver grants at a time. Must be non-zero.
    pub window_bytes: u32,
    /// Extend the window once remaining credit drops below this fraction.
    pub window_low_water_ratio: f64,
    /// Pacing hint a receiver asks its transmitter for. 0 = unpaced.
    pub min_delay_micros: u32,
    /// Base time to wait for the peer before retrying.
    pub session_timeout_ms: u64,
    /// Consecutive timeouts tolerated before the transfer fails.
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    /// Upper bound on a backed-off timeout.
    pub max_backoff_ms: u64,
    /// How long a finished transfer keeps answering stray chunks.
    pub linger_ms: u64,
}

/// Per-connection engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_concurrent_transfers: usize,
    /// Blocking threads that may touch resources at once.
    pub io_workers: usize,
    /// Frames buffered towards the transport.
    pub outbound_queue: usize,
    /// Treat chunks of an unknown type as DATA instead of dropping them.
    pub unknown_type_as_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
    /// Resources served to peers, by id.
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub id: u32,
    pub path: PathBuf,
    /// Peers may write to this resource.
    #[serde(default)]
    pub writable: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: 4096,
            window_bytes: 32 * 1024,
            window_low_water_ratio: 0.5,
            min_delay_micros: 0,
            session_timeout_ms: 2_000,
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            linger_ms: 5_000,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 16,
            io_workers: 4,
            outbound_queue: 64,
            unknown_type_as_data: true,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7420".to_string(),
            resources: Vec::new(),
        }
    }
}

impl TransferSettings {
    /// Chunk size actually used: never larger than the window or the wire cap.
    pub fn effective_max_chunk_size(&self) -> u32 {
        self.max_chunk_size_bytes
            .min(self.window_bytes)
            .min(MAX_DATA_LEN)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_micros(self.min_delay_micros.into())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("spool")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SpoolConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SpoolConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SPOOL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SpoolConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.window_bytes == 0 {
            return Err(invalid("transfer.window_bytes", "must be non-zero"));
        }
        if t.max_chunk_size_bytes == 0 {
            return Err(invalid("transfer.max_chunk_size_bytes", "must be non-zero"));
        }
        if !(0.0..1.0).contains(&t.window_low_water_ratio) {
            return Err(invalid(
                "transfer.window_low_water_ratio",
                format!("{} is outside [0, 1)", t.window_low_water_ratio),
            ));
        }
        if !(t.backoff_multiplier >= 1.0 && t.backoff_multiplier.is_finite()) {
            return Err(invalid(
                "transfer.backoff_multiplier",
                format!("{} is below 1", t.backoff_multiplier),
            ));
        }
        if t.session_timeout_ms == 0 {
            return Err(invalid("transfer.session_timeout_ms", "must be non-zero"));
        }
        let e = &self.engine;
        if e.io_workers == 0 {
            return Err(invalid("engine.io_workers", "must be non-zero"));
        }
        if e.outbound_queue == 0 {
            return Err(invalid("engine.outbound_queue", "must be non-zero"));
        }
        Ok(())
    }

    /// Apply SPOOL_SECTION__KEY overrides from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(value: Option<String>, slot: &mut T) {
            if let Some(v) = value.and_then(|v| v.parse().ok()) {
                *slot = v;
            }
        }

        let t = &mut self.transfer;
        parse(lookup("SPOOL_TRANSFER__MAX_CHUNK_SIZE_BYTES"), &mut t.max_chunk_size_bytes);
        parse(lookup("SPOOL_TRANSFER__WINDOW_BYTES"), &mut t.window_bytes);
        parse(lookup("SPOOL_TRANSFER__WINDOW_LOW_WATER_RATIO"), &mut t.window_low_water_ratio);
        parse(lookup("SPOOL_TRANSFER__MIN_DELAY_MICROS"), &mut t.min_delay_micros);
        parse(lookup("SPOOL_TRANSFER__SESSION_TIMEOUT_MS"), &mut t.session_timeout_ms);
        parse(lookup("SPOOL_TRANSFER__MAX_RETRIES"), &mut t.max_retries);
        parse(lookup("SPOOL_TRANSFER__BACKOFF_MULTIPLIER"), &mut t.backoff_multiplier);
        parse(lookup("SPOOL_TRANSFER__MAX_BACKOFF_MS"), &mut t.max_backoff_ms);
        parse(lookup("SPOOL_TRANSFER__LINGER_MS"), &mut t.linger_ms);

        let e = &mut self.engine;
        parse(lookup("SPOOL_ENGINE__MAX_CONCURRENT_TRANSFERS"), &mut e.max_concurrent_transfers);
        parse(lookup("SPOOL_ENGINE__IO_WORKERS"), &mut e.io_workers);
        parse(lookup("SPOOL_ENGINE__OUTBOUND_QUEUE"), &mut e.outbound_queue);
        if let Some(v) = lookup("SPOOL_ENGINE__UNKNOWN_TYPE_AS_DATA") {
            e.unknown_type_as_data = v == "true" || v == "1";
        }

        if let Some(v) = lookup("SPOOL_SERVER__LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

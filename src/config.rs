// Configuration management for autotake

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::recording::TakeSettings;

/// Recorder configuration. Read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory where takes are written
    pub storage_path: PathBuf,

    /// Substrings matched against audio and MIDI device names
    pub device_patterns: Vec<String>,

    /// Peak amplitude a block must exceed to count as activity
    pub trigger_threshold: u16,

    /// Idle seconds at or below which a take starts, above which it stops
    pub max_idle_secs: f64,

    /// Longest single take in seconds
    pub max_take_secs: f64,

    /// Requested frames per audio block
    pub chunk_frames: u32,

    /// Seconds between watchdog checks
    pub watchdog_interval_secs: u64,

    /// Blocks the writer thread may fall behind before blocks are dropped
    pub writer_queue_blocks: usize,

    /// How often the open take's header is brought up to date
    pub flush_interval_ms: u64,

    /// Repair takes left unfinished by a previous run
    pub recover_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: get_default_storage_path(),
            device_patterns: Vec::new(),
            trigger_threshold: 10,
            max_idle_secs: 2.0,
            max_take_secs: 10.0,
            chunk_frames: 4096,
            watchdog_interval_secs: 2,
            writer_queue_blocks: 256,
            flush_interval_ms: 1000,
            recover_on_start: true,
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config {}: {}", config_path.display(), e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file {}: {}", config_path.display(), e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    /// Reject values the recorder cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_patterns.is_empty() {
            anyhow::bail!("at least one device pattern is required");
        }
        if !(self.max_idle_secs.is_finite() && self.max_idle_secs > 0.0) {
            anyhow::bail!("max_idle_secs must be positive, got {}", self.max_idle_secs);
        }
        if !(self.max_take_secs.is_finite() && self.max_take_secs > 0.0) {
            anyhow::bail!("max_take_secs must be positive, got {}", self.max_take_secs);
        }
        if self.chunk_frames == 0 {
            anyhow::bail!("chunk_frames must be non-zero");
        }
        if self.watchdog_interval_secs == 0 {
            anyhow::bail!("watchdog_interval_secs must be non-zero");
        }
        if self.writer_queue_blocks == 0 {
            anyhow::bail!("writer_queue_blocks must be non-zero");
        }
        if self.flush_interval_ms == 0 {
            anyhow::bail!("flush_interval_ms must be non-zero");
        }
        Ok(())
    }

    pub fn take_settings(&self) -> TakeSettings {
        TakeSettings {
            trigger_threshold: self.trigger_threshold,
            max_idle_secs: self.max_idle_secs,
            max_take_secs: self.max_take_secs,
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Get the default storage path for takes
fn get_default_storage_path() -> PathBuf {
    dirs::audio_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Music")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("autotake")
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("autotake")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config: Config = toml::from_str(
            r#"
            device_patterns = ["Scarlett"]
            max_take_secs = 30.0
            "#,
        )
        .unwrap();
        assert_eq!(config.device_patterns, vec!["Scarlett".to_string()]);
        assert_eq!(config.max_take_secs, 30.0);
        assert_eq!(config.trigger_threshold, 10);
        assert_eq!(config.max_idle_secs, 2.0);
        assert_eq!(config.chunk_frames, 4096);
        assert!(config.recover_on_start);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.storage_path = dir.path().join("takes");
        config.device_patterns = vec!["Piano".into(), "USB Audio".into()];
        config.trigger_threshold = 40;

        config.save(&path).unwrap();
        assert_eq!(Config::load_or_default(&path), config);
    }

    #[test]
    fn unreadable_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_idle_secs = \"soon\"").unwrap();
        assert_eq!(Config::load_or_default(&path), Config::default());
        assert_eq!(Config::load_or_default(&dir.path().join("absent.toml")), Config::default());
    }

    #[test]
    fn validation() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.device_patterns = vec!["Scarlett".into()];
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.max_idle_secs = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.max_take_secs = f64::NAN;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.chunk_frames = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn take_settings_follow_config() {
        let config = Config {
            trigger_threshold: 25,
            max_idle_secs: 4.0,
            max_take_secs: 60.0,
            ..Config::default()
        };
        let settings = config.take_settings();
        assert_eq!(settings.trigger_threshold, 25);
        assert_eq!(settings.max_idle_secs, 4.0);
        assert_eq!(settings.max_take_secs, 60.0);
    }
}

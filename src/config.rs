//! User-facing settings, persisted as JSON.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Runtime settings shared between the request path and the playback driver.
pub type SharedConfig = Arc<RwLock<ClientConfig>>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

/// How many CPU threads each engine instance may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    Single,
    #[default]
    Half,
    All,
}

impl ThreadMode {
    pub fn thread_count(self) -> usize {
        self.thread_count_for(num_cpus::get())
    }

    pub fn thread_count_for(self, available: usize) -> usize {
        match self {
            ThreadMode::Single => 1,
            ThreadMode::Half => (available / 2).max(1),
            ThreadMode::All => available.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Multiplier applied to every synthesized sample before PCM conversion.
    pub base_volume: f32,
    /// Minimum interval between position refreshes of a remote speaker.
    pub position_refresh_ms: u64,
    /// Replace overlong messages with a short fallback line.
    pub avoid_long_messages: bool,
    /// Play the local player's own messages back to them.
    pub hear_self: bool,
    pub voice_id: i32,
    pub player_pitch: f32,
    /// Remote requests farther away than this are dropped before synthesis.
    pub hearing_range: u32,
    pub thread_mode: ThreadMode,
    /// Upper bound on pooled speaker slots (and engine instances).
    pub max_speakers: usize,
    /// Distance at which a remote voice plays at full volume.
    pub zero_distance: f32,
    /// Distance beyond which a remote voice is silent.
    pub max_distance: f32,
    pub debug_requests: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_volume: 2.0,
            position_refresh_ms: 500,
            avoid_long_messages: false,
            hear_self: true,
            voice_id: 0,
            player_pitch: 1.0,
            hearing_range: 60,
            thread_mode: ThreadMode::Half,
            max_speakers: 4,
            zero_distance: 2.0,
            max_distance: 35.0,
            debug_requests: false,
        }
    }
}

impl ClientConfig {
    /// Load settings from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&content)?;
        Ok(config.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Clamp every user-tunable value into its supported range.
    pub fn sanitized(mut self) -> Self {
        self.base_volume = self.base_volume.clamp(0.5, 3.5);
        self.position_refresh_ms = self.position_refresh_ms.clamp(50, 2000);
        self.voice_id = self.voice_id.clamp(0, 999);
        self.player_pitch = self.player_pitch.clamp(0.6, 1.6);
        self.hearing_range = self.hearing_range.clamp(40, 150);
        self.max_speakers = self.max_speakers.clamp(2, 32);
        self.zero_distance = self.zero_distance.max(0.0);
        self.max_distance = self.max_distance.max(self.zero_distance);
        self
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientConfig, ThreadMode};

    #[test]
    fn thread_modes_map_to_counts() {
        assert_eq!(ThreadMode::Single.thread_count_for(16), 1);
        assert_eq!(ThreadMode::Half.thread_count_for(16), 8);
        assert_eq!(ThreadMode::Half.thread_count_for(1), 1);
        assert_eq!(ThreadMode::All.thread_count_for(16), 16);
        assert_eq!(ThreadMode::All.thread_count_for(0), 1);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ClientConfig::load(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let config = ClientConfig {
            voice_id: 3,
            max_speakers: 6,
            thread_mode: ThreadMode::All,
            ..ClientConfig::default()
        };
        config.save(&path).expect("save");
        assert_eq!(ClientConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn partial_file_fills_defaults_and_clamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "max_speakers": 100, "base_volume": 0.1 }"#).expect("write");

        let config = ClientConfig::load(&path).expect("load");
        assert_eq!(config.max_speakers, 32);
        assert_eq!(config.base_volume, 0.5);
        assert_eq!(config.position_refresh_ms, 500);
        assert!(config.hear_self);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").expect("write");
        assert!(ClientConfig::load(&path).is_err());
    }
}

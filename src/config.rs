//! Configuration for scribed.
//!
//! Two layers: [`Config`] is the TOML file loaded at startup (`[audio]`,
//! `[stt]`, `[daemon]` sections), [`SessionConfig`] is the runtime slice a
//! client can replace through the `configure` command. The daemon builds its
//! initial `SessionConfig` from the file and applies [`SessionUpdate`]
//! patches atomically between recordings.

use crate::defaults;
use crate::error::{Result, ScribedError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure (TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub stt: SttConfig,
    pub daemon: DaemonConfig,
}

/// Audio capture and segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub silence_threshold: f32,
    /// Silence run (seconds) that ends a chunk.
    pub vad_silence_duration: f64,
    /// Hard cap on chunk length (seconds).
    pub vad_max_duration: f64,
    /// Chunks with a shorter voiced span are discarded.
    pub min_chunk_duration: f64,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SttConfig {
    pub model: String,
    /// Language code; None lets the model auto-detect.
    pub language: Option<String>,
    /// Directory holding ggml model files. Defaults to the XDG data dir.
    pub model_dir: Option<PathBuf>,
}

/// Daemon lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Socket path override (default: $XDG_RUNTIME_DIR/scribed.sock).
    pub socket: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            silence_threshold: defaults::SILENCE_THRESHOLD,
            vad_silence_duration: defaults::VAD_SILENCE_SECS,
            vad_max_duration: defaults::VAD_MAX_SECS,
            min_chunk_duration: defaults::MIN_CHUNK_SECS,
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_MODEL.to_string(),
            language: None,
            model_dir: None,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: None,
            startup_timeout_secs: defaults::STARTUP_TIMEOUT.as_secs(),
            shutdown_grace_secs: defaults::SHUTDOWN_GRACE.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if the file is missing.
    ///
    /// Only a missing file yields defaults; invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(ScribedError::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - SCRIBED_MODEL → stt.model
    /// - SCRIBED_LANGUAGE → stt.language
    /// - SCRIBED_AUDIO_DEVICE → audio.device
    /// - SCRIBED_SOCKET → daemon.socket
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("SCRIBED_MODEL")
            && !model.is_empty()
        {
            self.stt.model = model;
        }

        if let Ok(language) = std::env::var("SCRIBED_LANGUAGE")
            && !language.is_empty()
        {
            self.stt.language = Some(language);
        }

        if let Ok(device) = std::env::var("SCRIBED_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        if let Ok(socket) = std::env::var("SCRIBED_SOCKET")
            && !socket.is_empty()
        {
            self.daemon.socket = Some(PathBuf::from(socket));
        }

        self
    }

    /// Get the default configuration file path.
    ///
    /// Returns ~/.config/scribed/config.toml on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .expect("Could not determine config directory")
            .join("scribed")
            .join("config.toml")
    }

    /// Build the initial runtime session configuration from the file config.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            model: self.stt.model.clone(),
            language: self.stt.language.clone(),
            silence_threshold: self.audio.silence_threshold,
            vad_silence_duration: self.audio.vad_silence_duration,
            vad_max_duration: self.audio.vad_max_duration,
            chunk_duration: defaults::CHUNK_SECS,
            overlap_duration: defaults::OVERLAP_SECS,
        }
    }
}

/// Active recognition/segmentation settings, replaceable via `configure`.
///
/// Replaced atomically between recordings, never while a chunk is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub language: Option<String>,
    pub silence_threshold: f32,
    pub vad_silence_duration: f64,
    pub vad_max_duration: f64,
    /// Fixed chunk length for batch-mode file transcription.
    pub chunk_duration: f64,
    /// Chunk overlap for batch-mode file transcription.
    pub overlap_duration: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_MODEL.to_string(),
            language: None,
            silence_threshold: defaults::SILENCE_THRESHOLD,
            vad_silence_duration: defaults::VAD_SILENCE_SECS,
            vad_max_duration: defaults::VAD_MAX_SECS,
            chunk_duration: defaults::CHUNK_SECS,
            overlap_duration: defaults::OVERLAP_SECS,
        }
    }
}

/// Partial update carried by the `configure` command.
///
/// Absent fields leave the current value untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_silence_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_max_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap_duration: Option<f64>,
}

impl SessionUpdate {
    /// True when the update carries no fields at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl SessionConfig {
    /// Validate and apply a partial update.
    ///
    /// Returns whether the model changed (callers must reload the
    /// recognizer). Validation happens before any field is written, so a
    /// rejected update leaves the config untouched.
    pub fn apply(&mut self, update: &SessionUpdate) -> Result<bool> {
        if let Some(threshold) = update.silence_threshold
            && !(0.0..1.0).contains(&threshold)
        {
            return Err(ScribedError::ConfigInvalidValue {
                key: "silence_threshold".to_string(),
                message: format!("must be within [0, 1), got {}", threshold),
            });
        }

        for (key, value) in [
            ("vad_silence_duration", update.vad_silence_duration),
            ("vad_max_duration", update.vad_max_duration),
            ("chunk_duration", update.chunk_duration),
        ] {
            if let Some(secs) = value
                && secs <= 0.0
            {
                return Err(ScribedError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: format!("must be positive, got {}", secs),
                });
            }
        }

        if let Some(overlap) = update.overlap_duration
            && overlap < 0.0
        {
            return Err(ScribedError::ConfigInvalidValue {
                key: "overlap_duration".to_string(),
                message: format!("must not be negative, got {}", overlap),
            });
        }

        let model_changed = update
            .model
            .as_ref()
            .is_some_and(|model| *model != self.model);

        if let Some(model) = &update.model {
            self.model = model.clone();
        }
        if let Some(language) = &update.language {
            self.language = Some(language.clone());
        }
        if let Some(threshold) = update.silence_threshold {
            self.silence_threshold = threshold;
        }
        if let Some(secs) = update.vad_silence_duration {
            self.vad_silence_duration = secs;
        }
        if let Some(secs) = update.vad_max_duration {
            self.vad_max_duration = secs;
        }
        if let Some(secs) = update.chunk_duration {
            self.chunk_duration = secs;
        }
        if let Some(secs) = update.overlap_duration {
            self.overlap_duration = secs;
        }

        Ok(model_changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_scribed_env() {
        remove_env("SCRIBED_MODEL");
        remove_env("SCRIBED_LANGUAGE");
        remove_env("SCRIBED_AUDIO_DEVICE");
        remove_env("SCRIBED_SOCKET");
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();

        assert_eq!(config.audio.device, None);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.silence_threshold, 0.01);
        assert_eq!(config.audio.vad_silence_duration, 0.5);
        assert_eq!(config.audio.vad_max_duration, 30.0);

        assert_eq!(config.stt.model, "base");
        assert_eq!(config.stt.language, None);

        assert_eq!(config.daemon.socket, None);
        assert_eq!(config.daemon.startup_timeout_secs, 15);
        assert_eq!(config.daemon.shutdown_grace_secs, 5);
    }

    #[test]
    fn load_from_toml_file() {
        let toml_content = r#"
            [audio]
            device = "hw:0,0"
            silence_threshold = 0.05
            vad_silence_duration = 1.0
            vad_max_duration = 20.0

            [stt]
            model = "small"
            language = "de"

            [daemon]
            socket = "/run/user/1000/custom.sock"
            startup_timeout_secs = 30
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.audio.device, Some("hw:0,0".to_string()));
        assert_eq!(config.audio.silence_threshold, 0.05);
        assert_eq!(config.audio.vad_silence_duration, 1.0);
        assert_eq!(config.audio.vad_max_duration, 20.0);

        assert_eq!(config.stt.model, "small");
        assert_eq!(config.stt.language, Some("de".to_string()));

        assert_eq!(
            config.daemon.socket,
            Some(PathBuf::from("/run/user/1000/custom.sock"))
        );
        assert_eq!(config.daemon.startup_timeout_secs, 30);
    }

    #[test]
    fn load_partial_config_uses_defaults() {
        let toml_content = r#"
            [stt]
            model = "tiny"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.stt.model, "tiny");
        assert_eq!(config.audio.silence_threshold, 0.01);
        assert_eq!(config.daemon.startup_timeout_secs, 15);
    }

    #[test]
    fn env_override_model_and_socket() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_scribed_env();

        set_env("SCRIBED_MODEL", "tiny");
        set_env("SCRIBED_SOCKET", "/tmp/override.sock");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.stt.model, "tiny");
        assert_eq!(config.daemon.socket, Some(PathBuf::from("/tmp/override.sock")));
        assert_eq!(config.stt.language, None); // Not overridden

        clear_scribed_env();
    }

    #[test]
    fn env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_scribed_env();

        set_env("SCRIBED_MODEL", "");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.stt.model, "base");

        clear_scribed_env();
    }

    #[test]
    fn invalid_toml_returns_error() {
        let invalid_toml = r#"
            [audio
            device = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_scribed_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn session_mirrors_file_config() {
        let mut config = Config::default();
        config.stt.model = "medium".to_string();
        config.audio.silence_threshold = 0.02;

        let session = config.session();
        assert_eq!(session.model, "medium");
        assert_eq!(session.silence_threshold, 0.02);
        assert_eq!(session.chunk_duration, 5.0);
    }

    #[test]
    fn apply_update_changes_only_present_fields() {
        let mut session = SessionConfig::default();
        let update = SessionUpdate {
            silence_threshold: Some(0.03),
            ..Default::default()
        };

        let model_changed = session.apply(&update).unwrap();
        assert!(!model_changed);
        assert_eq!(session.silence_threshold, 0.03);
        assert_eq!(session.model, "base");
        assert_eq!(session.vad_silence_duration, 0.5);
    }

    #[test]
    fn apply_update_reports_model_change() {
        let mut session = SessionConfig::default();

        let same = SessionUpdate {
            model: Some("base".to_string()),
            ..Default::default()
        };
        assert!(!session.apply(&same).unwrap());

        let changed = SessionUpdate {
            model: Some("tiny".to_string()),
            ..Default::default()
        };
        assert!(session.apply(&changed).unwrap());
        assert_eq!(session.model, "tiny");
    }

    #[test]
    fn apply_rejects_out_of_range_threshold() {
        let mut session = SessionConfig::default();
        let update = SessionUpdate {
            silence_threshold: Some(1.5),
            model: Some("tiny".to_string()),
            ..Default::default()
        };

        let result = session.apply(&update);
        assert!(result.is_err());
        // Rejected update must not partially apply
        assert_eq!(session.model, "base");
        assert_eq!(session.silence_threshold, 0.01);
    }

    #[test]
    fn apply_rejects_non_positive_durations() {
        let mut session = SessionConfig::default();
        let update = SessionUpdate {
            vad_silence_duration: Some(0.0),
            ..Default::default()
        };
        assert!(session.apply(&update).is_err());

        let update = SessionUpdate {
            vad_max_duration: Some(-1.0),
            ..Default::default()
        };
        assert!(session.apply(&update).is_err());
    }

    #[test]
    fn session_update_json_field_names_match_wire_format() {
        let update: SessionUpdate =
            serde_json::from_str(r#"{"model":"tiny","silence_threshold":0.01}"#).unwrap();
        assert_eq!(update.model, Some("tiny".to_string()));
        assert_eq!(update.silence_threshold, Some(0.01));
        assert!(update.vad_silence_duration.is_none());
    }

    #[test]
    fn session_update_is_empty() {
        assert!(SessionUpdate::default().is_empty());
        let update = SessionUpdate {
            language: Some("en".to_string()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}

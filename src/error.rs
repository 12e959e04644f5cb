//! Error types for scribed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScribedError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    Capture { message: String },

    // Recognition errors
    #[error("Recognition model not found at {path}")]
    ModelNotFound { path: String },

    #[error("Recognition failed: {message}")]
    Recognition { message: String },

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection to daemon failed: {message}")]
    Connection { message: String },

    #[error("Socket error: {message}")]
    Socket { message: String },

    // Command rejected for the current service state
    #[error("{message}")]
    StateConflict { message: String },

    // Daemon lifecycle management errors (client side)
    #[error("Supervision error: {message}")]
    Supervision { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ScribedError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn config_invalid_value_display() {
        let error = ScribedError::ConfigInvalidValue {
            key: "silence_threshold".to_string(),
            message: "must be between 0 and 1".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for silence_threshold: must be between 0 and 1"
        );
    }

    #[test]
    fn audio_device_not_found_display() {
        let error = ScribedError::AudioDeviceNotFound {
            device: "default".to_string(),
        };
        assert_eq!(error.to_string(), "Audio device not found: default");
    }

    #[test]
    fn capture_display() {
        let error = ScribedError::Capture {
            message: "stream closed".to_string(),
        };
        assert_eq!(error.to_string(), "Audio capture failed: stream closed");
    }

    #[test]
    fn model_not_found_display() {
        let error = ScribedError::ModelNotFound {
            path: "/models/ggml-base.bin".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Recognition model not found at /models/ggml-base.bin"
        );
    }

    #[test]
    fn recognition_display() {
        let error = ScribedError::Recognition {
            message: "inference failed".to_string(),
        };
        assert_eq!(error.to_string(), "Recognition failed: inference failed");
    }

    #[test]
    fn protocol_display() {
        let error = ScribedError::Protocol {
            message: "invalid JSON".to_string(),
        };
        assert_eq!(error.to_string(), "Protocol error: invalid JSON");
    }

    #[test]
    fn connection_display() {
        let error = ScribedError::Connection {
            message: "refused".to_string(),
        };
        assert_eq!(error.to_string(), "Connection to daemon failed: refused");
    }

    #[test]
    fn state_conflict_display_is_bare_message() {
        let error = ScribedError::StateConflict {
            message: "Already recording".to_string(),
        };
        assert_eq!(error.to_string(), "Already recording");
    }

    #[test]
    fn supervision_display() {
        let error = ScribedError::Supervision {
            message: "daemon did not start".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Supervision error: daemon did not start"
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: ScribedError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: ScribedError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ScribedError>();
        assert_sync::<ScribedError>();
    }
}

//! scribed - continuous speech-to-text daemon
//!
//! A long-lived background process owns the loaded recognition model and the
//! microphone; clients drive it over a Unix-socket JSON protocol and receive
//! per-chunk transcriptions as they happen.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod daemon;
pub mod defaults;
pub mod error;
pub mod ipc;
pub mod pipeline;
pub mod stt;
pub mod supervisor;

// Core traits (source → segment → recognize)
pub use audio::source::FrameSource;
pub use stt::recognizer::Recognizer;

// Segmentation
pub use audio::segmenter::{AudioChunk, AudioFrame, CloseReason, VoiceActivitySegmenter};

// Pipeline
pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle, TranscriptionResult};

// Protocol
pub use ipc::protocol::{Command, Response, ServiceState, StreamMessage};

// Supervision
pub use supervisor::ProcessSupervisor;

// Error handling
pub use error::{Result, ScribedError};

// Config
pub use config::{Config, SessionConfig, SessionUpdate};

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.1+abc1234"` when the git hash is available, `"0.3.1"`
/// otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

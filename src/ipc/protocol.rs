//! JSON wire protocol between clients and the daemon.
//!
//! Newline-delimited, one object per line. Requests carry a `"command"` tag,
//! replies a `"status"` envelope, and unsolicited streaming messages a
//! `"type"` tag — so a client can always tell a reply from a stream message
//! by which field is present.

use crate::config::{SessionConfig, SessionUpdate};
use serde::{Deserialize, Serialize};

/// Service states as observed by clients.
///
/// The daemon's command path is the single owner; everyone else sees
/// snapshots via `get_status` and `state` stream messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Configuring,
    Recording,
    Draining,
    ShuttingDown,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Idle => "idle",
            ServiceState::Configuring => "configuring",
            ServiceState::Recording => "recording",
            ServiceState::Draining => "draining",
            ServiceState::ShuttingDown => "shutting_down",
        };
        write!(f, "{}", name)
    }
}

/// Commands sent by clients to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Replace parts of the active session configuration.
    Configure(SessionUpdate),
    /// Start the capture/recognition pipeline.
    StartRecording,
    /// Stop capturing; replies after the in-flight chunk has drained.
    StopRecording,
    /// Snapshot of state and active configuration.
    GetStatus,
    /// Opt this connection into the unsolicited result stream.
    Subscribe,
    /// Stop the daemon.
    Shutdown,
}

impl Command {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Machine-readable rejection categories, so front ends can distinguish
/// "command rejected" from "something broke" without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Command invalid for the current service state.
    StateConflict,
    /// Malformed or unparseable request.
    Protocol,
    /// Audio capture problem.
    Capture,
    /// Recognition backend problem.
    Recognition,
    /// Anything else.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Reply envelope: one per command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ServiceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<SessionConfig>,
}

impl Response {
    /// Plain acknowledgement.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            code: None,
            state: None,
            recording: None,
            model: None,
            config: None,
        }
    }

    /// `get_status` reply with the full snapshot.
    pub fn status_snapshot(
        state: ServiceState,
        model: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: "ok".to_string(),
            code: None,
            state: Some(state),
            recording: Some(state == ServiceState::Recording),
            model: Some(model.into()),
            config: Some(config),
        }
    }

    /// Generic failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            code: Some(ErrorCode::Internal),
            state: None,
            recording: None,
            model: None,
            config: None,
        }
    }

    /// Failure with a specific category.
    pub fn error_with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::error(message)
        }
    }

    /// Command rejected for the current service state.
    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::error_with_code(ErrorCode::StateConflict, message)
    }

    /// True for success replies.
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Unsolicited daemon → client messages, streamed while recording and on
/// lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// One recognized chunk, in capture order.
    Transcription {
        sequence: u64,
        text: String,
        start: f64,
        end: f64,
        transcription_time: f64,
    },
    /// A chunk whose recognition failed; the recording continues.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        message: String,
    },
    /// Service state change (recording stopped, capture lost, ...).
    State {
        state: ServiceState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The daemon is going away; the connection closes after this.
    Shutdown { message: String },
}

impl StreamMessage {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

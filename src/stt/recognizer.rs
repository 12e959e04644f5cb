//! Recognizer trait and test double.

use crate::error::{Result, ScribedError};
use std::sync::Arc;

/// Timing for one recognized segment within a chunk, seconds relative to the
/// chunk start.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTiming {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Output of one chunk recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    /// Recognized text, whitespace-trimmed.
    pub text: String,
    /// Detected (or forced) language code, empty when unknown.
    pub language: String,
    /// Per-segment timings when the backend provides them.
    pub segments: Vec<SegmentTiming>,
}

/// Trait for speech-to-text recognition backends.
///
/// `recognize` blocks for the duration of one chunk's inference. The pipeline
/// guarantees it is never invoked concurrently within one service instance,
/// so implementations need no reentrancy beyond `Send + Sync`.
pub trait Recognizer: Send + Sync {
    /// Recognize one chunk of 16kHz mono PCM.
    fn recognize(&self, audio: &[i16]) -> Result<Recognition>;

    /// Name of the loaded model.
    fn model_name(&self) -> &str;

    /// Whether the backend is ready to serve.
    fn is_ready(&self) -> bool;
}

/// Implement Recognizer for Arc<T> so one loaded model is shared across
/// recordings.
impl<T: Recognizer> Recognizer for Arc<T> {
    fn recognize(&self, audio: &[i16]) -> Result<Recognition> {
        (**self).recognize(audio)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Mock recognizer for testing.
#[derive(Debug, Clone)]
pub struct MockRecognizer {
    model_name: String,
    response: String,
    language: String,
    should_fail: bool,
}

impl MockRecognizer {
    /// Create a new mock recognizer with default settings.
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            response: "mock transcription".to_string(),
            language: "en".to_string(),
            should_fail: false,
        }
    }

    /// Configure the mock to return a specific response.
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the detected language.
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    /// Configure the mock to fail on recognize.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl Recognizer for MockRecognizer {
    fn recognize(&self, audio: &[i16]) -> Result<Recognition> {
        if self.should_fail {
            return Err(ScribedError::Recognition {
                message: "mock recognition failure".to_string(),
            });
        }

        let end = audio.len() as f64 / crate::defaults::SAMPLE_RATE as f64;
        Ok(Recognition {
            text: self.response.clone(),
            language: self.language.clone(),
            segments: vec![SegmentTiming {
                start: 0.0,
                end,
                text: self.response.clone(),
            }],
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        !self.should_fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_returns_configured_response() {
        let recognizer = MockRecognizer::new("test-model").with_response("hello world");

        let result = recognizer.recognize(&vec![0i16; 16000]).unwrap();
        assert_eq!(result.text, "hello world");
        assert_eq!(result.language, "en");
        assert_eq!(result.segments.len(), 1);
        assert!((result.segments[0].end - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mock_failure_is_recognition_error() {
        let recognizer = MockRecognizer::new("test-model").with_failure();

        match recognizer.recognize(&vec![0i16; 100]) {
            Err(ScribedError::Recognition { message }) => {
                assert_eq!(message, "mock recognition failure");
            }
            _ => panic!("Expected Recognition error"),
        }
        assert!(!recognizer.is_ready());
    }

    #[test]
    fn mock_model_name_and_readiness() {
        let recognizer = MockRecognizer::new("whisper-base");
        assert_eq!(recognizer.model_name(), "whisper-base");
        assert!(recognizer.is_ready());
    }

    #[test]
    fn trait_is_object_safe() {
        let recognizer: Box<dyn Recognizer> =
            Box::new(MockRecognizer::new("test-model").with_response("boxed"));

        assert_eq!(recognizer.model_name(), "test-model");
        assert_eq!(recognizer.recognize(&[0i16; 10]).unwrap().text, "boxed");
    }

    #[test]
    fn arc_sharing_delegates() {
        let recognizer = Arc::new(MockRecognizer::new("shared").with_response("via arc"));
        let shared: &dyn Recognizer = &recognizer;
        assert_eq!(shared.model_name(), "shared");
        assert_eq!(shared.recognize(&[0i16; 10]).unwrap().text, "via arc");
    }
}

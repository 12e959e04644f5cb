//! Whisper-based recognition backend via whisper-rs.
//!
//! Requires the `whisper` feature (and cmake at build time). Without the
//! feature a stub with the same constructor is compiled so the daemon code
//! stays feature-free; its `recognize` reports an unavailable backend.

use crate::error::{Result, ScribedError};
use crate::stt::recognizer::{Recognition, Recognizer};
#[cfg(feature = "whisper")]
use crate::stt::recognizer::SegmentTiming;
use std::path::PathBuf;

#[cfg(feature = "whisper")]
use std::sync::{Mutex, Once};
#[cfg(feature = "whisper")]
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

#[cfg(feature = "whisper")]
static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Configuration for the Whisper recognizer.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Path to the ggml model file.
    pub model_path: PathBuf,
    /// Language code; None lets Whisper auto-detect.
    pub language: Option<String>,
    /// Number of inference threads (None = auto-detect).
    pub threads: Option<usize>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/ggml-base.bin"),
            language: None,
            threads: None,
        }
    }
}

/// Whisper recognizer.
///
/// The model is loaded once at construction and kept in memory for the
/// daemon's lifetime; one inference runs at a time (the pipeline's
/// sequential-recognition invariant), so a plain Mutex around the context is
/// enough.
#[cfg(feature = "whisper")]
pub struct WhisperRecognizer {
    context: Mutex<WhisperContext>,
    config: WhisperConfig,
    model_name: String,
}

#[cfg(feature = "whisper")]
impl std::fmt::Debug for WhisperRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperRecognizer")
            .field("config", &self.config)
            .field("model_name", &self.model_name)
            .field("context", &"<WhisperContext>")
            .finish()
    }
}

/// Stub recognizer compiled without the `whisper` feature.
#[cfg(not(feature = "whisper"))]
#[derive(Debug)]
pub struct WhisperRecognizer {
    config: WhisperConfig,
    model_name: String,
}

fn model_name_from_path(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(feature = "whisper")]
impl WhisperRecognizer {
    /// Load the model and set up the inference context.
    ///
    /// # Errors
    /// `ModelNotFound` when the file is missing, `Recognition` when loading
    /// fails.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        // Quiet whisper.cpp's stderr chatter (only once per process)
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        if !config.model_path.exists() {
            return Err(ScribedError::ModelNotFound {
                path: config.model_path.to_string_lossy().to_string(),
            });
        }

        let model_name = model_name_from_path(&config.model_path);

        let mut context_params = WhisperContextParameters::default();
        // Fused attention kernels avoid the standalone softmax CUDA kernel,
        // which crashes on Blackwell GPUs (sm_120) with ggml <= 1.7.6
        context_params.flash_attn(true);
        let context = WhisperContext::new_with_params(
            config
                .model_path
                .to_str()
                .ok_or_else(|| ScribedError::Recognition {
                    message: "Invalid UTF-8 in model path".to_string(),
                })?,
            context_params,
        )
        .map_err(|e| ScribedError::Recognition {
            message: format!("Failed to load Whisper model: {}", e),
        })?;

        Ok(Self {
            context: Mutex::new(context),
            config,
            model_name,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }
}

#[cfg(not(feature = "whisper"))]
impl WhisperRecognizer {
    /// Stub constructor: validates the model path only.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        if !config.model_path.exists() {
            return Err(ScribedError::ModelNotFound {
                path: config.model_path.to_string_lossy().to_string(),
            });
        }

        let model_name = model_name_from_path(&config.model_path);
        Ok(Self { config, model_name })
    }

    /// Get the configuration.
    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }
}

/// Convert i16 PCM to the f32 [-1.0, 1.0] format Whisper expects.
pub fn convert_audio(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

#[cfg(feature = "whisper")]
impl Recognizer for WhisperRecognizer {
    fn recognize(&self, audio: &[i16]) -> Result<Recognition> {
        let audio_f32 = convert_audio(audio);

        let context = self.context.lock().map_err(|e| ScribedError::Recognition {
            message: format!("Failed to acquire context lock: {}", e),
        })?;

        let mut state = context.create_state().map_err(|e| ScribedError::Recognition {
            message: format!("Failed to create Whisper state: {}", e),
        })?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(self.config.language.as_deref());
        if let Some(threads) = self.config.threads {
            params.set_n_threads(threads as i32);
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &audio_f32)
            .map_err(|e| ScribedError::Recognition {
                message: format!("Whisper inference failed: {}", e),
            })?;

        let lang_id = state.full_lang_id_from_state();
        let language = whisper_rs::get_lang_str(lang_id).unwrap_or("").to_string();

        let mut text = String::new();
        let mut segments = Vec::new();
        for segment in state.as_iter() {
            let segment_text = segment.to_string();
            text.push_str(&segment_text);
            // Whisper timestamps are in centiseconds
            segments.push(SegmentTiming {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text: segment_text.trim().to_string(),
            });
        }

        Ok(Recognition {
            text: text.trim().to_string(),
            language,
            segments,
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(not(feature = "whisper"))]
impl Recognizer for WhisperRecognizer {
    fn recognize(&self, _audio: &[i16]) -> Result<Recognition> {
        Err(ScribedError::Recognition {
            message: "built without the `whisper` feature; rebuild with --features whisper"
                .to_string(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_audio_normalizes_range() {
        let samples = vec![0i16, 16384, -16384, i16::MAX, i16::MIN];
        let converted = convert_audio(&samples);

        assert_eq!(converted.len(), 5);
        assert_eq!(converted[0], 0.0);
        assert!((converted[1] - 0.5).abs() < 0.001);
        assert!((converted[2] + 0.5).abs() < 0.001);
        assert!(converted[3] <= 1.0 && converted[3] > 0.999);
        assert_eq!(converted[4], -1.0);
    }

    #[test]
    fn convert_audio_empty() {
        assert!(convert_audio(&[]).is_empty());
    }

    #[test]
    fn missing_model_file_errors() {
        let config = WhisperConfig {
            model_path: PathBuf::from("/nonexistent/ggml-missing.bin"),
            language: None,
            threads: None,
        };

        match WhisperRecognizer::new(config) {
            Err(ScribedError::ModelNotFound { path }) => {
                assert!(path.contains("ggml-missing.bin"));
            }
            _ => panic!("Expected ModelNotFound error"),
        }
    }

    #[test]
    fn model_name_strips_directory_and_extension() {
        assert_eq!(
            model_name_from_path(std::path::Path::new("/models/ggml-base.bin")),
            "ggml-base"
        );
    }

    #[test]
    fn default_config_auto_detects_language() {
        let config = WhisperConfig::default();
        assert!(config.language.is_none());
        assert!(config.threads.is_none());
    }
}

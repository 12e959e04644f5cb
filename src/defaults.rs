//! Default configuration constants for scribed.
//!
//! Shared across the config file, the `configure` command and the pipeline so
//! the three never disagree about what "default" means.

use std::time::Duration;

/// Audio sample rate in Hz.
///
/// 16kHz mono is the canonical rate for speech recognition; everything the
/// capture backends produce is converted to it before entering the pipeline.
pub const SAMPLE_RATE: u32 = 16000;

/// Analysis frame length in milliseconds.
///
/// The segmenter classifies audio voiced/silent one frame at a time; 100ms
/// matches the granularity the silence and max-duration rules are defined in.
pub const FRAME_MS: u32 = 100;

/// Samples per analysis frame at [`SAMPLE_RATE`].
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE / 1000 * FRAME_MS) as usize;

/// Default RMS amplitude threshold separating voiced from silent frames.
pub const SILENCE_THRESHOLD: f32 = 0.01;

/// Default silence run (seconds) that closes a chunk once speech has occurred.
pub const VAD_SILENCE_SECS: f64 = 0.5;

/// Default cap on chunk length (seconds), regardless of ongoing speech.
///
/// Prevents unbounded buffering during continuous speech; the segmenter rolls
/// straight into a fresh chunk so no audio is lost at the boundary.
pub const VAD_MAX_SECS: f64 = 30.0;

/// Minimum viable chunk duration in seconds.
///
/// Chunks with a shorter voiced span are spurious blips (door slams, clicks)
/// and are discarded instead of being handed to the recognizer.
pub const MIN_CHUNK_SECS: f64 = 0.3;

/// Default fixed chunk length for batch-mode file transcription (seconds).
pub const CHUNK_SECS: f64 = 5.0;

/// Default chunk overlap for batch-mode file transcription (seconds).
pub const OVERLAP_SECS: f64 = 1.0;

/// Depth of the chunk queue between segmentation and recognition.
///
/// Kept at 2 so recognition lag backpressures segmentation instead of letting
/// chunks pile up. The producer blocks when full; audio is never dropped.
pub const CHUNK_QUEUE_DEPTH: usize = 2;

/// Interval between audio source polls in the capture thread.
pub const CAPTURE_POLL: Duration = Duration::from_millis(16);

/// Consecutive failed source reads before capture is declared lost.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Default recognition model name.
pub const DEFAULT_MODEL: &str = "base";

/// How long the supervisor waits for a freshly spawned daemon to accept
/// connections before giving up.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period for a daemon to exit after a `shutdown` command before the
/// supervisor escalates to signals.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Report the GPU backend compiled into this build.
///
/// Only one backend can be active at a time; without any, returns "CPU".
pub fn gpu_backend() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA"
    } else if cfg!(feature = "vulkan") {
        "Vulkan"
    } else if cfg!(feature = "hipblas") {
        "HipBLAS (AMD)"
    } else if cfg!(feature = "openblas") {
        "OpenBLAS"
    } else {
        "CPU"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_samples_is_100ms_at_16khz() {
        assert_eq!(FRAME_SAMPLES, 1600);
    }

    #[test]
    fn gpu_backend_matches_compiled_feature() {
        let expected = if cfg!(feature = "cuda") {
            "CUDA"
        } else if cfg!(feature = "vulkan") {
            "Vulkan"
        } else if cfg!(feature = "hipblas") {
            "HipBLAS (AMD)"
        } else if cfg!(feature = "openblas") {
            "OpenBLAS"
        } else {
            "CPU"
        };
        assert_eq!(gpu_backend(), expected);
    }
}

//! Audio frame source abstraction.
//!
//! Exactly one concrete backend is selected at daemon startup by
//! [`detect_backend`]; everything downstream only ever sees the trait.

use crate::error::{Result, ScribedError};

/// Trait for audio capture sources.
///
/// Implementations deliver mono 16kHz 16-bit PCM. `read_samples` drains
/// whatever the device buffered since the last call; the pipeline slices the
/// stream into fixed analysis frames itself.
pub trait FrameSource: Send {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio from the source.
    fn stop(&mut self) -> Result<()>;

    /// Read buffered audio samples from the source.
    ///
    /// An empty result means "nothing buffered yet" for live sources and
    /// "exhausted" for finite ones (see [`FrameSource::is_finite`]).
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Whether this source ends on its own (file/pipe) rather than running
    /// until stopped (microphone).
    fn is_finite(&self) -> bool {
        false
    }
}

/// Capture backend chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBackend {
    /// Native audio API via cpal.
    #[cfg(feature = "cpal-audio")]
    Cpal,
    /// ffmpeg subprocess piping raw PCM.
    Ffmpeg,
}

/// Pick the capture backend for this process.
///
/// Resolved once before any pipeline starts; recordings later open fresh
/// sources of the chosen kind instead of re-probing per call.
pub fn detect_backend() -> Result<CaptureBackend> {
    #[cfg(feature = "cpal-audio")]
    if crate::audio::capture::has_input_device() {
        return Ok(CaptureBackend::Cpal);
    }

    if crate::audio::subprocess::ffmpeg_available() {
        return Ok(CaptureBackend::Ffmpeg);
    }

    Err(ScribedError::Capture {
        message: "no capture backend available: no audio input device found and \
                  ffmpeg is not installed"
            .to_string(),
    })
}

impl CaptureBackend {
    /// Open a new source of this backend kind.
    pub fn open(&self, device: Option<&str>) -> Result<Box<dyn FrameSource>> {
        match self {
            #[cfg(feature = "cpal-audio")]
            CaptureBackend::Cpal => Ok(Box::new(crate::audio::capture::CpalFrameSource::new(
                device,
            )?)),
            CaptureBackend::Ffmpeg => Ok(Box::new(
                crate::audio::subprocess::FfmpegFrameSource::new(device),
            )),
        }
    }
}

/// One phase of scripted mock output: `count` reads each returning `samples`.
#[derive(Debug, Clone)]
pub struct FramePhase {
    pub samples: Vec<i16>,
    pub count: u32,
}

/// Mock frame source for testing.
#[derive(Debug, Clone)]
pub struct MockFrameSource {
    is_started: bool,
    phases: Vec<FramePhase>,
    phase_index: usize,
    reads_in_phase: u32,
    finite: bool,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockFrameSource {
    /// Create a mock that immediately reports exhaustion.
    pub fn new() -> Self {
        Self {
            is_started: false,
            phases: Vec::new(),
            phase_index: 0,
            reads_in_phase: 0,
            finite: true,
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Script the sequence of reads this source produces.
    pub fn with_frame_sequence(mut self, phases: Vec<FramePhase>) -> Self {
        self.phases = phases;
        self
    }

    /// Report as a live source: exhausted phases read as empty instead of
    /// ending the stream.
    pub fn as_live_source(mut self) -> Self {
        self.finite = false;
        self
    }

    /// Configure the mock to fail on start.
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on every read.
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures.
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Check if the source is started.
    pub fn is_started(&self) -> bool {
        self.is_started
    }
}

impl Default for MockFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for MockFrameSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(ScribedError::Capture {
                message: self.error_message.clone(),
            });
        }
        self.is_started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            return Err(ScribedError::Capture {
                message: self.error_message.clone(),
            });
        }

        while let Some(phase) = self.phases.get(self.phase_index) {
            if self.reads_in_phase < phase.count {
                self.reads_in_phase += 1;
                return Ok(phase.samples.clone());
            }
            self.phase_index += 1;
            self.reads_in_phase = 0;
        }

        Ok(Vec::new())
    }

    fn is_finite(&self) -> bool {
        self.finite
    }
}

//! Transcription pipeline: capture → segmentation → recognition.
//!
//! Two stages on dedicated threads joined by a bounded chunk queue, so chunk
//! N+1 is being captured while chunk N is inside the recognizer. Recognition
//! is strictly sequential; the queue (depth 2) backpressures segmentation when
//! recognition falls behind. Audio is never dropped: the producer blocks on a
//! full queue and a warning event is emitted instead.

use crate::audio::segmenter::{AudioChunk, AudioFrame, SegmenterConfig, VoiceActivitySegmenter};
use crate::audio::source::FrameSource;
use crate::defaults;
use crate::error::Result;
use crate::stt::recognizer::{Recognizer, SegmentTiming};
use crossbeam_channel::{Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Segmenter settings for this recording.
    pub segmenter: SegmenterConfig,
    /// Depth of the chunk queue between segmentation and recognition.
    pub chunk_queue_depth: usize,
    /// Interval between audio source polls.
    pub poll_interval: Duration,
    /// Suppress status messages.
    pub quiet: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            chunk_queue_depth: defaults::CHUNK_QUEUE_DEPTH,
            poll_interval: defaults::CAPTURE_POLL,
            quiet: false,
        }
    }
}

/// What recognition produced for one chunk.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Recognition succeeded (text may be empty for unintelligible audio).
    Text {
        text: String,
        language: String,
        segments: Vec<SegmentTiming>,
    },
    /// Recognition failed for this chunk only; the pipeline continues.
    Failed { message: String },
}

/// Per-chunk result, delivered in strict capture order.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    /// Chunk sequence number, gapless per recording.
    pub sequence: u64,
    /// Chunk start in seconds since capture began.
    pub start: f64,
    /// End of the chunk's voiced span in seconds since capture began.
    pub end: f64,
    /// Recognition wall time for this chunk in seconds.
    pub transcription_time: f64,
    pub outcome: ChunkOutcome,
}

/// Out-of-band pipeline notifications.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Recognition is not keeping up; the chunk queue is saturated.
    /// Capture continues and no audio is dropped.
    FallingBehind { queued: usize },
    /// The capture source is lost. Fatal to this pipeline, not the service.
    CaptureFailed { message: String },
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Stop cooperatively: capture stops producing, the open chunk is
    /// force-flushed, the queue drains, and in-flight recognition finishes.
    ///
    /// Waits up to the default shutdown grace; stragglers are detached and
    /// die with the process.
    pub fn stop(self) {
        self.stop_with_grace(defaults::SHUTDOWN_GRACE)
    }

    /// Stop with an explicit grace period.
    pub fn stop_with_grace(mut self, grace: Duration) {
        self.running.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + grace;
        let poll_interval = Duration::from_millis(50);

        loop {
            // Join finished threads to surface panics
            let mut remaining = Vec::new();
            for handle in self.threads.drain(..) {
                if handle.is_finished() {
                    if let Err(panic_info) = handle.join() {
                        let msg = panic_info
                            .downcast_ref::<&str>()
                            .copied()
                            .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                            .unwrap_or("unknown panic");
                        eprintln!("scribed: pipeline thread panicked: {msg}");
                    }
                } else {
                    remaining.push(handle);
                }
            }
            self.threads = remaining;

            if self.threads.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                eprintln!(
                    "scribed: drain timeout — {} pipeline thread(s) still running, detaching",
                    self.threads.len()
                );
                break;
            }

            thread::sleep(poll_interval);
        }
    }

    /// Returns true while both stages are alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.threads.iter().all(|t| t.is_finished())
    }
}

/// Push a chunk into the queue, blocking if recognition is behind.
///
/// Emits one FallingBehind warning per saturation episode. Returns false when
/// the receiving side is gone.
fn deliver(
    chunk_tx: &Sender<AudioChunk>,
    chunk: AudioChunk,
    event_tx: &Sender<PipelineEvent>,
    warned_full: &mut bool,
) -> bool {
    if chunk_tx.is_full() {
        if !*warned_full {
            let _ = event_tx.send(PipelineEvent::FallingBehind {
                queued: chunk_tx.len(),
            });
            *warned_full = true;
        }
    } else {
        *warned_full = false;
    }
    chunk_tx.send(chunk).is_ok()
}

/// Transcription pipeline: FrameSource → segmenter → chunk queue → recognizer.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline with the given configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Start both stages.
    ///
    /// Results arrive on `result_tx` in chunk order; warnings and fatal
    /// capture errors on `event_tx`. Both channels close when the pipeline
    /// winds down, which is the completion signal for consumers.
    pub fn start(
        self,
        mut source: Box<dyn FrameSource>,
        recognizer: Arc<dyn Recognizer>,
        result_tx: Sender<TranscriptionResult>,
        event_tx: Sender<PipelineEvent>,
    ) -> Result<PipelineHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let (chunk_tx, chunk_rx) = bounded::<AudioChunk>(self.config.chunk_queue_depth);

        source.start()?;
        let source_is_finite = source.is_finite();

        // Stage 1: capture + segmentation
        let capture_running = Arc::clone(&running);
        let seg_config = self.config.segmenter;
        let poll = self.config.poll_interval;
        let quiet = self.config.quiet;
        let capture_event_tx = event_tx.clone();
        let frame_samples =
            (seg_config.sample_rate as usize / 1000) * defaults::FRAME_MS as usize;

        let capture_handle = thread::spawn(move || {
            let mut segmenter = VoiceActivitySegmenter::new(seg_config);
            let mut pending: Vec<i16> = Vec::new();
            let mut frame_sequence: u64 = 0;
            let mut consecutive_errors: u32 = 0;
            let mut warned_full = false;

            'capture: while capture_running.load(Ordering::SeqCst) {
                let samples = match source.read_samples() {
                    Ok(s) => {
                        consecutive_errors = 0;
                        s
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= defaults::MAX_CONSECUTIVE_READ_ERRORS {
                            if !quiet {
                                eprintln!(
                                    "scribed: audio capture failed {consecutive_errors} times in a row: {e}"
                                );
                            }
                            let _ = capture_event_tx.send(PipelineEvent::CaptureFailed {
                                message: e.to_string(),
                            });
                            break 'capture;
                        }
                        thread::sleep(poll);
                        continue;
                    }
                };

                if samples.is_empty() {
                    if source_is_finite {
                        // File/pipe source exhausted
                        break 'capture;
                    }
                    // Live source: empty reads are normal while the device
                    // warms up
                    thread::sleep(poll);
                    continue;
                }

                pending.extend_from_slice(&samples);
                while pending.len() >= frame_samples {
                    let frame = AudioFrame::new(
                        frame_sequence,
                        pending.drain(..frame_samples).collect(),
                    );
                    frame_sequence += 1;
                    if let Some(chunk) = segmenter.observe(frame)
                        && !deliver(&chunk_tx, chunk, &capture_event_tx, &mut warned_full)
                    {
                        break 'capture;
                    }
                }

                thread::sleep(poll);
            }

            // Wind-down: feed the leftover partial frame, then force-flush
            // the open chunk so stop never discards buffered speech.
            if !pending.is_empty()
                && let Some(chunk) =
                    segmenter.observe(AudioFrame::new(frame_sequence, std::mem::take(&mut pending)))
            {
                deliver(&chunk_tx, chunk, &capture_event_tx, &mut warned_full);
            }
            if let Some(chunk) = segmenter.flush() {
                deliver(&chunk_tx, chunk, &capture_event_tx, &mut warned_full);
            }

            if let Err(e) = source.stop() {
                eprintln!("scribed: failed to stop audio capture: {e}");
            }
            // Dropping chunk_tx closes the queue; recognition drains it and
            // exits on its own.
        });

        // Stage 2: sequential recognition
        let recognition_handle = thread::spawn(move || {
            for chunk in chunk_rx.iter() {
                let started = Instant::now();
                let outcome = match recognizer.recognize(&chunk.samples) {
                    Ok(recognition) => ChunkOutcome::Text {
                        text: recognition.text,
                        language: recognition.language,
                        segments: recognition.segments,
                    },
                    Err(e) => ChunkOutcome::Failed {
                        message: e.to_string(),
                    },
                };

                let result = TranscriptionResult {
                    sequence: chunk.sequence,
                    start: chunk.start,
                    end: chunk.end,
                    transcription_time: started.elapsed().as_secs_f64(),
                    outcome,
                };

                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });

        Ok(PipelineHandle {
            running,
            threads: vec![capture_handle, recognition_handle],
        })
    }
}

//! Subprocess-based audio capture via ffmpeg.
//!
//! Fallback backend for hosts without a usable native audio API: spawns
//! ffmpeg writing raw s16le mono 16kHz to stdout and drains it from a reader
//! thread. Selected by [`crate::audio::source::detect_backend`] when cpal has
//! no input device.

use crate::audio::source::FrameSource;
use crate::defaults;
use crate::error::{Result, ScribedError};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// True when an ffmpeg binary is on PATH.
pub fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Platform-specific ffmpeg input arguments for microphone capture.
fn audio_input_args(device: Option<&str>) -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec![
            "-f".into(),
            "avfoundation".into(),
            "-i".into(),
            device.unwrap_or(":0").to_string(),
        ]
    } else if cfg!(target_os = "windows") {
        vec![
            "-f".into(),
            "dshow".into(),
            "-i".into(),
            format!("audio={}", device.unwrap_or("")),
        ]
    } else {
        // Linux: ALSA when arecord can see devices, PulseAudio otherwise
        let alsa_works = Command::new("arecord")
            .arg("-l")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success());
        let format = if alsa_works { "alsa" } else { "pulse" };
        vec![
            "-f".into(),
            format.into(),
            "-i".into(),
            device.unwrap_or("default").to_string(),
        ]
    }
}

/// ffmpeg subprocess capture source.
pub struct FfmpegFrameSource {
    device: Option<String>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    buffer: Arc<Mutex<Vec<i16>>>,
    stop_flag: Arc<AtomicBool>,
}

impl FfmpegFrameSource {
    /// Create a source for the named device (backend default when None).
    pub fn new(device: Option<&str>) -> Self {
        Self {
            device: device.map(|d| d.to_string()),
            child: None,
            reader: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(()); // Already started
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y");
        cmd.args(audio_input_args(self.device.as_deref()));
        // Raw s16le avoids WAV header handling on the pipe
        cmd.args([
            "-acodec",
            "pcm_s16le",
            "-ar",
            &defaults::SAMPLE_RATE.to_string(),
            "-ac",
            "1",
            "-f",
            "s16le",
            "pipe:1",
        ]);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ScribedError::Capture {
            message: format!("Failed to spawn ffmpeg: {}", e),
        })?;

        let mut stdout = child.stdout.take().ok_or_else(|| ScribedError::Capture {
            message: "ffmpeg stdout not captured".to_string(),
        })?;

        self.stop_flag.store(false, Ordering::SeqCst);
        let buffer = Arc::clone(&self.buffer);
        let stop_flag = Arc::clone(&self.stop_flag);

        // Reader thread: 0.1s of audio per read keeps pipe latency low
        let read_size = (defaults::SAMPLE_RATE as usize / 10) * 2;
        let reader = std::thread::spawn(move || {
            let mut raw = vec![0u8; read_size];
            while !stop_flag.load(Ordering::SeqCst) {
                match stdout.read(&mut raw) {
                    Ok(0) => break, // ffmpeg exited
                    Ok(n) => {
                        let samples: Vec<i16> = raw[..n]
                            .chunks_exact(2)
                            .map(|b| i16::from_le_bytes([b[0], b[1]]))
                            .collect();
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&samples);
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        self.child = Some(child);
        self.reader = Some(reader);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);

        if let Some(mut child) = self.child.take() {
            // Ask ffmpeg to quit; fall back to kill if it lingers
            if let Some(mut stdin) = child.stdin.take() {
                use std::io::Write;
                let _ = stdin.write_all(b"q\n");
            }

            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() >= deadline => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                    Err(e) => {
                        return Err(ScribedError::Capture {
                            message: format!("Failed waiting for ffmpeg: {}", e),
                        });
                    }
                }
            }
        }

        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            eprintln!("scribed: ffmpeg reader thread panicked");
        }

        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| ScribedError::Capture {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buffer))
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        if self.child.is_some()
            && let Err(e) = self.stop()
        {
            eprintln!("scribed: failed to stop ffmpeg capture: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_args_name_a_container_format() {
        let args = audio_input_args(None);
        assert_eq!(args[0], "-f");
        assert!(["alsa", "pulse", "avfoundation", "dshow"].contains(&args[1].as_str()));
    }

    #[test]
    fn input_args_honor_device_override() {
        let args = audio_input_args(Some("hw:1,0"));
        assert!(args.iter().any(|a| a.contains("hw:1,0")));
    }

    #[test]
    fn read_before_start_is_empty() {
        let mut source = FfmpegFrameSource::new(None);
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn stop_without_start_is_ok() {
        let mut source = FfmpegFrameSource::new(None);
        assert!(source.stop().is_ok());
    }

    #[test]
    #[ignore] // Requires ffmpeg and a microphone
    fn capture_produces_samples() {
        let mut source = FfmpegFrameSource::new(None);
        source.start().expect("Failed to start ffmpeg");
        std::thread::sleep(Duration::from_millis(500));
        let samples = source.read_samples().expect("Failed to read");
        source.stop().expect("Failed to stop");
        assert!(!samples.is_empty());
    }
}

//! Command-line interface for scribed
//!
//! Argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Continuous speech-to-text daemon
#[derive(Parser, Debug)]
#[command(name = "scribed", version, about = "Continuous speech-to-text daemon")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the control socket (default: $XDG_RUNTIME_DIR/scribed.sock)
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Suppress status messages
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: lifecycle detail, -vv: full diagnostics)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the background service in the foreground (for systemd or debugging)
    Daemon,

    /// Update the running daemon's configuration (spawns it if needed)
    Configure {
        /// Recognition model preset (tiny, base, small, medium, large) or path
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Language code (e.g. en, de); omit for auto-detection
        #[arg(long, value_name = "LANG")]
        language: Option<String>,

        /// RMS amplitude below which a frame counts as silence (0.0 to 1.0)
        #[arg(long, value_name = "LEVEL")]
        silence_threshold: Option<f32>,

        /// Silence run that ends a chunk (e.g. 500ms, 1s)
        #[arg(long, value_name = "DURATION", value_parser = parse_secs)]
        vad_silence: Option<f64>,

        /// Maximum chunk length regardless of ongoing speech (e.g. 30s, 1m)
        #[arg(long, value_name = "DURATION", value_parser = parse_secs)]
        vad_max: Option<f64>,
    },

    /// Start recording (spawns the daemon if needed)
    Start {
        /// Stay connected and print transcriptions; Ctrl+C stops recording
        #[arg(long)]
        follow: bool,
    },

    /// Stop recording; returns after the last chunk's result is delivered
    Stop,

    /// Show daemon state and active configuration
    Status,

    /// Stop the background service
    Shutdown,

    /// Restart the background service
    Restart,

    /// Stream transcriptions from a running daemon
    Follow,

    /// Transcribe a WAV file (or stdin) directly, without the daemon
    Transcribe {
        /// WAV file to transcribe; reads stdin when omitted
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// List available audio input devices
    Devices,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Parse a duration flag into seconds.
///
/// Accepts bare numbers (seconds) and any `humantime` format (`500ms`,
/// `1s`, `1m30s`).
fn parse_secs(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(secs);
        }
        return Err(format!("duration must be a non-negative number, got {s}"));
    }
    humantime::parse_duration(s)
        .map(|d| d.as_secs_f64())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_secs_accepts_bare_seconds() {
        assert_eq!(parse_secs("30"), Ok(30.0));
        assert_eq!(parse_secs("0.5"), Ok(0.5));
    }

    #[test]
    fn parse_secs_accepts_humantime() {
        assert_eq!(parse_secs("500ms"), Ok(0.5));
        assert_eq!(parse_secs("1s"), Ok(1.0));
        assert_eq!(parse_secs("1m30s"), Ok(90.0));
    }

    #[test]
    fn parse_secs_rejects_garbage() {
        assert!(parse_secs("soon").is_err());
        assert!(parse_secs("-5").is_err());
    }

    #[test]
    fn cli_parses_daemon_with_socket() {
        let cli = Cli::try_parse_from(["scribed", "daemon", "--socket", "/tmp/x.sock"]).unwrap();
        assert!(matches!(cli.command, Commands::Daemon));
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/x.sock")));
    }

    #[test]
    fn cli_parses_configure_flags() {
        let cli = Cli::try_parse_from([
            "scribed",
            "configure",
            "--model",
            "tiny",
            "--silence-threshold",
            "0.02",
            "--vad-silence",
            "750ms",
        ])
        .unwrap();

        match cli.command {
            Commands::Configure {
                model,
                silence_threshold,
                vad_silence,
                language,
                vad_max,
            } => {
                assert_eq!(model, Some("tiny".to_string()));
                assert_eq!(silence_threshold, Some(0.02));
                assert_eq!(vad_silence, Some(0.75));
                assert!(language.is_none());
                assert!(vad_max.is_none());
            }
            other => panic!("Expected Configure, got {:?}", other),
        }
    }

    #[test]
    fn cli_parses_start_follow() {
        let cli = Cli::try_parse_from(["scribed", "start", "--follow"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { follow: true }));

        let cli = Cli::try_parse_from(["scribed", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start { follow: false }));
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["scribed"]).is_err());
    }

    #[test]
    fn cli_parses_transcribe_with_and_without_file() {
        let cli = Cli::try_parse_from(["scribed", "transcribe", "audio.wav"]).unwrap();
        match cli.command {
            Commands::Transcribe { file } => {
                assert_eq!(file, Some(PathBuf::from("audio.wav")));
            }
            other => panic!("Expected Transcribe, got {:?}", other),
        }

        let cli = Cli::try_parse_from(["scribed", "transcribe"]).unwrap();
        assert!(matches!(cli.command, Commands::Transcribe { file: None }));
    }

    #[test]
    fn cli_global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["scribed", "status", "--quiet"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Status));
    }
}

use anyhow::Context;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use scribed::cli::{Cli, Commands};
use scribed::config::{Config, SessionUpdate};
use scribed::daemon::run_daemon;
use scribed::error::ScribedError;
use scribed::ipc::client::ControlClient;
use scribed::ipc::protocol::{Command, ErrorCode, Response, StreamMessage};
use scribed::ipc::server::default_socket_path;
use scribed::supervisor::{DaemonStatus, ProcessSupervisor, SupervisorOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Exit codes: 0 success, 1 internal error, 2 service unreachable,
/// 3 command rejected by the daemon.
const EXIT_UNREACHABLE: i32 = 2;
const EXIT_REJECTED: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("scribed: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<ScribedError>() {
        Some(ScribedError::Connection { .. }) | Some(ScribedError::Supervision { .. }) => {
            EXIT_UNREACHABLE
        }
        Some(ScribedError::StateConflict { .. }) | Some(ScribedError::Protocol { .. }) => {
            EXIT_REJECTED
        }
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?
        .with_env_overrides();

    match cli.command {
        Commands::Daemon => {
            run_daemon(config, cli.socket, cli.quiet, cli.verbose).await?;
            Ok(0)
        }

        Commands::Configure {
            model,
            language,
            silence_threshold,
            vad_silence,
            vad_max,
        } => {
            let update = SessionUpdate {
                model,
                language,
                silence_threshold,
                vad_silence_duration: vad_silence,
                vad_max_duration: vad_max,
                ..Default::default()
            };
            if update.is_empty() {
                anyhow::bail!("no configuration flags given; see `scribed configure --help`");
            }

            let mut client = supervisor(&config, cli.socket, cli.quiet)
                .ensure_running()
                .await?;
            let response = client.request(&Command::Configure(update)).await?;
            Ok(finish(response, cli.quiet))
        }

        Commands::Start { follow } => {
            let mut client = supervisor(&config, cli.socket, cli.quiet)
                .ensure_running()
                .await?;
            let response = client.request(&Command::StartRecording).await?;
            if !response.is_success() || !follow {
                return Ok(finish(response, cli.quiet));
            }

            if !cli.quiet {
                eprintln!("Recording. Press Ctrl+C to stop.");
            }
            stream_until_interrupted(&mut client, cli.quiet).await
        }

        Commands::Stop => {
            let socket = socket_path(&config, cli.socket);
            let mut client = ControlClient::connect(&socket).await?;
            let response = client.request(&Command::StopRecording).await?;
            Ok(finish(response, cli.quiet))
        }

        Commands::Status => {
            match supervisor(&config, cli.socket, true).status().await {
                DaemonStatus::NotRunning => {
                    println!("Daemon not running");
                    Ok(0)
                }
                DaemonStatus::Running(response) => {
                    print_status(&response);
                    Ok(0)
                }
                DaemonStatus::Unreachable(message) => Err(ScribedError::Connection {
                    message: format!("daemon accepted the connection but is unresponsive: {message}"),
                }
                .into()),
            }
        }

        Commands::Shutdown => {
            let was_running = supervisor(&config, cli.socket, cli.quiet).stop().await?;
            if !cli.quiet {
                println!("{}", if was_running { "Daemon stopped" } else { "Daemon not running" });
            }
            Ok(0)
        }

        Commands::Restart => {
            let sup = supervisor(&config, cli.socket, cli.quiet);
            let mut client = sup.restart().await?;
            let response = client.request(&Command::GetStatus).await?;
            if !cli.quiet {
                println!("Daemon restarted");
                print_status(&response);
            }
            Ok(0)
        }

        Commands::Follow => {
            let socket = socket_path(&config, cli.socket);
            let mut client = ControlClient::connect(&socket).await?;
            let response = client.request(&Command::Subscribe).await?;
            if !response.is_success() {
                return Ok(finish(response, cli.quiet));
            }
            if !cli.quiet {
                eprintln!("Following transcriptions. Press Ctrl+C to detach.");
            }

            loop {
                tokio::select! {
                    msg = client.next_message() => {
                        match msg? {
                            Some(msg) => {
                                let shutting_down = matches!(msg, StreamMessage::Shutdown { .. });
                                print_stream_message(&msg, cli.quiet);
                                if shutting_down {
                                    return Ok(0);
                                }
                            }
                            None => return Ok(0),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        // Detach only; recording continues in the daemon
                        return Ok(0);
                    }
                }
            }
        }

        Commands::Transcribe { file } => {
            transcribe_file(&config, file, cli.quiet).await
        }

        Commands::Devices => {
            #[cfg(feature = "cpal-audio")]
            {
                let devices = scribed::audio::capture::list_devices()?;
                if devices.is_empty() {
                    println!("No audio input devices found");
                } else {
                    for device in devices {
                        println!("{}", device);
                    }
                }
            }
            #[cfg(not(feature = "cpal-audio"))]
            println!("Built without cpal; capture uses ffmpeg with the default device");
            Ok(0)
        }

        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "scribed", &mut std::io::stdout());
            Ok(0)
        }
    }
}

fn socket_path(config: &Config, cli_socket: Option<PathBuf>) -> PathBuf {
    cli_socket
        .or_else(|| config.daemon.socket.clone())
        .unwrap_or_else(default_socket_path)
}

fn supervisor(config: &Config, cli_socket: Option<PathBuf>, quiet: bool) -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorOptions {
        socket_path: socket_path(config, cli_socket),
        startup_timeout: Duration::from_secs(config.daemon.startup_timeout_secs),
        shutdown_grace: Duration::from_secs(config.daemon.shutdown_grace_secs),
        quiet,
    })
}

/// Print the reply and map it to an exit code.
fn finish(response: Response, quiet: bool) -> i32 {
    if response.is_success() {
        if !quiet {
            println!("{}", response.message);
        }
        0
    } else {
        eprintln!("scribed: {}", response.message);
        match response.code {
            Some(ErrorCode::StateConflict) | Some(ErrorCode::Protocol) => EXIT_REJECTED,
            _ => 1,
        }
    }
}

fn print_status(response: &Response) {
    println!("{} Daemon running", "●".green());
    if let Some(state) = response.state {
        println!("  State: {}", state);
    }
    if let Some(model) = &response.model {
        println!("  Model: {}", model);
    }
    if let Some(config) = &response.config {
        println!(
            "  Language: {}",
            config.language.as_deref().unwrap_or("auto")
        );
        println!("  Silence threshold: {}", config.silence_threshold);
        println!("  VAD silence duration: {}s", config.vad_silence_duration);
        println!("  VAD max duration: {}s", config.vad_max_duration);
    }
}

fn print_stream_message(msg: &StreamMessage, quiet: bool) {
    match msg {
        StreamMessage::Transcription {
            text, start, end, ..
        } => {
            let span = format!("[{:>7.2}s → {:>7.2}s]", start, end);
            println!("{} {}", span.dimmed(), text);
        }
        StreamMessage::Error { sequence, message } => {
            let seq = sequence.map_or(String::new(), |s| format!(" (chunk {})", s));
            eprintln!("scribed: recognition failed{}: {}", seq, message);
        }
        StreamMessage::State { state, message } => {
            if !quiet {
                match message {
                    Some(message) => eprintln!("scribed: {} ({})", state, message),
                    None => eprintln!("scribed: {}", state),
                }
            }
        }
        StreamMessage::Shutdown { message } => {
            eprintln!("scribed: {}", message);
        }
    }
}

/// Batch mode: run a WAV file through the same segmentation/recognition
/// pipeline the daemon uses, printing one line per chunk.
async fn transcribe_file(
    config: &Config,
    file: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<i32> {
    use scribed::audio::segmenter::SegmenterConfig;
    use scribed::audio::source::FrameSource;
    use scribed::audio::wav::WavFrameSource;
    use scribed::pipeline::{ChunkOutcome, Pipeline, PipelineConfig};

    let session = config.session();
    if !quiet {
        eprintln!("Loading model '{}'...", session.model);
    }
    let recognizer = scribed::daemon::create_recognizer(&session, config.stt.model_dir.as_deref())?;

    let source: Box<dyn FrameSource> = match &file {
        Some(path) => {
            let reader = std::fs::File::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            Box::new(WavFrameSource::from_reader(Box::new(reader))?)
        }
        None => Box::new(WavFrameSource::from_stdin()?),
    };

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    let (event_tx, _event_rx) = crossbeam_channel::unbounded();

    let pipeline_config = PipelineConfig {
        segmenter: SegmenterConfig::from_session(&session),
        // File sources need no pacing; drain as fast as recognition allows
        poll_interval: Duration::from_millis(1),
        quiet,
        ..Default::default()
    };
    let handle = Pipeline::new(pipeline_config).start(source, recognizer, result_tx, event_tx)?;

    // The result channel closes when the file is exhausted and drained
    let results = tokio::task::spawn_blocking(move || result_rx.iter().collect::<Vec<_>>()).await?;
    handle.stop();

    let mut failed = false;
    for result in results {
        match result.outcome {
            ChunkOutcome::Text { text, .. } => {
                if quiet {
                    println!("{}", text);
                } else {
                    let span = format!("[{:>7.2}s → {:>7.2}s]", result.start, result.end);
                    println!("{} {}", span.dimmed(), text);
                }
            }
            ChunkOutcome::Failed { message } => {
                eprintln!(
                    "scribed: recognition failed (chunk {}): {}",
                    result.sequence, message
                );
                failed = true;
            }
        }
    }

    Ok(if failed { 1 } else { 0 })
}

/// Print results until Ctrl+C, then stop the recording and drain.
async fn stream_until_interrupted(
    client: &mut ControlClient,
    quiet: bool,
) -> anyhow::Result<i32> {
    loop {
        tokio::select! {
            msg = client.next_message() => {
                match msg? {
                    Some(msg) => {
                        let shutting_down = matches!(msg, StreamMessage::Shutdown { .. });
                        print_stream_message(&msg, quiet);
                        if shutting_down {
                            return Ok(0);
                        }
                    }
                    None => return Ok(0),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if !quiet {
                    eprintln!("Stopping...");
                }
                let response = client.request(&Command::StopRecording).await?;
                // Results that raced the stop ack were parked by request();
                // give any last stragglers a moment, then print everything.
                loop {
                    match tokio::time::timeout(
                        Duration::from_millis(200),
                        client.next_message(),
                    )
                    .await
                    {
                        Ok(Ok(Some(msg))) => print_stream_message(&msg, quiet),
                        _ => break,
                    }
                }
                return Ok(finish(response, quiet));
            }
        }
    }
}

//! Daemon composition: load the model once, pick a capture backend once,
//! serve the control socket until told to stop.

pub mod handler;

use crate::audio::source::detect_backend;
use crate::config::{Config, SessionConfig};
use crate::defaults;
use crate::error::{Result, ScribedError};
use crate::ipc::server::{ControlServer, default_socket_path};
use crate::stt::recognizer::Recognizer;
use crate::stt::whisper::{WhisperConfig, WhisperRecognizer};
use handler::{DaemonCommandHandler, RecognizerFactory, SourceFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Pid file kept beside the socket so the supervisor can escalate to signals
/// when a graceful shutdown stalls.
pub fn pid_file_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

/// Resolve a model name or path to a ggml model file.
///
/// Accepts absolute paths, relative paths containing a separator, and bare
/// preset names (`base`, `tiny`, ...) looked up as `ggml-<name>.bin` in the
/// model directory (default: the XDG data dir).
pub fn resolve_model_path(model: &str, model_dir: Option<&Path>) -> Result<PathBuf> {
    let direct = PathBuf::from(model);
    if direct.is_absolute() || direct.exists() {
        return Ok(direct);
    }
    if model.contains('/') {
        return Ok(direct);
    }

    let dir = match model_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scribed")
            .join("models"),
    };
    let path = dir.join(format!("ggml-{}.bin", model));
    if path.exists() {
        Ok(path)
    } else {
        Err(ScribedError::ModelNotFound {
            path: path.to_string_lossy().to_string(),
        })
    }
}

/// Load the recognition backend for the given session configuration.
pub fn create_recognizer(
    session: &SessionConfig,
    model_dir: Option<&Path>,
) -> Result<Arc<dyn Recognizer>> {
    let model_path = resolve_model_path(&session.model, model_dir)?;
    let recognizer = WhisperRecognizer::new(WhisperConfig {
        model_path,
        language: session.language.clone(),
        threads: None,
    })?;
    Ok(Arc::new(recognizer))
}

/// Run the daemon: load model, bind the control socket, serve until a
/// `shutdown` command or a termination signal arrives.
pub async fn run_daemon(
    config: Config,
    socket_path: Option<PathBuf>,
    quiet: bool,
    verbosity: u8,
) -> Result<()> {
    #[cfg(feature = "cpal-audio")]
    crate::audio::capture::suppress_audio_warnings();

    let session = config.session();

    // Model load is the slow part and happens exactly once per daemon
    if !quiet {
        eprintln!("Loading model '{}'...", session.model);
    }
    let model_dir = config.stt.model_dir.clone();
    let recognizer = create_recognizer(&session, model_dir.as_deref())?;
    if !quiet {
        eprintln!("Model loaded ({} backend).", defaults::gpu_backend());
    }

    // One capture backend for the process lifetime; recordings open fresh
    // sources of this kind.
    let backend = detect_backend()?;
    if verbosity >= 1 {
        eprintln!("scribed: capture backend: {:?}", backend);
    }
    let device = config.audio.device.clone();
    let source_factory: SourceFactory = Box::new(move || backend.open(device.as_deref()));

    let recognizer_factory: RecognizerFactory = {
        let model_dir = model_dir.clone();
        Box::new(move |session| create_recognizer(session, model_dir.as_deref()))
    };

    let socket_path = socket_path
        .or_else(|| config.daemon.socket.clone())
        .unwrap_or_else(default_socket_path);
    let server = Arc::new(ControlServer::new(socket_path));

    let pid_file = pid_file_path(server.socket_path());
    if let Err(e) = std::fs::write(&pid_file, std::process::id().to_string()) {
        eprintln!("scribed: could not write pid file {}: {}", pid_file.display(), e);
    }

    let handler = Arc::new(DaemonCommandHandler::new(
        session,
        recognizer,
        source_factory,
        recognizer_factory,
        server.events(),
        server.shutdown_trigger(),
        quiet,
    ));

    if !quiet {
        eprintln!(
            "Control socket listening at: {}",
            server.socket_path().display()
        );
        eprintln!("Daemon ready.");
    }

    let run_server = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { run_server.run(handler).await });

    let result = tokio::select! {
        res = &mut server_task => {
            // Shutdown command path: the server loop already wound down
            flatten_join(res)
        }
        _ = tokio::signal::ctrl_c() => {
            if !quiet {
                eprintln!("\nReceived SIGINT, shutting down...");
            }
            server.trigger_shutdown();
            flatten_join(server_task.await)
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                eprintln!("scribed: signal handler setup failed: {e}");
            }
            if !quiet {
                eprintln!("\nReceived SIGTERM, shutting down...");
            }
            server.trigger_shutdown();
            flatten_join(server_task.await)
        }
    };

    if let Err(e) = std::fs::remove_file(&pid_file)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        eprintln!("scribed: could not remove pid file: {e}");
    }

    if !quiet {
        eprintln!("Daemon stopped.");
    }

    result
}

fn flatten_join(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(ScribedError::Other(format!("daemon server task failed: {e}"))),
    }
}

/// Wait for SIGTERM (systemd's stop signal).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ScribedError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    // Ctrl+C still works elsewhere
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_sits_beside_socket() {
        assert_eq!(
            pid_file_path(Path::new("/run/user/1000/scribed.sock")),
            PathBuf::from("/run/user/1000/scribed.pid")
        );
    }

    #[test]
    fn resolve_model_path_absolute_passthrough() {
        let path = resolve_model_path("/models/ggml-base.bin", None).unwrap();
        assert_eq!(path, PathBuf::from("/models/ggml-base.bin"));
    }

    #[test]
    fn resolve_model_path_relative_with_separator() {
        let path = resolve_model_path("./custom/ggml-x.bin", None).unwrap();
        assert_eq!(path, PathBuf::from("./custom/ggml-x.bin"));
    }

    #[test]
    fn resolve_model_path_missing_preset_names_expected_location() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_model_path("base", Some(dir.path()));
        match result {
            Err(ScribedError::ModelNotFound { path }) => {
                assert!(path.ends_with("ggml-base.bin"));
                assert!(path.starts_with(&dir.path().to_string_lossy().to_string()));
            }
            other => panic!("Expected ModelNotFound, got {:?}", other),
        }
    }

    #[test]
    fn resolve_model_path_finds_installed_preset() {
        let dir = tempfile::tempdir().unwrap();
        let model_file = dir.path().join("ggml-tiny.bin");
        std::fs::write(&model_file, b"stub").unwrap();

        let path = resolve_model_path("tiny", Some(dir.path())).unwrap();
        assert_eq!(path, model_file);
    }
}

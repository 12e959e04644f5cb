//! Async Unix-socket control server.
//!
//! Accepts any number of client connections; each gets its own
//! [`ConnectionSession`] and tokio task. Commands are newline-delimited JSON;
//! subscribed connections additionally receive the broadcast stream of
//! [`StreamMessage`]s. Shutdown is an explicit token every task observes at
//! its suspension points — no signal handler mutating shared flags.

use crate::error::{Result, ScribedError};
use crate::ipc::protocol::{Command, ErrorCode, Response, StreamMessage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

/// Per-connection state; destroyed when the socket closes.
#[derive(Debug, Default)]
pub struct ConnectionSession {
    /// Whether this connection receives unsolicited stream messages.
    pub streaming: bool,
}

/// Handler trait for processing commands.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one command and produce its reply. May flip the session's
    /// streaming flag (`subscribe`, `start_recording`).
    async fn handle(&self, command: Command, session: &mut ConnectionSession) -> Response;
}

/// Get the default socket path based on XDG_RUNTIME_DIR or fallback.
pub fn default_socket_path() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join("scribed.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/scribed-{}.sock", uid))
    }
}

/// Control server for the daemon's rendezvous socket.
pub struct ControlServer {
    socket_path: PathBuf,
    events: broadcast::Sender<StreamMessage>,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlServer {
    /// Create a server bound (later, in `run`) to the given socket path.
    pub fn new(socket_path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            socket_path,
            events,
            shutdown_tx,
        }
    }

    /// The socket path this server uses.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sender for broadcasting stream messages to subscribed connections.
    pub fn events(&self) -> broadcast::Sender<StreamMessage> {
        self.events.clone()
    }

    /// Cancellation token observed by the accept loop and every connection.
    pub fn shutdown_token(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Clonable trigger for the command handler, so a `shutdown` command can
    /// stop the server it arrived through.
    pub fn shutdown_trigger(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Begin shutdown: the accept loop stops, connections get a shutdown
    /// notice and close, the socket file is removed.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Bind and serve until shutdown is triggered.
    pub async fn run(&self, handler: Arc<dyn CommandHandler>) -> Result<()> {
        // A leftover socket file from a crashed instance must not block us
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| ScribedError::Socket {
                message: format!(
                    "Failed to remove stale socket {}: {}",
                    self.socket_path.display(),
                    e
                ),
            })?;
        }
        if let Some(parent) = self.socket_path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ScribedError::Socket {
                message: format!("Failed to create socket directory: {}", e),
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| ScribedError::Socket {
            message: format!("Failed to bind {}: {}", self.socket_path.display(), e),
        })?;

        // Owner-only: the socket is a local, single-user control channel
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&self.socket_path, perms) {
                eprintln!("scribed: could not set socket permissions: {}", e);
            }
        }

        let mut shutdown_rx = self.shutdown_token();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handler = Arc::clone(&handler);
                            let events = self.events.subscribe();
                            let shutdown = self.shutdown_token();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, handler, events, shutdown).await {
                                    eprintln!("scribed: connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            return Err(ScribedError::Connection {
                                message: format!("Failed to accept connection: {}", e),
                            });
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        // Let connections deliver their shutdown notices, bounded
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), drain).await;

        if self.socket_path.exists()
            && let Err(e) = std::fs::remove_file(&self.socket_path)
        {
            eprintln!("scribed: could not remove socket file: {}", e);
        }

        Ok(())
    }
}

async fn write_line(stream: &mut (impl AsyncWriteExt + Unpin), line: &str) -> Result<()> {
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ScribedError::Connection {
            message: format!("Failed to write to client: {}", e),
        })?;
    stream
        .write_all(b"\n")
        .await
        .map_err(|e| ScribedError::Connection {
            message: format!("Failed to write to client: {}", e),
        })?;
    stream.flush().await.map_err(|e| ScribedError::Connection {
        message: format!("Failed to flush writer: {}", e),
    })
}

/// Serve one client connection until it disconnects or shutdown fires.
async fn handle_connection(
    stream: UnixStream,
    handler: Arc<dyn CommandHandler>,
    mut events: broadcast::Receiver<StreamMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut session = ConnectionSession::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        // One bad frame must not kill the session: reply with
                        // a structured decode error and keep reading.
                        let response = match Command::from_json(line) {
                            Ok(command) => handler.handle(command, &mut session).await,
                            Err(e) => Response::error_with_code(
                                ErrorCode::Protocol,
                                format!("invalid JSON: {}", e),
                            ),
                        };
                        // Stream messages broadcast while the command ran go
                        // out first, so e.g. a stop ack always follows the
                        // final chunk's result on this connection.
                        while let Ok(msg) = events.try_recv() {
                            if session.streaming {
                                let json = msg.to_json().map_err(|e| ScribedError::Protocol {
                                    message: format!("Failed to serialize stream message: {}", e),
                                })?;
                                write_line(&mut writer, &json).await?;
                            }
                        }
                        let json = response.to_json().map_err(|e| ScribedError::Protocol {
                            message: format!("Failed to serialize response: {}", e),
                        })?;
                        write_line(&mut writer, &json).await?;
                    }
                    Ok(None) => break, // client disconnected
                    Err(_) => break,
                }
            }
            msg = events.recv() => {
                match msg {
                    Ok(msg) => {
                        if session.streaming {
                            let json = msg.to_json().map_err(|e| ScribedError::Protocol {
                                message: format!("Failed to serialize stream message: {}", e),
                            })?;
                            write_line(&mut writer, &json).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        eprintln!("scribed: connection lagged, skipped {} stream messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.changed() => {
                let notice = StreamMessage::Shutdown {
                    message: "daemon shutting down".to_string(),
                };
                if let Ok(json) = notice.to_json() {
                    let _ = write_line(&mut writer, &json).await;
                }
                break;
            }
        }
    }

    Ok(())
}

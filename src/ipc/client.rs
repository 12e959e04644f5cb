//! Control client: thin connector used by the CLI and the supervisor.

use crate::error::{Result, ScribedError};
use crate::ipc::protocol::{Command, Response, StreamMessage};
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Persistent connection to the daemon.
///
/// While recording, the daemon may interleave unsolicited stream messages
/// with command replies on the same connection; `request` parks those in a
/// buffer that `next_message` drains first.
pub struct ControlClient {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    pending: VecDeque<StreamMessage>,
}

impl ControlClient {
    /// Connect to the daemon's socket.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream =
            UnixStream::connect(socket_path)
                .await
                .map_err(|e| ScribedError::Connection {
                    message: format!("Failed to connect to daemon: {}", e),
                })?;

        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
            pending: VecDeque::new(),
        })
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        self.lines
            .next_line()
            .await
            .map_err(|e| ScribedError::Connection {
                message: format!("Failed to read from daemon: {}", e),
            })
    }

    /// Send one command and wait for its reply.
    ///
    /// Stream messages arriving before the reply are buffered for
    /// [`ControlClient::next_message`].
    pub async fn request(&mut self, command: &Command) -> Result<Response> {
        let json = command.to_json().map_err(|e| ScribedError::Protocol {
            message: format!("Failed to serialize command: {}", e),
        })?;

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| ScribedError::Connection {
                message: format!("Failed to write command: {}", e),
            })?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|e| ScribedError::Connection {
                message: format!("Failed to write command: {}", e),
            })?;
        self.writer
            .flush()
            .await
            .map_err(|e| ScribedError::Connection {
                message: format!("Failed to flush command: {}", e),
            })?;

        loop {
            let line = self.read_line().await?.ok_or_else(|| ScribedError::Connection {
                message: "Connection closed before response".to_string(),
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Ok(response) = Response::from_json(line) {
                return Ok(response);
            }
            match StreamMessage::from_json(line) {
                Ok(msg) => self.pending.push_back(msg),
                Err(e) => {
                    return Err(ScribedError::Protocol {
                        message: format!("Unparseable message from daemon: {}", e),
                    });
                }
            }
        }
    }

    /// Read the next stream message; None when the daemon closed the
    /// connection.
    pub async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }

        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return match StreamMessage::from_json(line) {
                Ok(msg) => Ok(Some(msg)),
                Err(e) => Err(ScribedError::Protocol {
                    message: format!("Unparseable stream message: {}", e),
                }),
            };
        }
    }
}

/// One-shot convenience: connect, send, read the reply, disconnect.
pub async fn send_command(socket_path: &Path, command: Command) -> Result<Response> {
    let mut client = ControlClient::connect(socket_path).await?;
    client.request(&command).await
}

//! Client-side daemon supervision: detect-running, spawn, stop, status.
//!
//! This is what makes every invocation after the first feel instant: the
//! heavyweight model load happens once in the background process, and front
//! ends just reconnect to it.

use crate::daemon::pid_file_path;
use crate::defaults;
use crate::error::{Result, ScribedError};
use crate::ipc::client::ControlClient;
use crate::ipc::protocol::{Command, Response};
use crate::ipc::server::default_socket_path;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub socket_path: PathBuf,
    /// How long to wait for a spawned daemon to accept connections.
    pub startup_timeout: Duration,
    /// How long to wait for a graceful exit before escalating to signals.
    pub shutdown_grace: Duration,
    pub quiet: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            startup_timeout: defaults::STARTUP_TIMEOUT,
            shutdown_grace: defaults::SHUTDOWN_GRACE,
            quiet: false,
        }
    }
}

/// Result of a status probe.
#[derive(Debug)]
pub enum DaemonStatus {
    /// Nothing listens on the socket.
    NotRunning,
    /// Connected and answered `get_status`.
    Running(Response),
    /// Something accepted the connection but did not answer properly.
    Unreachable(String),
}

/// Manages the background daemon's lifecycle from the client side.
pub struct ProcessSupervisor {
    opts: SupervisorOptions,
}

impl ProcessSupervisor {
    /// Create a supervisor with the given options.
    pub fn new(opts: SupervisorOptions) -> Self {
        Self { opts }
    }

    /// Convenience constructor for a socket path override.
    pub fn with_socket(socket_path: Option<PathBuf>) -> Self {
        Self::new(SupervisorOptions {
            socket_path: socket_path.unwrap_or_else(default_socket_path),
            ..Default::default()
        })
    }

    /// The socket path this supervisor manages.
    pub fn socket_path(&self) -> &Path {
        &self.opts.socket_path
    }

    /// Connect to the daemon, spawning it first if necessary.
    ///
    /// Connect-first makes concurrent callers converge on one instance: only
    /// the caller holding the spawn lock actually forks a daemon, everyone
    /// else polls the socket until it accepts.
    pub async fn ensure_running(&self) -> Result<ControlClient> {
        if let Ok(client) = ControlClient::connect(&self.opts.socket_path).await {
            return Ok(client);
        }

        self.clean_stale_socket()?;

        // Lock released when the guard drops, after the poll loop below
        let _spawn_lock = match acquire_spawn_lock(&pid_file_path(&self.opts.socket_path))? {
            Some(lock) => {
                self.spawn_daemon(&lock)?;
                Some(lock)
            }
            None => {
                // Another caller is spawning right now; just wait for it
                None
            }
        };

        let deadline = Instant::now() + self.opts.startup_timeout;
        let mut backoff = Duration::from_millis(100);
        loop {
            match ControlClient::connect(&self.opts.socket_path).await {
                Ok(client) => return Ok(client),
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
                Err(_) => {
                    return Err(ScribedError::Supervision {
                        message: format!(
                            "daemon did not accept connections at {} within {}s; \
                             run `scribed daemon -v` in a terminal to see why it fails",
                            self.opts.socket_path.display(),
                            self.opts.startup_timeout.as_secs(),
                        ),
                    });
                }
            }
        }
    }

    /// Stop the daemon. Returns false when none was running.
    ///
    /// Graceful first (`shutdown` command, wait out the grace period), then
    /// SIGTERM via the pid file, then SIGKILL.
    pub async fn stop(&self) -> Result<bool> {
        let socket = &self.opts.socket_path;

        let mut client = match ControlClient::connect(socket).await {
            Ok(client) => client,
            Err(_) => {
                // Not running; tidy up anything a crashed instance left
                self.clean_stale_socket()?;
                let _ = std::fs::remove_file(pid_file_path(socket));
                return Ok(false);
            }
        };

        let response = client.request(&Command::Shutdown).await?;
        if !response.is_success() {
            return Err(ScribedError::Supervision {
                message: format!("daemon refused shutdown: {}", response.message),
            });
        }
        drop(client);

        let deadline = Instant::now() + self.opts.shutdown_grace;
        while Instant::now() < deadline {
            if !socket.exists() && ControlClient::connect(socket).await.is_err() {
                let _ = std::fs::remove_file(pid_file_path(socket));
                if !self.opts.quiet {
                    eprintln!("scribed: daemon stopped");
                }
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.force_stop().await?;
        Ok(true)
    }

    /// Stop then start a fresh daemon (e.g. after changing the config file).
    pub async fn restart(&self) -> Result<ControlClient> {
        self.stop().await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.ensure_running().await
    }

    /// Probe the daemon without side effects.
    pub async fn status(&self) -> DaemonStatus {
        match ControlClient::connect(&self.opts.socket_path).await {
            Err(_) => DaemonStatus::NotRunning,
            Ok(mut client) => match client.request(&Command::GetStatus).await {
                Ok(response) => DaemonStatus::Running(response),
                Err(e) => DaemonStatus::Unreachable(e.to_string()),
            },
        }
    }

    /// Remove a rendezvous socket whose owning process is gone.
    fn clean_stale_socket(&self) -> Result<()> {
        let socket = &self.opts.socket_path;
        if !socket.exists() {
            return Ok(());
        }
        if !self.opts.quiet {
            eprintln!(
                "scribed: removing stale socket left by a crashed daemon: {}",
                socket.display()
            );
        }
        std::fs::remove_file(socket).map_err(|e| ScribedError::Supervision {
            message: format!(
                "stale socket {} could not be removed: {}",
                socket.display(),
                e
            ),
        })
    }

    fn spawn_daemon(&self, lock_file: &File) -> Result<()> {
        let exe = std::env::current_exe().map_err(|e| ScribedError::Supervision {
            message: format!("cannot locate own executable: {}", e),
        })?;

        let mut cmd = std::process::Command::new(exe);
        cmd.arg("daemon")
            .arg("--socket")
            .arg(&self.opts.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        {
            use std::os::unix::process::CommandExt;
            // Detach from our process group so terminal signals don't reach it
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| ScribedError::Supervision {
            message: format!("failed to spawn daemon: {}", e),
        })?;

        // Provisional pid; the daemon rewrites the file with its own once up
        use std::io::Write;
        let mut writer = lock_file;
        let _ = writer.set_len(0);
        let _ = write!(writer, "{}", child.id());

        if !self.opts.quiet {
            eprintln!("scribed: starting daemon (pid {})...", child.id());
        }
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        let pid_file = pid_file_path(&self.opts.socket_path);
        let Some(pid) = read_pid(&pid_file) else {
            return Err(ScribedError::Supervision {
                message: format!(
                    "daemon did not exit within the grace period and no pid file \
                     exists at {}; kill it manually",
                    pid_file.display()
                ),
            });
        };

        if !self.opts.quiet {
            eprintln!("scribed: daemon unresponsive, sending SIGTERM to {}", pid);
        }
        unsafe { libc::kill(pid, libc::SIGTERM) };

        let deadline = Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if process_alive(pid) {
            if !self.opts.quiet {
                eprintln!("scribed: SIGTERM ignored, sending SIGKILL to {}", pid);
            }
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }

        let _ = std::fs::remove_file(&self.opts.socket_path);
        let _ = std::fs::remove_file(&pid_file);
        Ok(())
    }
}

/// Take the exclusive spawn lock; None means another process holds it.
///
/// flock is advisory and process-scoped, which is exactly the contention
/// domain here: two CLI invocations racing to spawn the daemon.
fn acquire_spawn_lock(pid_file: &Path) -> Result<Option<File>> {
    if let Some(parent) = pid_file.parent()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(pid_file)?;

    let locked = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0;
    if locked { Ok(Some(file)) } else { Ok(None) }
}

fn read_pid(pid_file: &Path) -> Option<i32> {
    std::fs::read_to_string(pid_file)
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

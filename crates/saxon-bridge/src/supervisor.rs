//! Worker supervisor - owns one worker subprocess from spawn to teardown.
//!
//! Flow:
//! 1. Resolve the executable (stage embedded bytes to a temp file if needed)
//! 2. Spawn the worker with the debug flag as its only argument
//! 3. Drain stderr in a background task, forwarding each line to tracing
//! 4. Read the 24-byte port handshake from stdout
//! 5. On stop: kill and reap the worker, let the drain flush (bounded), delete the staged file
//!
//! A failed start tears down whatever it already created, so the caller only
//! ever sees a running worker or an error.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::handshake::{HandshakePayload, read_handshake};
use crate::config::BridgeConfig;
use crate::deadline::bounded;
use crate::error::{BridgeError, Phase};
use crate::staging::{self, RetryPolicy, StagedExecutable, TeardownError, WorkerSource};

const STDERR_CHUNK: usize = 1024;

/// How long a killed worker's remaining stderr is read before the drain is cancelled.
const STDERR_FLUSH_GRACE: Duration = Duration::from_millis(250);

/// A freshly written executable can briefly fail to exec with ETXTBSY while a
/// concurrently forked process still holds the write handle.
const SPAWN_BUSY_RETRIES: u32 = 10;
const SPAWN_BUSY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker already started")]
    AlreadyStarted,

    #[error("worker already stopped")]
    AlreadyStopped,

    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker {0} not captured")]
    PipeMissing(&'static str),
}

impl SpawnError {
    fn is_executable_busy(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == io::ErrorKind::ExecutableFileBusy)
    }
}

/// Extension point for how the worker process is launched.
///
/// Implementations must pipe stdout and stderr.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, executable: &Path, debug: bool) -> Result<Child, SpawnError>;
}

/// Runs the executable directly with `true`/`false` as its only argument.
#[derive(Debug, Default)]
pub struct SimpleSpawner;

impl WorkerSpawner for SimpleSpawner {
    fn spawn(&self, executable: &Path, debug: bool) -> Result<Child, SpawnError> {
        Command::new(executable)
            .arg(debug.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                path: executable.to_path_buf(),
                source,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One worker subprocess. Not reusable: start once, stop once.
pub struct WorkerProcess {
    state: WorkerState,
    spawner: Arc<dyn WorkerSpawner>,
    handshake_timeout: Duration,
    delete_retry: RetryPolicy,
    child: Option<Child>,
    // Held open so a worker writing past the handshake doesn't hit EPIPE.
    stdout: Option<ChildStdout>,
    staged: Option<StagedExecutable>,
    drain_cancel: CancellationToken,
    drain_task: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            state: WorkerState::NotStarted,
            spawner: Arc::clone(&config.spawner),
            handshake_timeout: config.handshake_timeout,
            delete_retry: config.delete_retry,
            child: None,
            stdout: None,
            staged: None,
            drain_cancel: CancellationToken::new(),
            drain_task: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// OS process id, while the child handle is held.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn staged_path(&self) -> Option<&Path> {
        self.staged.as_ref().map(StagedExecutable::path)
    }

    /// Launch the worker and wait for its port handshake.
    pub async fn start(
        &mut self,
        source: &WorkerSource,
        debug: bool,
    ) -> Result<HandshakePayload, BridgeError> {
        self.start_with_cancel(source, debug, &CancellationToken::new())
            .await
    }

    pub async fn start_with_cancel(
        &mut self,
        source: &WorkerSource,
        debug: bool,
        cancel: &CancellationToken,
    ) -> Result<HandshakePayload, BridgeError> {
        match self.state {
            WorkerState::NotStarted => {}
            WorkerState::Stopping | WorkerState::Stopped => {
                return Err(SpawnError::AlreadyStopped.into());
            }
            WorkerState::Starting | WorkerState::Running => {
                return Err(SpawnError::AlreadyStarted.into());
            }
        }
        self.state = WorkerState::Starting;

        match self.launch(source, debug, cancel).await {
            Ok(payload) => {
                self.state = WorkerState::Running;
                tracing::debug!(handshake = %payload, "Worker connected");
                Ok(payload)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Worker start failed, cleaning up");
                if let Err(stop_err) = self.stop().await {
                    tracing::warn!(error = %stop_err, "Failed to clean up after failed worker start");
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &mut self,
        source: &WorkerSource,
        debug_flag: bool,
        cancel: &CancellationToken,
    ) -> Result<HandshakePayload, BridgeError> {
        let executable = match source {
            WorkerSource::Path(path) => {
                tracing::debug!(path = %path.display(), "Using provided worker executable");
                path.clone()
            }
            WorkerSource::Embedded(bytes) => {
                let staged = staging::stage(bytes)?;
                let path = staged.path().to_path_buf();
                self.staged = Some(staged);
                path
            }
        };

        tracing::debug!(debug = debug_flag, "Starting worker executable");
        let child = self.spawn_with_retry(&executable, debug_flag).await?;
        let child = self.child.insert(child);
        tracing::debug!(pid = ?child.id(), "Worker spawned");

        let mut stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::PipeMissing("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::PipeMissing("stderr"))?;

        self.drain_task = Some(spawn_stderr_drain(stderr, self.drain_cancel.clone()));

        let payload = bounded(
            Phase::Handshake,
            Some(self.handshake_timeout),
            cancel,
            read_handshake(&mut stdout),
        )
        .await?;
        self.stdout = Some(stdout);
        Ok(payload)
    }

    async fn spawn_with_retry(&self, executable: &Path, debug: bool) -> Result<Child, SpawnError> {
        let mut retries = 0;
        loop {
            match self.spawner.spawn(executable, debug) {
                Err(e) if e.is_executable_busy() && retries < SPAWN_BUSY_RETRIES => {
                    retries += 1;
                    tracing::trace!(retries, "Worker executable busy, retrying spawn");
                    tokio::time::sleep(SPAWN_BUSY_INTERVAL).await;
                }
                result => return result,
            }
        }
    }

    /// Kill the worker (if alive) and delete the staged executable (if any).
    ///
    /// Safe to call in any state; calls after the first are no-ops. Only a
    /// staged file that cannot be deleted is an error.
    pub async fn stop(&mut self) -> Result<(), TeardownError> {
        if self.state == WorkerState::Stopped {
            return Ok(());
        }
        self.state = WorkerState::Stopping;
        tracing::debug!("Stopping worker");

        if let Some(mut child) = self.child.take() {
            kill_child(&mut child).await;
        }
        self.stdout = None;

        // Output still in the pipe is forwarded; a stderr held open by a
        // grandchild must not stall teardown.
        if let Some(mut task) = self.drain_task.take() {
            let joined = match tokio::time::timeout(STDERR_FLUSH_GRACE, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::debug!("Worker stderr still open after kill, cancelling drain");
                    self.drain_cancel.cancel();
                    task.await
                }
            };
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Stderr drain task failed");
            }
        }
        self.drain_cancel.cancel();

        let result = match self.staged.take() {
            Some(mut staged) => staged.remove(&self.delete_retry).await,
            None => Ok(()),
        };

        self.state = WorkerState::Stopped;
        result
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.drain_cancel.cancel();
        if self.state == WorkerState::Stopped || self.state == WorkerState::NotStarted {
            return;
        }
        tracing::debug!(state = ?self.state, "Worker dropped without stop, killing");
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.start_kill()
        {
            tracing::warn!(error = %e, "Failed to kill worker on drop");
        }
        // A staged executable removes itself on drop.
    }
}

/// Best effort: a kill that fails is logged, never returned.
async fn kill_child(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!(%status, "Worker already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to query worker status"),
    }

    tracing::debug!("Killing worker");
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}

fn spawn_stderr_drain(stderr: ChildStderr, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut reader = BufReader::with_capacity(STDERR_CHUNK, stderr);
            let mut line = Vec::new();
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        if !line.is_empty() {
                            forward_stderr_line(&line);
                        }
                        break;
                    }
                    read = reader.read_until(b'\n', &mut line) => match read {
                        Ok(0) => {
                            if !line.is_empty() {
                                forward_stderr_line(&line);
                            }
                            break;
                        }
                        Ok(_) => {
                            forward_stderr_line(&line);
                            line.clear();
                        }
                        // Partial bytes stay in `line` for the next read.
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read worker stderr");
                            break;
                        }
                    },
                }
            }
            tracing::trace!("Stderr drain exiting");
        }
        .instrument(tracing::Span::current()),
    )
}

/// One worker line per event, line terminator stripped.
fn forward_stderr_line(line: &[u8]) {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    tracing::info!(target: "saxon_bridge::worker", "{}", String::from_utf8_lossy(line));
}

//! OS-level process lifecycle.
//!
//! The supervisor owns port allocation, spawns the external agent runtime per
//! process, serialises prompt delivery through one FIFO per process, and
//! watches exits. State transitions stay with the processor: the supervisor
//! only reports what happened through `ConfirmReady` and `ProcessExited`
//! commands.

pub mod accountability;
pub mod ports;
pub mod readiness;

use crate::config::RuntimeConfig;
use crate::error::{ProcessError, Result};
use crate::logging::{LogCategory, LogSink};
use crate::mcp::config as mcp_config;
use crate::processor::command::{Command, CommandQueue, ExitCause};
use crate::processor::machine::ProcessRole;
use crate::{OrchestratorEvent, ProcessId};
use parking_lot::Mutex;
use ports::{PortAllocator, ReleaseHandle};
use readiness::ReadinessTracker;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command as OsCommand;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const MAX_STDERR_LOG_BYTES: usize = 64 * 1024;
const PROMPT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub session_dir: PathBuf,
    pub runtime: RuntimeConfig,
    pub grace_period: Duration,
    pub port_start: u16,
    pub port_end: u16,
}

struct ManagedProcess {
    prompt_tx: mpsc::Sender<String>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
    port: u16,
    /// Exit cause to report if the child exits now. None means unexpected.
    desired_exit: Arc<Mutex<Option<ExitCause>>>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    ports: PortAllocator,
    readiness: ReadinessTracker,
    commands: CommandQueue,
    events: broadcast::Sender<OrchestratorEvent>,
    processes: Mutex<HashMap<ProcessId, ManagedProcess>>,
    cancel: CancellationToken,
    log: LogSink,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        readiness: ReadinessTracker,
        commands: CommandQueue,
        events: broadcast::Sender<OrchestratorEvent>,
        cancel: CancellationToken,
        log: LogSink,
    ) -> Self {
        let ports = PortAllocator::new(config.port_start, config.port_end);
        Self {
            config,
            ports,
            readiness,
            commands,
            events,
            processes: Mutex::new(HashMap::new()),
            cancel,
            log,
        }
    }

    pub fn readiness(&self) -> &ReadinessTracker {
        &self.readiness
    }

    /// Launch the agent runtime for `process_id`: reserve a port, write the
    /// MCP config, spawn the child, and wire prompt/stderr/exit tasks.
    pub async fn spawn_process(&self, process_id: &ProcessId, role: ProcessRole) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }

        let (port, release) = self.ports.reserve(process_id)?;
        let config_value = match role {
            ProcessRole::Coordinator => mcp_config::coordinator_config(port),
            ProcessRole::Worker | ProcessRole::Observer => {
                mcp_config::worker_config(port, process_id)
            }
        };
        let config_dir = self.config.session_dir.join("processes").join(process_id);
        let config_path = match mcp_config::write_config(&config_dir.join("mcp.json"), &config_value)
        {
            Ok(path) => path,
            Err(error) => {
                release.release();
                return Err(error);
            }
        };

        let mut command = OsCommand::new(&self.config.runtime.command);
        command
            .args(&self.config.runtime.args)
            .env("PERLES_MCP_CONFIG", &config_path)
            .env("PERLES_PROCESS_ID", process_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                release.release();
                let failure = ProcessError::SpawnFailed {
                    id: process_id.clone(),
                    reason: error.to_string(),
                };
                self.commands.submit_nowait(Command::ProcessExited {
                    process_id: process_id.clone(),
                    cause: ExitCause::Failed,
                });
                return Err(failure.into());
            }
        };

        let stdin = child.stdin.take().ok_or_else(|| {
            anyhow::anyhow!("failed to capture stdin of runtime for {process_id}")
        })?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_reader(process_id.clone(), stderr);
        }

        let (prompt_tx, prompt_rx) = mpsc::channel::<String>(PROMPT_QUEUE_CAPACITY);
        let queued = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let desired_exit = Arc::new(Mutex::new(None));

        spawn_prompt_writer(
            process_id.clone(),
            prompt_rx,
            stdin,
            Arc::clone(&queued),
            self.events.clone(),
        );
        spawn_exit_watcher(
            process_id.clone(),
            child,
            cancel.clone(),
            Arc::clone(&desired_exit),
            release,
            self.commands.clone(),
        );

        self.processes.lock().insert(
            process_id.clone(),
            ManagedProcess {
                prompt_tx,
                queued,
                cancel,
                port,
                desired_exit,
            },
        );

        self.log.info(
            LogCategory::Supervisor,
            "process launched",
            &["process", process_id, "port", &port.to_string()],
        );
        tracing::info!(process = %process_id, port, role = role.as_str(), "process launched");
        Ok(())
    }

    /// Queue a prompt for delivery. Prompts sent while the process is
    /// mid-turn append behind earlier ones.
    pub async fn send_prompt(&self, process_id: &ProcessId, text: String) -> Result<()> {
        let (tx, queued) = {
            let processes = self.processes.lock();
            let managed = processes.get(process_id).ok_or_else(|| {
                crate::Error::Process(ProcessError::NotFound {
                    id: process_id.clone(),
                })
            })?;
            (managed.prompt_tx.clone(), Arc::clone(&managed.queued))
        };

        queued.fetch_add(1, Ordering::SeqCst);
        let queue_len = queued.load(Ordering::SeqCst);
        self.events
            .send(OrchestratorEvent::PromptQueued {
                process_id: process_id.clone(),
                queue_len,
            })
            .ok();
        tx.send(text).await.map_err(|_| {
            crate::Error::Process(ProcessError::NotFound {
                id: process_id.clone(),
            })
        })
    }

    /// Graceful stop: termination prompt, grace period, then kill. `force`
    /// skips the grace period.
    pub async fn stop_process(&self, process_id: &ProcessId, force: bool) -> Result<()> {
        self.shutdown_process(process_id, ExitCause::Stopped, force)
            .await
    }

    /// Retire: a graceful stop recorded with cause `Retired`.
    pub async fn retire_process(&self, process_id: &ProcessId) -> Result<()> {
        self.shutdown_process(process_id, ExitCause::Retired, false)
            .await
    }

    async fn shutdown_process(
        &self,
        process_id: &ProcessId,
        cause: ExitCause,
        force: bool,
    ) -> Result<()> {
        let (cancel, desired, prompt_tx, queued) = {
            let processes = self.processes.lock();
            let managed = processes.get(process_id).ok_or_else(|| {
                crate::Error::Process(ProcessError::NotFound {
                    id: process_id.clone(),
                })
            })?;
            (
                managed.cancel.clone(),
                Arc::clone(&managed.desired_exit),
                managed.prompt_tx.clone(),
                Arc::clone(&managed.queued),
            )
        };
        *desired.lock() = Some(cause);

        if force {
            cancel.cancel();
            return Ok(());
        }

        // Counted like any other prompt so the writer's decrement balances.
        queued.fetch_add(1, Ordering::SeqCst);
        prompt_tx
            .send(
                "The session is ending. Finish your current step, post any pending \
                 messages, and exit."
                    .to_string(),
            )
            .await
            .ok();

        let grace = self.config.grace_period;
        let process = process_id.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !cancel.is_cancelled() {
                log.info(
                    LogCategory::Supervisor,
                    "grace period elapsed, signalling",
                    &["process", &process],
                );
                cancel.cancel();
            }
        });
        Ok(())
    }

    /// Record a ready signal for the worker gate.
    pub fn confirm_ready(&self, process_id: &ProcessId) {
        self.readiness.confirm(process_id);
    }

    /// Drop bookkeeping for an exited process. The exit watcher has already
    /// released its port.
    pub fn forget_process(&self, process_id: &ProcessId) {
        self.processes.lock().remove(process_id);
    }

    pub fn queue_len(&self, process_id: &ProcessId) -> usize {
        self.processes
            .lock()
            .get(process_id)
            .map(|managed| managed.queued.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn port_of(&self, process_id: &ProcessId) -> Option<u16> {
        self.processes
            .lock()
            .get(process_id)
            .map(|managed| managed.port)
    }

    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }

    /// Stop every live process, force-killing after the shutdown deadline.
    pub async fn shutdown_all(&self) {
        let ids: Vec<ProcessId> = self.processes.lock().keys().cloned().collect();
        for id in &ids {
            self.stop_process(id, false).await.ok();
        }
        tokio::time::sleep(self.config.grace_period).await;
        let remaining: Vec<ProcessId> = self.processes.lock().keys().cloned().collect();
        for id in remaining {
            if let Some(managed) = self.processes.lock().get(&id) {
                managed.cancel.cancel();
            }
        }
    }
}

fn spawn_stderr_reader(
    process_id: ProcessId,
    stderr: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stderr);
        let mut chunk = [0u8; 2048];
        let mut buffer = Vec::new();
        loop {
            let read = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(size) => size,
                Err(error) => {
                    tracing::debug!(process = %process_id, %error, "failed to read runtime stderr");
                    return;
                }
            };
            let remaining = MAX_STDERR_LOG_BYTES.saturating_sub(buffer.len());
            if remaining == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read.min(remaining)]);
        }
        if !buffer.is_empty() {
            let mut output = String::from_utf8_lossy(&buffer).to_string();
            if buffer.len() >= MAX_STDERR_LOG_BYTES {
                output.push_str("\n...[truncated]");
            }
            tracing::debug!(process = %process_id, stderr = %output, "runtime stderr");
        }
    });
}

fn spawn_prompt_writer(
    process_id: ProcessId,
    mut prompt_rx: mpsc::Receiver<String>,
    mut stdin: tokio::process::ChildStdin,
    queued: Arc<AtomicUsize>,
    events: broadcast::Sender<OrchestratorEvent>,
) {
    tokio::spawn(async move {
        while let Some(prompt) = prompt_rx.recv().await {
            let mut line = prompt.replace('\n', "\u{23CE}");
            line.push('\n');
            if let Err(error) = stdin.write_all(line.as_bytes()).await {
                tracing::debug!(process = %process_id, %error, "prompt delivery failed");
                break;
            }
            if let Err(error) = stdin.flush().await {
                tracing::debug!(process = %process_id, %error, "prompt flush failed");
                break;
            }
            let queue_len = queued
                .fetch_sub(1, Ordering::SeqCst)
                .saturating_sub(1);
            events
                .send(OrchestratorEvent::PromptQueued {
                    process_id: process_id.clone(),
                    queue_len,
                })
                .ok();
        }
    });
}

fn spawn_exit_watcher(
    process_id: ProcessId,
    mut child: tokio::process::Child,
    cancel: CancellationToken,
    desired_exit: Arc<Mutex<Option<ExitCause>>>,
    release: ReleaseHandle,
    commands: CommandQueue,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                if let Err(error) = child.kill().await {
                    tracing::debug!(process = %process_id, %error, "failed to kill runtime");
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => {
                tracing::debug!(process = %process_id, %status, "runtime exited")
            }
            Err(error) => tracing::debug!(process = %process_id, %error, "runtime wait failed"),
        }
        release.release();
        let cause = desired_exit.lock().take().unwrap_or(ExitCause::Failed);
        commands.submit_nowait(Command::ProcessExited {
            process_id: process_id.clone(),
            cause,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::command::CommandEnvelope;

    fn test_config(dir: &std::path::Path) -> SupervisorConfig {
        SupervisorConfig {
            session_dir: dir.to_path_buf(),
            // `cat` consumes stdin lines and exits when stdin closes or on
            // SIGKILL, standing in for the agent runtime.
            runtime: RuntimeConfig {
                command: "cat".into(),
                args: Vec::new(),
            },
            grace_period: Duration::from_millis(50),
            port_start: 9000,
            port_end: 9001,
        }
    }

    fn harness(dir: &std::path::Path) -> (Arc<Supervisor>, mpsc::Receiver<CommandEnvelope>) {
        let (tx, rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(64);
        let supervisor = Arc::new(Supervisor::new(
            test_config(dir),
            ReadinessTracker::new(1),
            CommandQueue::new(tx),
            events,
            CancellationToken::new(),
            LogSink::noop(),
        ));
        (supervisor, rx)
    }

    async fn wait_for_exit(
        rx: &mut mpsc::Receiver<CommandEnvelope>,
        process_id: &str,
    ) -> ExitCause {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("exit command should arrive")
                .expect("queue open");
            if let Command::ProcessExited {
                process_id: id,
                cause,
            } = envelope.command
            {
                assert_eq!(id, process_id);
                return cause;
            }
        }
    }

    #[tokio::test]
    async fn spawn_allocates_port_and_writes_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, _rx) = harness(dir.path());

        supervisor
            .spawn_process(&"WORKER.1".to_string(), ProcessRole::Worker)
            .await
            .expect("spawn");
        let port = supervisor.port_of(&"WORKER.1".to_string()).expect("port");
        assert!((9000..=9001).contains(&port));

        let config_path = dir.path().join("processes/WORKER.1/mcp.json");
        let raw = std::fs::read_to_string(config_path).expect("mcp config written");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(
            value["mcpServers"]["perles-worker"]["url"],
            format!("http://localhost:{port}/worker/WORKER.1")
        );

        supervisor
            .stop_process(&"WORKER.1".to_string(), true)
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn force_stop_reports_stopped_and_releases_port() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, mut rx) = harness(dir.path());
        let id = "WORKER.1".to_string();

        supervisor
            .spawn_process(&id, ProcessRole::Worker)
            .await
            .expect("spawn");
        assert_eq!(supervisor.ports_in_use(), 1);

        supervisor.stop_process(&id, true).await.expect("stop");
        let cause = wait_for_exit(&mut rx, &id).await;
        assert_eq!(cause, ExitCause::Stopped);
        assert_eq!(supervisor.ports_in_use(), 0);
    }

    #[tokio::test]
    async fn graceful_retire_escalates_after_grace_period() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, mut rx) = harness(dir.path());
        let id = "WORKER.1".to_string();

        supervisor
            .spawn_process(&id, ProcessRole::Worker)
            .await
            .expect("spawn");
        supervisor.retire_process(&id).await.expect("retire");
        // `cat` ignores the termination prompt, so the grace timer kills it.
        let cause = wait_for_exit(&mut rx, &id).await;
        assert_eq!(cause, ExitCause::Retired);
    }

    #[tokio::test]
    async fn unexpected_exit_reports_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, mut rx) = harness(dir.path());
        let id = "WORKER.1".to_string();

        supervisor
            .spawn_process(&id, ProcessRole::Worker)
            .await
            .expect("spawn");
        // Dropping the managed entry drops prompt_tx, which ends the writer
        // task, closes the child's stdin, and `cat` exits on its own.
        supervisor.forget_process(&id);

        let cause = wait_for_exit(&mut rx, &id).await;
        assert_eq!(cause, ExitCause::Failed);
    }

    #[tokio::test]
    async fn prompts_queue_and_drain_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, _rx) = harness(dir.path());
        let id = "WORKER.1".to_string();

        supervisor
            .spawn_process(&id, ProcessRole::Worker)
            .await
            .expect("spawn");
        for n in 0..3 {
            supervisor
                .send_prompt(&id, format!("prompt {n}"))
                .await
                .expect("send");
        }
        // The writer drains the queue as fast as `cat` consumes stdin.
        tokio::time::timeout(Duration::from_secs(5), async {
            while supervisor.queue_len(&id) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue should drain");

        supervisor.stop_process(&id, true).await.expect("stop");
    }

    #[tokio::test]
    async fn send_prompt_to_unknown_process_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, _rx) = harness(dir.path());
        let error = supervisor
            .send_prompt(&"WORKER.9".to_string(), "hello".into())
            .await
            .expect_err("unknown process");
        assert!(matches!(
            error,
            crate::Error::Process(ProcessError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn spawn_failure_releases_port_and_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(64);
        let mut config = test_config(dir.path());
        config.runtime.command = "definitely-not-a-real-binary-xyz".into();
        let supervisor = Supervisor::new(
            config,
            ReadinessTracker::new(1),
            CommandQueue::new(tx),
            events,
            CancellationToken::new(),
            LogSink::noop(),
        );

        let error = supervisor
            .spawn_process(&"WORKER.1".to_string(), ProcessRole::Worker)
            .await
            .expect_err("spawn must fail");
        assert!(matches!(
            error,
            crate::Error::Process(ProcessError::SpawnFailed { .. })
        ));
        assert_eq!(supervisor.ports_in_use(), 0);
        let cause = wait_for_exit(&mut rx, "WORKER.1").await;
        assert_eq!(cause, ExitCause::Failed);
    }
}

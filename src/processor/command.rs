//! Commands accepted by the processor queue.

use crate::error::Result;
use crate::fabric::broker::NotificationBatch;
use crate::processor::machine::ProcessRole;
use crate::{ProcessId, ThreadId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Review verdicts a reviewer may report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Verdict {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "DENIED")]
    Denied,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approved => "APPROVED",
            Verdict::Denied => "DENIED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "APPROVED" => Some(Verdict::Approved),
            "DENIED" => Some(Verdict::Denied),
            _ => None,
        }
    }
}

/// A tagged request entering the processor. The first group is submitted by
/// MCP tool adapters; the trailing variants are internal notifications from
/// the supervisor keeping the state machine the single writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SpawnProcess {
        process_id: ProcessId,
        role: ProcessRole,
    },
    AssignTask {
        process_id: ProcessId,
        task_id: String,
        thread_id: Option<ThreadId>,
        description: String,
    },
    AssignReview {
        process_id: ProcessId,
        task_id: String,
        implementer_id: ProcessId,
        summary: String,
    },
    AssignReviewFeedback {
        process_id: ProcessId,
        task_id: String,
        feedback: String,
    },
    ApproveCommit {
        process_id: ProcessId,
        task_id: String,
    },
    ReportImplementationComplete {
        process_id: ProcessId,
        summary: String,
    },
    ReportReviewVerdict {
        process_id: ProcessId,
        verdict: Verdict,
        comments: String,
    },
    SendToProcess {
        process_id: ProcessId,
        text: String,
    },
    DeliverNotification {
        process_id: ProcessId,
        batch: NotificationBatch,
    },
    RetireProcess {
        process_id: ProcessId,
    },
    ReplaceProcess {
        process_id: ProcessId,
    },
    StopProcess {
        process_id: ProcessId,
        force: bool,
    },
    MarkTaskComplete {
        task_id: String,
    },
    MarkTaskFailed {
        task_id: String,
        reason: String,
    },
    SignalWorkflowComplete {
        status: String,
        summary: String,
    },
    NotifyUser {
        message: String,
    },

    /// Supervisor: the process posted ready / signalled ready.
    ConfirmReady {
        process_id: ProcessId,
        session_ref: Option<String>,
    },
    /// Supervisor: the OS process exited.
    ProcessExited {
        process_id: ProcessId,
        cause: ExitCause,
    },
}

/// Why a managed process exited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitCause {
    Stopped,
    Retired,
    Failed,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SpawnProcess { .. } => "spawn_process",
            Command::AssignTask { .. } => "assign_task",
            Command::AssignReview { .. } => "assign_review",
            Command::AssignReviewFeedback { .. } => "assign_review_feedback",
            Command::ApproveCommit { .. } => "approve_commit",
            Command::ReportImplementationComplete { .. } => "report_implementation_complete",
            Command::ReportReviewVerdict { .. } => "report_review_verdict",
            Command::SendToProcess { .. } => "send_to_process",
            Command::DeliverNotification { .. } => "deliver_notification",
            Command::RetireProcess { .. } => "retire_process",
            Command::ReplaceProcess { .. } => "replace_process",
            Command::StopProcess { .. } => "stop_process",
            Command::MarkTaskComplete { .. } => "mark_task_complete",
            Command::MarkTaskFailed { .. } => "mark_task_failed",
            Command::SignalWorkflowComplete { .. } => "signal_workflow_complete",
            Command::NotifyUser { .. } => "notify_user",
            Command::ConfirmReady { .. } => "confirm_ready",
            Command::ProcessExited { .. } => "process_exited",
        }
    }

    /// The target process, where one applies.
    pub fn process_id(&self) -> Option<&ProcessId> {
        match self {
            Command::SpawnProcess { process_id, .. }
            | Command::AssignTask { process_id, .. }
            | Command::AssignReview { process_id, .. }
            | Command::AssignReviewFeedback { process_id, .. }
            | Command::ApproveCommit { process_id, .. }
            | Command::ReportImplementationComplete { process_id, .. }
            | Command::ReportReviewVerdict { process_id, .. }
            | Command::SendToProcess { process_id, .. }
            | Command::DeliverNotification { process_id, .. }
            | Command::RetireProcess { process_id }
            | Command::ReplaceProcess { process_id }
            | Command::StopProcess { process_id, .. }
            | Command::ConfirmReady { process_id, .. }
            | Command::ProcessExited { process_id, .. } => Some(process_id),
            Command::MarkTaskComplete { .. }
            | Command::MarkTaskFailed { .. }
            | Command::SignalWorkflowComplete { .. }
            | Command::NotifyUser { .. } => None,
        }
    }
}

/// Result returned to a waiting submitter.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub message: String,
    /// Set by spawn/replace: the id of the newly created process.
    pub new_process_id: Option<ProcessId>,
}

/// A command plus submission metadata.
pub struct CommandEnvelope {
    pub command: Command,
    pub cancel: CancellationToken,
    reply: Option<oneshot::Sender<Result<CommandOutcome>>>,
}

impl CommandEnvelope {
    pub fn fire_and_forget(command: Command) -> Self {
        Self {
            command,
            cancel: CancellationToken::new(),
            reply: None,
        }
    }

    pub fn with_reply(
        command: Command,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<Result<CommandOutcome>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                cancel,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn reply(self, result: Result<CommandOutcome>) {
        if let Some(tx) = self.reply {
            tx.send(result).ok();
        }
    }
}

/// Cloneable submitter side of the processor queue.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl CommandQueue {
    pub fn new(tx: mpsc::Sender<CommandEnvelope>) -> Self {
        Self { tx }
    }

    pub async fn submit(
        &self,
        envelope: CommandEnvelope,
    ) -> std::result::Result<(), mpsc::error::SendError<CommandEnvelope>> {
        self.tx.send(envelope).await
    }

    /// Non-blocking submit for callers that must never suspend (the broker's
    /// notifier). A full queue drops the command with a warning.
    pub fn submit_nowait(&self, command: Command) {
        let name = command.name();
        if let Err(error) = self.tx.try_send(CommandEnvelope::fire_and_forget(command)) {
            tracing::warn!(command = name, %error, "command queue full, dropping");
        }
    }
}

/// Seam to the external issue tracker (the `bd` CLI in production). The
/// orchestrator only closes or fails tasks and reads coarse status;
/// everything else lives in the tracker itself.
#[async_trait::async_trait]
pub trait TaskTracker: Send + Sync {
    async fn mark_complete(&self, task_id: &str) -> Result<()>;
    async fn mark_failed(&self, task_id: &str, reason: &str) -> Result<()>;
    async fn status(&self, task_id: &str) -> Option<String>;
}

/// In-memory tracker used in tests and when no external tracker is wired.
#[derive(Debug, Default)]
pub struct InMemoryTaskTracker {
    states: parking_lot::Mutex<std::collections::HashMap<String, String>>,
}

impl InMemoryTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskTracker for InMemoryTaskTracker {
    async fn mark_complete(&self, task_id: &str) -> Result<()> {
        self.states
            .lock()
            .insert(task_id.to_string(), "closed".to_string());
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, reason: &str) -> Result<()> {
        self.states
            .lock()
            .insert(task_id.to_string(), format!("failed: {reason}"));
        Ok(())
    }

    async fn status(&self, task_id: &str) -> Option<String> {
        self.states.lock().get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parses_exact_values_only() {
        assert_eq!(Verdict::parse("APPROVED"), Some(Verdict::Approved));
        assert_eq!(Verdict::parse("DENIED"), Some(Verdict::Denied));
        assert_eq!(Verdict::parse("approved"), None);
        assert_eq!(Verdict::parse("MAYBE"), None);
    }

    #[test]
    fn command_names_and_targets() {
        let command = Command::AssignTask {
            process_id: "WORKER.1".into(),
            task_id: "bd-42".into(),
            thread_id: None,
            description: "implement".into(),
        };
        assert_eq!(command.name(), "assign_task");
        assert_eq!(command.process_id().map(String::as_str), Some("WORKER.1"));

        let command = Command::MarkTaskComplete {
            task_id: "bd-42".into(),
        };
        assert!(command.process_id().is_none());
    }

    #[tokio::test]
    async fn in_memory_tracker_records_transitions() {
        let tracker = InMemoryTaskTracker::new();
        assert!(tracker.status("bd-42").await.is_none());
        tracker.mark_complete("bd-42").await.expect("complete");
        assert_eq!(tracker.status("bd-42").await.as_deref(), Some("closed"));
        tracker.mark_failed("bd-43", "flaky env").await.expect("failed");
        assert_eq!(
            tracker.status("bd-43").await.as_deref(),
            Some("failed: flaky env")
        );
    }
}

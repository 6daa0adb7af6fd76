//! The workflow state machine.
//!
//! [`transition`] is pure: given the current process table and a command it
//! returns the updated records and the side effects to execute, or a
//! structured precondition error. The processor loop owns all I/O.

use crate::error::{ProcessError, Result};
use crate::processor::command::{Command, ExitCause, Verdict};
use crate::{replacement_id, ProcessId, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of the OS process, independent of workflow phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    Starting,
    Ready,
    Working,
    Paused,
    Stopped,
    Retiring,
    Retired,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Ready => "ready",
            ProcessStatus::Working => "working",
            ProcessStatus::Paused => "paused",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Retiring => "retiring",
            ProcessStatus::Retired => "retired",
            ProcessStatus::Failed => "failed",
        }
    }

    /// Whether the OS process is gone for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Stopped | ProcessStatus::Retired | ProcessStatus::Failed
        )
    }
}

/// Position in the implement → review → commit workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkPhase {
    #[default]
    Idle,
    Implementing,
    AwaitingReview,
    Reviewing,
    AddressingFeedback,
    Committing,
}

impl WorkPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkPhase::Idle => "idle",
            WorkPhase::Implementing => "implementing",
            WorkPhase::AwaitingReview => "awaiting_review",
            WorkPhase::Reviewing => "reviewing",
            WorkPhase::AddressingFeedback => "addressing_feedback",
            WorkPhase::Committing => "committing",
        }
    }
}

/// Role of a managed process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Coordinator,
    Worker,
    Observer,
}

impl ProcessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessRole::Coordinator => "coordinator",
            ProcessRole::Worker => "worker",
            ProcessRole::Observer => "observer",
        }
    }
}

/// One worker or coordinator as the state machine sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub role: ProcessRole,
    pub status: ProcessStatus,
    pub phase: WorkPhase,
    pub current_task_id: Option<String>,
    pub current_thread_id: Option<ThreadId>,
    /// Opaque token for the external agent runtime to resume context.
    pub session_ref: Option<String>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub queue_len: usize,
    pub created_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(id: impl Into<ProcessId>, role: ProcessRole) -> Self {
        Self {
            id: id.into(),
            role,
            status: ProcessStatus::Starting,
            phase: WorkPhase::Idle,
            current_task_id: None,
            current_thread_id: None,
            session_ref: None,
            tokens_used: 0,
            cost_usd: 0.0,
            queue_len: 0,
            created_at: Utc::now(),
        }
    }
}

/// The processor's view of every known process.
#[derive(Debug, Default)]
pub struct ProcessTable {
    records: HashMap<ProcessId, ProcessRecord>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&ProcessRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ProcessRecord> {
        self.records.get_mut(id)
    }

    pub fn upsert(&mut self, record: ProcessRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// The process currently holding `task_id`, excluding `except`.
    fn holder_of(&self, task_id: &str, except: Option<&str>) -> Option<&ProcessRecord> {
        self.records.values().find(|record| {
            record.current_task_id.as_deref() == Some(task_id)
                && except.is_none_or(|id| record.id != id)
        })
    }
}

/// Side effects produced by a transition, executed by the processor loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    Spawn {
        process_id: ProcessId,
        role: ProcessRole,
    },
    SendPrompt {
        process_id: ProcessId,
        text: String,
    },
    Retire {
        process_id: ProcessId,
    },
    Stop {
        process_id: ProcessId,
        force: bool,
    },
    /// Auto-issued follow-up command (review verdict routing).
    SubmitFollowUp(Command),
    CloseTask {
        task_id: String,
        failed: bool,
        reason: Option<String>,
    },
    ConfirmReadiness {
        process_id: ProcessId,
    },
    ReleaseResources {
        process_id: ProcessId,
    },
    EmitTerminal {
        status: String,
        summary: String,
    },
    NotifyUser {
        message: String,
    },
    FlagFailure {
        process_id: ProcessId,
    },
}

/// Result of a successful transition.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub updates: Vec<ProcessRecord>,
    pub effects: Vec<SideEffect>,
    pub message: String,
    pub new_process_id: Option<ProcessId>,
}

impl Transition {
    fn with_update(mut self, record: ProcessRecord) -> Self {
        self.updates.push(record);
        self
    }

    fn with_effect(mut self, effect: SideEffect) -> Self {
        self.effects.push(effect);
        self
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

fn precondition(process: &str, field: &'static str, reason: impl Into<String>) -> crate::Error {
    ProcessError::Precondition {
        process: process.to_string(),
        field,
        reason: reason.into(),
    }
    .into()
}

fn require<'a>(table: &'a ProcessTable, id: &str) -> Result<&'a ProcessRecord> {
    table
        .get(id)
        .ok_or_else(|| ProcessError::NotFound { id: id.to_string() }.into())
}

/// Apply `command` against `table`. Pure: no I/O, no clock reads beyond
/// record construction, deterministic given its inputs.
pub fn transition(table: &ProcessTable, command: &Command) -> Result<Transition> {
    match command {
        Command::SpawnProcess { process_id, role } => {
            if table.contains(process_id) {
                return Err(ProcessError::AlreadyExists {
                    id: process_id.clone(),
                }
                .into());
            }
            let record = ProcessRecord::new(process_id.clone(), *role);
            Ok(Transition::default()
                .with_update(record)
                .with_effect(SideEffect::Spawn {
                    process_id: process_id.clone(),
                    role: *role,
                })
                .with_message(format!("spawning {process_id}")))
        }

        Command::ConfirmReady {
            process_id,
            session_ref,
        } => {
            let record = require(table, process_id)?;
            match record.status {
                ProcessStatus::Pending | ProcessStatus::Starting => {
                    let mut updated = record.clone();
                    updated.status = ProcessStatus::Ready;
                    if session_ref.is_some() {
                        updated.session_ref = session_ref.clone();
                    }
                    Ok(Transition::default()
                        .with_update(updated)
                        .with_effect(SideEffect::ConfirmReadiness {
                            process_id: process_id.clone(),
                        })
                        .with_message(format!("{process_id} ready")))
                }
                // A live process re-signalling ready is harmless.
                ProcessStatus::Ready | ProcessStatus::Working | ProcessStatus::Paused => {
                    Ok(Transition::default().with_message(format!("{process_id} already ready")))
                }
                other => Err(precondition(
                    process_id,
                    "status",
                    format!("cannot signal ready while {}", other.as_str()),
                )),
            }
        }

        Command::AssignTask {
            process_id,
            task_id,
            thread_id,
            description,
        } => {
            let record = require(table, process_id)?;
            if record.status != ProcessStatus::Ready {
                return Err(precondition(
                    process_id,
                    "status",
                    format!("expected ready, is {}", record.status.as_str()),
                ));
            }
            if record.phase != WorkPhase::Idle {
                return Err(precondition(
                    process_id,
                    "phase",
                    format!("expected idle, is {}", record.phase.as_str()),
                ));
            }
            let mut updated = record.clone();
            updated.status = ProcessStatus::Working;
            updated.phase = WorkPhase::Implementing;
            updated.current_task_id = Some(task_id.clone());
            updated.current_thread_id = thread_id.clone();
            Ok(Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::SendPrompt {
                    process_id: process_id.clone(),
                    text: prompts::task(task_id, description),
                })
                .with_message(format!("{task_id} assigned to {process_id}")))
        }

        Command::ReportImplementationComplete {
            process_id,
            summary,
        } => {
            let record = require(table, process_id)?;
            if !matches!(
                record.phase,
                WorkPhase::Implementing | WorkPhase::AddressingFeedback
            ) {
                return Err(precondition(
                    process_id,
                    "phase",
                    format!(
                        "expected implementing or addressing_feedback, is {}",
                        record.phase.as_str()
                    ),
                ));
            }
            let mut updated = record.clone();
            updated.phase = WorkPhase::AwaitingReview;
            Ok(Transition::default()
                .with_update(updated)
                .with_message(format!("{process_id} awaiting review: {summary}")))
        }

        Command::AssignReview {
            process_id,
            task_id,
            implementer_id,
            summary,
        } => {
            let record = require(table, process_id)?;
            if process_id == implementer_id {
                return Err(precondition(
                    process_id,
                    "implementer_id",
                    "a worker cannot review its own implementation",
                ));
            }
            if record.status != ProcessStatus::Ready {
                return Err(precondition(
                    process_id,
                    "status",
                    format!("expected ready, is {}", record.status.as_str()),
                ));
            }
            if record.phase != WorkPhase::Idle {
                return Err(precondition(
                    process_id,
                    "phase",
                    format!("expected idle, is {}", record.phase.as_str()),
                ));
            }
            let mut updated = record.clone();
            updated.phase = WorkPhase::Reviewing;
            updated.current_task_id = Some(task_id.clone());
            Ok(Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::SendPrompt {
                    process_id: process_id.clone(),
                    text: prompts::review(task_id, implementer_id, summary),
                })
                .with_message(format!("{process_id} reviewing {task_id}")))
        }

        Command::ReportReviewVerdict {
            process_id,
            verdict,
            comments,
        } => {
            let record = require(table, process_id)?;
            if record.phase != WorkPhase::Reviewing {
                return Err(precondition(
                    process_id,
                    "phase",
                    format!("expected reviewing, is {}", record.phase.as_str()),
                ));
            }
            let task_id = record.current_task_id.clone().ok_or_else(|| {
                precondition(process_id, "task", "reviewer has no task under review")
            })?;
            let implementer = table
                .holder_of(&task_id, Some(process_id.as_str()))
                .filter(|holder| holder.phase == WorkPhase::AwaitingReview)
                .map(|holder| holder.id.clone())
                .ok_or_else(|| {
                    precondition(
                        process_id,
                        "task",
                        format!("no implementer awaiting review for {task_id}"),
                    )
                })?;

            let mut updated = record.clone();
            updated.phase = WorkPhase::Idle;
            updated.status = ProcessStatus::Ready;
            updated.current_task_id = None;

            let follow_up = match verdict {
                Verdict::Denied => Command::AssignReviewFeedback {
                    process_id: implementer.clone(),
                    task_id: task_id.clone(),
                    feedback: comments.clone(),
                },
                Verdict::Approved => Command::ApproveCommit {
                    process_id: implementer.clone(),
                    task_id: task_id.clone(),
                },
            };
            Ok(Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::SubmitFollowUp(follow_up))
                .with_message(format!(
                    "{task_id} review by {process_id}: {}",
                    verdict.as_str()
                )))
        }

        Command::AssignReviewFeedback {
            process_id,
            task_id,
            feedback,
        } => {
            let record = require(table, process_id)?;
            if record.phase != WorkPhase::AwaitingReview {
                return Err(precondition(
                    process_id,
                    "phase",
                    format!("expected awaiting_review, is {}", record.phase.as_str()),
                ));
            }
            let mut updated = record.clone();
            updated.phase = WorkPhase::AddressingFeedback;
            Ok(Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::SendPrompt {
                    process_id: process_id.clone(),
                    text: prompts::feedback(task_id, feedback),
                })
                .with_message(format!("{process_id} addressing feedback on {task_id}")))
        }

        Command::ApproveCommit {
            process_id,
            task_id,
        } => {
            let record = require(table, process_id)?;
            if record.phase != WorkPhase::AwaitingReview {
                return Err(precondition(
                    process_id,
                    "phase",
                    format!("expected awaiting_review, is {}", record.phase.as_str()),
                ));
            }
            let mut updated = record.clone();
            updated.phase = WorkPhase::Committing;
            Ok(Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::SendPrompt {
                    process_id: process_id.clone(),
                    text: prompts::commit(task_id),
                })
                .with_message(format!("{process_id} committing {task_id}")))
        }

        Command::MarkTaskComplete { task_id } => {
            let mut transition = Transition::default()
                .with_effect(SideEffect::CloseTask {
                    task_id: task_id.clone(),
                    failed: false,
                    reason: None,
                })
                .with_message(format!("{task_id} complete"));
            if let Some(holder) = table.holder_of(task_id, None) {
                let mut updated = holder.clone();
                updated.phase = WorkPhase::Idle;
                updated.status = ProcessStatus::Ready;
                updated.current_task_id = None;
                updated.current_thread_id = None;
                transition = transition.with_update(updated);
            }
            Ok(transition)
        }

        Command::MarkTaskFailed { task_id, reason } => {
            let mut transition = Transition::default()
                .with_effect(SideEffect::CloseTask {
                    task_id: task_id.clone(),
                    failed: true,
                    reason: Some(reason.clone()),
                })
                .with_message(format!("{task_id} failed: {reason}"));
            if let Some(holder) = table.holder_of(task_id, None) {
                let mut updated = holder.clone();
                updated.phase = WorkPhase::Idle;
                updated.status = ProcessStatus::Ready;
                updated.current_task_id = None;
                updated.current_thread_id = None;
                transition = transition.with_update(updated);
            }
            Ok(transition)
        }

        Command::SendToProcess { process_id, text } => {
            require(table, process_id)?;
            Ok(Transition::default()
                .with_effect(SideEffect::SendPrompt {
                    process_id: process_id.clone(),
                    text: text.clone(),
                })
                .with_message(format!("queued for {process_id}")))
        }

        Command::DeliverNotification { process_id, batch } => {
            require(table, process_id)?;
            Ok(Transition::default()
                .with_effect(SideEffect::SendPrompt {
                    process_id: process_id.clone(),
                    text: batch.render(),
                })
                .with_message(format!("notification queued for {process_id}")))
        }

        Command::RetireProcess { process_id } => {
            let record = require(table, process_id)?;
            if matches!(
                record.status,
                ProcessStatus::Retired | ProcessStatus::Failed
            ) {
                return Err(precondition(
                    process_id,
                    "status",
                    format!("cannot retire a {} process", record.status.as_str()),
                ));
            }
            let mut updated = record.clone();
            updated.status = ProcessStatus::Retiring;
            Ok(Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::Retire {
                    process_id: process_id.clone(),
                })
                .with_message(format!("{process_id} retiring")))
        }

        Command::ReplaceProcess { process_id } => {
            let record = require(table, process_id)?;
            if matches!(
                record.status,
                ProcessStatus::Retired | ProcessStatus::Failed
            ) {
                return Err(precondition(
                    process_id,
                    "status",
                    format!("cannot replace a {} process", record.status.as_str()),
                ));
            }
            let role = record.role;
            let new_id = replacement_id(process_id);
            if table.contains(&new_id) {
                return Err(ProcessError::AlreadyExists { id: new_id }.into());
            }

            let mut retiring = record.clone();
            retiring.status = ProcessStatus::Retiring;

            let replacement = ProcessRecord::new(new_id.clone(), role);
            let mut transition = Transition::default()
                .with_update(retiring)
                .with_update(replacement)
                .with_effect(SideEffect::Retire {
                    process_id: process_id.clone(),
                })
                .with_effect(SideEffect::Spawn {
                    process_id: new_id.clone(),
                    role,
                })
                .with_effect(SideEffect::SendPrompt {
                    process_id: new_id.clone(),
                    text: prompts::handoff(process_id),
                })
                .with_message(format!("{process_id} replaced by {new_id}"));
            transition.new_process_id = Some(new_id);
            Ok(transition)
        }

        Command::StopProcess { process_id, force } => {
            let record = require(table, process_id)?;
            if record.status == ProcessStatus::Retired {
                return Err(precondition(
                    process_id,
                    "status",
                    "cannot stop a retired process",
                ));
            }
            let mut updated = record.clone();
            updated.status = ProcessStatus::Stopped;
            Ok(Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::Stop {
                    process_id: process_id.clone(),
                    force: *force,
                })
                .with_message(format!("{process_id} stopping")))
        }

        Command::ProcessExited { process_id, cause } => {
            let Some(record) = table.get(process_id) else {
                // Exit races a forgotten process; nothing to update.
                return Ok(Transition::default());
            };
            let mut updated = record.clone();
            updated.status = match cause {
                ExitCause::Stopped => ProcessStatus::Stopped,
                ExitCause::Retired => ProcessStatus::Retired,
                ExitCause::Failed => ProcessStatus::Failed,
            };
            let mut transition = Transition::default()
                .with_update(updated)
                .with_effect(SideEffect::ReleaseResources {
                    process_id: process_id.clone(),
                });
            if *cause == ExitCause::Failed {
                transition = transition
                    .with_effect(SideEffect::FlagFailure {
                        process_id: process_id.clone(),
                    })
                    .with_effect(SideEffect::NotifyUser {
                        message: format!("{process_id} exited unexpectedly"),
                    });
            }
            Ok(transition)
        }

        Command::SignalWorkflowComplete { status, summary } => Ok(Transition::default()
            .with_effect(SideEffect::EmitTerminal {
                status: status.clone(),
                summary: summary.clone(),
            })
            .with_message("workflow complete".to_string())),

        Command::NotifyUser { message } => Ok(Transition::default()
            .with_effect(SideEffect::NotifyUser {
                message: message.clone(),
            })
            .with_message("user notified".to_string())),
    }
}

mod prompts {
    pub fn task(task_id: &str, description: &str) -> String {
        format!(
            "You are assigned task {task_id}.\n\n{description}\n\n\
             Work the task to completion, then call report_implementation_complete \
             with a summary of what you changed."
        )
    }

    pub fn review(task_id: &str, implementer_id: &str, summary: &str) -> String {
        format!(
            "Review the implementation of {task_id} by {implementer_id}.\n\n\
             Implementer summary: {summary}\n\n\
             Inspect the changes and call report_review_verdict with APPROVED or \
             DENIED plus your comments."
        )
    }

    pub fn feedback(task_id: &str, feedback: &str) -> String {
        format!(
            "Your implementation of {task_id} was denied in review.\n\n\
             Reviewer comments: {feedback}\n\n\
             Address the feedback, then call report_implementation_complete again."
        )
    }

    pub fn commit(task_id: &str) -> String {
        format!(
            "Your implementation of {task_id} was approved. Commit your work, \
             then post an accountability summary and call fabric_send to report \
             the commit in #tasks."
        )
    }

    pub fn handoff(retired_id: &str) -> String {
        format!(
            "You are replacing {retired_id}. Read the message log with \
             fabric_history and wait for user direction before taking work."
        )
    }
}

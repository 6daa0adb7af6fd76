//! Coordinator tool namespace, served at `/mcp`.

use crate::mcp::fabric_tools::FabricTools;
use crate::mcp::schema::{parse_args, unknown_tool, ToolCallResult, ToolDef};
use crate::mcp::worker::validate_task_id;
use crate::processor::command::{Command, CommandQueue, TaskTracker};
use crate::processor::enforcement::TurnTracker;
use crate::processor::machine::ProcessRole;
use crate::processor::{submit_and_wait, ProcessView};
use crate::supervisor::accountability::{AccountabilityReport, AccountabilityWriter};
use crate::{worker_id as worker_id_for, ProcessId, COORDINATOR_ID};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, JsonSchema)]
struct SpawnWorkerArgs {
    #[serde(default)]
    worker_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AssignTaskArgs {
    worker_id: String,
    task_id: String,
    description: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AssignReviewArgs {
    reviewer_id: String,
    task_id: String,
    implementer_id: String,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReviewFeedbackArgs {
    worker_id: String,
    task_id: String,
    feedback: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ApproveCommitArgs {
    worker_id: String,
    task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SendToWorkerArgs {
    worker_id: String,
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WorkerIdArgs {
    worker_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct StopWorkerArgs {
    worker_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TaskIdArgs {
    task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MarkTaskFailedArgs {
    task_id: String,
    reason: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryWorkerStateArgs {
    #[serde(default)]
    worker_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WorkflowCompleteArgs {
    status: String,
    summary: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NotifyUserArgs {
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GenerateAccountabilityArgs {
    worker_id: String,
    task_id: String,
    summary: String,
    #[serde(default)]
    commits: Vec<String>,
    #[serde(default)]
    issues_discovered: Vec<String>,
    #[serde(default)]
    issues_closed: Vec<String>,
    #[serde(default)]
    verification_points: Vec<String>,
    #[serde(default)]
    next_steps: Vec<String>,
}

pub struct CoordinatorToolset {
    fabric: FabricTools,
    commands: CommandQueue,
    turns: Arc<TurnTracker>,
    view: ProcessView,
    tracker: Arc<dyn TaskTracker>,
    accountability: AccountabilityWriter,
    cancel: CancellationToken,
}

impl CoordinatorToolset {
    pub fn new(
        fabric: FabricTools,
        commands: CommandQueue,
        turns: Arc<TurnTracker>,
        view: ProcessView,
        tracker: Arc<dyn TaskTracker>,
        accountability: AccountabilityWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fabric,
            commands,
            turns,
            view,
            tracker,
            accountability,
            cancel,
        }
    }

    pub fn defs() -> Vec<ToolDef> {
        let worker_ref =
            || json!({"type": "string", "description": "Worker process id, e.g. WORKER.1"});
        let task_ref = || json!({"type": "string", "description": "Tracker id, e.g. bd-42"});
        let mut defs = vec![
            ToolDef::new(
                "signal_ready",
                "Signal that you are booted and ready to coordinate.",
                json!({"type": "object", "properties": {}, "required": []}),
            ),
            ToolDef::new(
                "spawn_worker",
                "Spawn a new worker process. Returns its id once starting.",
                json!({
                    "type": "object",
                    "properties": {"worker_id": worker_ref()},
                    "required": []
                }),
            ),
            ToolDef::new(
                "assign_task",
                "Assign a task to an idle, ready worker.",
                json!({
                    "type": "object",
                    "properties": {
                        "worker_id": worker_ref(),
                        "task_id": task_ref(),
                        "description": {"type": "string"},
                        "thread_id": {"type": "string"}
                    },
                    "required": ["worker_id", "task_id", "description"]
                }),
            ),
            ToolDef::new(
                "assign_task_review",
                "Ask a second worker to review a completed implementation.",
                json!({
                    "type": "object",
                    "properties": {
                        "reviewer_id": worker_ref(),
                        "task_id": task_ref(),
                        "implementer_id": worker_ref(),
                        "summary": {"type": "string"}
                    },
                    "required": ["reviewer_id", "task_id", "implementer_id"]
                }),
            ),
            ToolDef::new(
                "assign_review_feedback",
                "Send denied-review feedback back to the implementer.",
                json!({
                    "type": "object",
                    "properties": {
                        "worker_id": worker_ref(),
                        "task_id": task_ref(),
                        "feedback": {"type": "string"}
                    },
                    "required": ["worker_id", "task_id", "feedback"]
                }),
            ),
            ToolDef::new(
                "approve_commit",
                "Authorize the implementer to commit approved work.",
                json!({
                    "type": "object",
                    "properties": {"worker_id": worker_ref(), "task_id": task_ref()},
                    "required": ["worker_id", "task_id"]
                }),
            ),
            ToolDef::new(
                "send_to_worker",
                "Queue a free-form prompt for a worker.",
                json!({
                    "type": "object",
                    "properties": {"worker_id": worker_ref(), "message": {"type": "string"}},
                    "required": ["worker_id", "message"]
                }),
            ),
            ToolDef::new(
                "replace_worker",
                "Retire a worker and spawn a fresh replacement with the same role.",
                json!({
                    "type": "object",
                    "properties": {"worker_id": worker_ref()},
                    "required": ["worker_id"]
                }),
            ),
            ToolDef::new(
                "retire_worker",
                "Retire a worker permanently.",
                json!({
                    "type": "object",
                    "properties": {"worker_id": worker_ref()},
                    "required": ["worker_id"]
                }),
            ),
            ToolDef::new(
                "stop_worker",
                "Stop a worker. Graceful unless force is set.",
                json!({
                    "type": "object",
                    "properties": {"worker_id": worker_ref(), "force": {"type": "boolean"}},
                    "required": ["worker_id"]
                }),
            ),
            ToolDef::new(
                "get_task_status",
                "Read a task's status from the tracker.",
                json!({
                    "type": "object",
                    "properties": {"task_id": task_ref()},
                    "required": ["task_id"]
                }),
            ),
            ToolDef::new(
                "mark_task_complete",
                "Close a task in the tracker and free its worker.",
                json!({
                    "type": "object",
                    "properties": {"task_id": task_ref()},
                    "required": ["task_id"]
                }),
            ),
            ToolDef::new(
                "mark_task_failed",
                "Mark a task failed in the tracker and free its worker.",
                json!({
                    "type": "object",
                    "properties": {"task_id": task_ref(), "reason": {"type": "string"}},
                    "required": ["task_id", "reason"]
                }),
            ),
            ToolDef::new(
                "query_worker_state",
                "Inspect one worker's status and phase, or all of them.",
                json!({
                    "type": "object",
                    "properties": {"worker_id": worker_ref()},
                    "required": []
                }),
            ),
            ToolDef::new(
                "generate_accountability_summary",
                "Write an accountability summary on a worker's behalf.",
                json!({
                    "type": "object",
                    "properties": {
                        "worker_id": worker_ref(),
                        "task_id": task_ref(),
                        "summary": {"type": "string"},
                        "commits": {"type": "array", "items": {"type": "string"}},
                        "issues_discovered": {"type": "array", "items": {"type": "string"}},
                        "issues_closed": {"type": "array", "items": {"type": "string"}},
                        "verification_points": {"type": "array", "items": {"type": "string"}},
                        "next_steps": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["worker_id", "task_id", "summary"]
                }),
            ),
            ToolDef::new(
                "signal_workflow_complete",
                "Declare the whole workflow finished.",
                json!({
                    "type": "object",
                    "properties": {
                        "status": {"type": "string", "enum": ["success", "partial", "failed"]},
                        "summary": {"type": "string"}
                    },
                    "required": ["status", "summary"]
                }),
            ),
            ToolDef::new(
                "notify_user",
                "Surface a message to the human user.",
                json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }),
            ),
        ];
        defs.extend(FabricTools::defs());
        defs
    }

    pub async fn dispatch(&self, name: &str, args: Value) -> crate::Result<ToolCallResult> {
        if let Some(result) = self.fabric.dispatch(name, args.clone()) {
            return result;
        }
        match name {
            "signal_ready" => {
                self.turns.record_tool(COORDINATOR_ID, "signal_ready");
                self.submit(Command::ConfirmReady {
                    process_id: COORDINATOR_ID.to_string(),
                    session_ref: None,
                })
                .await
            }
            "spawn_worker" => self.spawn_worker(args).await,
            "assign_task" => {
                let args: AssignTaskArgs = parse_args(args)?;
                if let Err(error) = validate_task_id(&args.task_id) {
                    return Ok(ToolCallResult::from_error(&error));
                }
                self.submit(Command::AssignTask {
                    process_id: args.worker_id,
                    task_id: args.task_id,
                    thread_id: args.thread_id,
                    description: args.description,
                })
                .await
            }
            "assign_task_review" => {
                let args: AssignReviewArgs = parse_args(args)?;
                self.submit(Command::AssignReview {
                    process_id: args.reviewer_id,
                    task_id: args.task_id,
                    implementer_id: args.implementer_id,
                    summary: args.summary,
                })
                .await
            }
            "assign_review_feedback" => {
                let args: ReviewFeedbackArgs = parse_args(args)?;
                self.submit(Command::AssignReviewFeedback {
                    process_id: args.worker_id,
                    task_id: args.task_id,
                    feedback: args.feedback,
                })
                .await
            }
            "approve_commit" => {
                let args: ApproveCommitArgs = parse_args(args)?;
                self.submit(Command::ApproveCommit {
                    process_id: args.worker_id,
                    task_id: args.task_id,
                })
                .await
            }
            "send_to_worker" => {
                let args: SendToWorkerArgs = parse_args(args)?;
                self.submit(Command::SendToProcess {
                    process_id: args.worker_id,
                    text: args.message,
                })
                .await
            }
            "replace_worker" => {
                let args: WorkerIdArgs = parse_args(args)?;
                self.submit(Command::ReplaceProcess {
                    process_id: args.worker_id,
                })
                .await
            }
            "retire_worker" => {
                let args: WorkerIdArgs = parse_args(args)?;
                self.submit(Command::RetireProcess {
                    process_id: args.worker_id,
                })
                .await
            }
            "stop_worker" => {
                let args: StopWorkerArgs = parse_args(args)?;
                self.submit(Command::StopProcess {
                    process_id: args.worker_id,
                    force: args.force,
                })
                .await
            }
            "get_task_status" => {
                let args: TaskIdArgs = parse_args(args)?;
                match self.tracker.status(&args.task_id).await {
                    Some(status) => Ok(ToolCallResult::json(&json!({
                        "task_id": args.task_id,
                        "status": status,
                    }))),
                    None => Ok(ToolCallResult::json(&json!({
                        "task_id": args.task_id,
                        "status": "open",
                    }))),
                }
            }
            "mark_task_complete" => {
                let args: TaskIdArgs = parse_args(args)?;
                self.submit(Command::MarkTaskComplete {
                    task_id: args.task_id,
                })
                .await
            }
            "mark_task_failed" => {
                let args: MarkTaskFailedArgs = parse_args(args)?;
                self.submit(Command::MarkTaskFailed {
                    task_id: args.task_id,
                    reason: args.reason,
                })
                .await
            }
            "query_worker_state" => {
                let args: QueryWorkerStateArgs = parse_args(args)?;
                self.query_worker_state(args)
            }
            "generate_accountability_summary" => {
                let args: GenerateAccountabilityArgs = parse_args(args)?;
                self.generate_accountability(args)
            }
            "signal_workflow_complete" => {
                let args: WorkflowCompleteArgs = parse_args(args)?;
                self.submit(Command::SignalWorkflowComplete {
                    status: args.status,
                    summary: args.summary,
                })
                .await
            }
            "notify_user" => {
                let args: NotifyUserArgs = parse_args(args)?;
                self.submit(Command::NotifyUser {
                    message: args.message,
                })
                .await
            }
            other => Err(unknown_tool(other)),
        }
    }

    async fn spawn_worker(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: SpawnWorkerArgs = parse_args(args)?;
        let process_id = args.worker_id.unwrap_or_else(|| self.next_worker_id());
        match submit_and_wait(
            &self.commands,
            Command::SpawnProcess {
                process_id: process_id.clone(),
                role: ProcessRole::Worker,
            },
            self.cancel.clone(),
        )
        .await
        {
            Ok(_) => Ok(ToolCallResult::json(&json!({
                "worker_id": process_id,
                "status": "starting",
            }))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    /// Next unused base worker index (replacement generations don't count).
    fn next_worker_id(&self) -> ProcessId {
        let view = self.view.read();
        let mut max_index = 0usize;
        for id in view.keys() {
            if let Some(rest) = id.strip_prefix("WORKER.")
                && let Some(first) = rest.split('.').next()
                && let Ok(index) = first.parse::<usize>()
            {
                max_index = max_index.max(index);
            }
        }
        worker_id_for(max_index + 1)
    }

    fn query_worker_state(&self, args: QueryWorkerStateArgs) -> crate::Result<ToolCallResult> {
        let view = self.view.read();
        match args.worker_id {
            Some(worker_id) => match view.get(&worker_id) {
                Some(record) => Ok(ToolCallResult::json(record)),
                None => Ok(ToolCallResult::error(format!(
                    "process {worker_id} not found"
                ))),
            },
            None => {
                let mut records: Vec<_> = view.values().cloned().collect();
                records.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(ToolCallResult::json(&records))
            }
        }
    }

    fn generate_accountability(
        &self,
        args: GenerateAccountabilityArgs,
    ) -> crate::Result<ToolCallResult> {
        if let Err(error) = validate_task_id(&args.task_id) {
            return Ok(ToolCallResult::from_error(&error));
        }
        let report = AccountabilityReport {
            task_id: args.task_id,
            worker_id: args.worker_id,
            summary: args.summary,
            commits: args.commits,
            issues_discovered: args.issues_discovered,
            issues_closed: args.issues_closed,
            verification_points: args.verification_points,
            retro: None,
            next_steps: args.next_steps,
        };
        match self.accountability.write(&report) {
            Ok(path) => Ok(ToolCallResult::text(format!(
                "accountability summary written to {}",
                path.display()
            ))),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }

    async fn submit(&self, command: Command) -> crate::Result<ToolCallResult> {
        match submit_and_wait(&self.commands, command, self.cancel.clone()).await {
            Ok(outcome) => {
                if let Some(new_id) = outcome.new_process_id {
                    Ok(ToolCallResult::json(&json!({
                        "message": outcome.message,
                        "worker_id": new_id,
                    })))
                } else {
                    Ok(ToolCallResult::text(outcome.message))
                }
            }
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_defs_cover_lifecycle_review_and_fabric() {
        let names: Vec<String> = CoordinatorToolset::defs()
            .into_iter()
            .map(|d| d.name)
            .collect();
        for expected in [
            "signal_ready",
            "spawn_worker",
            "assign_task",
            "assign_task_review",
            "assign_review_feedback",
            "approve_commit",
            "send_to_worker",
            "replace_worker",
            "retire_worker",
            "stop_worker",
            "get_task_status",
            "mark_task_complete",
            "mark_task_failed",
            "query_worker_state",
            "generate_accountability_summary",
            "signal_workflow_complete",
            "notify_user",
            "fabric_send",
            "fabric_inbox",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn verdict_enum_values_match_schema() {
        let defs = CoordinatorToolset::defs();
        let complete = defs
            .iter()
            .find(|def| def.name == "signal_workflow_complete")
            .expect("def");
        assert_eq!(
            complete.input_schema["properties"]["status"]["enum"],
            json!(["success", "partial", "failed"])
        );
    }
}

//! Worker tool namespace, served per worker at `/worker/<id>`.

use crate::mcp::fabric_tools::FabricTools;
use crate::mcp::schema::{parse_args, unknown_tool, ToolCallResult, ToolDef};
use crate::processor::command::{Command, CommandQueue, Verdict};
use crate::processor::enforcement::TurnTracker;
use crate::processor::submit_and_wait;
use crate::supervisor::accountability::{AccountabilityReport, AccountabilityWriter, Retro};
use crate::ProcessId;
use crate::error::ValidationError;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;

/// Accountability summaries must describe real work.
const MIN_SUMMARY_LEN: usize = 20;

static TASK_ID_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-z]+-[a-zA-Z0-9]+(\.[0-9]+)?$").expect("task id pattern compiles")
});

#[derive(Debug, Deserialize, JsonSchema)]
struct ImplementationCompleteArgs {
    summary: String,
    #[serde(default)]
    #[allow(dead_code)]
    trace_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReviewVerdictArgs {
    verdict: String,
    comments: String,
    #[serde(default)]
    #[allow(dead_code)]
    trace_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RetroArgs {
    #[serde(default)]
    went_well: String,
    #[serde(default)]
    friction: String,
    #[serde(default)]
    patterns: String,
    #[serde(default)]
    takeaways: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AccountabilityArgs {
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
    retro: Option<RetroArgs>,
    #[serde(default)]
    next_steps: Vec<String>,
}

pub struct WorkerToolset {
    worker_id: ProcessId,
    fabric: FabricTools,
    commands: CommandQueue,
    turns: Arc<TurnTracker>,
    accountability: AccountabilityWriter,
    cancel: CancellationToken,
}

impl WorkerToolset {
    pub fn new(
        worker_id: ProcessId,
        fabric: FabricTools,
        commands: CommandQueue,
        turns: Arc<TurnTracker>,
        accountability: AccountabilityWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            fabric,
            commands,
            turns,
            accountability,
            cancel,
        }
    }

    pub fn defs() -> Vec<ToolDef> {
        let mut defs = vec![
            ToolDef::new(
                "signal_ready",
                "Signal that you are booted and ready for work. Call once after reading #system.",
                json!({"type": "object", "properties": {}, "required": []}),
            ),
            ToolDef::new(
                "report_implementation_complete",
                "Report that your assigned task is implemented and ready for review.",
                json!({
                    "type": "object",
                    "properties": {
                        "summary": {"type": "string", "description": "What you changed and why"},
                        "trace_id": {"type": "string"}
                    },
                    "required": ["summary"]
                }),
            ),
            ToolDef::new(
                "report_review_verdict",
                "Report your review verdict for the task you were asked to review.",
                json!({
                    "type": "object",
                    "properties": {
                        "verdict": {"type": "string", "enum": ["APPROVED", "DENIED"]},
                        "comments": {"type": "string"},
                        "trace_id": {"type": "string"}
                    },
                    "required": ["verdict", "comments"]
                }),
            ),
            ToolDef::new(
                "post_accountability_summary",
                "Write your accountability summary for a finished task.",
                json!({
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "string", "description": "Tracker id, e.g. bd-42"},
                        "summary": {"type": "string", "description": "At least 20 characters"},
                        "commits": {"type": "array", "items": {"type": "string"}},
                        "issues_discovered": {"type": "array", "items": {"type": "string"}},
                        "issues_closed": {"type": "array", "items": {"type": "string"}},
                        "verification_points": {"type": "array", "items": {"type": "string"}},
                        "retro": {
                            "type": "object",
                            "properties": {
                                "went_well": {"type": "string"},
                                "friction": {"type": "string"},
                                "patterns": {"type": "string"},
                                "takeaways": {"type": "string"}
                            }
                        },
                        "next_steps": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["task_id", "summary"]
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
            "signal_ready" => self.signal_ready().await,
            "report_implementation_complete" => self.implementation_complete(args).await,
            "report_review_verdict" => self.review_verdict(args).await,
            "post_accountability_summary" => self.accountability_summary(args),
            other => Err(unknown_tool(other)),
        }
    }

    async fn signal_ready(&self) -> crate::Result<ToolCallResult> {
        self.turns.record_tool(&self.worker_id, "signal_ready");
        self.submit(Command::ConfirmReady {
            process_id: self.worker_id.clone(),
            session_ref: None,
        })
        .await
    }

    async fn implementation_complete(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: ImplementationCompleteArgs = parse_args(args)?;
        self.turns
            .record_tool(&self.worker_id, "report_implementation_complete");
        self.submit(Command::ReportImplementationComplete {
            process_id: self.worker_id.clone(),
            summary: args.summary,
        })
        .await
    }

    async fn review_verdict(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: ReviewVerdictArgs = parse_args(args)?;
        let Some(verdict) = Verdict::parse(&args.verdict) else {
            // Value validation fails before the boundary; nothing recorded.
            return Ok(ToolCallResult::from_error(
                &ValidationError::InvalidVerdict {
                    value: args.verdict,
                }
                .into(),
            ));
        };
        self.turns
            .record_tool(&self.worker_id, "report_review_verdict");
        self.submit(Command::ReportReviewVerdict {
            process_id: self.worker_id.clone(),
            verdict,
            comments: args.comments,
        })
        .await
    }

    fn accountability_summary(&self, args: Value) -> crate::Result<ToolCallResult> {
        let args: AccountabilityArgs = parse_args(args)?;
        if let Err(error) = validate_task_id(&args.task_id) {
            return Ok(ToolCallResult::from_error(&error));
        }
        if args.summary.len() < MIN_SUMMARY_LEN {
            return Ok(ToolCallResult::from_error(
                &ValidationError::SummaryTooShort {
                    len: args.summary.len(),
                    min: MIN_SUMMARY_LEN,
                }
                .into(),
            ));
        }

        let report = AccountabilityReport {
            task_id: args.task_id,
            worker_id: self.worker_id.clone(),
            summary: args.summary,
            commits: args.commits,
            issues_discovered: args.issues_discovered,
            issues_closed: args.issues_closed,
            verification_points: args.verification_points,
            retro: args.retro.map(|retro| Retro {
                went_well: retro.went_well,
                friction: retro.friction,
                patterns: retro.patterns,
                takeaways: retro.takeaways,
            }),
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
            Ok(outcome) => Ok(ToolCallResult::text(outcome.message)),
            Err(error) => Ok(ToolCallResult::from_error(&error)),
        }
    }
}

/// Task ids are tracker-prefixed tokens; traversal characters never pass.
pub fn validate_task_id(task_id: &str) -> crate::Result<()> {
    if task_id.contains("..") || task_id.contains('/') {
        return Err(ValidationError::PathTraversal {
            value: task_id.to_string(),
        }
        .into());
    }
    if !TASK_ID_PATTERN.is_match(task_id) {
        return Err(ValidationError::TaskIdFormat {
            value: task_id.to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::repo::{
        AckRepo, DependencyRepo, ParticipantRepo, ReactionRepo, SubscriptionRepo, ThreadRepo,
    };
    use crate::fabric::FabricService;
    use crate::logging::LogSink;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn toolset(dir: &std::path::Path) -> WorkerToolset {
        let fabric = Arc::new(FabricService::new(
            Arc::new(ThreadRepo::new()),
            Arc::new(DependencyRepo::new()),
            Arc::new(SubscriptionRepo::new()),
            Arc::new(AckRepo::new()),
            Arc::new(ParticipantRepo::new()),
            Arc::new(ReactionRepo::new()),
            LogSink::noop(),
        ));
        let turns = Arc::new(TurnTracker::new());
        let (tx, _rx) = mpsc::channel(8);
        WorkerToolset::new(
            "WORKER.1".into(),
            crate::mcp::fabric_tools::FabricTools {
                agent_id: "WORKER.1".into(),
                fabric,
                turns: Arc::clone(&turns),
            },
            CommandQueue::new(tx),
            turns,
            AccountabilityWriter::new(dir),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn traversal_task_id_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = toolset(dir.path());
        let result = tools
            .dispatch(
                "post_accountability_summary",
                json!({
                    "task_id": "../etc/passwd",
                    "summary": "a perfectly long enough summary"
                }),
            )
            .await
            .expect("dispatch survives");
        assert!(result.is_error);
        assert!(result.message().contains("path separators"));
        assert!(
            !dir.path().join("workers").exists(),
            "nothing may be written for a rejected task id"
        );
    }

    #[tokio::test]
    async fn short_summary_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = toolset(dir.path());
        let result = tools
            .dispatch(
                "post_accountability_summary",
                json!({"task_id": "bd-42", "summary": "too short"}),
            )
            .await
            .expect("dispatch survives");
        assert!(result.is_error);
        assert!(result.message().contains("summary too short"));
    }

    #[tokio::test]
    async fn valid_summary_lands_under_the_worker_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = toolset(dir.path());
        let result = tools
            .dispatch(
                "post_accountability_summary",
                json!({
                    "task_id": "bd-42",
                    "summary": "Implemented the parser rewrite end to end.",
                    "commits": ["abc1234"],
                    "retro": {"went_well": "scope", "friction": "ci", "patterns": "", "takeaways": ""}
                }),
            )
            .await
            .expect("dispatch survives");
        assert!(!result.is_error, "{}", result.message());
        let path = dir
            .path()
            .join("workers/WORKER.1/accountability_summary.md");
        let content = std::fs::read_to_string(path).expect("summary written");
        assert!(content.contains("task_id: bd-42"));
        assert!(content.contains("## What I Accomplished"));
    }

    #[test]
    fn task_id_pattern_accepts_tracker_ids() {
        for good in ["bd-42", "bd-abc123", "task-9", "bd-42.1", "bd-X1.10"] {
            assert!(validate_task_id(good).is_ok(), "{good} should pass");
        }
    }

    #[test]
    fn task_id_pattern_rejects_traversal_and_noise() {
        for bad in [
            "../etc/passwd",
            "bd-42/../../x",
            "bd/42",
            "BD-42",
            "42",
            "bd-",
            "bd-42.1.2",
            "",
        ] {
            assert!(validate_task_id(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn worker_defs_include_lifecycle_and_fabric_tools() {
        let names: Vec<String> = WorkerToolset::defs().into_iter().map(|d| d.name).collect();
        for expected in [
            "signal_ready",
            "report_implementation_complete",
            "report_review_verdict",
            "post_accountability_summary",
            "fabric_inbox",
            "fabric_send",
            "fabric_ack",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }
}

//! Perles: an orchestration runtime for a fleet of AI worker agents under a
//! single coordinator.
//!
//! The coordinator delegates tasks to workers, arbitrates code review, and
//! synthesizes results. This crate owns the worker lifecycle (spawn, assign,
//! pause, retire, replace), the command-driven workflow state machine, and the
//! Fabric, a graph-structured channel/message bus with subscription-based
//! notification routing. Session state is event-sourced to disk so interrupted
//! sessions can be resumed.

pub mod config;
pub mod error;
pub mod fabric;
pub mod logging;
pub mod mcp;
pub mod persist;
pub mod processor;
pub mod session;
pub mod supervisor;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Agent identifier type (e.g. `COORDINATOR`, `WORKER.1`, `USER`).
pub type AgentId = String;

/// Thread identifier type.
pub type ThreadId = String;

/// Process identifier type. Processes and agents share an id space: the
/// process `WORKER.1` authenticates to the Fabric as agent `WORKER.1`.
pub type ProcessId = String;

/// Session identifier type.
pub type SessionId = String;

/// The coordinator's fixed process id.
pub const COORDINATOR_ID: &str = "COORDINATOR";

/// The observer's fixed process id; the only recipient the `#observer`
/// channel ever notifies.
pub const OBSERVER_ID: &str = "OBSERVER";

/// The human user's agent id.
pub const USER_ID: &str = "USER";

/// Mention token that expands to every joined participant.
pub const HERE_MENTION: &str = "@here";

/// Derive the worker id for the Nth spawned worker.
pub fn worker_id(n: usize) -> ProcessId {
    format!("WORKER.{n}")
}

/// Derive the id of the process replacing `retired`. `WORKER.1` becomes
/// `WORKER.1.2`; `WORKER.1.2` becomes `WORKER.1.3`.
pub fn replacement_id(retired: &str) -> ProcessId {
    let parts: Vec<&str> = retired.split('.').collect();
    if parts.len() >= 3
        && let Ok(generation) = parts[parts.len() - 1].parse::<u64>()
    {
        let prefix = parts[..parts.len() - 1].join(".");
        return format!("{prefix}.{}", generation + 1);
    }
    format!("{retired}.2")
}

/// Events published by the orchestration runtime for presentation layers
/// (kanban board, transcript view). Consumers subscribe via a broadcast
/// channel; dropped receivers never block the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    ProcessUpdated {
        process_id: ProcessId,
        status: String,
        phase: String,
        queue_len: usize,
    },
    PromptQueued {
        process_id: ProcessId,
        queue_len: usize,
    },
    TurnNotCompleted {
        process_id: ProcessId,
    },
    UserNotification {
        message: String,
    },
    WorkflowComplete {
        status: String,
        summary: String,
    },
    ProcessFailed {
        process_id: ProcessId,
    },
}

//! Turn-completion enforcement.
//!
//! Every prompt delivered to a process opens a turn; the turn is complete
//! once the process invokes at least one turn-completing tool. Before the
//! next prompt goes out, the tracker reports whether the previous turn ended
//! without one, at most once per offending turn, so a stuck process is
//! nudged rather than spammed.
//!
//! Recording is best-effort: adapters record only after argument validation
//! succeeds, so malformed calls never count, while precondition failures
//! returned by the processor do (the process reached the boundary).

use crate::ProcessId;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Tools whose invocation completes a turn.
pub const TURN_COMPLETING_TOOLS: [&str; 6] = [
    "signal_ready",
    "report_implementation_complete",
    "report_review_verdict",
    "fabric_send",
    "fabric_reply",
    "fabric_ack",
];

pub fn is_turn_completing(tool: &str) -> bool {
    TURN_COMPLETING_TOOLS.contains(&tool)
}

#[derive(Debug, Default, Clone, Copy)]
struct TurnState {
    open: bool,
    completed: bool,
}

/// Verdict returned when a new turn starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnVerdict {
    /// The previous turn ended without a turn-completing tool.
    pub needs_nudge: bool,
}

#[derive(Debug, Default)]
pub struct TurnTracker {
    states: Mutex<HashMap<ProcessId, TurnState>>,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool invocation. Non-completing tools are ignored.
    pub fn record_tool(&self, process_id: &str, tool: &str) {
        if !is_turn_completing(tool) {
            return;
        }
        let mut states = self.states.lock();
        let state = states.entry(process_id.to_string()).or_default();
        state.completed = true;
    }

    /// Open a new turn, reporting on the previous one. The flag fires exactly
    /// once per offending turn: opening the next turn resets the state.
    pub fn start_turn(&self, process_id: &str) -> TurnVerdict {
        let mut states = self.states.lock();
        let state = states.entry(process_id.to_string()).or_default();
        let needs_nudge = state.open && !state.completed;
        state.open = true;
        state.completed = false;
        TurnVerdict { needs_nudge }
    }

    pub fn forget(&self, process_id: &str) {
        self.states.lock().remove(process_id);
    }
}

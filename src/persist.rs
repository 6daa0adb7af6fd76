//! Event-sourced persistence.
//!
//! Fabric events are teed to an append-only JSONL file per session; replay
//! rebuilds the repositories from that log on resume. A separate application
//! index tracks every session for listing and resumability checks.

pub mod event_log;
pub mod replay;
pub mod sessions;

pub use event_log::{EventLogger, PersistedEvent, SCHEMA_VERSION};
pub use replay::{load_persisted_events, restore_fabric_state};

//! MCP tool surface.
//!
//! Two namespaces: worker tools served per worker at `/worker/<id>` and
//! coordinator tools served at `/mcp`. This module owns the handler layer:
//! tool definitions with JSON schemas, argument validation, and dispatch into
//! the Fabric service and the command processor. The HTTP transport below
//! these signatures lives outside the orchestration runtime.

pub mod config;
pub mod coordinator;
pub mod fabric_tools;
pub mod schema;
pub mod worker;

pub use coordinator::CoordinatorToolset;
pub use schema::{ToolCallResult, ToolDef};
pub use worker::WorkerToolset;

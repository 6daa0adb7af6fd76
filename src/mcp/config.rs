//! MCP config generation for the external agent runtime.

use anyhow::Context as _;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const WORKER_SERVER_NAME: &str = "perles-worker";
pub const COORDINATOR_SERVER_NAME: &str = "perles-orchestrator";

/// Config handed to a worker runtime: one HTTP server at `/worker/<id>`.
pub fn worker_config(port: u16, worker_id: &str) -> Value {
    json!({
        "mcpServers": {
            WORKER_SERVER_NAME: {
                "type": "http",
                "url": format!("http://localhost:{port}/worker/{worker_id}"),
            }
        }
    })
}

/// Config handed to the coordinator runtime: one HTTP server at `/mcp`.
pub fn coordinator_config(port: u16) -> Value {
    json!({
        "mcpServers": {
            COORDINATOR_SERVER_NAME: {
                "type": "http",
                "url": format!("http://localhost:{port}/mcp"),
            }
        }
    })
}

/// Write a config to disk, creating parent directories. Returns the path.
pub fn write_config(path: &Path, value: &Value) -> crate::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(value).context("failed to serialize MCP config")?;
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_shape() {
        let value = worker_config(9120, "WORKER.3");
        assert_eq!(
            value["mcpServers"]["perles-worker"]["url"],
            "http://localhost:9120/worker/WORKER.3"
        );
        assert_eq!(value["mcpServers"]["perles-worker"]["type"], "http");
    }

    #[test]
    fn coordinator_config_shape() {
        let value = coordinator_config(9100);
        assert_eq!(
            value["mcpServers"]["perles-orchestrator"]["url"],
            "http://localhost:9100/mcp"
        );
    }

    #[test]
    fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processes/WORKER.1/mcp.json");
        let written = write_config(&path, &worker_config(9000, "WORKER.1")).expect("write");
        assert_eq!(written, path);
        let raw = std::fs::read_to_string(path).expect("read");
        assert!(raw.contains("perles-worker"));
    }
}

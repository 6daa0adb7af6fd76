//! Accountability summary rendering and storage.
//!
//! Summaries land at `<session_dir>/workers/<worker_id>/accountability_summary.md`
//! as YAML-frontmatter markdown. Callers have already validated the task id;
//! the writer independently rejects any path that would escape the session
//! directory.

use crate::error::{Result, ValidationError};
use anyhow::Context as _;
use chrono::Utc;
use std::path::{Component, Path, PathBuf};

pub const SUMMARY_FILE: &str = "accountability_summary.md";

/// Retro section of a report.
#[derive(Debug, Clone, Default)]
pub struct Retro {
    pub went_well: String,
    pub friction: String,
    pub patterns: String,
    pub takeaways: String,
}

/// One worker's account of a completed task.
#[derive(Debug, Clone)]
pub struct AccountabilityReport {
    pub task_id: String,
    pub worker_id: String,
    pub summary: String,
    pub commits: Vec<String>,
    pub issues_discovered: Vec<String>,
    pub issues_closed: Vec<String>,
    pub verification_points: Vec<String>,
    pub retro: Option<Retro>,
    pub next_steps: Vec<String>,
}

/// Writes accountability summaries under one session directory.
#[derive(Debug, Clone)]
pub struct AccountabilityWriter {
    session_dir: PathBuf,
}

impl AccountabilityWriter {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
        }
    }

    /// Render and write the report, returning the absolute path.
    pub fn write(&self, report: &AccountabilityReport) -> Result<PathBuf> {
        let dir = self
            .session_dir
            .join("workers")
            .join(&report.worker_id);
        reject_escape(&self.session_dir, &dir, &report.worker_id)?;

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(SUMMARY_FILE);
        std::fs::write(&path, render(report))
            .with_context(|| format!("failed to write {}", path.display()))?;

        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        Ok(absolute)
    }
}

/// A path escapes when any component walks up or re-roots the tree.
fn reject_escape(session_dir: &Path, candidate: &Path, worker_id: &str) -> Result<()> {
    if worker_id.is_empty() || worker_id.contains('/') || worker_id.contains("..") {
        return Err(ValidationError::PathTraversal {
            value: worker_id.to_string(),
        }
        .into());
    }
    let relative = candidate.strip_prefix(session_dir).map_err(|_| {
        crate::Error::Validation(ValidationError::PathTraversal {
            value: candidate.display().to_string(),
        })
    })?;
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(ValidationError::PathTraversal {
                    value: candidate.display().to_string(),
                }
                .into());
            }
        }
    }
    Ok(())
}

fn render(report: &AccountabilityReport) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("task_id: {}\n", report.task_id));
    out.push_str(&format!("worker_id: {}\n", report.worker_id));
    out.push_str(&format!("timestamp: {}\n", Utc::now().to_rfc3339()));
    push_yaml_list(&mut out, "commits", &report.commits);
    push_yaml_list(&mut out, "issues_discovered", &report.issues_discovered);
    push_yaml_list(&mut out, "issues_closed", &report.issues_closed);
    out.push_str("---\n\n");

    out.push_str("## What I Accomplished\n\n");
    out.push_str(&report.summary);
    out.push('\n');

    if !report.verification_points.is_empty() {
        out.push_str("\n## Verification Points\n\n");
        for point in &report.verification_points {
            out.push_str(&format!("- {point}\n"));
        }
    }

    if !report.issues_discovered.is_empty() {
        out.push_str("\n## Issues Discovered\n\n");
        for issue in &report.issues_discovered {
            out.push_str(&format!("- {issue}\n"));
        }
    }

    if let Some(retro) = &report.retro {
        out.push_str("\n## Retro\n");
        out.push_str(&format!("\n### What Went Well\n\n{}\n", retro.went_well));
        out.push_str(&format!("\n### Friction\n\n{}\n", retro.friction));
        out.push_str(&format!("\n### Patterns\n\n{}\n", retro.patterns));
        out.push_str(&format!("\n### Takeaways\n\n{}\n", retro.takeaways));
    }

    if !report.next_steps.is_empty() {
        out.push_str("\n## Next Steps\n\n");
        for step in &report.next_steps {
            out.push_str(&format!("- {step}\n"));
        }
    }

    out
}

fn push_yaml_list(out: &mut String, key: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    out.push_str(&format!("{key}:\n"));
    for value in values {
        out.push_str(&format!("  - {value}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn report(worker_id: &str) -> AccountabilityReport {
        AccountabilityReport {
            task_id: "bd-42".into(),
            worker_id: worker_id.into(),
            summary: "Implemented the widget pipeline end to end.".into(),
            commits: vec!["abc1234".into()],
            issues_discovered: vec!["bd-77: flaky fixture".into()],
            issues_closed: vec!["bd-42".into()],
            verification_points: vec!["unit suite green".into()],
            retro: Some(Retro {
                went_well: "clear task scope".into(),
                friction: "slow CI".into(),
                patterns: "stub external calls early".into(),
                takeaways: "keep diffs small".into(),
            }),
            next_steps: vec!["monitor the nightly run".into()],
        }
    }

    #[test]
    fn writes_frontmatter_and_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = AccountabilityWriter::new(dir.path());
        let path = writer.write(&report("WORKER.1")).expect("write");

        assert!(path.is_absolute());
        assert!(path.ends_with("workers/WORKER.1/accountability_summary.md"));

        let content = std::fs::read_to_string(&path).expect("read back");
        assert!(content.starts_with("---\ntask_id: bd-42\nworker_id: WORKER.1\n"));
        assert!(content.contains("commits:\n  - abc1234"));
        assert!(content.contains("## What I Accomplished"));
        assert!(content.contains("### What Went Well"));
        assert!(content.contains("## Next Steps"));
    }

    #[test]
    fn rejects_traversal_in_worker_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = AccountabilityWriter::new(dir.path());

        for bad in ["../escape", "a/b", "..", ""] {
            let error = writer.write(&report(bad)).expect_err("must reject");
            assert!(
                matches!(error, Error::Validation(ValidationError::PathTraversal { .. })),
                "expected traversal rejection for {bad:?}, got {error:?}"
            );
        }
        assert!(
            !dir.path().join("workers").exists(),
            "nothing may be written on rejection"
        );
    }

    #[test]
    fn minimal_report_omits_empty_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = AccountabilityWriter::new(dir.path());
        let minimal = AccountabilityReport {
            task_id: "bd-1".into(),
            worker_id: "WORKER.2".into(),
            summary: "Small fix to the retry logic in the poller.".into(),
            commits: Vec::new(),
            issues_discovered: Vec::new(),
            issues_closed: Vec::new(),
            verification_points: Vec::new(),
            retro: None,
            next_steps: Vec::new(),
        };
        let path = writer.write(&minimal).expect("write");
        let content = std::fs::read_to_string(path).expect("read back");
        assert!(!content.contains("commits:"));
        assert!(!content.contains("## Retro"));
        assert!(!content.contains("## Next Steps"));
    }
}

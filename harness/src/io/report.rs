//! Machine-readable summary of one run, persisted as pretty JSON.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::blueprint::{Blueprint, RunContext};
use crate::core::types::{NodeResult, TokenUsage};
use crate::engine::{EngineOutcome, RunStatus};
use crate::publish::PushResult;

/// One recorded result, keyed by the name it was recorded under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub name: String,
    #[serde(flatten)]
    pub result: NodeResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub blueprint: String,
    pub branch: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node: Option<String>,
    /// Top-level blueprint nodes that ran or were skipped, in order.
    pub nodes: Vec<ReportEntry>,
    /// Repair invocations recorded by validate nodes.
    pub repairs: Vec<ReportEntry>,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Inputs to [`RunReport::build`] beyond the run context.
#[derive(Debug, Clone)]
pub struct ReportMeta<'a> {
    pub branch: &'a str,
    pub outcome: &'a EngineOutcome,
    pub snapshot: Option<String>,
    pub push: Option<PushResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Split recorded results into top-level nodes and repair entries.
    pub fn build(blueprint: &Blueprint, ctx: &RunContext, meta: ReportMeta<'_>) -> Self {
        let is_top_level = |name: &str| blueprint.nodes().iter().any(|n| n.name == name);
        let (nodes, repairs): (Vec<_>, Vec<_>) = ctx
            .results()
            .map(|(name, result)| ReportEntry {
                name: name.to_string(),
                result: result.clone(),
            })
            .partition(|entry| is_top_level(&entry.name));
        Self {
            run_id: ctx.run_id.clone(),
            blueprint: blueprint.name().to_string(),
            branch: meta.branch.to_string(),
            status: meta.outcome.status,
            failed_node: meta.outcome.failed_node.clone(),
            nodes,
            repairs,
            usage: meta.outcome.usage,
            snapshot: meta.snapshot,
            push: meta.push,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Write `report` as pretty JSON with a trailing newline, creating parents.
pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    let mut payload = serde_json::to_string_pretty(report).context("serialize run report")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::blueprint::{DelegatedNode, Node, ValidateNode, ValidateStep, command};
    use crate::sandbox::ExecRequest;

    fn blueprint() -> Blueprint {
        let prompt = Box::new(|_: &RunContext| -> Result<String> { Ok(String::new()) });
        let validate = ValidateNode::new(
            vec![ValidateStep::command("t", ["true"], Duration::from_secs(1))],
            "fix",
            DelegatedNode::new("coder", prompt),
        );
        Blueprint::new(
            "demo",
            "",
            vec![
                Node::exact("install", command(ExecRequest::new(["true"], Duration::from_secs(1)))),
                Node::validate("checks", validate),
            ],
        )
        .expect("blueprint")
    }

    #[test]
    fn separates_repairs_and_writes_json() {
        let bp = blueprint();
        let mut ctx = RunContext::new("deadbeef", "/tmp");
        ctx.record("install", NodeResult::success("ok", Duration::from_millis(3)))
            .expect("record");
        ctx.record("fix", NodeResult::success("patched", Duration::from_millis(4)))
            .expect("record");
        ctx.record("checks", NodeResult::success("", Duration::from_millis(5)))
            .expect("record");
        let outcome = EngineOutcome {
            status: RunStatus::Success,
            failed_node: None,
            usage: TokenUsage::default(),
            duration: Duration::from_millis(12),
        };
        let now = Utc::now();
        let report = RunReport::build(
            &bp,
            &ctx,
            ReportMeta {
                branch: "harness/deadbeef/demo",
                outcome: &outcome,
                snapshot: Some("abc123".to_string()),
                push: None,
                started_at: now,
                finished_at: now,
            },
        );
        let names: Vec<&str> = report.nodes.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["install", "checks"]);
        assert_eq!(report.repairs.len(), 1);
        assert!(report.succeeded());

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports/run.json");
        write_report(&path, &report).expect("write");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(json["status"], "success");
        assert_eq!(json["nodes"][0]["name"], "install");
        assert_eq!(json["nodes"][0]["duration_ms"], 3);
        assert!(json.get("push").is_none());
    }
}

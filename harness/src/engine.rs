//! Blueprint execution engine.
//!
//! Nodes run strictly in order against one sandbox. For every executed node
//! the sink sees `NodeStart`, then zero or more `NodeOutput`, then
//! `NodeComplete`; skipped nodes produce a single `NodeSkipped`. A `failure`
//! result halts the run. Errors escaping a node body propagate unchanged; the
//! caller owns sandbox teardown.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentDispatcher, AgentRequest};
use crate::blueprint::{
    Blueprint, DelegatedNode, Node, NodeKind, RunContext, ValidateNode, repair_result_name,
};
use crate::core::types::{NodeResult, NodeStatus, TokenUsage};
use crate::sandbox::Sandbox;

/// Lifecycle notification emitted while a blueprint runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    NodeStart { node: String },
    NodeOutput { node: String, output: String },
    NodeComplete { node: String, result: NodeResult },
    NodeSkipped { node: String },
}

impl RunEvent {
    pub fn node(&self) -> &str {
        match self {
            RunEvent::NodeStart { node }
            | RunEvent::NodeOutput { node, .. }
            | RunEvent::NodeComplete { node, .. }
            | RunEvent::NodeSkipped { node } => node,
        }
    }
}

/// Receiver for [`RunEvent`]s, in emission order.
pub trait EventSink {
    fn emit(&mut self, event: RunEvent);
}

/// Sink that logs each event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: RunEvent) {
        match &event {
            RunEvent::NodeStart { node } => info!(node = %node, "node started"),
            RunEvent::NodeOutput { node, output } => {
                debug!(node = %node, bytes = output.len(), "node output");
            }
            RunEvent::NodeComplete { node, result } => match result.status {
                NodeStatus::Failure => warn!(
                    node = %node,
                    duration_ms = result.duration.as_millis() as u64,
                    error = result.error.as_deref().unwrap_or_default(),
                    "node failed"
                ),
                _ => info!(
                    node = %node,
                    duration_ms = result.duration.as_millis() as u64,
                    "node succeeded"
                ),
            },
            RunEvent::NodeSkipped { node } => info!(node = %node, "node skipped"),
        }
    }
}

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

/// What the engine hands back once the node list is exhausted or halted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutcome {
    pub status: RunStatus,
    /// Node whose failure halted the run.
    pub failed_node: Option<String>,
    pub usage: TokenUsage,
    pub duration: Duration,
}

/// Run every node of `blueprint` in order, recording results into `ctx`.
#[instrument(skip_all, fields(blueprint = blueprint.name(), run_id = %ctx.run_id))]
pub fn run_blueprint(
    blueprint: &Blueprint,
    ctx: &mut RunContext,
    sandbox: &mut dyn Sandbox,
    agents: &dyn AgentDispatcher,
    events: &mut dyn EventSink,
) -> Result<EngineOutcome> {
    let started = Instant::now();
    let mut runner = NodeRunner {
        ctx,
        sandbox,
        agents,
        events,
        usage: TokenUsage::default(),
    };

    for node in blueprint.nodes() {
        if node.skip.as_ref().is_some_and(|skip| skip(&*runner.ctx)) {
            debug!(node = %node.name, "skip predicate held");
            runner.record(&node.name, NodeResult::skipped())?;
            runner.events.emit(RunEvent::NodeSkipped {
                node: node.name.clone(),
            });
            continue;
        }

        let result = runner.run_node(node)?;
        if result.is_failure() {
            info!(node = %node.name, "halting on failure");
            return Ok(EngineOutcome {
                status: RunStatus::Failure,
                failed_node: Some(node.name.clone()),
                usage: runner.usage,
                duration: started.elapsed(),
            });
        }
    }

    Ok(EngineOutcome {
        status: RunStatus::Success,
        failed_node: None,
        usage: runner.usage,
        duration: started.elapsed(),
    })
}

struct NodeRunner<'a> {
    ctx: &'a mut RunContext,
    sandbox: &'a mut dyn Sandbox,
    agents: &'a dyn AgentDispatcher,
    events: &'a mut dyn EventSink,
    usage: TokenUsage,
}

impl NodeRunner<'_> {
    fn record(&mut self, name: &str, result: NodeResult) -> Result<()> {
        self.ctx
            .record(name, result)
            .with_context(|| format!("record result for {name}"))
    }

    /// Emit start, run, emit output and complete, record.
    fn run_node(&mut self, node: &Node) -> Result<NodeResult> {
        self.start(&node.name);
        let result = match &node.kind {
            NodeKind::Gate(check) => check(&*self.ctx, &mut *self.sandbox)?,
            NodeKind::Exact(action) => action(&*self.ctx, &mut *self.sandbox)?,
            NodeKind::Delegated(delegated) => self.dispatch(&node.name, delegated)?,
            NodeKind::Validate(validate) => self.validate(&node.name, validate)?,
        };
        if !matches!(node.kind, NodeKind::Validate(_)) {
            self.output(&node.name, &result.output);
        }
        self.finish(&node.name, result)
    }

    fn start(&mut self, name: &str) {
        self.events.emit(RunEvent::NodeStart {
            node: name.to_string(),
        });
    }

    fn output(&mut self, name: &str, output: &str) {
        if !output.is_empty() {
            self.events.emit(RunEvent::NodeOutput {
                node: name.to_string(),
                output: output.to_string(),
            });
        }
    }

    fn finish(&mut self, name: &str, result: NodeResult) -> Result<NodeResult> {
        self.events.emit(RunEvent::NodeComplete {
            node: name.to_string(),
            result: result.clone(),
        });
        self.record(name, result.clone())?;
        Ok(result)
    }

    fn dispatch(&mut self, name: &str, node: &DelegatedNode) -> Result<NodeResult> {
        let prompt = (node.prompt)(&*self.ctx).with_context(|| format!("build prompt for {name}"))?;
        let request = AgentRequest {
            node: name,
            agent: &node.agent,
            prompt: &prompt,
            tools: &node.tools,
            timeout: node.timeout,
        };
        let outcome = self.agents.dispatch(&request, &*self.ctx, &mut *self.sandbox)?;
        self.usage.add(outcome.usage);
        Ok(outcome.result)
    }

    /// Attempts `0..=max_retries`; repair runs between failing attempts.
    fn validate(&mut self, name: &str, node: &ValidateNode) -> Result<NodeResult> {
        let started = Instant::now();
        let mut repairs = 0u32;

        for attempt in 0..=node.max_retries {
            let mut outputs = Vec::new();
            let mut elapsed = Duration::ZERO;
            let mut failed = None;

            for step in &node.steps {
                let result = (step.action)(&*self.ctx, &mut *self.sandbox)
                    .with_context(|| format!("validate step {}", step.name))?;
                elapsed += result.duration;
                if !result.output.is_empty() {
                    self.output(name, &result.output);
                    outputs.push(format!("[{}]\n{}", step.name, result.output));
                }
                if result.is_failure() {
                    let error = result.error.unwrap_or_else(|| "step failed".to_string());
                    failed = Some(format!("{}: {error}", step.name));
                    break;
                }
            }

            let Some(error) = failed else {
                debug!(node = %name, attempt, "validation passed");
                return Ok(NodeResult::success(outputs.join("\n"), elapsed));
            };
            if attempt == node.max_retries {
                warn!(node = %name, attempt, "validation failed, retries exhausted");
                return Ok(NodeResult::failure(outputs.join("\n"), started.elapsed(), error));
            }

            info!(node = %name, attempt, error = %error, "validation failed, repairing");
            self.ctx.validation_failure = Some(error);
            repairs += 1;
            let repair_name = repair_result_name(&node.repair_name, repairs);
            self.start(&repair_name);
            let repaired = self.dispatch(&repair_name, &node.repair)?;
            self.output(&repair_name, &repaired.output);
            let repaired = self.finish(&repair_name, repaired)?;
            if repaired.is_failure() {
                warn!(node = %repair_name, "repair failed, retrying validation anyway");
            }
        }
        unreachable!("validate loop returns on its final attempt")
    }
}

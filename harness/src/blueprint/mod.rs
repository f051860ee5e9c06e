//! Blueprint model: an ordered list of named nodes.
//!
//! Node kinds form a closed sum type. Gate and Exact nodes carry an action
//! over `(context, sandbox)`; Delegated nodes carry a prompt builder and are
//! handed to an agent dispatcher; Validate nodes bundle checks with a repair
//! node that runs between failing attempts.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;

use crate::core::redact::redact;
use crate::core::types::NodeResult;
use crate::sandbox::{ExecRequest, Sandbox};

pub mod context;
pub mod loader;

pub use context::RunContext;

/// Default retry budget for validate nodes.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Default timeout for agent and command nodes.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(600);

pub type SkipFn = Box<dyn Fn(&RunContext) -> bool>;
pub type ActionFn = Box<dyn Fn(&RunContext, &mut dyn Sandbox) -> Result<NodeResult>>;
pub type PromptFn = Box<dyn Fn(&RunContext) -> Result<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlueprintError {
    #[error("duplicate node name {0:?}")]
    DuplicateName(String),
    #[error("node name must not be empty")]
    EmptyName,
}

/// A compiled workflow.
#[derive(Debug)]
pub struct Blueprint {
    name: String,
    description: String,
    nodes: Vec<Node>,
}

impl Blueprint {
    /// Build a blueprint, rejecting duplicate node names (repair names included).
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        nodes: Vec<Node>,
    ) -> Result<Self, BlueprintError> {
        let mut seen = BTreeSet::new();
        for node in &nodes {
            for name in node.names() {
                if name.is_empty() {
                    return Err(BlueprintError::EmptyName);
                }
                if seen.contains(&name) {
                    return Err(BlueprintError::DuplicateName(name));
                }
                seen.insert(name);
            }
        }
        Ok(Self {
            name: name.into(),
            description: description.into(),
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// One named step of a blueprint.
pub struct Node {
    pub name: String,
    pub skip: Option<SkipFn>,
    pub kind: NodeKind,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("skippable", &self.skip.is_some())
            .finish()
    }
}

pub enum NodeKind {
    Gate(ActionFn),
    Exact(ActionFn),
    Delegated(DelegatedNode),
    Validate(ValidateNode),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Gate(_) => "gate",
            NodeKind::Exact(_) => "exact",
            NodeKind::Delegated(_) => "agent",
            NodeKind::Validate(_) => "validate",
        }
    }
}

/// Work handed to an agent.
pub struct DelegatedNode {
    pub agent: String,
    pub prompt: PromptFn,
    /// Tools the agent may use.
    pub tools: Vec<String>,
    pub timeout: Duration,
}

impl DelegatedNode {
    pub fn new(agent: impl Into<String>, prompt: PromptFn) -> Self {
        Self {
            agent: agent.into(),
            prompt,
            tools: Vec::new(),
            timeout: DEFAULT_NODE_TIMEOUT,
        }
    }

    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Ordered checks plus a repair agent run between failing attempts.
pub struct ValidateNode {
    pub steps: Vec<ValidateStep>,
    pub repair_name: String,
    pub repair: DelegatedNode,
    pub max_retries: u32,
}

impl ValidateNode {
    pub fn new(steps: Vec<ValidateStep>, repair_name: impl Into<String>, repair: DelegatedNode) -> Self {
        Self {
            steps,
            repair_name: repair_name.into(),
            repair,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

pub struct ValidateStep {
    pub name: String,
    pub action: ActionFn,
}

impl ValidateStep {
    pub fn new(name: impl Into<String>, action: ActionFn) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }

    /// A step that runs `argv` and passes on exit code 0.
    pub fn command<I, S>(name: impl Into<String>, argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, command(ExecRequest::new(argv, timeout)))
    }
}

impl Node {
    pub fn gate(name: impl Into<String>, check: ActionFn) -> Self {
        Self::with_kind(name, NodeKind::Gate(check))
    }

    pub fn exact(name: impl Into<String>, action: ActionFn) -> Self {
        Self::with_kind(name, NodeKind::Exact(action))
    }

    /// Exact node running one command.
    pub fn command<I, S>(name: impl Into<String>, argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::exact(name, command(ExecRequest::new(argv, timeout)))
    }

    pub fn delegated(name: impl Into<String>, node: DelegatedNode) -> Self {
        Self::with_kind(name, NodeKind::Delegated(node))
    }

    pub fn validate(name: impl Into<String>, node: ValidateNode) -> Self {
        Self::with_kind(name, NodeKind::Validate(node))
    }

    /// Skip this node when `predicate` holds.
    pub fn skip_when(mut self, predicate: SkipFn) -> Self {
        self.skip = Some(predicate);
        self
    }

    fn with_kind(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            skip: None,
            kind,
        }
    }

    /// Every result name this node can record.
    fn names(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        if let NodeKind::Validate(validate) = &self.kind {
            let repairs = validate.max_retries.max(1);
            names.extend((1..=repairs).map(|n| repair_result_name(&validate.repair_name, n)));
        }
        names
    }
}

/// First repair is recorded under the repair node name, later ones as `name#n`.
pub fn repair_result_name(repair_name: &str, attempt: u32) -> String {
    if attempt <= 1 {
        repair_name.to_string()
    } else {
        format!("{repair_name}#{attempt}")
    }
}

/// Action that runs `request` in the sandbox.
///
/// Exit code 0 is success; anything else, including a timeout, is a failure
/// result. Output is redacted against the run's env.
pub fn command(request: ExecRequest) -> ActionFn {
    Box::new(move |ctx: &RunContext, sandbox: &mut dyn Sandbox| -> Result<NodeResult> {
        let started = Instant::now();
        let out = sandbox.exec(&request)?;
        let output = redact(&out.combined(), &ctx.env);
        let elapsed = started.elapsed();
        if out.success() {
            return Ok(NodeResult::success(output, elapsed));
        }
        let program = request.argv.first().map(String::as_str).unwrap_or_default();
        let error = if out.timed_out {
            format!("{program} timed out after {}s", request.timeout.as_secs())
        } else {
            format!("{program} exited with code {}", out.exit_code)
        };
        Ok(NodeResult::failure(output, elapsed, error))
    })
}

/// Gate that passes only when every key is set and non-empty in the run env.
pub fn require_env<I, S>(keys: I) -> ActionFn
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    Box::new(move |ctx: &RunContext, _sandbox: &mut dyn Sandbox| -> Result<NodeResult> {
        let missing: Vec<&str> = keys
            .iter()
            .filter(|key| ctx.env.get(*key).is_none_or(|value| value.is_empty()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(NodeResult::success("", Duration::ZERO))
        } else {
            Ok(NodeResult::failure(
                "",
                Duration::ZERO,
                format!("missing required env: {}", missing.join(", ")),
            ))
        }
    })
}

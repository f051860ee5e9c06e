//! Declarative blueprint files.
//!
//! A blueprint file is TOML with a `name`, optional `description` and an
//! ordered `[[nodes]]` array. Each node has a `kind`:
//!
//! - `gate`: `argv` to run, or `require_env` keys that must be set.
//! - `exact`: `argv` to run, optional `cwd`.
//! - `agent`: `agent`, `prompt` (a minijinja template), optional `tools`.
//! - `validate`: `[[nodes.steps]]` commands plus a `[nodes.repair]` agent.
//!
//! Every node accepts `timeout_secs`, `skip_if_env` and `skip_unless_env`.
//! Prompt templates see `intent`, `run_id`, `repo`, `failure` (last failing
//! validation step) and `results` (recorded node results by name).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use minijinja::{Environment, UndefinedBehavior, context};
use serde::Deserialize;
use tracing::debug;

use super::{
    Blueprint, DelegatedNode, Node, NodeKind, PromptFn, RunContext, SkipFn, ValidateNode,
    ValidateStep, command, require_env,
};
use crate::sandbox::ExecRequest;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlueprintFile {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    nodes: Vec<NodeFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum KindName {
    Gate,
    Exact,
    Agent,
    Validate,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeFile {
    name: String,
    kind: KindName,
    #[serde(default)]
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    require_env: Vec<String>,
    agent: Option<String>,
    prompt: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
    timeout_secs: Option<u64>,
    skip_if_env: Option<String>,
    skip_unless_env: Option<String>,
    #[serde(default)]
    steps: Vec<StepFile>,
    repair: Option<RepairFile>,
    max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    name: String,
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepairFile {
    name: String,
    agent: String,
    prompt: String,
    #[serde(default)]
    tools: Vec<String>,
    timeout_secs: Option<u64>,
}

/// Read and compile a blueprint file.
pub fn load_blueprint(path: &Path, default_timeout: Duration) -> Result<Blueprint> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_blueprint(&raw, default_timeout).with_context(|| format!("compile {}", path.display()))
}

/// Compile blueprint TOML. `default_timeout` applies where a node sets none.
pub fn parse_blueprint(raw: &str, default_timeout: Duration) -> Result<Blueprint> {
    let file: BlueprintFile = toml::from_str(raw).context("parse blueprint toml")?;
    let nodes = file
        .nodes
        .into_iter()
        .map(|node| {
            let name = node.name.clone();
            compile_node(node, default_timeout).with_context(|| format!("node {name:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    debug!(blueprint = %file.name, nodes = nodes.len(), "compiled blueprint");
    Ok(Blueprint::new(file.name, file.description, nodes)?)
}

fn compile_node(node: NodeFile, default_timeout: Duration) -> Result<Node> {
    let timeout = node
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);
    let skip = skip_predicate(node.skip_if_env.clone(), node.skip_unless_env.clone());

    let kind = match node.kind {
        KindName::Gate => match (node.argv.is_empty(), node.require_env.is_empty()) {
            (false, true) => NodeKind::Gate(command(exec_request(node.argv, node.cwd, timeout))),
            (true, false) => NodeKind::Gate(require_env(node.require_env)),
            _ => bail!("gate needs exactly one of `argv` or `require_env`"),
        },
        KindName::Exact => {
            if node.argv.is_empty() {
                bail!("exact node needs `argv`");
            }
            NodeKind::Exact(command(exec_request(node.argv, node.cwd, timeout)))
        }
        KindName::Agent => {
            let agent = node.agent.ok_or_else(|| anyhow!("agent node needs `agent`"))?;
            let prompt = node.prompt.ok_or_else(|| anyhow!("agent node needs `prompt`"))?;
            NodeKind::Delegated(
                DelegatedNode::new(agent, prompt_template(prompt)?)
                    .tools(node.tools)
                    .timeout(timeout),
            )
        }
        KindName::Validate => {
            if node.steps.is_empty() {
                bail!("validate node needs at least one step");
            }
            let repair = node
                .repair
                .ok_or_else(|| anyhow!("validate node needs `repair`"))?;
            let steps = node
                .steps
                .into_iter()
                .map(|step| {
                    if step.argv.is_empty() {
                        bail!("step {:?} needs `argv`", step.name);
                    }
                    let step_timeout = step.timeout_secs.map(Duration::from_secs).unwrap_or(timeout);
                    Ok(ValidateStep::new(
                        step.name,
                        command(exec_request(step.argv, step.cwd, step_timeout)),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            let repair_timeout = repair
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            let delegated = DelegatedNode::new(repair.agent, prompt_template(repair.prompt)?)
                .tools(repair.tools)
                .timeout(repair_timeout);
            let mut validate = ValidateNode::new(steps, repair.name, delegated);
            if let Some(max_retries) = node.max_retries {
                validate = validate.max_retries(max_retries);
            }
            NodeKind::Validate(validate)
        }
    };

    Ok(Node {
        name: node.name,
        skip,
        kind,
    })
}

fn exec_request(argv: Vec<String>, cwd: Option<PathBuf>, timeout: Duration) -> ExecRequest {
    let request = ExecRequest::new(argv, timeout);
    match cwd {
        Some(cwd) => request.cwd(cwd),
        None => request,
    }
}

fn skip_predicate(skip_if: Option<String>, skip_unless: Option<String>) -> Option<SkipFn> {
    if skip_if.is_none() && skip_unless.is_none() {
        return None;
    }
    let is_set = |ctx: &RunContext, key: &str| ctx.env.get(key).is_some_and(|v| !v.is_empty());
    Some(Box::new(move |ctx: &RunContext| {
        skip_if.as_deref().is_some_and(|key| is_set(ctx, key))
            || skip_unless.as_deref().is_some_and(|key| !is_set(ctx, key))
    }))
}

fn template_env<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

/// Check `source` now; render it against the run context on each call.
fn prompt_template(source: String) -> Result<PromptFn> {
    template_env()
        .template_from_str(&source)
        .context("invalid prompt template")?;
    Ok(Box::new(move |ctx: &RunContext| -> Result<String> {
        render_prompt(&source, ctx)
    }))
}

pub fn render_prompt(source: &str, ctx: &RunContext) -> Result<String> {
    let results: std::collections::BTreeMap<&str, _> = ctx.results().collect();
    let rendered = template_env()
        .render_str(
            source,
            context! {
                intent => ctx.intent.trim(),
                run_id => &ctx.run_id,
                repo => &ctx.repo,
                failure => ctx.validation_failure.as_deref().map(str::trim),
                results => results,
            },
        )
        .context("render prompt template")?;
    Ok(rendered)
}

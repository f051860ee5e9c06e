//! Agent dispatch for delegated nodes.
//!
//! The engine treats agents as opaque: it hands an [`AgentRequest`] to an
//! [`AgentDispatcher`] and records the returned [`NodeResult`]. Tests use
//! scripted dispatchers; [`CommandAgentDispatcher`] runs a configured agent CLI
//! inside the sandbox.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::blueprint::RunContext;
use crate::core::redact::redact;
use crate::core::types::{NodeResult, TokenUsage};
use crate::io::config::AgentCommandConfig;
use crate::sandbox::{ExecRequest, Sandbox};

/// One agent invocation derived from a delegated node.
#[derive(Debug, Clone)]
pub struct AgentRequest<'a> {
    /// Name the result will be recorded under.
    pub node: &'a str,
    pub agent: &'a str,
    pub prompt: &'a str,
    pub tools: &'a [String],
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub result: NodeResult,
    pub usage: TokenUsage,
}

/// Abstraction over agent backends.
pub trait AgentDispatcher {
    /// Run the agent. Agent failure is a `failure` result; `Err` is reserved for
    /// misconfiguration and sandbox errors, which abort the run.
    fn dispatch(
        &self,
        request: &AgentRequest<'_>,
        ctx: &RunContext,
        sandbox: &mut dyn Sandbox,
    ) -> Result<AgentOutcome>;
}

/// Dispatcher that runs agent CLIs from the config's agent table.
#[derive(Debug, Clone)]
pub struct CommandAgentDispatcher {
    agents: BTreeMap<String, AgentCommandConfig>,
    output_limit_bytes: usize,
}

impl CommandAgentDispatcher {
    pub fn new(agents: BTreeMap<String, AgentCommandConfig>, output_limit_bytes: usize) -> Self {
        Self {
            agents,
            output_limit_bytes,
        }
    }

    pub fn knows(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }
}

/// Render each argv element with `prompt`, `tools`, `agent` and `run_id`.
pub fn render_argv(config: &AgentCommandConfig, request: &AgentRequest<'_>, run_id: &str) -> Result<Vec<String>> {
    let env = Environment::new();
    let tools = request.tools.join(",");
    config
        .argv
        .iter()
        .map(|arg| {
            env.render_str(
                arg,
                context! {
                    prompt => request.prompt,
                    tools => &tools,
                    agent => request.agent,
                    run_id => run_id,
                },
            )
            .with_context(|| format!("render agent argument {arg:?}"))
        })
        .collect()
}

impl AgentDispatcher for CommandAgentDispatcher {
    #[instrument(skip_all, fields(node = request.node, agent = request.agent))]
    fn dispatch(
        &self,
        request: &AgentRequest<'_>,
        ctx: &RunContext,
        sandbox: &mut dyn Sandbox,
    ) -> Result<AgentOutcome> {
        let config = self
            .agents
            .get(request.agent)
            .ok_or_else(|| anyhow!("no agent named {:?} in config", request.agent))?;
        let argv = render_argv(config, request, &ctx.run_id)?;
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(request.timeout);
        let mut env = ctx.env.clone();
        env.extend(config.env.clone());

        info!(timeout_secs = timeout.as_secs(), "starting agent");
        let out = sandbox.exec(
            &ExecRequest::new(argv, timeout)
                .env(env.clone())
                .max_output_bytes(self.output_limit_bytes),
        )?;
        let usage = parse_usage(&out.stdout).unwrap_or_default();
        let output = redact(&out.combined(), &env);

        let result = if out.success() {
            debug!(exit_code = out.exit_code, "agent completed");
            NodeResult::success(output, out.duration())
        } else if out.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "agent timed out");
            NodeResult::failure(
                output,
                out.duration(),
                format!("agent {} timed out after {}s", request.agent, timeout.as_secs()),
            )
        } else {
            warn!(exit_code = out.exit_code, "agent failed");
            NodeResult::failure(
                output,
                out.duration(),
                format!("agent {} exited with code {}", request.agent, out.exit_code),
            )
        };
        Ok(AgentOutcome { result, usage })
    }
}

/// Token usage from the last JSON line of agent stdout that reports one.
///
/// Accepts `input_tokens`/`output_tokens` at the top level or under `usage`.
pub fn parse_usage(stdout: &str) -> Option<TokenUsage> {
    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(line).ok()?;
        let usage = value.get("usage").unwrap_or(&value);
        let input = usage.get("input_tokens").and_then(Value::as_u64);
        let output = usage.get("output_tokens").and_then(Value::as_u64);
        if input.is_none() && output.is_none() {
            return None;
        }
        Some(TokenUsage {
            input_tokens: input.unwrap_or(0),
            output_tokens: output.unwrap_or(0),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(argv: &[&str]) -> AgentCommandConfig {
        AgentCommandConfig {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            timeout_secs: None,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn renders_prompt_and_tools_into_argv() {
        let tools = vec!["edit".to_string(), "bash".to_string()];
        let request = AgentRequest {
            node: "impl",
            agent: "coder",
            prompt: "fix it's bug",
            tools: &tools,
            timeout: Duration::from_secs(5),
        };
        let argv = render_argv(
            &config(&["coder-cli", "-p", "{{ prompt }}", "--tools={{ tools }}", "--tag={{ run_id }}"]),
            &request,
            "deadbeef",
        )
        .expect("render");
        assert_eq!(
            argv,
            vec!["coder-cli", "-p", "fix it's bug", "--tools=edit,bash", "--tag=deadbeef"]
        );
    }

    #[test]
    fn usage_comes_from_last_json_line() {
        let stdout = "working...\n{\"usage\":{\"input_tokens\":10,\"output_tokens\":4}}\n{\"input_tokens\":120,\"output_tokens\":30}\ndone\n";
        assert_eq!(
            parse_usage(stdout),
            Some(TokenUsage {
                input_tokens: 120,
                output_tokens: 30
            })
        );
        assert_eq!(parse_usage("no json here"), None);
        assert_eq!(parse_usage("{\"other\":1}"), None);
    }

    #[cfg(unix)]
    #[test]
    fn command_dispatcher_runs_agent_in_sandbox_and_redacts() {
        use crate::sandbox::local::{LocalSandbox, LocalSandboxOptions};
        use crate::test_support::TestRepo;

        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut options = LocalSandboxOptions::new(repo.path(), "harness/agent-test");
        options.worktree_parent = scratch.path().to_path_buf();
        let mut sandbox = LocalSandbox::create(options).expect("sandbox");

        let mut agents = BTreeMap::new();
        agents.insert(
            "echo".to_string(),
            config(&["sh", "-c", "echo \"$1 $API_TOKEN\"; echo '{\"input_tokens\":3,\"output_tokens\":2}'", "agent", "{{ prompt }}"]),
        );
        let dispatcher = CommandAgentDispatcher::new(agents, 4096);
        let mut ctx = RunContext::new("deadbeef", sandbox.root());
        ctx.env.insert("API_TOKEN".to_string(), "tok_0123456789".to_string());

        let tools = Vec::new();
        let request = AgentRequest {
            node: "impl",
            agent: "echo",
            prompt: "hello",
            tools: &tools,
            timeout: Duration::from_secs(10),
        };
        let outcome = dispatcher.dispatch(&request, &ctx, &mut sandbox).expect("dispatch");
        assert!(!outcome.result.is_failure(), "{outcome:?}");
        assert!(outcome.result.output.contains("hello [REDACTED:API_TOKEN]"));
        assert!(!outcome.result.output.contains("tok_0123456789"));
        assert_eq!(outcome.usage.input_tokens, 3);

        let missing = AgentRequest { agent: "nope", ..request };
        assert!(dispatcher.dispatch(&missing, &ctx, &mut sandbox).is_err());
        sandbox.teardown().expect("teardown");
    }
}

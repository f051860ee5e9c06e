//! One complete run: provision, execute, snapshot, publish, tear down.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agent::AgentDispatcher;
use crate::blueprint::context::{generate_run_id, is_valid_run_id, run_branch};
use crate::blueprint::{Blueprint, RunContext};
use crate::engine::{EventSink, RunStatus, run_blueprint};
use crate::io::report::{ReportMeta, RunReport};
use crate::publish::{ReviewRequester, publish};
use crate::sandbox::Sandbox;

/// Owns a sandbox and tears it down when dropped.
///
/// [`SandboxGuard::finish`] tears down explicitly so the error can be
/// reported; drop is the fallback for early returns and panics.
pub struct SandboxGuard<S: Sandbox> {
    sandbox: S,
    finished: bool,
}

impl<S: Sandbox> SandboxGuard<S> {
    pub fn new(sandbox: S) -> Self {
        Self {
            sandbox,
            finished: false,
        }
    }

    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.sandbox.teardown()
    }
}

impl<S: Sandbox> Deref for SandboxGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.sandbox
    }
}

impl<S: Sandbox> DerefMut for SandboxGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.sandbox
    }
}

impl<S: Sandbox> Drop for SandboxGuard<S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.sandbox.teardown() {
            warn!(err = %format!("{err:#}"), "sandbox teardown failed");
        }
    }
}

/// Publishing settings for a run.
pub struct PublishOptions<'a> {
    /// Push credential. `None` yields the "token missing" outcome.
    pub token: Option<String>,
    pub reviewer: Option<&'a dyn ReviewRequester>,
}

/// Everything a run needs besides the sandbox.
pub struct RunRequest<'a> {
    pub blueprint: &'a Blueprint,
    pub branch_prefix: &'a str,
    pub intent: String,
    pub repo: String,
    pub env: BTreeMap<String, String>,
    /// Fixed run id; generated when `None`.
    pub run_id: Option<String>,
    /// Push and request review after a successful run.
    pub publish: Option<PublishOptions<'a>>,
}

/// Run `request.blueprint` in a sandbox created by `create_sandbox(branch)`.
///
/// The sandbox is torn down on every exit path. On success the final state is
/// snapshotted and, when requested, published. An error escaping a node body
/// is returned after teardown.
#[instrument(skip_all, fields(blueprint = request.blueprint.name()))]
pub fn execute_run<S, F>(
    request: RunRequest<'_>,
    create_sandbox: F,
    agents: &dyn AgentDispatcher,
    events: &mut dyn EventSink,
) -> Result<RunReport>
where
    S: Sandbox,
    F: FnOnce(&str) -> Result<S>,
{
    let run_id = match request.run_id {
        Some(id) if is_valid_run_id(&id) => id,
        Some(id) => return Err(anyhow!("run id {id:?} must be 8 lowercase hex characters")),
        None => generate_run_id(),
    };
    let blueprint = request.blueprint;
    let branch = run_branch(request.branch_prefix, &run_id, blueprint.name());
    let started_at = Utc::now();
    info!(run_id = %run_id, branch = %branch, "starting run");

    let mut sandbox = SandboxGuard::new(create_sandbox(&branch).context("create sandbox")?);
    let mut ctx = RunContext::new(run_id, sandbox.root())
        .with_intent(request.intent)
        .with_repo(request.repo)
        .with_env(request.env)
        .with_push(request.publish.is_some());

    let outcome = run_blueprint(blueprint, &mut ctx, &mut *sandbox, agents, events)?;

    let mut snapshot = None;
    let mut push = None;
    if outcome.status == RunStatus::Success {
        let message = format!("harness: {} run {}", blueprint.name(), ctx.run_id);
        snapshot = Some(sandbox.snapshot(&message).context("snapshot sandbox")?);
        if let Some(options) = request.publish {
            let title = format!("{}: {}", blueprint.name(), first_line(&ctx.intent));
            push = Some(publish(
                &mut *sandbox,
                options.token.as_deref(),
                options.reviewer,
                &title,
                &ctx.intent,
            ));
        }
    }

    sandbox.finish().context("tear down sandbox")?;
    let report = RunReport::build(
        blueprint,
        &ctx,
        ReportMeta {
            branch: &branch,
            outcome: &outcome,
            snapshot,
            push,
            started_at,
            finished_at: Utc::now(),
        },
    );
    info!(status = ?report.status, nodes = report.nodes.len(), "run finished");
    Ok(report)
}

fn first_line(text: &str) -> &str {
    text.lines().next().map(str::trim).unwrap_or_default()
}

//! Test-only helpers: scratch git repositories and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::agent::{AgentDispatcher, AgentOutcome, AgentRequest};
use crate::blueprint::RunContext;
use crate::core::types::{NodeResult, TokenUsage};
use crate::engine::{EventSink, RunEvent};
use crate::io::control_plane::{ControlPlane, RemoteSession, SessionOutput};
use crate::sandbox::{ExecOutput, ExecRequest, FileUpload, Sandbox, VcsCapability};

/// Commit id the fake control plane reports for `git rev-parse HEAD`.
pub const FAKE_SHA: &str = "0123456789abcdef0123456789abcdef01234567";

/// Temporary git repository with one commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q", "-b", "main"])?;
        repo.git(&["config", "user.name", "Test User"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# test repo\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial commit"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Run git in the repository, returning trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("run git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Sink that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<RunEvent>,
}

impl RecordingSink {
    /// Events as `kind:node` strings, e.g. `start:install`.
    pub fn kinds(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|event| {
                let kind = match event {
                    RunEvent::NodeStart { .. } => "start",
                    RunEvent::NodeOutput { .. } => "output",
                    RunEvent::NodeComplete { .. } => "complete",
                    RunEvent::NodeSkipped { .. } => "skipped",
                };
                format!("{kind}:{}", event.node())
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: RunEvent) {
        self.events.push(event);
    }
}

/// One queued agent response.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub outcome: AgentOutcome,
    /// Files written into the sandbox before the outcome is returned.
    pub uploads: Vec<FileUpload>,
}

impl ScriptedStep {
    pub fn uploading(mut self, files: Vec<FileUpload>) -> Self {
        self.uploads = files;
        self
    }
}

/// An agent invocation as the dispatcher saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub node: String,
    pub agent: String,
    pub prompt: String,
    pub tools: Vec<String>,
}

/// Dispatcher that replays queued responses in order.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    steps: RefCell<VecDeque<ScriptedStep>>,
    calls: RefCell<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn success(output: &str, input_tokens: u64, output_tokens: u64) -> ScriptedStep {
        ScriptedStep {
            outcome: AgentOutcome {
                result: NodeResult::success(output, Duration::from_millis(1)),
                usage: TokenUsage {
                    input_tokens,
                    output_tokens,
                },
            },
            uploads: Vec::new(),
        }
    }

    pub fn failure(error: &str) -> ScriptedStep {
        ScriptedStep {
            outcome: AgentOutcome {
                result: NodeResult::failure("", Duration::from_millis(1), error),
                usage: TokenUsage::default(),
            },
            uploads: Vec::new(),
        }
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.borrow().clone()
    }
}

impl AgentDispatcher for ScriptedAgent {
    fn dispatch(
        &self,
        request: &AgentRequest<'_>,
        _ctx: &RunContext,
        sandbox: &mut dyn Sandbox,
    ) -> Result<AgentOutcome> {
        self.calls.borrow_mut().push(AgentCall {
            node: request.node.to_string(),
            agent: request.agent.to_string(),
            prompt: request.prompt.to_string(),
            tools: request.tools.to_vec(),
        });
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no response for {}", request.node))?;
        if !step.uploads.is_empty() {
            sandbox.upload_files(&step.uploads)?;
        }
        Ok(step.outcome)
    }
}

/// Push/default-branch capability with scripted results.
#[derive(Debug, Clone)]
pub struct ScriptedVcs {
    pub branch: String,
    pub default_branch: String,
    pub push_error: Option<String>,
    /// Tokens passed to each successful push.
    pub pushes: Vec<String>,
}

impl ScriptedVcs {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            default_branch: "main".to_string(),
            push_error: None,
            pushes: Vec::new(),
        }
    }
}

impl VcsCapability for ScriptedVcs {
    fn branch(&self) -> &str {
        &self.branch
    }

    fn push_branch(&mut self, token: &str) -> Result<()> {
        if let Some(err) = &self.push_error {
            return Err(anyhow!(err.clone()));
        }
        self.pushes.push(token.to_string());
        Ok(())
    }

    fn default_branch(&mut self) -> Result<String> {
        Ok(self.default_branch.clone())
    }
}

#[derive(Debug, Default)]
struct NullState {
    execs: RefCell<Vec<ExecRequest>>,
    uploads: RefCell<Vec<FileUpload>>,
    snapshots: Cell<usize>,
    teardowns: Cell<usize>,
}

/// Read-only view of a [`NullSandbox`] that outlives the sandbox itself.
#[derive(Debug, Clone)]
pub struct SandboxProbe(Rc<NullState>);

impl SandboxProbe {
    pub fn execs(&self) -> Vec<ExecRequest> {
        self.0.execs.borrow().clone()
    }

    pub fn uploads(&self) -> Vec<FileUpload> {
        self.0.uploads.borrow().clone()
    }

    pub fn snapshots(&self) -> usize {
        self.0.snapshots.get()
    }

    /// Number of real releases; repeated teardown calls do not count.
    pub fn teardowns(&self) -> usize {
        self.0.teardowns.get()
    }
}

/// In-memory sandbox: every command succeeds with empty output.
#[derive(Debug)]
pub struct NullSandbox {
    root: PathBuf,
    state: Rc<NullState>,
    vcs: Option<ScriptedVcs>,
    torn_down: bool,
}

impl Default for NullSandbox {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sandbox"),
            state: Rc::default(),
            vcs: None,
            torn_down: false,
        }
    }
}

impl NullSandbox {
    pub fn with_vcs(vcs: ScriptedVcs) -> Self {
        Self {
            vcs: Some(vcs),
            ..Self::default()
        }
    }

    pub fn probe(&self) -> SandboxProbe {
        SandboxProbe(Rc::clone(&self.state))
    }

    pub fn vcs_state(&self) -> Option<&ScriptedVcs> {
        self.vcs.as_ref()
    }
}

impl Sandbox for NullSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exec(&mut self, request: &ExecRequest) -> Result<ExecOutput> {
        self.state.execs.borrow_mut().push(request.clone());
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            timed_out: false,
        })
    }

    fn upload_files(&mut self, files: &[FileUpload]) -> Result<()> {
        self.state.uploads.borrow_mut().extend(files.iter().cloned());
        Ok(())
    }

    fn snapshot(&mut self, _message: &str) -> Result<String> {
        self.state.snapshots.set(self.state.snapshots.get() + 1);
        Ok(format!("snapshot-{}", self.state.snapshots.get()))
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.torn_down {
            self.torn_down = true;
            self.state.teardowns.set(self.state.teardowns.get() + 1);
        }
        Ok(())
    }

    fn vcs(&mut self) -> Option<&mut dyn VcsCapability> {
        self.vcs.as_mut().map(|vcs| vcs as &mut dyn VcsCapability)
    }
}

type CommandMatcher = Box<dyn Fn(&str) -> bool>;

#[derive(Default)]
struct PlaneState {
    next_id: Cell<usize>,
    created: RefCell<Vec<String>>,
    deleted: RefCell<Vec<String>>,
    commands: RefCell<Vec<String>>,
    timeouts: RefCell<Vec<u64>>,
    files: RefCell<Vec<(PathBuf, Vec<u8>)>>,
    queued: RefCell<VecDeque<SessionOutput>>,
    fail_when: RefCell<Option<CommandMatcher>>,
    delete_failures: Cell<usize>,
    sessions_opened: Cell<usize>,
    sessions_closed: Cell<usize>,
}

/// In-memory control plane that records every command sent to it.
///
/// Commands succeed with empty output unless a response was queued with
/// [`FakeControlPlane::respond_next`] or they match [`FakeControlPlane::fail_when`].
/// `git rev-parse HEAD` answers [`FAKE_SHA`]; the origin default branch is `main`.
#[derive(Clone, Default)]
pub struct FakeControlPlane {
    state: Rc<PlaneState>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when(&self, matcher: impl Fn(&str) -> bool + 'static) {
        *self.state.fail_when.borrow_mut() = Some(Box::new(matcher));
    }

    /// Make the next `count` container deletions fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.state.delete_failures.set(count);
    }

    pub fn respond_next(&self, output: SessionOutput) {
        self.state.queued.borrow_mut().push_back(output);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.borrow().clone()
    }

    pub fn timeouts(&self) -> Vec<u64> {
        self.state.timeouts.borrow().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.state.created.borrow().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.deleted.borrow().clone()
    }

    pub fn files(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.state.files.borrow().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.get()
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.get()
    }
}

impl ControlPlane for FakeControlPlane {
    fn create_container(&self, _image: &str) -> Result<String> {
        let id = self.state.next_id.get() + 1;
        self.state.next_id.set(id);
        let id = format!("ctr-{id}");
        self.state.created.borrow_mut().push(id.clone());
        Ok(id)
    }

    fn delete_container(&self, container_id: &str) -> Result<()> {
        let failures = self.state.delete_failures.get();
        if failures > 0 {
            self.state.delete_failures.set(failures - 1);
            return Err(anyhow!("delete {container_id}: control plane unavailable"));
        }
        self.state.deleted.borrow_mut().push(container_id.to_string());
        Ok(())
    }

    fn open_session(&self, _container_id: &str) -> Result<Box<dyn RemoteSession>> {
        self.state
            .sessions_opened
            .set(self.state.sessions_opened.get() + 1);
        Ok(Box::new(FakeSession {
            state: Rc::clone(&self.state),
        }))
    }

    fn write_file(&self, _container_id: &str, path: &Path, content: &[u8]) -> Result<()> {
        self.state
            .files
            .borrow_mut()
            .push((path.to_path_buf(), content.to_vec()));
        Ok(())
    }
}

struct FakeSession {
    state: Rc<PlaneState>,
}

impl RemoteSession for FakeSession {
    fn run(&mut self, command: &str, timeout_secs: u64) -> Result<SessionOutput> {
        self.state.commands.borrow_mut().push(command.to_string());
        self.state.timeouts.borrow_mut().push(timeout_secs);

        let failing = self
            .state
            .fail_when
            .borrow()
            .as_ref()
            .is_some_and(|matcher| matcher(command));
        if failing {
            return Ok(SessionOutput {
                exit_code: Some(1),
                stderr: "fake failure".to_string(),
                ..SessionOutput::default()
            });
        }
        if let Some(queued) = self.state.queued.borrow_mut().pop_front() {
            return Ok(queued);
        }
        let stdout = if command.contains("'rev-parse' 'HEAD'") {
            format!("{FAKE_SHA}\n")
        } else if command.contains("'symbolic-ref'") {
            "origin/main\n".to_string()
        } else {
            String::new()
        };
        Ok(SessionOutput {
            exit_code: Some(0),
            stdout,
            ..SessionOutput::default()
        })
    }

    fn close(&mut self) -> Result<()> {
        self.state
            .sessions_closed
            .set(self.state.sessions_closed.get() + 1);
        Ok(())
    }
}

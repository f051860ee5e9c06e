//! Remote backend: a provisioned container reached through a control plane.
//!
//! One session is opened during bootstrap and reused for every command until
//! teardown. Commands are sent as `cd <cwd> && <env> <argv>` with every piece
//! quoted; this is the only place argv is turned into a shell string.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use super::{
    ExecOutput, ExecRequest, FileUpload, Sandbox, VcsCapability, confined_cwd, confined_uploads,
    validate_env_keys,
};
use crate::core::redact::redact;
use crate::core::shell::{env_assignments, quote_arg, shell_quote};
use crate::core::truncate::{DEFAULT_MAX_OUTPUT_BYTES, truncate};
use crate::io::control_plane::{ControlPlane, RemoteSession, SessionOutput};
use crate::io::git::CommitAuthor;
use crate::io::process::TIMEOUT_EXIT_CODE;

/// Exit code assumed when the backend does not report one.
///
/// Fail-safe: an unknown outcome is never treated as success.
pub const UNKNOWN_EXIT_CODE: i32 = 1;

/// Env var carrying the push credential into the container's git process.
const PUSH_TOKEN_ENV: &str = "HARNESS_PUSH_TOKEN";

/// Inputs for [`RemoteSandbox::create`].
#[derive(Debug, Clone)]
pub struct RemoteSandboxOptions {
    pub image: String,
    pub repo_url: String,
    /// Absolute sandbox root inside the container.
    pub root: PathBuf,
    pub branch: String,
    pub author: CommitAuthor,
    pub bootstrap_timeout: Duration,
    pub default_output_limit: usize,
}

impl RemoteSandboxOptions {
    pub fn new(image: impl Into<String>, repo_url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            repo_url: repo_url.into(),
            root: PathBuf::from("/workspace/repo"),
            branch: branch.into(),
            author: CommitAuthor {
                name: "harness".to_string(),
                email: "harness@local.invalid".to_string(),
            },
            bootstrap_timeout: Duration::from_secs(600),
            default_output_limit: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Sandbox living inside a remote container.
pub struct RemoteSandbox<C: ControlPlane> {
    plane: C,
    container_id: String,
    session: Option<Box<dyn RemoteSession>>,
    root: PathBuf,
    branch: String,
    author: CommitAuthor,
    default_output_limit: usize,
    default_branch: Option<String>,
    torn_down: bool,
}

impl<C: ControlPlane> std::fmt::Debug for RemoteSandbox<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSandbox")
            .field("container_id", &self.container_id)
            .field("root", &self.root)
            .field("branch", &self.branch)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl<C: ControlPlane> RemoteSandbox<C> {
    /// Provision a container, clone the default branch and check out the run branch.
    ///
    /// Any bootstrap failure deletes the container before the error propagates.
    #[instrument(skip_all, fields(image = %options.image, branch = %options.branch))]
    pub fn create(plane: C, options: RemoteSandboxOptions) -> Result<Self> {
        if !options.root.is_absolute() {
            return Err(anyhow!("remote root {} must be absolute", options.root.display()));
        }
        let container_id = plane
            .create_container(&options.image)
            .context("create sandbox container")?;
        info!(container_id = %container_id, "container provisioned");

        let session = match bootstrap(&plane, &container_id, &options) {
            Ok(session) => session,
            Err(err) => {
                warn!(container_id = %container_id, err = %err, "bootstrap failed, deleting container");
                if let Err(del) = plane.delete_container(&container_id) {
                    warn!(err = %del, "failed to delete container after bootstrap failure");
                }
                return Err(err.context("bootstrap remote sandbox"));
            }
        };

        Ok(Self {
            plane,
            container_id,
            session: Some(session),
            root: options.root,
            branch: options.branch,
            author: options.author,
            default_output_limit: options.default_output_limit,
            default_branch: None,
            torn_down: false,
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn session(&mut self) -> Result<&mut Box<dyn RemoteSession>> {
        if self.torn_down {
            return Err(anyhow!("sandbox {} was torn down", self.container_id));
        }
        self.session
            .as_mut()
            .ok_or_else(|| anyhow!("sandbox {} has no session", self.container_id))
    }

    /// Run a git command at the root, failing on non-zero exit.
    fn git_checked(&mut self, args: &[&str], env: &BTreeMap<String, String>) -> Result<ExecOutput> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        let out = self.exec(&ExecRequest::new(argv, Duration::from_secs(300)).env(env.clone()))?;
        if !out.success() {
            return Err(anyhow!(
                "git {} failed (exit {}): {}",
                args.first().copied().unwrap_or_default(),
                out.exit_code,
                redact(out.stderr.trim(), env)
            ));
        }
        Ok(out)
    }
}

fn bootstrap<C: ControlPlane>(
    plane: &C,
    container_id: &str,
    options: &RemoteSandboxOptions,
) -> Result<Box<dyn RemoteSession>> {
    let mut session = plane
        .open_session(container_id)
        .context("open sandbox session")?;
    let timeout_secs = timeout_to_secs(options.bootstrap_timeout);
    let root = options.root.to_string_lossy().into_owned();
    let parent = options
        .root
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    let (root, parent) = (root.as_str(), parent.as_str());
    let (url, branch) = (options.repo_url.as_str(), options.branch.as_str());
    let (name, email) = (options.author.name.as_str(), options.author.email.as_str());
    // Clone without --branch: the run branch does not exist upstream yet.
    let steps: [(&str, Vec<&str>); 5] = [
        ("prepare workdir", vec!["mkdir", "-p", parent]),
        ("clone repository", vec!["git", "clone", url, root]),
        ("create run branch", vec!["git", "-C", root, "checkout", "-b", branch]),
        ("configure identity", vec!["git", "-C", root, "config", "user.name", name]),
        ("configure identity", vec!["git", "-C", root, "config", "user.email", email]),
    ];

    let result = steps.iter().try_for_each(|(label, argv)| -> Result<()> {
        let command = shell_quote(argv)?;
        debug!(step = label, "bootstrap step");
        let out = session
            .run(&command, timeout_secs)
            .with_context(|| format!("{label}: session error"))?;
        if out.timed_out || out.exit_code != Some(0) {
            return Err(anyhow!(
                "{label} failed (exit {:?}): {}",
                out.exit_code,
                truncate(out.stderr.trim(), 4096)
            ));
        }
        Ok(())
    });

    match result {
        Ok(()) => Ok(session),
        Err(err) => {
            if let Err(close_err) = session.close() {
                debug!(err = %close_err, "failed to close session after bootstrap failure");
            }
            Err(err)
        }
    }
}

/// Milliseconds to whole seconds, rounded up, at least one.
pub fn timeout_to_secs(timeout: Duration) -> u64 {
    let millis = timeout.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

/// Build `cd <cwd> && [K='v' ...] <argv>` with every element quoted.
pub fn build_command(cwd: &Path, env: &BTreeMap<String, String>, argv: &[String]) -> Result<String> {
    let assignments = env_assignments(env)?;
    let quoted = shell_quote(argv)?;
    let cd = format!("cd {}", quote_arg(&cwd.to_string_lossy()));
    if assignments.is_empty() {
        Ok(format!("{cd} && {quoted}"))
    } else {
        Ok(format!("{cd} && {assignments} {quoted}"))
    }
}

fn to_exec_output(out: SessionOutput, limit: usize, elapsed: Duration) -> ExecOutput {
    let exit_code = if out.timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        out.exit_code.unwrap_or_else(|| {
            warn!("remote backend reported no exit code, assuming failure");
            UNKNOWN_EXIT_CODE
        })
    };
    ExecOutput {
        exit_code,
        stdout: truncate(&out.stdout, limit),
        stderr: truncate(&out.stderr, limit),
        duration_ms: elapsed.as_millis() as u64,
        timed_out: out.timed_out,
    }
}

impl<C: ControlPlane> Sandbox for RemoteSandbox<C> {
    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip_all, fields(container_id = %self.container_id, program = request.argv.first().map(String::as_str)))]
    fn exec(&mut self, request: &ExecRequest) -> Result<ExecOutput> {
        let cwd = confined_cwd(&self.root, request.cwd.as_deref())?;
        validate_env_keys(&request.env)?;
        let command = build_command(&cwd, &request.env, &request.argv)?;
        let limit = request.max_output_bytes.unwrap_or(self.default_output_limit);
        let timeout_secs = timeout_to_secs(request.timeout);

        let start = Instant::now();
        let out = self
            .session()?
            .run(&command, timeout_secs)
            .context("remote session exec")?;
        let output = to_exec_output(out, limit, start.elapsed());
        debug!(exit_code = output.exit_code, timed_out = output.timed_out, "remote command finished");
        Ok(output)
    }

    fn upload_files(&mut self, files: &[FileUpload]) -> Result<()> {
        let targets = confined_uploads(&self.root, files)?;
        self.session()?;
        for (path, content) in targets {
            if let Some(parent) = path.parent() {
                let out = self.exec(&ExecRequest::new(
                    ["mkdir".to_string(), "-p".to_string(), parent.to_string_lossy().into_owned()],
                    Duration::from_secs(60),
                ))?;
                if !out.success() {
                    return Err(anyhow!("create {}: {}", parent.display(), out.stderr.trim()));
                }
            }
            self.plane
                .write_file(&self.container_id, &path, &content)
                .with_context(|| format!("upload {}", path.display()))?;
            debug!(path = %path.display(), "uploaded file");
        }
        Ok(())
    }

    fn snapshot(&mut self, message: &str) -> Result<String> {
        let none = BTreeMap::new();
        let status = self.git_checked(&["status", "--porcelain"], &none)?;
        let name = format!("user.name={}", self.author.name);
        let email = format!("user.email={}", self.author.email);
        if status.stdout.trim().is_empty() {
            debug!("worktree clean, recording empty snapshot");
        } else {
            self.git_checked(&["add", "-A"], &none)?;
        }
        self.git_checked(
            &["-c", &name, "-c", &email, "commit", "--allow-empty", "--no-verify", "-m", message],
            &none,
        )?;
        let head = self.git_checked(&["rev-parse", "HEAD"], &none)?;
        let sha = head.stdout.trim().to_string();
        info!(sha = %sha, "snapshot committed");
        Ok(sha)
    }

    #[instrument(skip_all, fields(container_id = %self.container_id))]
    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        if let Some(mut session) = self.session.take()
            && let Err(err) = session.close()
        {
            warn!(err = %err, "failed to close session");
        }
        // Stays retryable until the container is actually gone.
        self.plane
            .delete_container(&self.container_id)
            .context("delete sandbox container")?;
        self.torn_down = true;
        info!("remote sandbox torn down");
        Ok(())
    }

    fn vcs(&mut self) -> Option<&mut dyn VcsCapability> {
        Some(self)
    }
}

impl<C: ControlPlane> VcsCapability for RemoteSandbox<C> {
    fn branch(&self) -> &str {
        &self.branch
    }

    fn push_branch(&mut self, token: &str) -> Result<()> {
        let mut env = BTreeMap::new();
        env.insert(PUSH_TOKEN_ENV.to_string(), token.to_string());
        // The credential helper reads the token from the environment so it never
        // appears in the command line itself.
        let helper = format!(
            "credential.helper=!f() {{ echo username=x-access-token; echo \"password=${PUSH_TOKEN_ENV}\"; }}; f"
        );
        let branch = self.branch.clone();
        self.git_checked(&["-c", &helper, "push", "--set-upstream", "origin", &branch], &env)?;
        info!(branch = %branch, "branch pushed");
        Ok(())
    }

    fn default_branch(&mut self) -> Result<String> {
        if let Some(name) = &self.default_branch {
            return Ok(name.clone());
        }
        let out = self.git_checked(
            &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
            &BTreeMap::new(),
        )?;
        let full = out.stdout.trim();
        let name = full.strip_prefix("origin/").unwrap_or(full).to_string();
        self.default_branch = Some(name.clone());
        Ok(name)
    }
}

//! Sandbox isolation layer.
//!
//! A [`Sandbox`] is the only channel through which a run touches a filesystem
//! or spawns a process. Two backends implement it: [`local::LocalSandbox`]
//! (a git worktree plus direct process spawning) and [`remote::RemoteSandbox`]
//! (a provisioned container driven through a control plane session).
//!
//! Every backend confines command working directories and upload targets to
//! its root, validates env keys before building a command, and bounds output.
//! Ordinary command failure and timeouts are values in [`ExecOutput`]; only
//! boundary violations (and backend transport failures) are errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::core::confine::resolve_within;
use crate::core::env::validate_env_key;
use crate::core::error::BoundaryError;

pub mod local;
pub mod remote;

/// One command invocation against a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Working directory; relative paths resolve against the sandbox root.
    /// `None` means the root itself.
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    /// Per-stream output cap; `None` uses the backend default (50 KiB).
    pub max_output_bytes: Option<usize>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout,
            env: BTreeMap::new(),
            max_output_bytes: None,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = Some(limit);
        self
    }
}

/// Result of [`Sandbox::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout and stderr joined for display.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n--- stderr ---\n{}", self.stdout, self.stderr),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// A file to place inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// Target path; relative paths resolve against the sandbox root.
    pub path: PathBuf,
    pub content: Vec<u8>,
}

impl FileUpload {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Uniform capability contract shared by all backends.
pub trait Sandbox {
    /// Absolute confinement root.
    fn root(&self) -> &Path;

    /// Run a command. See the module docs for the error/outcome split.
    fn exec(&mut self, request: &ExecRequest) -> Result<ExecOutput>;

    /// Write files below the root, creating parent directories.
    fn upload_files(&mut self, files: &[FileUpload]) -> Result<()>;

    /// Capture the current state and return its identifier. Succeeds with no
    /// pending changes.
    fn snapshot(&mut self, message: &str) -> Result<String>;

    /// Release every backend resource. Calling it again is a silent no-op.
    fn teardown(&mut self) -> Result<()>;

    /// Optional push/default-branch capability. `None` means unsupported.
    fn vcs(&mut self) -> Option<&mut dyn VcsCapability> {
        None
    }
}

/// Version-control operations only some backends can perform.
pub trait VcsCapability {
    /// The run branch checked out in the sandbox.
    fn branch(&self) -> &str;

    /// Push the run branch upstream, authenticating with `token`.
    fn push_branch(&mut self, token: &str) -> Result<()>;

    /// Upstream default branch name, resolved once and cached.
    fn default_branch(&mut self) -> Result<String>;
}

/// Confine `cwd` to `root`, defaulting to the root itself.
pub(crate) fn confined_cwd(root: &Path, cwd: Option<&Path>) -> Result<PathBuf, BoundaryError> {
    match cwd {
        Some(cwd) => resolve_within(root, cwd),
        None => resolve_within(root, Path::new(".")),
    }
}

pub(crate) fn validate_env_keys(env: &BTreeMap<String, String>) -> Result<(), BoundaryError> {
    env.keys().try_for_each(|key| validate_env_key(key))
}

/// Resolve and confine every upload target before anything is written.
pub(crate) fn confined_uploads(
    root: &Path,
    files: &[FileUpload],
) -> Result<Vec<(PathBuf, Vec<u8>)>, BoundaryError> {
    files
        .iter()
        .map(|file| Ok((resolve_within(root, &file.path)?, file.content.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_output_labels_stderr() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: "a".to_string(),
            stderr: "b".to_string(),
            duration_ms: 5,
            timed_out: false,
        };
        assert_eq!(out.combined(), "a\n--- stderr ---\nb");
        assert!(!out.success());
    }

    #[test]
    fn confined_cwd_defaults_to_root() {
        let root = Path::new("/sandbox/root");
        assert_eq!(confined_cwd(root, None).expect("cwd"), PathBuf::from("/sandbox/root"));
        assert!(confined_cwd(root, Some(Path::new("/sandbox/root2"))).is_err());
    }

    #[test]
    fn uploads_are_all_checked_before_returning() {
        let root = Path::new("/sandbox/root");
        let files = vec![
            FileUpload::new("ok.txt", "x"),
            FileUpload::new("../escape.txt", "y"),
        ];
        let err = confined_uploads(root, &files).unwrap_err();
        assert!(matches!(err, BoundaryError::PathEscape { .. }));
    }
}

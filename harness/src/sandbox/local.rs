//! Local backend: an isolated git worktree on a dedicated branch.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use super::{
    ExecOutput, ExecRequest, FileUpload, Sandbox, confined_cwd, confined_uploads,
    validate_env_keys,
};
use crate::core::confine::assert_resolved_confined;
use crate::core::truncate::DEFAULT_MAX_OUTPUT_BYTES;
use crate::io::git::{CommitAuthor, Git};
use crate::io::process::{ProcessRequest, run_process};

/// Inputs for [`LocalSandbox::create`].
#[derive(Debug, Clone)]
pub struct LocalSandboxOptions {
    /// Repository the worktree is cut from.
    pub source_repo: PathBuf,
    /// New branch created for the run.
    pub branch: String,
    /// Commit-ish the branch starts from.
    pub start_point: String,
    /// Directory that will hold the worktree (created if missing).
    pub worktree_parent: PathBuf,
    /// Name of the worktree directory inside `worktree_parent`.
    pub worktree_name: String,
    pub author: CommitAuthor,
    pub default_output_limit: usize,
}

impl LocalSandboxOptions {
    pub fn new(source_repo: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        Self {
            source_repo: source_repo.into(),
            worktree_name: branch.replace('/', "-"),
            branch,
            start_point: "HEAD".to_string(),
            worktree_parent: std::env::temp_dir().join("harness-worktrees"),
            author: CommitAuthor {
                name: "harness".to_string(),
                email: "harness@local.invalid".to_string(),
            },
            default_output_limit: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Sandbox rooted at a linked worktree of the source repository.
#[derive(Debug)]
pub struct LocalSandbox {
    source: Git,
    root: PathBuf,
    branch: String,
    author: CommitAuthor,
    default_output_limit: usize,
    torn_down: bool,
}

impl LocalSandbox {
    /// Cut a fresh worktree on `options.branch`.
    ///
    /// If anything fails after the worktree exists, it is removed again before
    /// the error is returned.
    #[instrument(skip_all, fields(branch = %options.branch))]
    pub fn create(options: LocalSandboxOptions) -> Result<Self> {
        let source = Git::new(&options.source_repo);
        fs::create_dir_all(&options.worktree_parent).with_context(|| {
            format!("create worktree dir {}", options.worktree_parent.display())
        })?;
        let path = options.worktree_parent.join(&options.worktree_name);
        if path.exists() {
            return Err(anyhow!("worktree path {} already exists", path.display()));
        }

        source
            .worktree_add(&path, &options.branch, &options.start_point)
            .with_context(|| format!("create worktree for {}", options.branch))?;

        let root = match fs::canonicalize(&path) {
            Ok(root) => root,
            Err(err) => {
                cleanup_worktree(&source, &path, &options.branch);
                return Err(err).with_context(|| format!("resolve {}", path.display()));
            }
        };

        info!(root = %root.display(), "local sandbox ready");
        Ok(Self {
            source,
            root,
            branch: options.branch,
            author: options.author,
            default_output_limit: options.default_output_limit,
            torn_down: false,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(anyhow!("sandbox {} was torn down", self.root.display()));
        }
        Ok(())
    }
}

impl Sandbox for LocalSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip_all, fields(program = request.argv.first().map(String::as_str)))]
    fn exec(&mut self, request: &ExecRequest) -> Result<ExecOutput> {
        let cwd = confined_cwd(&self.root, request.cwd.as_deref())?;
        validate_env_keys(&request.env)?;
        self.ensure_live()?;
        if !cwd.is_dir() {
            return Err(anyhow!("working directory {} does not exist", cwd.display()));
        }
        assert_resolved_confined(&cwd, &self.root)?;

        let output = run_process(&ProcessRequest {
            argv: &request.argv,
            cwd: &cwd,
            env: &request.env,
            timeout: request.timeout,
            output_limit_bytes: request.max_output_bytes.unwrap_or(self.default_output_limit),
        })?;

        Ok(ExecOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration.as_millis() as u64,
            timed_out: output.timed_out,
        })
    }

    fn upload_files(&mut self, files: &[FileUpload]) -> Result<()> {
        let targets = confined_uploads(&self.root, files)?;
        self.ensure_live()?;
        for (path, _) in &targets {
            assert_resolved_confined(path, &self.root)?;
        }
        for (path, content) in targets {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
            debug!(path = %path.display(), "uploaded file");
        }
        Ok(())
    }

    fn snapshot(&mut self, message: &str) -> Result<String> {
        self.ensure_live()?;
        let git = Git::new(&self.root);
        let changes = git.status_porcelain().context("read worktree status")?;
        debug!(changed = changes.len(), "snapshotting worktree");
        let sha = git
            .commit_all_allow_empty(message, &self.author)
            .context("snapshot worktree")?;
        info!(sha = %sha, "snapshot committed");
        Ok(sha)
    }

    #[instrument(skip_all, fields(root = %self.root.display()))]
    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first_err = None;
        if let Err(err) = self.source.worktree_remove(&self.root) {
            warn!(err = %err, "failed to remove worktree");
            first_err.get_or_insert(err);
        }
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(err = %err, "failed to remove worktree directory");
                first_err.get_or_insert(anyhow!(err).context("remove worktree directory"));
            }
        }
        if let Err(err) = self.source.delete_branch(&self.branch) {
            warn!(err = %err, "failed to delete run branch");
            first_err.get_or_insert(err);
        }

        info!("local sandbox torn down");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn cleanup_worktree(source: &Git, path: &Path, branch: &str) {
    if let Err(err) = source.worktree_remove(path) {
        warn!(err = %err, "cleanup: failed to remove worktree");
    }
    if let Err(err) = source.delete_branch(branch) {
        warn!(err = %err, "cleanup: failed to delete branch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BoundaryError;
    use crate::test_support::TestRepo;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn sandbox(repo: &TestRepo, scratch: &Path, branch: &str) -> LocalSandbox {
        let mut options = LocalSandboxOptions::new(repo.path(), branch);
        options.worktree_parent = scratch.to_path_buf();
        LocalSandbox::create(options).expect("create sandbox")
    }

    #[test]
    fn creates_worktree_on_dedicated_branch() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/abc12345/demo");

        assert!(sb.root().join("README.md").exists());
        assert_eq!(
            Git::new(sb.root()).current_branch().expect("branch"),
            "harness/abc12345/demo"
        );
        sb.teardown().expect("teardown");
    }

    #[test]
    fn exec_runs_in_root_and_reports_failures_as_values() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/exec/demo");

        let out = sb
            .exec(&ExecRequest::new(["pwd"], Duration::from_secs(10)))
            .expect("exec");
        assert_eq!(out.stdout.trim(), sb.root().display().to_string());

        let out = sb
            .exec(&ExecRequest::new(["sh", "-c", "exit 7"], Duration::from_secs(10)))
            .expect("exec");
        assert_eq!(out.exit_code, 7);
        assert!(!out.success());
        sb.teardown().expect("teardown");
    }

    #[test]
    fn exec_rejects_escaping_cwd_and_bad_env_keys() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/guard/demo");

        let err = sb
            .exec(&ExecRequest::new(["pwd"], Duration::from_secs(10)).cwd(".."))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BoundaryError>(),
            Some(BoundaryError::PathEscape { .. })
        ));

        let mut env = BTreeMap::new();
        env.insert("BAD=KEY".to_string(), "x".to_string());
        let err = sb
            .exec(&ExecRequest::new(["pwd"], Duration::from_secs(10)).env(env))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BoundaryError>(),
            Some(BoundaryError::InvalidEnvKey(_))
        ));
        sb.teardown().expect("teardown");
    }

    #[test]
    fn exec_truncates_each_stream() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/trunc/demo");

        let out = sb
            .exec(
                &ExecRequest::new(
                    ["sh", "-c", "printf abcdef; printf uvwxyz >&2"],
                    Duration::from_secs(10),
                )
                .max_output_bytes(3),
            )
            .expect("exec");
        assert_eq!(out.stdout, "abc\n[truncated 3 bytes]");
        assert_eq!(out.stderr, "uvw\n[truncated 3 bytes]");
        sb.teardown().expect("teardown");
    }

    #[test]
    fn upload_creates_parents_and_rejects_escapes_before_writing() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/upload/demo");

        sb.upload_files(&[FileUpload::new("nested/dir/a.txt", "hello")])
            .expect("upload");
        assert_eq!(
            fs::read_to_string(sb.root().join("nested/dir/a.txt")).expect("read"),
            "hello"
        );

        let err = sb
            .upload_files(&[
                FileUpload::new("first.txt", "x"),
                FileUpload::new("../../outside.txt", "y"),
            ])
            .unwrap_err();
        assert!(err.downcast_ref::<BoundaryError>().is_some());
        assert!(!sb.root().join("first.txt").exists());
        sb.teardown().expect("teardown");
    }

    #[cfg(unix)]
    #[test]
    fn upload_refuses_to_write_through_symlinks_leaving_the_root() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let outside = tempfile::tempdir().expect("outside");
        let mut sb = sandbox(&repo, scratch.path(), "harness/link/demo");
        std::os::unix::fs::symlink(outside.path(), sb.root().join("link")).expect("symlink");

        let err = sb
            .upload_files(&[FileUpload::new("link/x", "payload")])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BoundaryError>(),
            Some(BoundaryError::PathEscape { .. })
        ));
        assert!(!outside.path().join("x").exists());

        let err = sb
            .exec(&ExecRequest::new(["pwd"], Duration::from_secs(10)).cwd("link"))
            .unwrap_err();
        assert!(err.downcast_ref::<BoundaryError>().is_some());
        sb.teardown().expect("teardown");
    }

    #[cfg(unix)]
    #[test]
    fn exec_timeout_is_not_held_up_by_grandchildren() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/tree/demo");

        let started = std::time::Instant::now();
        let out = sb
            .exec(&ExecRequest::new(
                ["sh", "-c", "sleep 6; echo done"],
                Duration::from_millis(300),
            ))
            .expect("exec");
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 124);
        assert!(started.elapsed() < Duration::from_secs(3));
        sb.teardown().expect("teardown");
    }

    #[test]
    fn snapshot_succeeds_without_changes() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/snap/demo");

        let first = sb.snapshot("harness: empty snapshot").expect("snapshot");
        sb.upload_files(&[FileUpload::new("new.txt", "x")]).expect("upload");
        let second = sb.snapshot("harness: with change").expect("snapshot");
        assert_ne!(first, second);
        assert_eq!(first.len(), 40);
        sb.teardown().expect("teardown");
    }

    #[test]
    fn teardown_is_idempotent_and_removes_branch() {
        let repo = TestRepo::new().expect("repo");
        let scratch = tempfile::tempdir().expect("scratch");
        let mut sb = sandbox(&repo, scratch.path(), "harness/down/demo");
        let root = sb.root().to_path_buf();

        sb.teardown().expect("first teardown");
        sb.teardown().expect("second teardown");
        assert!(!root.exists());
        assert!(
            !Git::new(repo.path())
                .branch_exists("harness/down/demo")
                .expect("branch check")
        );
        assert!(sb.exec(&ExecRequest::new(["pwd"], Duration::from_secs(1))).is_err());
    }
}

//! Git adapter used by the local sandbox backend.
//!
//! A small, explicit wrapper around `git` subprocess calls. Everything goes
//! through an argument vector; nothing is shell-interpreted.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Identity used for harness-authored commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD"));
        }
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create a linked worktree at `path` on a new `branch` starting from `start_point`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        debug!("adding worktree");
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "-b", branch, &path_arg, start_point])?;
        Ok(())
    }

    /// Remove a linked worktree. A worktree git no longer knows about is not an error.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        let output = self.run(&["worktree", "remove", "--force", &path_arg])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!("worktree already gone");
            self.run(&["worktree", "prune"])?;
            return Ok(());
        }
        Err(anyhow!("git worktree remove failed: {}", stderr.trim()))
    }

    /// Force-delete a local branch. A missing branch is not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let output = self.run(&["branch", "-D", branch])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!(branch, "branch already gone");
            return Ok(());
        }
        Err(anyhow!("git branch -D {branch} failed: {}", stderr.trim()))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Stage everything and commit, even when nothing changed. Returns the new HEAD.
    #[instrument(skip_all)]
    pub fn commit_all_allow_empty(&self, message: &str, author: &CommitAuthor) -> Result<String> {
        self.add_all()?;
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        self.run_checked(&[
            "-c",
            &name,
            "-c",
            &email,
            "commit",
            "--allow-empty",
            "--no-verify",
            "-m",
            message,
        ])?;
        self.head_sha()
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .stdin(std::process::Stdio::null())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("is not a working tree") || lower.contains("no such")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

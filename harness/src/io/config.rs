//! Harness configuration stored under `.harness/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::env::validate_env_key;
use crate::core::truncate::DEFAULT_MAX_OUTPUT_BYTES;
use crate::io::git::CommitAuthor;

/// Default location, relative to the source repository.
pub const DEFAULT_CONFIG_PATH: &str = ".harness/config.toml";

/// Harness configuration (TOML).
///
/// Missing fields fall back to defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// First segment of every run branch (`<prefix>/<run-id>/<blueprint>`).
    pub branch_prefix: String,

    /// Timeout for nodes that do not declare their own, in seconds.
    pub default_timeout_secs: u64,

    /// Per-stream cap on captured command output.
    pub exec_output_limit_bytes: usize,

    /// Per-stream cap for agent invocations, which routinely exceed the exec cap.
    pub agent_output_limit_bytes: usize,

    /// Where local worktrees are created. Defaults to the system temp dir.
    pub worktree_dir: Option<PathBuf>,

    pub snapshot_author: AuthorConfig,

    pub remote: RemoteConfig,

    /// Agent CLIs available to delegated nodes, keyed by agent name.
    pub agents: BTreeMap<String, AgentCommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthorConfig {
    pub name: String,
    pub email: String,
}

impl Default for AuthorConfig {
    fn default() -> Self {
        Self {
            name: "harness".to_string(),
            email: "harness@local.invalid".to_string(),
        }
    }
}

impl From<&AuthorConfig> for CommitAuthor {
    fn from(value: &AuthorConfig) -> Self {
        CommitAuthor {
            name: value.name.clone(),
            email: value.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the sandbox control plane API.
    pub api_url: String,
    /// Env var holding the control plane bearer token.
    pub api_token_env: String,
    /// Container image used for new sandboxes.
    pub base_image: String,
    /// Sandbox root inside the container.
    pub workdir: PathBuf,
    /// Clone URL of the target repository.
    pub repo_url: String,
    /// Timeout for each bootstrap command (clone, checkout), in seconds.
    pub bootstrap_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8700".to_string(),
            api_token_env: "HARNESS_SANDBOX_TOKEN".to_string(),
            base_image: "harness-base:latest".to_string(),
            workdir: PathBuf::from("/workspace/repo"),
            repo_url: String::new(),
            bootstrap_timeout_secs: 10 * 60,
        }
    }
}

/// How to launch one agent CLI.
///
/// Each `argv` element is a template; `{{ prompt }}`, `{{ tools }}` and
/// `{{ agent }}` are available.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCommandConfig {
    pub argv: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Extra env for the agent process, merged over the run environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "harness".to_string(),
            default_timeout_secs: 10 * 60,
            exec_output_limit_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            agent_output_limit_bytes: 1_000_000,
            worktree_dir: None,
            snapshot_author: AuthorConfig::default(),
            remote: RemoteConfig::default(),
            agents: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        let prefix = self.branch_prefix.trim();
        if prefix.is_empty() || prefix.contains(char::is_whitespace) || prefix.contains("..") {
            return Err(anyhow!("branch_prefix must be a non-empty ref segment"));
        }
        if self.default_timeout_secs == 0 {
            return Err(anyhow!("default_timeout_secs must be > 0"));
        }
        if self.exec_output_limit_bytes == 0 {
            return Err(anyhow!("exec_output_limit_bytes must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if !self.remote.workdir.is_absolute() {
            return Err(anyhow!("remote.workdir must be an absolute path"));
        }
        if self.remote.bootstrap_timeout_secs == 0 {
            return Err(anyhow!("remote.bootstrap_timeout_secs must be > 0"));
        }
        validate_env_key(&self.remote.api_token_env)
            .context("remote.api_token_env")?;
        for (name, agent) in &self.agents {
            if agent.argv.is_empty() || agent.argv[0].trim().is_empty() {
                return Err(anyhow!("agents.{name}.argv must be a non-empty array"));
            }
            if agent.timeout_secs == Some(0) {
                return Err(anyhow!("agents.{name}.timeout_secs must be > 0"));
            }
            for key in agent.env.keys() {
                validate_env_key(key).with_context(|| format!("agents.{name}.env"))?;
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.exec_output_limit_bytes, 50 * 1024);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".harness/config.toml");
        let mut cfg = HarnessConfig::default();
        cfg.agents.insert(
            "codex".to_string(),
            AgentCommandConfig {
                argv: vec!["codex".to_string(), "exec".to_string(), "{{ prompt }}".to_string()],
                timeout_secs: Some(900),
                env: BTreeMap::new(),
            },
        );
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "branch_prefix = \"bots\"\n[remote]\nbase_image = \"img:1\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.branch_prefix, "bots");
        assert_eq!(cfg.remote.base_image, "img:1");
        assert_eq!(cfg.remote.workdir, PathBuf::from("/workspace/repo"));
    }

    #[test]
    fn rejects_bad_agent_env_keys() {
        let mut cfg = HarnessConfig::default();
        let mut env = BTreeMap::new();
        env.insert("BAD KEY".to_string(), "x".to_string());
        cfg.agents.insert(
            "a".to_string(),
            AgentCommandConfig {
                argv: vec!["a".to_string()],
                timeout_secs: None,
                env,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("invalid environment key"));
    }
}

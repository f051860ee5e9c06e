//! Per-run mutable state threaded through every node.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::NodeResult;

/// Attempt to record a second result under an existing name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("result for node {0:?} already recorded")]
pub struct DuplicateResult(pub String);

/// Single-owner record of one blueprint run.
///
/// Results are append-only: a name, once written, is never overwritten.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Eight lowercase hex characters.
    pub run_id: String,
    pub workdir: PathBuf,
    pub intent: String,
    /// Source repository reference (path or URL).
    pub repo: String,
    pub push_enabled: bool,
    pub env: BTreeMap<String, String>,
    /// Error text of the most recent failing validation step, for repair prompts.
    pub validation_failure: Option<String>,
    results: Vec<(String, NodeResult)>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            workdir: workdir.into(),
            ..Self::default()
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_push(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }

    /// Record `result` under `name`. Fails if the name is already taken.
    pub fn record(&mut self, name: &str, result: NodeResult) -> Result<(), DuplicateResult> {
        if self.result(name).is_some() {
            return Err(DuplicateResult(name.to_string()));
        }
        self.results.push((name.to_string(), result));
        Ok(())
    }

    pub fn result(&self, name: &str) -> Option<&NodeResult> {
        self.results
            .iter()
            .find(|(recorded, _)| recorded == name)
            .map(|(_, result)| result)
    }

    /// Results in recording order.
    pub fn results(&self) -> impl Iterator<Item = (&str, &NodeResult)> {
        self.results.iter().map(|(name, result)| (name.as_str(), result))
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }
}

/// Fresh run id: four random bytes, hex encoded.
pub fn generate_run_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

pub fn is_valid_run_id(run_id: &str) -> bool {
    run_id.len() == 8
        && run_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Lowercase, alphanumeric runs joined by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "blueprint".to_string()
    } else {
        slug
    }
}

/// `<prefix>/<run_id>/<blueprint_slug>`.
pub fn run_branch(prefix: &str, run_id: &str, blueprint_name: &str) -> String {
    format!(
        "{}/{}/{}",
        prefix.trim_matches('/'),
        run_id,
        slugify(blueprint_name)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn record_rejects_overwrite_and_keeps_first() {
        let mut ctx = RunContext::new("deadbeef", "/tmp/x");
        ctx.record("build", NodeResult::success("one", Duration::ZERO))
            .expect("first");
        let err = ctx
            .record("build", NodeResult::success("two", Duration::ZERO))
            .unwrap_err();
        assert_eq!(err, DuplicateResult("build".to_string()));
        assert_eq!(ctx.result("build").map(|r| r.output.as_str()), Some("one"));
        assert_eq!(ctx.result_count(), 1);
    }

    #[test]
    fn results_keep_recording_order() {
        let mut ctx = RunContext::new("deadbeef", "/tmp/x");
        for name in ["b", "a", "c"] {
            ctx.record(name, NodeResult::skipped()).expect("record");
        }
        let names: Vec<&str> = ctx.results().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn generated_run_ids_are_eight_lowercase_hex() {
        for _ in 0..32 {
            let id = generate_run_id();
            assert!(is_valid_run_id(&id), "bad id {id}");
        }
        assert!(!is_valid_run_id("DEADBEEF"));
        assert!(!is_valid_run_id("deadbee"));
    }

    #[test]
    fn branch_uses_slugged_blueprint_name() {
        assert_eq!(run_branch("harness", "deadbeef", "demo"), "harness/deadbeef/demo");
        assert_eq!(
            run_branch("harness/", "deadbeef", "Fix  Lint: CI!"),
            "harness/deadbeef/fix-lint-ci"
        );
        assert_eq!(slugify("--"), "blueprint");
    }
}

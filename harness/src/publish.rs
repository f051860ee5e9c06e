//! Publishing a finished run: push the run branch, then ask for a review.
//!
//! Publishing never raises. Every outcome lands in a [`PushResult`]:
//! token missing, push failed, pushed but review request failed, or both
//! succeeded.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::redact::redact;
use crate::sandbox::Sandbox;

/// Outcome of [`publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub pushed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a review request needs to know about the pushed branch.
#[derive(Debug, Clone)]
pub struct ReviewRequest<'a> {
    pub branch: &'a str,
    pub base: &'a str,
    pub title: &'a str,
    pub body: &'a str,
}

/// Opens a review (pull request) for a pushed branch and returns its URL.
pub trait ReviewRequester {
    fn request_review(&self, request: &ReviewRequest<'_>, token: &str) -> Result<String>;
}

/// Push the sandbox's run branch and optionally request a review.
///
/// Without a `reviewer` a successful push is the whole job.
#[instrument(skip_all)]
pub fn publish(
    sandbox: &mut dyn Sandbox,
    token: Option<&str>,
    reviewer: Option<&dyn ReviewRequester>,
    title: &str,
    body: &str,
) -> PushResult {
    let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
        warn!("push token missing, skipping publish");
        return failed(false, "push token missing");
    };
    let mut secrets = BTreeMap::new();
    secrets.insert("PUSH_TOKEN".to_string(), token.to_string());

    let Some(vcs) = sandbox.vcs() else {
        warn!("sandbox backend cannot push");
        return failed(false, "sandbox backend does not support push");
    };

    if let Err(err) = vcs.push_branch(token) {
        let message = redact(&format!("push failed: {err:#}"), &secrets);
        warn!(error = %message, "push failed");
        return failed(false, message);
    }
    let branch = vcs.branch().to_string();
    info!(branch = %branch, "pushed run branch");

    let Some(reviewer) = reviewer else {
        return PushResult {
            pushed: true,
            ..PushResult::default()
        };
    };

    let base = match vcs.default_branch() {
        Ok(base) => base,
        Err(err) => {
            let message = redact(&format!("resolve default branch: {err:#}"), &secrets);
            warn!(error = %message, "review request skipped");
            return failed(true, message);
        }
    };
    let request = ReviewRequest {
        branch: &branch,
        base: &base,
        title,
        body,
    };
    match reviewer.request_review(&request, token) {
        Ok(url) => {
            info!(url = %url, "review requested");
            PushResult {
                pushed: true,
                pr_url: Some(url),
                error: None,
            }
        }
        Err(err) => {
            let message = redact(&format!("review request failed: {err:#}"), &secrets);
            warn!(error = %message, "review request failed");
            failed(true, message)
        }
    }
}

fn failed(pushed: bool, error: impl Into<String>) -> PushResult {
    PushResult {
        pushed,
        pr_url: None,
        error: Some(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use anyhow::anyhow;

    use super::*;
    use crate::test_support::{NullSandbox, ScriptedVcs};

    struct Reviewer {
        reply: Result<String, String>,
        seen: RefCell<Vec<(String, String)>>,
    }

    impl ReviewRequester for Reviewer {
        fn request_review(&self, request: &ReviewRequest<'_>, _token: &str) -> Result<String> {
            self.seen
                .borrow_mut()
                .push((request.branch.to_string(), request.base.to_string()));
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    fn reviewer(reply: Result<&str, &str>) -> Reviewer {
        Reviewer {
            reply: reply.map(str::to_string).map_err(str::to_string),
            seen: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn missing_token_is_first_state() {
        let mut sandbox = NullSandbox::with_vcs(ScriptedVcs::new("harness/x/demo"));
        let result = publish(&mut sandbox, Some("  "), None, "t", "b");
        assert_eq!(result, failed(false, "push token missing"));
        assert!(sandbox.vcs_state().expect("vcs").pushes.is_empty());
    }

    #[test]
    fn unsupported_backend_reports_not_pushed() {
        let mut sandbox = NullSandbox::default();
        let result = publish(&mut sandbox, Some("ghp_0123456789"), None, "t", "b");
        assert!(!result.pushed);
        assert!(result.error.expect("error").contains("does not support push"));
    }

    #[test]
    fn push_failure_is_captured_and_redacted() {
        let mut vcs = ScriptedVcs::new("harness/x/demo");
        vcs.push_error = Some("remote rejected ghp_0123456789".to_string());
        let mut sandbox = NullSandbox::with_vcs(vcs);
        let result = publish(&mut sandbox, Some("ghp_0123456789"), None, "t", "b");
        assert!(!result.pushed);
        let error = result.error.expect("error");
        assert!(error.contains("[REDACTED:PUSH_TOKEN]"), "{error}");
        assert!(!error.contains("ghp_0123456789"));
    }

    #[test]
    fn pushed_but_review_failed() {
        let mut sandbox = NullSandbox::with_vcs(ScriptedVcs::new("harness/x/demo"));
        let reviewer = reviewer(Err("422 unprocessable"));
        let result = publish(&mut sandbox, Some("ghp_0123456789"), Some(&reviewer), "t", "b");
        assert!(result.pushed);
        assert_eq!(result.pr_url, None);
        assert!(result.error.expect("error").contains("422"));
    }

    #[test]
    fn pushed_and_reviewed() {
        let mut sandbox = NullSandbox::with_vcs(ScriptedVcs::new("harness/x/demo"));
        let reviewer = reviewer(Ok("https://example.test/pr/1"));
        let result = publish(&mut sandbox, Some("ghp_0123456789"), Some(&reviewer), "t", "b");
        assert_eq!(
            result,
            PushResult {
                pushed: true,
                pr_url: Some("https://example.test/pr/1".to_string()),
                error: None,
            }
        );
        assert_eq!(
            reviewer.seen.borrow().as_slice(),
            &[("harness/x/demo".to_string(), "main".to_string())]
        );
        assert_eq!(
            sandbox.vcs_state().expect("vcs").pushes,
            vec!["ghp_0123456789".to_string()]
        );
    }
}

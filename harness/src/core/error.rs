//! Boundary violations.
//!
//! These indicate a caller bug or an attempted sandbox escape, never a task
//! outcome, so they travel as errors instead of failed `NodeResult`s. They are
//! typed so callers can `downcast_ref` them out of an `anyhow::Error`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundaryError {
    /// A path resolved outside the sandbox root.
    #[error("path {} escapes sandbox root {}", candidate.display(), root.display())]
    PathEscape { candidate: PathBuf, root: PathBuf },

    /// An environment variable name that is unsafe to serialize into a shell prefix.
    #[error("invalid environment key '{0}' (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidEnvKey(String),

    /// A command with no program.
    #[error("argument vector must not be empty")]
    EmptyArgv,
}

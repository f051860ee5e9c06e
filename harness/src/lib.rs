//! Blueprint harness: run short automation workflows inside an isolated sandbox.
//!
//! A blueprint is an ordered list of nodes mixing exact commands with
//! agent-driven steps. The crate is layered leaf to root:
//!
//! - **[`core`]**: Pure security primitives and result types (path confinement,
//!   argument quoting, env-key validation, redaction, truncation). No I/O.
//! - **[`io`]**: Side-effecting adapters (child processes, git, config, the
//!   remote control plane client, run reports).
//! - **[`sandbox`]**: The isolation contract and its local worktree and
//!   remote container backends. The only way a run touches files or spawns
//!   processes.
//! - **[`blueprint`]**, **[`engine`]**: The node model and the sequential
//!   executor with its retry-with-repair loop and ordered lifecycle events.
//!
//! [`run`] ties these together for one run, [`publish`] pushes the result.

pub mod agent;
pub mod blueprint;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod publish;
pub mod run;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

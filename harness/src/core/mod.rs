//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. The security primitives here
//! are the boundary every sandbox backend routes through: path confinement,
//! argument quoting, environment-key validation, redaction and truncation.

pub mod confine;
pub mod env;
pub mod error;
pub mod redact;
pub mod shell;
pub mod truncate;
pub mod types;

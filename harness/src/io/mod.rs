//! I/O adapters: child processes, git, configuration, the remote control plane
//! and run reports.

pub mod config;
pub mod control_plane;
pub mod git;
pub mod process;
pub mod report;

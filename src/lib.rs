//! toolgate: run and tool orchestration core.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) and the `toolgate` binary can access them.

pub mod cli;
pub mod config;
pub mod error;
pub mod logs;
pub mod orchestrator;
pub mod run;
pub mod tools;
pub mod trigger;

/// Return the toolgate home directory.
///
/// Resolution order:
/// 1. `TOOLGATE_HOME` environment variable
/// 2. `$HOME/.toolgate`
pub fn toolgate_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("TOOLGATE_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".toolgate")
    }
}

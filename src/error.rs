//! Crate-wide error types.
//!
//! Each fallible component gets its own `thiserror` enum carrying enough
//! context to log usefully (§7.1); `VmError` is the single `From`
//! conversion chain the binary entry point matches on to pick an exit code.

use thiserror::Error;

use crate::config::ConfigError;
use crate::loader::LoadError;

/// Top-level error surfaced to `main`.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("image load error: {0}")]
    Load(#[from] LoadError),

    #[error("allocation failure: {0}")]
    Allocation(String),

    #[error("main process panicked: {0}")]
    MainPanic(String),
}

/// Exit codes documented in §6.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const MAIN_PANIC: i32 = 1;
    pub const LOAD_FAILURE: i32 = 2;
    pub const CONFIG_FAILURE: i32 = 3;
}

impl VmError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::Config(_) => exit_code::CONFIG_FAILURE,
            VmError::Load(_) => exit_code::LOAD_FAILURE,
            VmError::Allocation(_) => exit_code::MAIN_PANIC,
            VmError::MainPanic(_) => exit_code::MAIN_PANIC,
        }
    }
}

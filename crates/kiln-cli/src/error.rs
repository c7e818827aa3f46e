//! Process exit codes.
//!
//! - 0: success
//! - 64: configuration error
//! - 69: store unavailable (lock held or root unusable)
//! - 74: I/O error during startup scan

use std::process::ExitCode;

use kiln_core::ConfigError;
use kiln_store::StoreError;

/// Exit codes the daemon can terminate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CliExitCode {
    Success = 0,
    Config = 64,
    StoreUnavailable = 69,
    Io = 74,
}

impl From<CliExitCode> for ExitCode {
    fn from(code: CliExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

impl From<&ConfigError> for CliExitCode {
    fn from(_: &ConfigError) -> Self {
        CliExitCode::Config
    }
}

impl From<&StoreError> for CliExitCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::LockHeld { .. } | StoreError::Unavailable { .. } => {
                CliExitCode::StoreUnavailable
            }
            _ => CliExitCode::Io,
        }
    }
}

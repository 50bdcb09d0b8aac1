//! Error types for box setup and execution.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the box manager and box handles.
///
/// Failures of the program under test are never errors at this layer; they are
/// encoded in the returned [`RunResult`](crate::meta::RunResult).
#[derive(Debug, Error)]
pub enum BoxError {
    #[error("isolate binary not found at {0}")]
    IsolateMissing(PathBuf),

    #[error("failed to start isolate: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("isolate --init failed for box {id} (exit code {code:?}): {output}")]
    Init {
        id: u32,
        code: Option<i32>,
        output: String,
    },

    #[error("box {id} could not be initialized after {attempts} attempts")]
    InitAttemptsExhausted { id: u32, attempts: u32 },

    #[error("could not chown isolate binary to root: {0}")]
    Chown(String),

    #[error("isolate --cleanup failed for box {id} (exit code {code:?}): {output}")]
    Cleanup {
        id: u32,
        code: Option<i32>,
        output: String,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("path escapes the box root: {0}")]
    InvalidPath(String),

    #[error("command lookup failed for {program}: {reason}")]
    CommandLookup { program: String, reason: String },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BoxError {
    /// Setup errors are fatal for the box and are never retried.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::IsolateMissing(_)
                | Self::Init { .. }
                | Self::InitAttemptsExhausted { .. }
                | Self::Chown(_)
                | Self::Cleanup { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BoxError>;

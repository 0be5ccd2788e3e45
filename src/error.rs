//! Error types for the gpg wrapper.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WrapperError>;

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Process(Box<ProcessFailure>),

    #[error("Failed to copy GPG home entry {path}: {source}")]
    Clone {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gpg-agent failed to launch: {0}")]
    AgentSpawn(#[source] std::io::Error),

    #[error("{0}")]
    AgentLaunch(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WrapperError {
    /// The captured failure of a child that ran to completion, if this is one.
    #[must_use]
    pub fn as_process_failure(&self) -> Option<&ProcessFailure> {
        match self {
            Self::Process(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<ProcessFailure> for WrapperError {
    fn from(failure: ProcessFailure) -> Self {
        Self::Process(Box::new(failure))
    }
}

/// A gpg run that exited abnormally, with everything it wrote.
///
/// Exactly one of `code` and `signal` is set.
#[derive(Debug, Clone)]
pub struct ProcessFailure {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub message: String,
}

impl std::fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl ProcessFailure {
    #[must_use]
    pub fn killed_by_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// Lossy view of stderr for pattern matching.
    #[must_use]
    pub fn stderr_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

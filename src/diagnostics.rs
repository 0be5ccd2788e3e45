//! Append-only diagnostics log for `GIT_TRACE` sessions.
//!
//! The wrapper sits between git and gpg, so it must never write anything of
//! its own to stdout or stderr. Diagnostics go to `<scratch>/gpg-wrapper.log`
//! instead, and only when both `GIT_TRACE` and a scratch directory are set.
//!
//! Writing is DECORATIVE I/O: a log that cannot be opened or written is
//! silently dropped rather than failing the gpg operation.

use crate::config::WrapperConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

const MESSAGE_PREFIX: &str = "gpg-wrapper: ";

/// Shared handle to the diagnostics log.
///
/// Cloning is cheap; every clone writes to the same file. The file is
/// created on the first write, never before.
#[derive(Clone)]
pub struct Diagnostics {
    inner: Option<Arc<Sink>>,
}

struct Sink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

enum SinkState {
    Unopened,
    Open(BufWriter<File>),
    /// Opening failed or the log was closed; further writes are dropped.
    Closed,
}

impl Diagnostics {
    /// A sink that ignores every message.
    #[must_use]
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// A sink writing to `path` once something is logged.
    #[must_use]
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Some(Arc::new(Sink {
                path: path.into(),
                state: Mutex::new(SinkState::Unopened),
            })),
        }
    }

    #[must_use]
    pub fn from_config(config: &WrapperConfig) -> Self {
        match config.log_path() {
            Some(path) if config.diagnostics_enabled() => Self::to_file(path),
            _ => Self::disabled(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Log one prefixed line.
    pub async fn log(&self, message: impl AsRef<str>) {
        if self.inner.is_none() {
            return;
        }
        let line = format!("{MESSAGE_PREFIX}{}\n", message.as_ref());
        self.write(line.as_bytes()).await;
    }

    /// Mirror raw child output into the log.
    pub async fn raw(&self, bytes: &[u8]) {
        self.write(bytes).await;
    }

    /// Terminate the log with a newline and flush it to disk.
    ///
    /// Safe to call more than once and on a log that was never opened.
    pub async fn close(&self) {
        let Some(sink) = &self.inner else {
            return;
        };

        let mut state = sink.state.lock().await;
        if let SinkState::Open(writer) = &mut *state {
            let _ = writer.write_all(b"\n").await;
            let _ = writer.flush().await;
            let _ = writer.get_mut().sync_all().await;
        }
        *state = SinkState::Closed;
    }

    async fn write(&self, bytes: &[u8]) {
        let Some(sink) = &self.inner else {
            return;
        };

        let mut state = sink.state.lock().await;
        if let SinkState::Unopened = *state {
            *state = match File::create(&sink.path).await {
                Ok(file) => SinkState::Open(BufWriter::new(file)),
                Err(_) => SinkState::Closed,
            };
        }

        if let SinkState::Open(writer) = &mut *state {
            let _ = writer.write_all(bytes).await;
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(sink) => f.debug_tuple("Diagnostics").field(&sink.path).finish(),
            None => f.write_str("Diagnostics(disabled)"),
        }
    }
}

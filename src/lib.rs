//! Transparent gpg wrapper for editor-driven git commit signing
//!
//! git invokes this wrapper in place of gpg. It first runs the real gpg
//! exactly as git would have; when that fails because no pinentry can prompt
//! (the editor has no terminal), it retries against an isolated copy of the
//! GPG home served by a private gpg-agent whose pinentry is the editor's own.
//! git sees the same arguments, output and exit codes either way.

pub mod agent;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fallback;
pub mod home;
pub mod invoke;
pub mod resolver;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

// Re-export common types
pub use config::WrapperConfig;
pub use diagnostics::Diagnostics;
pub use error::{ProcessFailure, WrapperError};
pub use fallback::{FAILURE_EXIT_CODE, NativeFailure, Orchestrator};
pub use invoke::Relay;

use std::ffi::OsString;

/// Run the wrapper against the process's own stdin, stdout and stderr.
///
/// The diagnostics log is flushed before returning on every path.
pub async fn run(config: &WrapperConfig, args: &[OsString]) -> i32 {
    let diagnostics = Diagnostics::from_config(config);
    let mut relay = Relay::stdio();

    let code = Orchestrator::new(config, &diagnostics)
        .run(args, tokio::io::stdin(), &mut relay)
        .await;

    diagnostics.close().await;
    code
}

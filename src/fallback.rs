//! Native-then-isolated pinentry fallback
//!
//! 1. Resolve the gpg program and drain stdin concurrently.
//! 2. Run gpg against the caller's GPG home. Success ends the run.
//! 3. A failure that gpg clearly reported itself (signal, bad passphrase,
//!    user cancellation) is relayed to the caller as-is.
//! 4. Any other failure is taken to mean the native pinentry could not
//!    prompt: clone the GPG home, start an isolated agent wired to the
//!    editor's pinentry, and run gpg once more. That second result is final.

use crate::agent::{AgentEnv, find_agent_program, launch_agent};
use crate::config::WrapperConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{ProcessFailure, Result, WrapperError};
use crate::home::create_isolated_home;
use crate::invoke::{GpgInvoker, InvocationRequest, Relay};
use crate::resolver::GpgProgramResolver;
use regex::Regex;
use std::ffi::OsString;
use std::sync::LazyLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Exit code when no attempt produced one
pub const FAILURE_EXIT_CODE: i32 = 1;

static BAD_PASSPHRASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("Bad passphrase").expect("bad passphrase pattern is valid"));

static OPERATION_CANCELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("Operation cancelled").expect("cancellation pattern is valid")
});

/// How a failed native attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeFailure {
    KilledBySignal,
    BadPassphrase,
    CancelledByUser,
    /// Anything else; assumed to be a pinentry that could not prompt
    PinentryUnavailable,
}

impl NativeFailure {
    #[must_use]
    pub fn classify(failure: &ProcessFailure) -> Self {
        if failure.killed_by_signal() {
            return Self::KilledBySignal;
        }

        let stderr = failure.stderr_text();
        if BAD_PASSPHRASE.is_match(&stderr) {
            Self::BadPassphrase
        } else if OPERATION_CANCELLED.is_match(&stderr) {
            Self::CancelledByUser
        } else {
            Self::PinentryUnavailable
        }
    }

    /// Whether the isolated agent should be tried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        self == Self::PinentryUnavailable
    }
}

enum NativeOutcome {
    /// Final exit code; output has already been relayed
    Finished(i32),
    Retry,
}

pub struct Orchestrator<'a> {
    config: &'a WrapperConfig,
    diagnostics: &'a Diagnostics,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(config: &'a WrapperConfig, diagnostics: &'a Diagnostics) -> Self {
        Self {
            config,
            diagnostics,
        }
    }

    /// Run the whole fallback sequence and return the wrapper's exit code.
    ///
    /// Never fails: internal errors are logged and reported as
    /// [`FAILURE_EXIT_CODE`].
    pub async fn run<R, O, E>(
        &self,
        args: &[OsString],
        stdin: R,
        relay: &mut Relay<O, E>,
    ) -> i32
    where
        R: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        if let Ok(json) = serde_json::to_string(self.config) {
            self.diagnostics.log(format!("Configuration: {json}")).await;
        }

        match self.sign(args, stdin, relay).await {
            Ok(code) => code,
            Err(e) => {
                self.diagnostics
                    .log(format!("Failed with error:\n{e}"))
                    .await;
                FAILURE_EXIT_CODE
            }
        }
    }

    async fn sign<R, O, E>(
        &self,
        args: &[OsString],
        stdin: R,
        relay: &mut Relay<O, E>,
    ) -> Result<i32>
    where
        R: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let resolver = GpgProgramResolver::new(self.config, self.diagnostics);
        let (program, payload) = tokio::join!(resolver.resolve(), read_all(stdin));
        let payload = payload?;

        match self.try_native(&program, args, &payload, relay).await? {
            NativeOutcome::Finished(code) => Ok(code),
            NativeOutcome::Retry => self.try_isolated(&program, args, &payload, relay).await,
        }
    }

    async fn try_native<O, E>(
        &self,
        program: &str,
        args: &[OsString],
        payload: &[u8],
        relay: &mut Relay<O, E>,
    ) -> Result<NativeOutcome>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        self.diagnostics
            .log("Attempting to execute gpg with native pinentry.")
            .await;

        let env = AgentEnv::new();
        let request = InvocationRequest {
            program,
            args,
            home: &self.config.gnupg_home,
            env: &env,
            stdin: payload,
        };

        let failure = match GpgInvoker::new(self.config, self.diagnostics)
            .invoke(&request, relay)
            .await
        {
            Ok(code) => return Ok(NativeOutcome::Finished(code)),
            Err(WrapperError::Process(failure)) => failure,
            Err(e) => return Err(e),
        };

        let kind = NativeFailure::classify(&failure);
        if kind.is_retryable() {
            self.diagnostics
                .log("Native pinentry failed. This is ok.")
                .await;
            return Ok(NativeOutcome::Retry);
        }

        self.diagnostics
            .log(format!("Native gpg failed ({kind:?}); not retrying."))
            .await;
        relay.emit(&failure.stdout, &failure.stderr).await?;
        Ok(NativeOutcome::Finished(
            failure.code.unwrap_or(FAILURE_EXIT_CODE),
        ))
    }

    async fn try_isolated<O, E>(
        &self,
        program: &str,
        args: &[OsString],
        payload: &[u8],
        relay: &mut Relay<O, E>,
    ) -> Result<i32>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        self.diagnostics
            .log("Attempting to execute gpg with the editor pinentry.")
            .await;

        let home = create_isolated_home(self.config, self.diagnostics).await?;
        let agent = find_agent_program(self.config, program).await;
        let env = launch_agent(&agent, &home, self.config, self.diagnostics).await?;

        let request = InvocationRequest {
            program,
            args,
            home: &home,
            env: &env,
            stdin: payload,
        };

        GpgInvoker::new(self.config, self.diagnostics)
            .invoke(&request, relay)
            .await
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut stdin: R) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    stdin.read_to_end(&mut payload).await?;
    Ok(payload)
}

//! gpg execution
//!
//! Runs the real gpg with the wrapper's fixed non-interactive flags, replays
//! the captured stdin into it, and captures everything it writes. Output is
//! only forwarded to the caller once a run succeeds; failed runs hand their
//! output back inside [`ProcessFailure`] so the fallback logic can decide
//! whether the caller should ever see it.

use crate::agent::{AGENT_INFO_VAR, AgentEnv};
use crate::config::WrapperConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{ProcessFailure, Result, WrapperError};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Flags that keep gpg from ever trying to open a terminal
const GPG_BATCH_FLAGS: &[&str] = &["--batch", "--no-tty", "--yes"];

/// Read chunk size for child output
const CHUNK_SIZE: usize = 8192;

/// One gpg run. Built once per attempt and never modified.
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    pub program: &'a str,
    /// Caller-supplied arguments, appended after the fixed flags
    pub args: &'a [OsString],
    pub home: &'a Path,
    /// Only these variables (plus fallbacks) reach gpg
    pub env: &'a AgentEnv,
    pub stdin: &'a [u8],
}

/// Output of a gpg run that exited cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The wrapper's own stdout and stderr.
pub struct Relay<O, E> {
    stdout: O,
    stderr: E,
}

impl Relay<tokio::io::Stdout, tokio::io::Stderr> {
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdout(), tokio::io::stderr())
    }
}

impl<O, E> Relay<O, E>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    pub fn new(stdout: O, stderr: E) -> Self {
        Self { stdout, stderr }
    }

    /// Forward captured gpg output verbatim, stderr first.
    pub async fn emit(&mut self, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        self.stderr.write_all(stderr).await?;
        self.stderr.flush().await?;
        self.stdout.write_all(stdout).await?;
        self.stdout.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> (O, E) {
        (self.stdout, self.stderr)
    }
}

pub struct GpgInvoker<'a> {
    config: &'a WrapperConfig,
    diagnostics: &'a Diagnostics,
}

impl<'a> GpgInvoker<'a> {
    #[must_use]
    pub fn new(config: &'a WrapperConfig, diagnostics: &'a Diagnostics) -> Self {
        Self {
            config,
            diagnostics,
        }
    }

    /// Run gpg and, on success, forward its output through `relay`.
    ///
    /// # Returns
    /// * `Ok(i32)` - gpg's exit code (always 0 in practice)
    /// * `Err(WrapperError::Process)` - gpg failed; nothing was relayed
    /// * `Err(WrapperError::Spawn)` - gpg could not be started
    pub async fn invoke<O, E>(
        &self,
        request: &InvocationRequest<'_>,
        relay: &mut Relay<O, E>,
    ) -> Result<i32>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let run = self.run(request).await?;
        relay.emit(&run.stdout, &run.stderr).await?;
        Ok(run.code)
    }

    /// Run gpg to completion and classify how it ended.
    pub async fn run(&self, request: &InvocationRequest<'_>) -> Result<CompletedRun> {
        let mut args: Vec<OsString> = GPG_BATCH_FLAGS.iter().map(OsString::from).collect();
        args.push("--homedir".into());
        args.push(request.home.as_os_str().to_owned());
        args.extend(request.args.iter().cloned());

        let display_args: Vec<_> = args.iter().map(|a| a.to_string_lossy()).collect();
        self.diagnostics
            .log(format!(
                "Executing {} {}.",
                request.program,
                display_args.join(" ")
            ))
            .await;

        let mut child = tokio::process::Command::new(request.program)
            .args(&args)
            .env_clear()
            .envs(self.child_env(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| WrapperError::Spawn {
                program: request.program.to_string(),
                source,
            })?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(WrapperError::Io(std::io::Error::other(
                "gpg stdio was not captured",
            )));
        };

        let feed = async {
            let written = stdin.write_all(request.stdin).await;
            drop(stdin);
            written
        };

        let (fed, stdout, stderr) = tokio::join!(
            feed,
            self.capture(stdout),
            self.capture(stderr)
        );
        let status = child.wait().await?;

        // gpg may exit without reading all of stdin; its exit status decides
        if let Err(e) = fed {
            self.diagnostics
                .log(format!("Failed to write gpg stdin: {e}"))
                .await;
        }
        let (stdout, stderr) = (stdout?, stderr?);

        match classify_exit(status) {
            Ok(code) => {
                self.diagnostics.log("gpg process terminated normally.").await;
                Ok(CompletedRun {
                    code,
                    stdout,
                    stderr,
                })
            }
            Err((code, signal, message)) => {
                self.diagnostics.log(&message).await;
                Err(ProcessFailure {
                    code,
                    signal,
                    stdout,
                    stderr,
                    message,
                }
                .into())
            }
        }
    }

    /// Requested environment, plus caller fallbacks for `PATH`,
    /// `GPG_AGENT_INFO` and `GNUPGHOME`.
    fn child_env(&self, request: &InvocationRequest<'_>) -> BTreeMap<String, OsString> {
        let mut env: BTreeMap<String, OsString> = request
            .env
            .iter()
            .map(|(key, value)| (key.clone(), OsString::from(value)))
            .collect();

        let unset = |env: &BTreeMap<String, OsString>, key: &str| {
            env.get(key).is_none_or(|value| value.is_empty())
        };

        if unset(&env, "PATH")
            && let Some(path) = &self.config.caller_path
        {
            env.insert("PATH".to_string(), path.clone());
        }
        if unset(&env, AGENT_INFO_VAR) {
            env.insert(
                AGENT_INFO_VAR.to_string(),
                self.config.caller_agent_info.clone().unwrap_or_default(),
            );
        }
        if unset(&env, "GNUPGHOME") {
            env.insert("GNUPGHOME".to_string(), request.home.as_os_str().to_owned());
        }

        env
    }

    /// Accumulate a child stream, mirroring each chunk into the diagnostics log.
    async fn capture(&self, mut stream: impl AsyncRead + Unpin) -> Result<Vec<u8>> {
        let mut captured = Vec::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let n = stream.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.diagnostics.raw(&buffer[..n]).await;
            captured.extend_from_slice(&buffer[..n]);
        }

        Ok(captured)
    }
}

/// Exit code on success, or `(code, signal, message)` for an abnormal exit.
///
/// A non-zero code takes priority over a signal.
fn classify_exit(
    status: ExitStatus,
) -> std::result::Result<i32, (Option<i32>, Option<i32>, String)> {
    if let Some(code) = status.code()
        && code != 0
    {
        return Err((
            Some(code),
            None,
            format!("gpg process exited abnormally with code {code}."),
        ));
    }

    if let Some(signal) = exit_signal(&status) {
        return Err((
            None,
            Some(signal),
            format!("gpg process terminated with signal {signal}."),
        ));
    }

    Ok(status.code().unwrap_or(0))
}

/// Signal that terminated a child, where the platform has them.
#[cfg(unix)]
pub(crate) fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;

    struct Fixture {
        bin: tempfile::TempDir,
        home: tempfile::TempDir,
        config: WrapperConfig,
        env: AgentEnv,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bin: tempfile::tempdir().expect("bin"),
                home: tempfile::tempdir().expect("home"),
                config: WrapperConfig {
                    caller_path: Some("/usr/bin:/bin".into()),
                    ..Default::default()
                },
                env: AgentEnv::new(),
            }
        }

        fn gpg(&self, body: &str) -> String {
            write_script(self.bin.path(), "gpg", body)
                .display()
                .to_string()
        }

        fn request<'a>(
            &'a self,
            program: &'a str,
            args: &'a [OsString],
            stdin: &'a [u8],
        ) -> InvocationRequest<'a> {
            InvocationRequest {
                program,
                args,
                home: self.home.path(),
                env: &self.env,
                stdin,
            }
        }
    }

    #[tokio::test]
    async fn success_relays_output_and_returns_code() {
        let fixture = Fixture::new();
        let gpg = fixture.gpg("cat\necho signed-notice >&2\n");
        let args = [OsString::from("-bsau"), OsString::from("ABC123")];

        let diagnostics = Diagnostics::disabled();
        let invoker = GpgInvoker::new(&fixture.config, &diagnostics);
        let mut relay = Relay::new(Vec::new(), Vec::new());

        let code = invoker
            .invoke(&fixture.request(&gpg, &args, b"commit payload"), &mut relay)
            .await
            .expect("invoke");

        let (stdout, stderr) = relay.into_inner();
        assert_eq!(code, 0);
        assert_eq!(stdout, b"commit payload");
        assert_eq!(stderr, b"signed-notice\n");
    }

    #[tokio::test]
    async fn fixed_flags_precede_caller_arguments() {
        let fixture = Fixture::new();
        let gpg = fixture.gpg("echo \"$@\"\n");
        let args = [OsString::from("--status-fd=2"), OsString::from("-bsau")];

        let diagnostics = Diagnostics::disabled();
        let run = GpgInvoker::new(&fixture.config, &diagnostics)
            .run(&fixture.request(&gpg, &args, b""))
            .await
            .expect("run");

        assert_eq!(
            String::from_utf8_lossy(&run.stdout),
            format!(
                "--batch --no-tty --yes --homedir {} --status-fd=2 -bsau\n",
                fixture.home.path().display()
            )
        );
    }

    #[tokio::test]
    async fn environment_falls_back_to_caller_values() {
        let mut fixture = Fixture::new();
        fixture.config.caller_agent_info = Some("/run/S.caller:1:1".into());
        let gpg = fixture.gpg("echo \"$PATH|$GPG_AGENT_INFO|$GNUPGHOME|$HOME\"\n");

        let diagnostics = Diagnostics::disabled();
        let run = GpgInvoker::new(&fixture.config, &diagnostics)
            .run(&fixture.request(&gpg, &[], b""))
            .await
            .expect("run");

        assert_eq!(
            String::from_utf8_lossy(&run.stdout),
            format!("/usr/bin:/bin|/run/S.caller:1:1|{}|\n", fixture.home.path().display())
        );
    }

    #[tokio::test]
    async fn overlay_takes_priority_over_fallbacks() {
        let mut fixture = Fixture::new();
        fixture.config.caller_agent_info = Some("/run/S.caller:1:1".into());
        fixture
            .env
            .insert(AGENT_INFO_VAR.to_string(), "/tmp/S.isolated:0:1".to_string());
        let gpg = fixture.gpg("echo \"$GPG_AGENT_INFO\"\n");

        let diagnostics = Diagnostics::disabled();
        let run = GpgInvoker::new(&fixture.config, &diagnostics)
            .run(&fixture.request(&gpg, &[], b""))
            .await
            .expect("run");

        assert_eq!(run.stdout, b"/tmp/S.isolated:0:1\n");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_output_and_relays_nothing() {
        let fixture = Fixture::new();
        let gpg =
            fixture.gpg("echo partial\necho 'gpg: signing failed: No pinentry' >&2\nexit 2\n");

        let diagnostics = Diagnostics::disabled();
        let mut relay = Relay::new(Vec::new(), Vec::new());
        let err = GpgInvoker::new(&fixture.config, &diagnostics)
            .invoke(&fixture.request(&gpg, &[], b""), &mut relay)
            .await
            .unwrap_err();

        let failure = err.as_process_failure().expect("process failure");
        assert_eq!(failure.code, Some(2));
        assert_eq!(failure.signal, None);
        assert_eq!(failure.stdout, b"partial\n");
        assert_eq!(failure.stderr_text(), "gpg: signing failed: No pinentry\n");

        let (stdout, stderr) = relay.into_inner();
        assert!(stdout.is_empty());
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn signal_death_is_a_failure() {
        let fixture = Fixture::new();
        let gpg = fixture.gpg("kill -KILL $$\n");

        let diagnostics = Diagnostics::disabled();
        let err = GpgInvoker::new(&fixture.config, &diagnostics)
            .run(&fixture.request(&gpg, &[], b""))
            .await
            .unwrap_err();

        let failure = err.as_process_failure().expect("process failure");
        assert_eq!(failure.code, None);
        assert_eq!(failure.signal, Some(9));
        assert!(failure.killed_by_signal());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let fixture = Fixture::new();

        let diagnostics = Diagnostics::disabled();
        let err = GpgInvoker::new(&fixture.config, &diagnostics)
            .run(&fixture.request("/nonexistent/gpg", &[], b"payload"))
            .await
            .unwrap_err();

        assert!(matches!(err, WrapperError::Spawn { .. }));
    }

    #[tokio::test]
    async fn output_is_mirrored_to_diagnostics() {
        let fixture = Fixture::new();
        let gpg = fixture.gpg("echo out-chunk\necho err-chunk >&2\n");
        let log = fixture.bin.path().join("wrapper.log");

        let diagnostics = Diagnostics::to_file(&log);
        GpgInvoker::new(&fixture.config, &diagnostics)
            .run(&fixture.request(&gpg, &[], b""))
            .await
            .expect("run");
        diagnostics.close().await;

        let contents = std::fs::read_to_string(&log).expect("log");
        assert!(contents.contains("gpg-wrapper: Executing"));
        assert!(contents.contains("out-chunk\n"));
        assert!(contents.contains("err-chunk\n"));
    }

    #[tokio::test]
    async fn early_exit_without_reading_stdin_is_not_an_error() {
        let fixture = Fixture::new();
        let gpg = fixture.gpg("exit 0\n");
        let payload = vec![b'x'; 1 << 20];

        let diagnostics = Diagnostics::disabled();
        let run = GpgInvoker::new(&fixture.config, &diagnostics)
            .run(&fixture.request(&gpg, &[], &payload))
            .await
            .expect("run");

        assert_eq!(run.code, 0);
    }
}

//! Isolated gpg-agent launch
//!
//! Starts `gpg-agent --daemon` against the isolated GPG home with the
//! editor's pinentry launcher, and reports the connection info it prints.
//! The launch resolves exactly once: a spawn error, or the daemonizing parent
//! exiting, whichever the child reports first. The backgrounded daemon may keep
//! the inherited pipes open indefinitely, so readiness never depends on EOF.

use crate::config::{GPG_AGENT_BINARY, WrapperConfig};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, WrapperError};
use crate::invoke::exit_signal;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Connection variable printed by pre-2.1 agents
pub const AGENT_INFO_VAR: &str = "GPG_AGENT_INFO";

/// How long stdout may stay open after the launching parent exited
const ANNOUNCEMENT_GRACE: Duration = Duration::from_millis(500);

static AGENT_INFO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"GPG_AGENT_INFO=([^;\s]+)").expect("agent info pattern is valid")
});

/// Environment needed to reach a running agent. Empty when the agent did not
/// announce itself (2.1+ agents use the socket in their home directory).
pub type AgentEnv = BTreeMap<String, String>;

/// Pick the gpg-agent binary to launch.
///
/// Prefers an explicit override, then an agent installed next to the gpg
/// program in use, then the first one on the caller's `PATH`.
pub async fn find_agent_program(config: &WrapperConfig, gpg_program: &str) -> PathBuf {
    if let Some(program) = &config.agent_program {
        return program.clone();
    }

    let agent_name = format!("{GPG_AGENT_BINARY}{}", std::env::consts::EXE_SUFFIX);

    let gpg = Path::new(gpg_program);
    if gpg.parent().is_some_and(|dir| !dir.as_os_str().is_empty()) {
        let sibling = gpg.with_file_name(&agent_name);
        if tokio::fs::metadata(&sibling)
            .await
            .is_ok_and(|meta| meta.is_file())
        {
            return sibling;
        }
    }

    if let Some(path) = &config.caller_path
        && let Ok(found) = which::which_in(
            GPG_AGENT_BINARY,
            Some(path),
            std::env::current_dir().unwrap_or_default(),
        )
    {
        return found;
    }

    PathBuf::from(GPG_AGENT_BINARY)
}

/// Launch an isolated gpg-agent bound to `home`.
///
/// The agent only sees `GNUPGHOME` and the passthrough variables from the
/// config; nothing else from the wrapper's environment is inherited.
///
/// # Errors
/// * `WrapperError::AgentSpawn` - the agent binary could not be started
/// * `WrapperError::AgentLaunch` - the agent exited non-zero or was killed
pub async fn launch_agent(
    program: &Path,
    home: &Path,
    config: &WrapperConfig,
    diagnostics: &Diagnostics,
) -> Result<AgentEnv> {
    diagnostics
        .log(format!("Starting an isolated GPG agent in {}.", home.display()))
        .await;

    let mut args = vec![
        "--daemon".into(),
        "--verbose".into(),
        "--homedir".into(),
        home.as_os_str().to_owned(),
    ];
    match &config.pinentry_launcher {
        Some(launcher) => {
            args.push("--pinentry-program".into());
            args.push(launcher.as_os_str().to_owned());
        }
        None => {
            diagnostics
                .log("No pinentry launcher configured; using the agent's default pinentry.")
                .await;
        }
    }

    let display_args: Vec<_> = args.iter().map(|a| a.to_string_lossy()).collect();
    diagnostics
        .log(format!(
            "Spawning {} with {}",
            program.display(),
            display_args.join(" ")
        ))
        .await;

    let child = tokio::process::Command::new(program)
        .args(&args)
        .env_clear()
        .env("GNUPGHOME", home)
        .envs(&config.agent_passthrough)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            diagnostics
                .log(format!("gpg-agent failed to launch: {e}"))
                .await;
            return Err(WrapperError::AgentSpawn(e));
        }
    };

    // The daemon inherits both pipes and may hold them for its whole life,
    // so readiness is the parent's exit, not EOF.
    let (tx, mut announcements) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, tx));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(mirror_output(stderr, diagnostics.clone()));
    }

    let status = child.wait().await?;

    if let Some(code) = status.code()
        && code != 0
    {
        return Err(WrapperError::AgentLaunch(format!(
            "gpg-agent exited with status {code}."
        )));
    }
    if let Some(signal) = exit_signal(&status) {
        return Err(WrapperError::AgentLaunch(format!(
            "gpg-agent was terminated with signal {signal}."
        )));
    }

    diagnostics.log("gpg-agent launched successfully.").await;

    let stdout = collect_announcement(&mut announcements).await;
    let env = parse_agent_env(&String::from_utf8_lossy(&stdout));
    if let Some(info) = env.get(AGENT_INFO_VAR) {
        diagnostics.log(format!("Acquired agent info {info}.")).await;
    }

    Ok(env)
}

/// Forward stdout chunks until EOF or until nobody is listening.
async fn forward_output<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(chunk[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Keep the agent's stderr drained into the log for as long as it is open.
async fn mirror_output<R: AsyncRead + Unpin>(mut reader: R, diagnostics: Diagnostics) {
    let mut chunk = [0u8; 1024];
    while let Ok(n) = reader.read(&mut chunk).await {
        if n == 0 {
            break;
        }
        diagnostics.raw(&chunk[..n]).await;
    }
}

/// Everything the agent printed on stdout, up to EOF or [`ANNOUNCEMENT_GRACE`]
/// after the parent exited, whichever comes first.
async fn collect_announcement(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    let deadline = Instant::now() + ANNOUNCEMENT_GRACE;
    let mut stdout = Vec::new();
    while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        stdout.extend_from_slice(&chunk);
    }
    stdout
}

/// Extract `GPG_AGENT_INFO` from the agent's `sh`-style output.
#[must_use]
pub fn parse_agent_env(stdout: &str) -> AgentEnv {
    AGENT_INFO_PATTERN
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|value| (AGENT_INFO_VAR.to_string(), value.as_str().to_string()))
        .into_iter()
        .collect()
}

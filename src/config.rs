//! Snapshot of everything the wrapper reads from its environment.
//!
//! The binary builds a [`WrapperConfig`] once with [`WrapperConfig::from_env`];
//! every other component receives it by reference, so tests can exercise the
//! deterministic-mode and diagnostics branches without touching the process
//! environment.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Program used when git has no `gpg.program` configured
pub const DEFAULT_GPG_PROGRAM: &str = "gpg";

/// Helper agent binary name
pub const GPG_AGENT_BINARY: &str = "gpg-agent";

/// Diagnostics log file name inside the scratch directory
pub const LOG_FILE_NAME: &str = "gpg-wrapper.log";

/// Prefix of every isolated GPG home created under the scratch directory
pub const ISOLATED_HOME_PREFIX: &str = "gpg-home";

/// Variables forwarded to the isolated gpg-agent (and from there to the pinentry launcher)
pub const AGENT_PASSTHROUGH_VARS: &[&str] = &[
    "PATH",
    "GIT_TRACE",
    "ATOM_GITHUB_TMP",
    "ATOM_GITHUB_ELECTRON_PATH",
    "ATOM_GITHUB_SOCK_PATH",
    "ATOM_GITHUB_PINENTRY_PATH",
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct WrapperConfig {
    /// git used for the non-system `gpg.program` query
    pub git_program: PathBuf,

    /// `GIT_EXEC_PATH` for a bundled git distribution
    pub git_exec_path: Option<PathBuf>,

    /// Scratch directory shared with the editor; `None` when unset or empty
    pub scratch_dir: Option<PathBuf>,

    /// Repository the `gpg.program` query runs in
    pub workdir: Option<PathBuf>,

    /// Executable handed to gpg-agent as `--pinentry-program`
    pub pinentry_launcher: Option<PathBuf>,

    /// Skip the `--system` git config lookup
    pub spec_mode: bool,

    /// Value of `GIT_TRACE`
    pub trace: String,

    /// `PATH` for the system git config lookup
    pub original_path: String,

    /// Explicit gpg-agent binary
    pub agent_program: Option<PathBuf>,

    /// The caller's real GPG home
    pub gnupg_home: PathBuf,

    #[serde(skip)]
    pub caller_path: Option<OsString>,

    #[serde(skip)]
    pub caller_agent_info: Option<OsString>,

    /// Subset of [`AGENT_PASSTHROUGH_VARS`] present in the environment
    #[serde(skip)]
    pub agent_passthrough: BTreeMap<String, OsString>,
}

impl WrapperConfig {
    /// Capture the wrapper's configuration from the current process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var_os(key).filter(|v| !v.is_empty());
        let var_string = |key: &str| std::env::var(key).unwrap_or_default();

        let (git_program, git_exec_path) = match var("ATOM_GITHUB_DUGITE_PATH") {
            Some(dugite) => bundled_git(Path::new(&dugite)),
            None => (PathBuf::from("git"), None),
        };

        let gnupg_home = var("GNUPGHOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".gnupg"));

        let agent_passthrough = AGENT_PASSTHROUGH_VARS
            .iter()
            .filter_map(|key| std::env::var_os(key).map(|v| ((*key).to_string(), v)))
            .collect();

        Self {
            git_program,
            git_exec_path,
            scratch_dir: var("ATOM_GITHUB_TMP").map(PathBuf::from),
            workdir: var("ATOM_GITHUB_WORKDIR_PATH").map(PathBuf::from),
            pinentry_launcher: var("ATOM_GITHUB_PINENTRY_LAUNCHER").map(PathBuf::from),
            spec_mode: var_string("ATOM_GITHUB_SPEC_MODE") == "true",
            trace: var_string("GIT_TRACE"),
            original_path: var_string("ATOM_GITHUB_ORIGINAL_PATH"),
            agent_program: var("ATOM_GITHUB_GPG_AGENT_PATH").map(PathBuf::from),
            gnupg_home,
            caller_path: std::env::var_os("PATH"),
            caller_agent_info: std::env::var_os("GPG_AGENT_INFO"),
            agent_passthrough,
        }
    }

    /// Diagnostics need both a trace flag and somewhere to write.
    #[must_use]
    pub fn diagnostics_enabled(&self) -> bool {
        !self.trace.is_empty() && self.scratch_dir.is_some()
    }

    #[must_use]
    pub fn log_path(&self) -> Option<PathBuf> {
        self.scratch_dir.as_ref().map(|dir| dir.join(LOG_FILE_NAME))
    }

    /// Directory the isolated GPG home is created in.
    #[must_use]
    pub fn isolated_home_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Locate git inside a dugite-style bundled distribution.
fn bundled_git(dugite: &Path) -> (PathBuf, Option<PathBuf>) {
    let root = dugite.join("git");

    let program = if cfg!(windows) {
        root.join("cmd").join("git.exe")
    } else {
        root.join("bin").join("git")
    };

    let exec_path = if cfg!(windows) {
        root.join("mingw64").join("libexec").join("git-core")
    } else {
        root.join("libexec").join("git-core")
    };

    (program, Some(exec_path))
}

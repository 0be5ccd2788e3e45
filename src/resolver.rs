//! Discover the real gpg program that git is configured to use.
//!
//! Lookup order:
//! 1. `git config gpg.program` in the working directory (bundled git)
//! 2. `git config --system gpg.program` with the caller's original `PATH`
//!    (skipped under `ATOM_GITHUB_SPEC_MODE` so results do not depend on the host)
//! 3. [`DEFAULT_GPG_PROGRAM`]
//!
//! Query failures are treated as "not configured"; resolution never fails.

use crate::config::{DEFAULT_GPG_PROGRAM, WrapperConfig};
use crate::diagnostics::Diagnostics;

const GPG_PROGRAM_KEY: &str = "gpg.program";

/// Cleared for every query so `git -c` overrides injected by the caller
/// cannot redirect the lookup.
const CONFIG_PARAMETERS_VAR: &str = "GIT_CONFIG_PARAMETERS";

pub struct GpgProgramResolver<'a> {
    config: &'a WrapperConfig,
    diagnostics: &'a Diagnostics,
}

impl<'a> GpgProgramResolver<'a> {
    #[must_use]
    pub fn new(config: &'a WrapperConfig, diagnostics: &'a Diagnostics) -> Self {
        Self {
            config,
            diagnostics,
        }
    }

    pub async fn resolve(&self) -> String {
        if let Some(program) = self.configured_program().await {
            self.diagnostics
                .log(format!(
                    "Discovered gpg program {program} from non-system git configuration."
                ))
                .await;
            return program;
        }

        if let Some(program) = self.system_program().await {
            self.diagnostics
                .log(format!(
                    "Discovered gpg program {program} from system git configuration."
                ))
                .await;
            return program;
        }

        self.diagnostics.log("Using default gpg program.").await;
        DEFAULT_GPG_PROGRAM.to_string()
    }

    async fn configured_program(&self) -> Option<String> {
        let mut command = tokio::process::Command::new(&self.config.git_program);
        command
            .args(["config", GPG_PROGRAM_KEY])
            .env(CONFIG_PARAMETERS_VAR, "");

        if let Some(exec_path) = &self.config.git_exec_path {
            command.env("GIT_EXEC_PATH", exec_path);
        }
        if let Some(workdir) = &self.config.workdir {
            command.current_dir(workdir);
        }

        query(command).await
    }

    async fn system_program(&self) -> Option<String> {
        if self.config.spec_mode {
            return None;
        }

        let mut command = tokio::process::Command::new("git");
        command
            .args(["config", "--system", GPG_PROGRAM_KEY])
            .env_clear()
            .env(CONFIG_PARAMETERS_VAR, "")
            .env("PATH", &self.config.original_path);

        query(command).await
    }
}

/// Run a config query and return its trimmed stdout, if any.
///
/// `git config` exits 1 for an unset key; stdout is consulted regardless of
/// the exit status.
async fn query(mut command: tokio::process::Command) -> Option<String> {
    let output = command
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .ok()?;

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

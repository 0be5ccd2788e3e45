use clap::Parser;
use std::ffi::OsString;
use std::process::ExitCode;

use kodegen_gpg_wrapper::{FAILURE_EXIT_CODE, WrapperConfig};

// ============================================================================
// OUTPUT STRATEGY
// ============================================================================
//
// git reads gpg's stdout (the signature) and stderr (status lines) directly,
// so this binary never prints anything of its own. Everything it has to say
// goes to the GIT_TRACE diagnostics log; the caller only ever sees gpg's
// output and an exit code.
// ============================================================================

/// Every argument belongs to gpg, including `--help` and `--version`.
#[derive(Parser)]
#[command(name = "gpg-wrapper")]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Arguments forwarded verbatim to gpg
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    gpg_args: Vec<OsString>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = WrapperConfig::from_env();

    let code = kodegen_gpg_wrapper::run(&config, &cli.gpg_args).await;

    ExitCode::from(u8::try_from(code).unwrap_or(FAILURE_EXIT_CODE as u8))
}

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kodegen_gpg_wrapper::WrapperConfig;

/// Write an executable `/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}

/// Stand-in git, gpg and gpg-agent plus a GPG home and scratch directory.
///
/// Every gpg run appends its `GNUPGHOME` to `gpg-runs`; every agent launch
/// appends its `--homedir` to `agent-runs`.
pub struct Sandbox {
    pub bin: tempfile::TempDir,
    pub scratch: tempfile::TempDir,
    pub gnupg_home: tempfile::TempDir,
    pub config: WrapperConfig,
}

impl Sandbox {
    /// `gpg_body` runs after the run has been recorded.
    pub fn new(gpg_body: &str) -> Self {
        Self::with_agent(
            gpg_body,
            "echo 'GPG_AGENT_INFO=/tmp/S.1234:0:1; export GPG_AGENT_INFO;'\n",
        )
    }

    pub fn with_agent(gpg_body: &str, agent_body: &str) -> Self {
        let bin = tempfile::tempdir().expect("bin");
        let scratch = tempfile::tempdir().expect("scratch");
        let gnupg_home = tempfile::tempdir().expect("gnupg home");

        std::fs::write(gnupg_home.path().join("pubring.kbx"), "keyring").expect("keyring");
        std::fs::create_dir(gnupg_home.path().join("private-keys-v1.d")).expect("keys dir");
        std::fs::write(
            gnupg_home.path().join("private-keys-v1.d").join("ABC123.key"),
            "secret",
        )
        .expect("key");

        let gpg = write_script(
            bin.path(),
            "gpg",
            &format!(
                "echo \"$GNUPGHOME\" >> {runs}\n{gpg_body}",
                runs = bin.path().join("gpg-runs").display()
            ),
        );
        write_script(bin.path(), "git", &format!("echo {}\n", gpg.display()));
        let agent = write_script(
            bin.path(),
            "gpg-agent",
            &format!(
                "echo \"$4\" >> {runs}\n{agent_body}",
                runs = bin.path().join("agent-runs").display()
            ),
        );

        let config = WrapperConfig {
            git_program: bin.path().join("git"),
            scratch_dir: Some(scratch.path().to_path_buf()),
            pinentry_launcher: Some(bin.path().join("pinentry.sh")),
            spec_mode: true,
            agent_program: Some(agent),
            gnupg_home: gnupg_home.path().to_path_buf(),
            caller_path: Some("/usr/bin:/bin".into()),
            ..Default::default()
        };

        Self {
            bin,
            scratch,
            gnupg_home,
            config,
        }
    }

    pub fn gpg_runs(&self) -> Vec<String> {
        read_lines(&self.bin.path().join("gpg-runs"))
    }

    pub fn agent_runs(&self) -> Vec<String> {
        read_lines(&self.bin.path().join("agent-runs"))
    }

    /// Isolated homes created under the scratch directory.
    pub fn isolated_homes(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.scratch.path())
            .expect("read scratch")
            .map(|entry| entry.expect("entry").path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("gpg-home-"))
            })
            .collect()
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|contents| contents.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

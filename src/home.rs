//! Isolated GPG home management
//!
//! The fallback path never touches the caller's real GPG home. Instead it
//! copies the whole tree into a private directory under the scratch root and
//! points the isolated gpg-agent and gpg at the copy.

use crate::config::{ISOLATED_HOME_PREFIX, WrapperConfig};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, WrapperError};
use rand::distr::{Alphanumeric, SampleString};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::task::JoinSet;

/// Owner-only mode for every directory the clone creates
#[cfg(unix)]
const PRIVATE_DIR_MODE: u32 = 0o700;

/// Create a fresh isolated GPG home populated from the caller's GPG home.
///
/// The directory name is randomized so a home left behind by an earlier run
/// is never reused. The copy is not removed when the wrapper exits; the
/// isolated gpg-agent keeps running against it.
pub async fn create_isolated_home(
    config: &WrapperConfig,
    diagnostics: &Diagnostics,
) -> Result<PathBuf> {
    let name = format!(
        "{ISOLATED_HOME_PREFIX}-{}",
        Alphanumeric.sample_string(&mut rand::rng(), 16)
    );
    let home = config.isolated_home_root().join(name);

    diagnostics
        .log(format!("Creating an isolated GPG home {}.", home.display()))
        .await;
    diagnostics
        .log(format!(
            "Copying GPG home from {} to {}.",
            config.gnupg_home.display(),
            home.display()
        ))
        .await;

    clone_home(&config.gnupg_home, &home).await?;
    Ok(home)
}

/// Recursively copy `source` into a new owner-only directory at `dest`.
///
/// Regular files are copied byte for byte and directories are recreated
/// owner-only. Anything else (sockets, symlinks, fifos) is skipped. Sibling
/// entries are copied concurrently; the first failure aborts the rest and
/// leaves a partial copy behind.
///
/// # Errors
/// * `WrapperError::Clone` - `dest` already exists, or any entry could not be
///   read or written
pub async fn clone_home(source: &Path, dest: &Path) -> Result<()> {
    create_private_dir(dest).await?;
    copy_dir(source.to_path_buf(), dest.to_path_buf()).await
}

fn copy_dir(
    source: PathBuf,
    dest: PathBuf,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(&source)
            .await
            .map_err(clone_error(&source))?;

        let mut copies = JoinSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(clone_error(&source))? {
            copies.spawn(copy_entry(entry.path(), dest.join(entry.file_name())));
        }

        while let Some(joined) = copies.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    copies.abort_all();
                    return Err(e);
                }
                Err(join_error) => {
                    copies.abort_all();
                    return Err(WrapperError::Clone {
                        path: source,
                        source: std::io::Error::other(join_error),
                    });
                }
            }
        }

        Ok(())
    })
}

async fn copy_entry(source: PathBuf, dest: PathBuf) -> Result<()> {
    // lstat: symlinks are skipped rather than followed
    let metadata = tokio::fs::symlink_metadata(&source)
        .await
        .map_err(clone_error(&source))?;

    if metadata.is_file() {
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(clone_error(&source))?;
    } else if metadata.is_dir() {
        create_private_dir(&dest).await?;
        copy_dir(source, dest).await?;
    }

    Ok(())
}

async fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(PRIVATE_DIR_MODE);

    builder.create(path).await.map_err(clone_error(path))
}

fn clone_error(path: &Path) -> impl FnOnce(std::io::Error) -> WrapperError + '_ {
    move |source| WrapperError::Clone {
        path: path.to_path_buf(),
        source,
    }
}

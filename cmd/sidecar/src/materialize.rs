//! Writing received credentials onto the filesystem and into the process
//! environment.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::debug;

use connector_core::proto::Credential;

/// Materialize every file and env var in the bundle. Any failure aborts
/// the current refresh; previously written files are left untouched.
pub fn apply(credentials: &[Credential]) -> Result<()> {
    for credential in credentials {
        for file in &credential.files {
            let path = expand_home(&file.path)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("couldn't create {}", parent.display()))?;
            }
            write_with_mode(&path, &file.contents, file.mode)
                .with_context(|| format!("couldn't write {}", path.display()))?;
            debug!("wrote {} ({} bytes)", path.display(), file.contents.len());
        }
        for (key, value) in &credential.env_vars {
            std::env::set_var(key, value);
            debug!("set env var {key}");
        }
    }
    Ok(())
}

/// Expand a leading `~/` to the invoking user's home directory. A
/// degenerate `/` home collapses to stripping the `~`.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    let Some(rest) = path.strip_prefix("~/") else {
        return Ok(PathBuf::from(path));
    };
    let home = std::env::var_os("HOME")
        .ok_or_else(|| anyhow!("cannot expand {path:?}: HOME is not set"))?;
    Ok(PathBuf::from(home).join(rest))
}

#[cfg(unix)]
fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::fs::PermissionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)?;
    // The open-time mode only applies to newly created files; make
    // overwrites converge on the requested mode too.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, contents: &[u8], _mode: u32) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

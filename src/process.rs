//! External process adapter
//!
//! Thin translation boundary around the binaries the orchestrator shells out
//! to (acme.sh and nginx). Resolves the binary on `PATH`, runs it to
//! completion and turns a missing binary or a non-zero exit into an
//! [`ExternalProcessError`]. There is no retry and no timeout at this layer.

use crate::error::ExternalProcessError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Run `binary` with `args` and return its combined stdout/stderr
pub async fn run(binary: &str, args: &[String]) -> Result<String, ExternalProcessError> {
    run_with_env(binary, args, &[]).await
}

/// Run `binary` with `args` and extra environment variables
///
/// The variables are added on top of the inherited environment.
pub async fn run_with_env(
    binary: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<String, ExternalProcessError> {
    let path = find_executable(binary).ok_or_else(|| ExternalProcessError::NotFound {
        binary: binary.to_string(),
    })?;

    debug!(command = %path.display(), args = ?args, "Executing external command");

    let mut cmd = Command::new(&path);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let output = cmd.output().await.map_err(|source| ExternalProcessError::Spawn {
        binary: path.display().to_string(),
        source,
    })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        warn!(
            command = %path.display(),
            code = ?output.status.code(),
            output = %combined.trim(),
            "External command failed"
        );
        return Err(ExternalProcessError::Failed {
            command: path.display().to_string(),
            args: args.to_vec(),
            code: output.status.code(),
            output: combined,
        });
    }

    Ok(combined)
}

/// Resolve a binary name the way a shell would
///
/// Names containing a path separator are taken as-is; bare names are looked
/// up in each `PATH` entry in order.
pub fn find_executable(binary: &str) -> Option<PathBuf> {
    if binary.is_empty() {
        return None;
    }

    let candidate = Path::new(binary);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let search_path = std::env::var_os("PATH").unwrap_or_else(OsString::new);
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(binary))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

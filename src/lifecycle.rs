//! Daemon lifecycle utilities.
//!
//! Helpers for daemonizing the process, managing the PID file and checking
//! whether another instance already owns the socket.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::config::expand_path;
use crate::error::ServerError;

/// Daemonize the current process.
///
/// This forks the process, detaches from the terminal, and runs in the background.
///
/// # Arguments
/// * `pid_file` - Path to write the daemon's PID (supports `~` expansion)
/// * `working_dir` - Working directory for the daemon (defaults to `/`)
///
/// # Example
///
/// ```rust,no_run
/// use prontrd::lifecycle::daemonize;
///
/// daemonize("/run/prontrd/prontrd.pid", None)?;
/// // Now running as a daemon
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn daemonize(pid_file: impl AsRef<Path>, working_dir: Option<&Path>) -> Result<()> {
    let pid_path = expand_path(pid_file.as_ref());

    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let daemonize = daemonize::Daemonize::new()
        .pid_file(&pid_path)
        .working_directory(working_dir.unwrap_or(Path::new("/")));

    daemonize.start().context("Failed to daemonize process")?;

    Ok(())
}

/// Write a PID file for the current process.
pub fn write_pid_file(pid_file: impl AsRef<Path>) -> Result<()> {
    let pid_path = expand_path(pid_file.as_ref());

    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(&pid_path)
        .with_context(|| format!("Failed to create PID file {}", pid_path.display()))?;
    writeln!(file, "{}", std::process::id())?;

    Ok(())
}

/// Read a PID from a PID file.
///
/// Returns `None` if the file doesn't exist or can't be parsed.
pub fn read_pid_file(pid_file: impl AsRef<Path>) -> Option<u32> {
    let content = fs::read_to_string(expand_path(pid_file.as_ref())).ok()?;
    content.trim().parse().ok()
}

/// Check if a process with the given PID is running.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the existence check without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Check whether a daemon is accepting connections on `socket_path`.
pub fn is_daemon_running(socket_path: impl AsRef<Path>) -> bool {
    UnixStream::connect(expand_path(socket_path.as_ref())).is_ok()
}

/// Refuse to start if another instance is already serving.
///
/// A live PID file or a socket that accepts connections both count. A stale
/// socket file is left for the server to replace when it binds.
pub fn ensure_not_running(socket_path: impl AsRef<Path>, pid_file: Option<&Path>) -> Result<()> {
    if let Some(pid) = pid_file.and_then(|path| read_pid_file(path)) {
        if pid != std::process::id() && is_process_running(pid) {
            bail!("prontrd already running (PID {})", pid);
        }
    }

    if is_daemon_running(&socket_path) {
        bail!(
            "prontrd already listening on {}",
            socket_path.as_ref().display()
        );
    }

    Ok(())
}

/// Remove a leftover socket file before binding.
///
/// Returns `Ok(false)` if nothing exists at `path`. Anything other than a
/// socket is left alone and reported as [`ServerError::NotASocket`].
pub fn remove_stale_socket(path: &Path) -> Result<bool, ServerError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if !metadata.file_type().is_socket() {
        return Err(ServerError::NotASocket(path.to_path_buf()));
    }

    fs::remove_file(path)?;
    Ok(true)
}

/// Remove the PID file, if any.
pub fn cleanup_pid_file(pid_file: Option<&Path>) {
    if let Some(pid_path) = pid_file {
        let _ = fs::remove_file(expand_path(pid_path));
    }
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Side effects on the local system.
//!
//! Everything that touches the file system or spawns an external process on
//! behalf of the reconciliation engine goes through the [`Host`] trait. The
//! engine only decides what to do. How it gets done is up to the host, which
//! keeps planning deterministic and lets callers swap in a recording host.
//!
//! External commands are never fire-and-forget here. A command that cannot be
//! spawned, or that exits with a non-zero status, is reported back as a
//! [`HostError::Command`] so the caller can decide whether to carry on.

use std::{
    ffi::{OsStr, OsString},
    fs::{self, DirBuilder, Permissions},
    io::ErrorKind,
    os::unix::fs::{chown, DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, instrument};

/// Layer of indirection for system side effects.
pub trait Host {
    /// Ensure directory exists with target permission bits and ownership.
    ///
    /// Creates missing directories, and fixes permissions and ownership of
    /// existing ones. Safe to call repeatedly.
    fn ensure_dir(&self, dir: &Path, mode: u32, uid: u32, gid: u32) -> Result<()>;

    /// Remove directory and everything inside it. Missing is not an error.
    fn remove_dir(&self, dir: &Path) -> Result<()>;

    /// Overwrite file with target contents, creating parent directories.
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Run external command to completion, returning its output.
    fn run(&self, program: &str, args: &[OsString]) -> Result<String>;
}

/// Host that performs side effects on the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHost;

impl LocalHost {
    /// Construct new local host.
    pub fn new() -> Self {
        Self
    }
}

impl Host for LocalHost {
    #[instrument(skip(self), level = "debug")]
    fn ensure_dir(&self, dir: &Path, mode: u32, uid: u32, gid: u32) -> Result<()> {
        if !dir.exists() {
            debug!("create {:?}", dir.display());
            DirBuilder::new()
                .recursive(true)
                .mode(mode)
                .create(dir)
                .map_err(|err| HostError::io(dir, err))?;
        }

        // INVARIANT: Always apply mode explicitly, the umask may have masked it.
        fs::set_permissions(dir, Permissions::from_mode(mode))
            .map_err(|err| HostError::io(dir, err))?;
        chown(dir, Some(uid), Some(gid)).map_err(|err| HostError::io(dir, err))?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn remove_dir(&self, dir: &Path) -> Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HostError::io(dir, err)),
        }
    }

    #[instrument(skip(self, contents), level = "debug")]
    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(|err| HostError::io(parent, err))?;
        }

        fs::write(path, contents).map_err(|err| HostError::io(path, err))
    }

    #[instrument(skip(self), level = "debug")]
    fn run(&self, program: &str, args: &[OsString]) -> Result<String> {
        syscall_non_interactive(program, args)
    }
}

fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let program = cmd.as_ref().to_string_lossy().into_owned();
    let output = Command::new(cmd.as_ref())
        .args(args)
        .output()
        .map_err(|err| HostError::Command(CommandError::Spawn {
            source: err,
            program: program.clone(),
        }))?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message);

    if !output.status.success() {
        return Err(HostError::Command(CommandError::Failed {
            program,
            status: output.status.code(),
            message,
        }));
    }

    Ok(message)
}

/// External command failure.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Command could not be started at all.
    #[error("failed to spawn {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Command ran but reported failure.
    #[error("command {program:?} failed with status {}:\n{message}", display_status(.status))]
    Failed {
        program: String,
        status: Option<i32>,
        message: String,
    },
}

fn display_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "<signal>".into(),
    }
}

/// Host side effect error types.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// File system operation fails.
    #[error("file system operation on {:?} failed", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// External command fails.
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl HostError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            source,
            path: path.to_path_buf(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = HostError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! NFS export definitions for the share root.
//!
//! Thin clients reach shared folders over NFS. Two export entries are
//! enough: a read-only export of the share root itself, so clients can list
//! the available folders, and a read-write export of each folder below it.
//! Group permissions are then enforced by the bindfs mounts on the server.

use crate::host::{Host, Result};

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// Well-known location of the shared folders export definitions.
pub const DEFAULT_EXPORTS_FILE: &str = "/etc/exports.d/shared-folders.exports";

const EXPORT_OPTIONS: &str = "async,no_subtree_check,insecure";

/// Writer of NFS export definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsExporter {
    exports_file: PathBuf,
}

impl NfsExporter {
    /// Construct new exporter writing definitions to target file.
    pub fn new(exports_file: impl Into<PathBuf>) -> Self {
        Self {
            exports_file: exports_file.into(),
        }
    }

    /// File that export definitions are written to.
    pub fn exports_file(&self) -> &Path {
        self.exports_file.as_path()
    }

    /// Render export definitions for target share root.
    ///
    /// Redundant separators in the share root are dropped.
    pub fn render(share_dir: impl AsRef<Path>) -> String {
        let share_dir = share_dir.as_ref().components().collect::<PathBuf>();
        let share_dir = share_dir.display().to_string();
        let share_dir = share_dir.trim_end_matches('/');
        format!(
            "{share_dir}/ *(ro,{EXPORT_OPTIONS})\n{share_dir}/* *(rw,{EXPORT_OPTIONS})\n"
        )
    }

    /// Overwrite export definitions file for target share root.
    ///
    /// # Errors
    ///
    /// - Return [`HostError`](crate::host::HostError) if file cannot be
    ///   written.
    #[instrument(skip(self, host), level = "debug")]
    pub fn write_definitions(&self, host: &impl Host, share_dir: &Path) -> Result<()> {
        info!("write NFS exports to {:?}", self.exports_file.display());
        host.write_file(&self.exports_file, &Self::render(share_dir))
    }

    /// Ask NFS server to re-read its export table.
    ///
    /// # Errors
    ///
    /// - Return [`HostError::Command`](crate::host::HostError::Command) if
    ///   `exportfs` fails.
    #[instrument(skip(self, host), level = "debug")]
    pub fn reload(&self, host: &impl Host) -> Result<()> {
        info!("reload NFS exports");
        host.run("exportfs", &Self::reload_args())?;
        Ok(())
    }

    /// Write export definitions, then reload NFS export table.
    ///
    /// # Errors
    ///
    /// - Return [`HostError`](crate::host::HostError) if either step fails.
    pub fn write_exports(&self, host: &impl Host, share_dir: &Path) -> Result<()> {
        self.write_definitions(host, share_dir)?;
        self.reload(host)
    }

    pub(crate) fn reload_args() -> Vec<OsString> {
        vec!["-a".into()]
    }
}

impl Default for NfsExporter {
    fn default() -> Self {
        Self::new(DEFAULT_EXPORTS_FILE)
    }
}

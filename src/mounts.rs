// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Live mount table inspection.
//!
//! Find out which shared folders are currently mounted, and which group id
//! each mount reports. The mount table changes under our feet, so nothing is
//! cached: every call to [`MountTable::current_mounts`] re-reads the source
//! and parses it lazily.
//!
//! # Mount Table Layout
//!
//! Each line of `/proc/self/mounts` holds whitespace separated fields:
//! device, mount point, filesystem type, comma separated options, and two
//! numeric fields nobody cares about. Whitespace inside a mount point is
//! escaped as a three digit octal sequence, e.g., `\040` for a space.

use serde::Serialize;
use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Well-known location of the live mount table.
pub const DEFAULT_MOUNTS_FILE: &str = "/proc/self/mounts";

/// Shared folder found in the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    /// Group name, i.e., the final segment of the mount point.
    pub group: String,

    /// Group id reported by the `gid=` mount option.
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MountSource {
    File(PathBuf),
    Snapshot(String),
}

/// Source of mount table listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTable {
    source: MountSource,
}

impl MountTable {
    /// Read live mount table of current process.
    pub fn new() -> Self {
        Self::from_path(DEFAULT_MOUNTS_FILE)
    }

    /// Read mount table from target path on every query.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: MountSource::File(path.into()),
        }
    }

    /// Use fixed mount table contents.
    pub fn from_snapshot(contents: impl Into<String>) -> Self {
        Self {
            source: MountSource::Snapshot(contents.into()),
        }
    }

    /// List shared folders currently mounted below target share root.
    ///
    /// The source is re-read on each call, but lines are only parsed as the
    /// returned iterator advances. A missing source file is treated as an
    /// empty mount table.
    ///
    /// # Errors
    ///
    /// - Return [`MountError::Read`] if source exists but cannot be read.
    /// - Iterator yields [`MountError`] for each malformed matching line.
    pub fn current_mounts(&self, share_dir: impl AsRef<Path>) -> Result<MountRecords> {
        let contents = match &self.source {
            MountSource::Snapshot(contents) => contents.clone(),
            MountSource::File(path) => match read_to_string(path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("no mount table at {:?}", path.display());
                    String::new()
                }
                Err(err) => {
                    return Err(MountError::Read {
                        source: err,
                        path: path.clone(),
                    })
                }
            },
        };

        Ok(MountRecords {
            contents,
            offset: 0,
            lineno: 0,
            share_dir: share_dir.as_ref().to_path_buf(),
        })
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy sequence of shared folder mounts.
#[derive(Debug)]
pub struct MountRecords {
    contents: String,
    offset: usize,
    lineno: usize,
    share_dir: PathBuf,
}

impl Iterator for MountRecords {
    type Item = Result<MountRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset < self.contents.len() {
            let rest = &self.contents[self.offset..];
            let (line, consumed) = match rest.find('\n') {
                Some(end) => (&rest[..end], end + 1),
                None => (rest, rest.len()),
            };
            self.offset += consumed;
            self.lineno += 1;

            match parse_line(self.lineno, line, &self.share_dir) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }

        None
    }
}

fn parse_line(lineno: usize, line: &str, share_dir: &Path) -> Result<Option<MountRecord>> {
    let fields = line.split_whitespace().collect::<Vec<_>>();
    if fields.is_empty() {
        return Ok(None);
    }

    if fields.len() < 2 {
        return Err(MountError::Malformed { lineno });
    }

    let mount_point = PathBuf::from(unescape(fields[1]));
    if mount_point == share_dir || !mount_point.starts_with(share_dir) {
        return Ok(None);
    }

    let group = match mount_point.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Ok(None),
    };

    let gid = fields
        .get(3)
        .and_then(|options| {
            options
                .split(',')
                .find_map(|option| option.strip_prefix("gid="))
        })
        .ok_or_else(|| MountError::MissingGid {
            mount_point: mount_point.clone(),
        })?;
    let gid = gid.parse().map_err(|_| MountError::InvalidGid {
        mount_point: mount_point.clone(),
        value: gid.into(),
    })?;

    Ok(Some(MountRecord { group, gid }))
}

// Decode `\ooo` octal escapes that the kernel uses for special characters.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 3 < bytes.len() {
            let digits = &bytes[idx + 1..idx + 4];
            if digits.iter().all(|byte| (b'0'..=b'7').contains(byte)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, byte| acc * 8 + u32::from(byte - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    decoded.push(value);
                    idx += 4;
                    continue;
                }
            }
        }

        decoded.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

/// Mount table error types.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// Mount table exists but cannot be read.
    #[error("failed to read mount table at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Mount table line lacks a mount point.
    #[error("malformed mount table entry on line {lineno}")]
    Malformed { lineno: usize },

    /// Shared folder mount has no `gid=` option.
    #[error("shared folder mount {:?} has no gid option", mount_point.display())]
    MissingGid { mount_point: PathBuf },

    /// Shared folder mount has a non-numeric `gid=` option.
    #[error("shared folder mount {:?} has invalid gid {value:?}", mount_point.display())]
    InvalidGid { mount_point: PathBuf, value: String },
}

/// Friendly result alias :3
pub type Result<T, E = MountError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Group database snapshot.
//!
//! Shared folders are owned by system groups, so the engine needs to know the
//! current numeric id of each group it provisions. The group database is
//! read once into an immutable [`GroupDirectory`] that gets passed around by
//! reference. Nothing here ever writes to the group database.

use std::{
    collections::{BTreeMap, HashSet},
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Well-known location of the group database.
pub const DEFAULT_GROUP_FILE: &str = "/etc/group";

// Infrastructure groups that never get a shared folder.
const SYSTEM_GROUP_NAMES: &[&str] = &[
    "adm", "audio", "avahi", "backup", "bin", "cdrom", "crontab", "daemon", "dialout", "dip",
    "disk", "epoptes", "fax", "floppy", "games", "gnats", "input", "irc", "kmem", "kvm",
    "lightdm", "list", "lp", "lpadmin", "mail", "man", "messagebus", "netdev", "news",
    "nogroup", "nopasswdlogin", "operator", "plugdev", "proxy", "render", "root", "sambashare",
    "sasl", "scanner", "shadow", "src", "ssh", "staff", "sudo", "sys", "systemd-journal",
    "tape", "tty", "users", "utmp", "uucp", "video", "voice", "www-data",
];

/// Names of groups reserved for system infrastructure.
pub fn load_system_group_names() -> HashSet<&'static str> {
    SYSTEM_GROUP_NAMES.iter().copied().collect()
}

/// Single entry of the group database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,

    /// Numeric id, unset when the database entry leaves the field empty.
    pub gid: Option<u32>,
}

impl Group {
    /// Construct new group entry.
    pub fn new(name: impl Into<String>, gid: Option<u32>) -> Self {
        Self {
            name: name.into(),
            gid,
        }
    }
}

/// Read-only snapshot of the group database keyed by group name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDirectory {
    groups: BTreeMap<String, Group>,
}

impl GroupDirectory {
    /// Snapshot the system group database.
    ///
    /// # Errors
    ///
    /// - Return [`LookupError::Read`] if the database cannot be read.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_GROUP_FILE)
    }

    /// Snapshot a group database in `/etc/group` format at target path.
    ///
    /// # Errors
    ///
    /// - Return [`LookupError::Read`] if the file cannot be read.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let contents = read_to_string(path.as_ref()).map_err(|err| LookupError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;
        let directory = Self::parse(&contents);
        debug!(
            "loaded {} groups from {:?}",
            directory.len(),
            path.as_ref().display()
        );

        Ok(directory)
    }

    /// Parse contents of a group database in `/etc/group` format.
    ///
    /// Lines that do not look like `name:password:gid:members` are skipped.
    pub fn parse(contents: &str) -> Self {
        let mut groups = BTreeMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 || fields[0].is_empty() {
                warn!("skip malformed group entry on line {}", lineno + 1);
                continue;
            }

            let gid = match fields[2].trim() {
                "" => None,
                gid => match gid.parse() {
                    Ok(gid) => Some(gid),
                    Err(_) => {
                        warn!("skip group {:?} with invalid gid {gid:?}", fields[0]);
                        continue;
                    }
                },
            };

            // INVARIANT: First entry wins, like getgrnam(3).
            groups
                .entry(fields[0].to_string())
                .or_insert_with(|| Group::new(fields[0], gid));
        }

        Self { groups }
    }

    /// Build snapshot out of known groups.
    pub fn from_groups(groups: impl IntoIterator<Item = Group>) -> Self {
        let mut directory = Self::default();
        for group in groups {
            directory.groups.entry(group.name.clone()).or_insert(group);
        }

        directory
    }

    /// Look up group by exact name.
    pub fn lookup(&self, name: impl AsRef<str>) -> Option<&Group> {
        self.groups.get(name.as_ref())
    }

    /// Resolve current numeric id of target group.
    ///
    /// # Errors
    ///
    /// - Return [`LookupError::UnknownGroup`] if group is not in snapshot.
    /// - Return [`LookupError::NoGid`] if group exists without an id.
    pub fn gid(&self, name: impl AsRef<str>) -> Result<u32> {
        let name = name.as_ref();
        let group = self
            .lookup(name)
            .ok_or_else(|| LookupError::UnknownGroup { name: name.into() })?;
        group.gid.ok_or_else(|| LookupError::NoGid { name: name.into() })
    }

    /// Number of groups in snapshot.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Check if snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Iterate through groups by name.
    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }
}

/// Group lookup error types.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// Group database cannot be read.
    #[error("failed to read group database at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Group name is absent from group database.
    #[error("group {name:?} does not exist")]
    UnknownGroup { name: String },

    /// Group exists, but has no numeric id.
    #[error("group {name:?} has no gid")]
    NoGid { name: String },
}

/// Friendly result alias :3
pub type Result<T, E = LookupError> = std::result::Result<T, E>;

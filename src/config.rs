// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Shared folders are configured through a shell-style file of `KEY=VALUE`
//! assignments, the same file that the boot-time shell scripts source. The
//! file is optional. Whatever it contains is overlaid on top of a fixed set
//! of defaults, so every recognized key always has a value.
//!
//! # Recognized Keys
//!
//! | Key                      | Meaning                                     |
//! |--------------------------|---------------------------------------------|
//! | `DISABLE_SHARED_FOLDERS` | Do not mount anything when `true`.          |
//! | `DISABLE_NFS_EXPORTS`    | Do not write or reload NFS exports.         |
//! | `RESTRICT_DIRS`          | Parsed only, the share root is always 0711. |
//! | `TEACHERS`               | Group owning the symlink staging directory. |
//! | `SHARE_DIR`              | Share root.                                 |
//! | `SHARE_GROUPS`           | Space separated default group names.        |
//! | `ADM_UID` / `ADM_GID`    | Administrator owning shared directories.    |
//! | `MISSING_GROUPS`         | `skip` or `fail` on unknown group names.    |

use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    num::ParseIntError,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Well-known location of the shared folders configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/default/shared-folders";

const DEFAULTS: [(&str, &str); 9] = [
    ("DISABLE_SHARED_FOLDERS", "false"),
    ("DISABLE_NFS_EXPORTS", "false"),
    ("RESTRICT_DIRS", "true"),
    ("TEACHERS", "teachers"),
    ("SHARE_DIR", "/home/Shared"),
    ("SHARE_GROUPS", "teachers"),
    ("ADM_UID", "1000"),
    ("ADM_GID", "1000"),
    ("MISSING_GROUPS", "skip"),
];

/// Loader of the shared folders configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Construct new configuration loader reading from target path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the configuration file this store reads.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Load configuration.
    ///
    /// Starts from the default mapping, then overlays the assignments of the
    /// configuration file if it exists. A missing file keeps the defaults.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file exists but cannot be read.
    /// - Return [`ConfigError::Split`] if the file has unbalanced quoting.
    /// - Return [`ConfigError::MalformedAssignment`] for a word that is not
    ///   of the form `KEY=VALUE`.
    #[instrument(skip(self), level = "debug")]
    pub fn load(&self) -> Result<Configuration> {
        let mut config = Configuration::default();
        match read_to_string(&self.path) {
            Ok(contents) => {
                debug!("overlay configuration from {:?}", self.path.display());
                config.overlay(&contents)?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no configuration at {:?}, using defaults", self.path.display());
            }
            Err(err) => {
                return Err(ConfigError::Read {
                    source: err,
                    path: self.path.clone(),
                })
            }
        }

        Ok(config)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_FILE)
    }
}

/// Raw key/value configuration.
///
/// Always contains every default key. Overlays replace or extend entries but
/// never remove them.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    /// Overlay shell-style `KEY=VALUE` assignments on current entries.
    ///
    /// Values may refer to keys assigned before them through `$KEY` or
    /// `${KEY}`. Unknown references are kept verbatim.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Split`] if shell quoting is unbalanced.
    /// - Return [`ConfigError::MalformedAssignment`] if a word lacks `=`.
    pub fn overlay(&mut self, contents: &str) -> Result<()> {
        let words = shell_words::split(contents)?;

        // INVARIANT: Validate every word before touching any entry.
        let mut assignments = Vec::with_capacity(words.len());
        for word in words {
            match word.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    assignments.push((key.to_string(), value.to_string()))
                }
                _ => return Err(ConfigError::MalformedAssignment { word }),
            }
        }

        for (key, value) in assignments {
            let value = shellexpand::env_with_context_no_errors(&value, |name: &str| {
                self.entries.get(name).cloned()
            })
            .into_owned();
            self.entries.insert(key, value);
        }

        Ok(())
    }

    /// Get raw value of target key.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.entries.get(key.as_ref()).map(String::as_str)
    }

    /// Set raw value of target key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Iterate through all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Interpret target key as a `true`/`false` flag.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Missing`] if key is not set.
    /// - Return [`ConfigError::InvalidFlag`] for anything but `true` or
    ///   `false`.
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.require(key)? {
            "true" => Ok(true),
            "false" => Ok(false),
            value => Err(ConfigError::InvalidFlag {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    /// Interpret target key as a numeric user or group id.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Missing`] if key is not set.
    /// - Return [`ConfigError::InvalidId`] if value is not a `u32`.
    pub fn id(&self, key: &str) -> Result<u32> {
        let value = self.require(key)?;
        value.trim().parse().map_err(|err| ConfigError::InvalidId {
            source: err,
            key: key.into(),
            value: value.into(),
        })
    }

    /// Interpret target key as a whitespace separated list.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Missing`] if key is not set.
    pub fn list(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .require(key)?
            .split_whitespace()
            .map(ToString::to_string)
            .collect())
    }

    /// Build typed settings out of raw entries.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError`] if any recognized key has an invalid value.
    pub fn settings(&self) -> Result<Settings> {
        Ok(Settings {
            disable_shared_folders: self.flag("DISABLE_SHARED_FOLDERS")?,
            disable_nfs_exports: self.flag("DISABLE_NFS_EXPORTS")?,
            restrict_dirs: self.flag("RESTRICT_DIRS")?,
            teachers: self.require("TEACHERS")?.to_string(),
            share_dir: PathBuf::from(self.require("SHARE_DIR")?),
            share_groups: self.list("SHARE_GROUPS")?,
            adm_uid: self.id("ADM_UID")?,
            adm_gid: self.id("ADM_GID")?,
            missing_groups: self.require("MISSING_GROUPS")?.parse()?,
        })
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| ConfigError::Missing { key: key.into() })
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            entries: DEFAULTS
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }
}

impl FromStr for Configuration {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();
        config.overlay(data)?;
        Ok(config)
    }
}

impl Display for Configuration {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for (key, value) in self.iter() {
            writeln!(fmt, "{key}={}", shell_words::quote(value))?;
        }

        Ok(())
    }
}

/// Typed view of a [`Configuration`].
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct Settings {
    pub disable_shared_folders: bool,
    pub disable_nfs_exports: bool,
    pub restrict_dirs: bool,
    pub teachers: String,
    pub share_dir: PathBuf,
    pub share_groups: Vec<String>,
    pub adm_uid: u32,
    pub adm_gid: u32,
    pub missing_groups: MissingGroupPolicy,
}

impl Settings {
    /// Directory shared by target group.
    pub fn group_dir(&self, group: impl AsRef<str>) -> PathBuf {
        self.share_dir.join(group.as_ref())
    }

    /// Hidden directory where teachers stage symlinks to shared folders.
    pub fn symlinks_dir(&self) -> PathBuf {
        self.share_dir.join(".symlinks")
    }
}

impl Default for Settings {
    fn default() -> Self {
        // INVARIANT: Defaults are hard-coded and always valid.
        Configuration::default()
            .settings()
            .unwrap_or_else(|err| unreachable!("default configuration is invalid: {err}"))
    }
}

/// What to do with a group name that the group database does not know.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingGroupPolicy {
    /// Warn and leave the group out of the pass.
    #[default]
    Skip,

    /// Abort the whole pass.
    Fail,
}

impl FromStr for MissingGroupPolicy {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            other => Err(ConfigError::InvalidPolicy {
                value: other.into(),
            }),
        }
    }
}

impl Display for MissingGroupPolicy {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Skip => fmt.write_str("skip"),
            Self::Fail => fmt.write_str("fail"),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file exists but cannot be read.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file is not valid shell word syntax.
    #[error(transparent)]
    Split(#[from] shell_words::ParseError),

    /// Word in configuration file is not an assignment.
    #[error("expected KEY=VALUE assignment, found {word:?}")]
    MalformedAssignment { word: String },

    /// Required key has no value.
    #[error("configuration key {key} is not set")]
    Missing { key: String },

    /// Key expected to be a flag has another value.
    #[error("configuration key {key} must be true or false, found {value:?}")]
    InvalidFlag { key: String, value: String },

    /// Key expected to be numeric id has another value.
    #[error("configuration key {key} must be a numeric id, found {value:?}")]
    InvalidId {
        #[source]
        source: ParseIntError,
        key: String,
        value: String,
    },

    /// Missing group policy is unknown.
    #[error("missing group policy must be skip or fail, found {value:?}")]
    InvalidPolicy { value: String },
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[test]
    fn default_settings() {
        let result = Configuration::default().settings().unwrap();
        let expect = Settings {
            disable_shared_folders: false,
            disable_nfs_exports: false,
            restrict_dirs: true,
            teachers: "teachers".into(),
            share_dir: "/home/Shared".into(),
            share_groups: vec!["teachers".into()],
            adm_uid: 1000,
            adm_gid: 1000,
            missing_groups: MissingGroupPolicy::Skip,
        };
        assert_eq!(result, expect);
    }

    #[test]
    fn overlay_replaces_and_extends() -> anyhow::Result<()> {
        let config: Configuration = indoc! {r#"
            # Managed by the lab administrator.
            SHARE_GROUPS="teachers a1 b2"
            ADM_UID=1001
            DISABLE_NFS_EXPORTS='true'
            EXTRA_KEY=whatever
        "#}
        .parse()?;

        let settings = config.settings()?;
        assert_eq!(settings.share_groups, vec!["teachers", "a1", "b2"]);
        assert_eq!(settings.adm_uid, 1001);
        assert_eq!(settings.adm_gid, 1000);
        assert!(settings.disable_nfs_exports);
        assert_eq!(config.get("EXTRA_KEY"), Some("whatever"));
        assert_eq!(config.get("SHARE_DIR"), Some("/home/Shared"));

        Ok(())
    }

    #[test]
    fn overlay_expands_earlier_keys() -> anyhow::Result<()> {
        let config: Configuration = indoc! {r#"
            TEACHERS=staff
            SHARE_GROUPS="$TEACHERS ${TEACHERS}-extra"
            SHARE_DIR=$NOT_A_KEY/Shared
        "#}
        .parse()?;

        assert_eq!(config.get("SHARE_GROUPS"), Some("staff staff-extra"));
        assert_eq!(config.get("SHARE_DIR"), Some("$NOT_A_KEY/Shared"));

        Ok(())
    }

    #[test]
    fn overlay_value_keeps_extra_equal_signs() -> anyhow::Result<()> {
        let config: Configuration = "TEACHERS=a=b".parse()?;
        assert_eq!(config.get("TEACHERS"), Some("a=b"));

        Ok(())
    }

    #[test_case("SHARE_GROUPS=\"teachers"; "unbalanced quote")]
    #[test_case("SHARE_GROUPS"; "missing equal sign")]
    #[test_case("=teachers"; "empty key")]
    #[test]
    fn overlay_rejects_malformed_contents(contents: &str) {
        use pretty_assertions::assert_eq;
        let mut config = Configuration::default();
        let result = config.overlay(contents);
        assert!(result.is_err());
        assert_eq!(config, Configuration::default());
    }

    #[test_case("RESTRICT_DIRS=yes"; "flag")]
    #[test_case("ADM_GID=-1"; "negative id")]
    #[test_case("ADM_UID=root"; "named id")]
    #[test_case("MISSING_GROUPS=ignore"; "policy")]
    #[test]
    fn settings_reject_invalid_values(contents: &str) {
        let config: Configuration = contents.parse().unwrap();
        assert!(config.settings().is_err());
    }

    #[test]
    fn settings_paths() {
        let settings = Settings {
            restrict_dirs: false,
            ..Settings::default()
        };
        assert_eq!(settings.group_dir("a1"), PathBuf::from("/home/Shared/a1"));
        assert_eq!(
            settings.symlinks_dir(),
            PathBuf::from("/home/Shared/.symlinks")
        );
        assert!(!settings.restrict_dirs);
    }

    #[test]
    fn display_configuration() -> anyhow::Result<()> {
        let config: Configuration = "SHARE_GROUPS='teachers a1'".parse()?;
        let expect = indoc! {r#"
            ADM_GID=1000
            ADM_UID=1000
            DISABLE_NFS_EXPORTS=false
            DISABLE_SHARED_FOLDERS=false
            MISSING_GROUPS=skip
            RESTRICT_DIRS=true
            SHARE_DIR=/home/Shared
            SHARE_GROUPS='teachers a1'
            TEACHERS=teachers
        "#};
        assert_eq!(config.to_string(), expect);

        Ok(())
    }

    #[sealed_test]
    fn load_missing_file_keeps_defaults() -> anyhow::Result<()> {
        let result = ConfigStore::new("shared-folders").load()?;
        assert_eq!(result, Configuration::default());

        Ok(())
    }

    #[sealed_test]
    fn load_overlays_file() -> anyhow::Result<()> {
        std::fs::write("shared-folders", "SHARE_DIR=/srv/Shared\n")?;
        let result = ConfigStore::new("shared-folders").load()?.settings()?;
        assert_eq!(result.share_dir, PathBuf::from("/srv/Shared"));

        Ok(())
    }

    #[sealed_test]
    fn load_propagates_malformed_file() -> anyhow::Result<()> {
        std::fs::write("shared-folders", "SHARE_DIR='/srv/Shared\n")?;
        let result = ConfigStore::new("shared-folders").load();
        assert!(matches!(result, Err(ConfigError::Split(_))));

        Ok(())
    }
}

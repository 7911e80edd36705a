// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shared folder reconciliation.
//!
//! Every group in the __working set__ gets a directory below the share root,
//! bind mounted onto itself through bindfs so that new files always belong to
//! the administrator and the group, and so that nobody can chown, chgrp, or
//! chmod their way around group quotas.
//!
//! # Reconciliation Pass
//!
//! A pass is a single linear run, not a daemon. It compares the working set
//! against a [`GroupDirectory`] snapshot and the live [`MountTable`], and
//! classifies each group:
//!
//! - [`GroupState::MountedCorrectGid`]: mounted with the group's current id.
//!   Nothing to do.
//! - [`GroupState::MountedStaleGid`]: mounted, but the group was recreated
//!   with a different id. Unmount it, then mount it again.
//! - [`GroupState::NotMounted`]: create the directory if needed and mount.
//! - [`GroupState::Unknown`]: the group database does not know the group, or
//!   knows it without an id. Skipped or fatal depending on
//!   [`MissingGroupPolicy`].
//!
//! The result is a [`Plan`] of [`Action`]s, which is then applied through a
//! [`Host`]. When nothing needs to change the plan is empty, so running the
//! pass twice in a row does nothing the second time.
//!
//! # Concurrency
//!
//! Nothing here locks anything. Two passes running at once will race on
//! mounts and directory permissions, so callers must serialize invocations,
//! e.g., by only running the pass from one scheduled job.

use crate::{
    config::{MissingGroupPolicy, Settings},
    exports::NfsExporter,
    group::{load_system_group_names, GroupDirectory},
    host::{Host, HostError, LocalHost},
    mounts::MountTable,
};

use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Mode of the share root.
const SHARE_DIR_MODE: u32 = 0o711;

/// Mode of the symlink staging directory.
const SYMLINKS_MODE: u32 = 0o731;

/// Mode of each group directory.
const GROUP_DIR_MODE: u32 = 0o770;

/// Observed state of a single shared folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Group database has no usable id for the group.
    Unknown,

    /// Shared folder is not mounted.
    NotMounted,

    /// Shared folder is mounted with the group's current id.
    MountedCorrectGid,

    /// Shared folder is mounted with an outdated id.
    MountedStaleGid,
}

impl Display for GroupState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Unknown => "unknown",
            Self::NotMounted => "not mounted",
            Self::MountedCorrectGid => "mounted",
            Self::MountedStaleGid => "mounted with stale gid",
        })
    }
}

/// Classification of one group of the working set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub group: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_gid: Option<u32>,

    pub state: GroupState,
}

impl Display for GroupStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}: {}", self.group, self.state)?;
        match (self.gid, self.observed_gid) {
            (Some(gid), Some(observed)) if gid != observed => {
                write!(fmt, " (gid {observed}, expected {gid})")
            }
            (Some(gid), _) => write!(fmt, " (gid {gid})"),
            (None, _) => Ok(()),
        }
    }
}

/// Status listing that serializes into a TOML document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    #[serde(rename = "group")]
    pub groups: Vec<GroupStatus>,
}

/// Single side effect of a pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Unmount directory without touching its contents.
    Unmount { dir: PathBuf },

    /// Create directory, or fix its permissions and ownership.
    EnsureDir {
        dir: PathBuf,
        mode: u32,
        uid: u32,
        gid: u32,
    },

    /// Bind mount directory onto itself through bindfs.
    BindMount { dir: PathBuf, uid: u32, gid: u32 },

    /// Overwrite NFS export definitions.
    WriteExports { file: PathBuf, share_dir: PathBuf },

    /// Ask NFS server to reload its export table.
    ReloadExports,

    /// Delete directory and its contents.
    RemoveDir { dir: PathBuf },
}

impl Action {
    fn target(&self) -> Target<'_> {
        match self {
            Self::Unmount { dir }
            | Self::EnsureDir { dir, .. }
            | Self::BindMount { dir, .. }
            | Self::RemoveDir { dir } => Target::Dir(dir),
            Self::WriteExports { .. } | Self::ReloadExports => Target::Exports,
        }
    }
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Unmount { dir } => write!(fmt, "unmount {}", dir.display()),
            Self::EnsureDir {
                dir,
                mode,
                uid,
                gid,
            } => write!(
                fmt,
                "ensure directory {} (mode {mode:04o}, owner {uid}:{gid})",
                dir.display()
            ),
            Self::BindMount { dir, uid, gid } => {
                write!(fmt, "bind mount {} (owner {uid}:{gid})", dir.display())
            }
            Self::WriteExports { file, .. } => write!(fmt, "write NFS exports {}", file.display()),
            Self::ReloadExports => fmt.write_str("reload NFS exports"),
            Self::RemoveDir { dir } => write!(fmt, "remove directory {}", dir.display()),
        }
    }
}

// Actions on a directory depend on earlier actions on that directory and on
// its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target<'a> {
    Dir(&'a Path),
    Exports,
}

impl Target<'_> {
    fn depends_on(&self, failed: &Target<'_>) -> bool {
        match (self, failed) {
            (Target::Dir(dir), Target::Dir(failed)) => dir.starts_with(failed),
            (Target::Exports, Target::Exports) => true,
            _ => false,
        }
    }
}

/// Ordered list of actions computed by a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    /// Check if plan has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Display for Plan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for action in &self.actions {
            writeln!(fmt, "{action}")?;
        }

        Ok(())
    }
}

/// Action that failed while applying a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub action: Action,
    pub error: String,
}

/// Outcome of applying a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub applied: Vec<Action>,
    pub failed: Vec<Failure>,

    /// Actions left out because an earlier action on the same target failed.
    pub skipped: Vec<Action>,
}

impl Report {
    /// Check if every action of the plan was applied.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// What to do when an action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, record in the report, skip dependent actions, keep going.
    #[default]
    Continue,

    /// Stop the pass at the first failure.
    Abort,
}

/// Shared folder reconciliation engine.
#[derive(Debug)]
pub struct ReconciliationEngine<H = LocalHost>
where
    H: Host,
{
    settings: Settings,
    exporter: NfsExporter,
    failure_policy: FailurePolicy,
    host: H,
}

impl<H> ReconciliationEngine<H>
where
    H: Host,
{
    /// Construct new engine.
    pub fn new(settings: Settings, host: H) -> Self {
        Self {
            settings,
            exporter: NfsExporter::default(),
            failure_policy: FailurePolicy::default(),
            host,
        }
    }

    /// Use target NFS exporter instead of the default one.
    pub fn with_exporter(mut self, exporter: NfsExporter) -> Self {
        self.exporter = exporter;
        self
    }

    /// Use target failure policy when applying plans.
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Use target missing group policy instead of the configured one.
    pub fn with_missing_group_policy(mut self, policy: MissingGroupPolicy) -> Self {
        self.settings.missing_groups = policy;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn exporter(&self) -> &NfsExporter {
        &self.exporter
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Resolve group names to consider in a pass.
    ///
    /// Uses explicit candidates when given, configured share groups otherwise.
    /// Duplicates, reserved system groups, and names that cannot be a single
    /// path segment are left out.
    pub fn working_set(&self, candidates: Option<&[String]>) -> Vec<String> {
        let names = candidates.unwrap_or(self.settings.share_groups.as_slice());
        let system_groups = load_system_group_names();
        let mut seen = HashSet::new();
        let mut working_set = Vec::new();
        for name in names {
            if !is_valid_group_name(name) {
                warn!("skip invalid group name {name:?}");
                continue;
            }

            if system_groups.contains(name.as_str()) {
                warn!("skip system group {name:?}");
                continue;
            }

            if seen.insert(name.as_str()) {
                working_set.push(name.clone());
            }
        }

        working_set
    }

    /// Classify every group of the working set without changing anything.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Mount`] if mount table cannot be parsed.
    #[instrument(skip(self, groups, mounts), level = "debug")]
    pub fn status(
        &self,
        candidates: Option<&[String]>,
        groups: &GroupDirectory,
        mounts: &MountTable,
    ) -> Result<Vec<GroupStatus>> {
        let working_set = self.working_set(candidates);

        // INVARIANT: Last entry wins, it is the top of a mount stack.
        let mut observed = BTreeMap::new();
        for record in mounts.current_mounts(&self.settings.share_dir)? {
            let record = record?;
            if working_set.contains(&record.group) {
                observed.insert(record.group, record.gid);
            }
        }

        let statuses = working_set
            .into_iter()
            .map(|group| {
                let gid = groups.lookup(&group).and_then(|entry| entry.gid);
                let observed_gid = observed.get(&group).copied();
                let state = match (gid, observed_gid) {
                    (None, _) => GroupState::Unknown,
                    (Some(_), None) => GroupState::NotMounted,
                    (Some(gid), Some(observed)) if gid == observed => {
                        GroupState::MountedCorrectGid
                    }
                    (Some(_), Some(_)) => GroupState::MountedStaleGid,
                };

                GroupStatus {
                    group,
                    gid,
                    observed_gid,
                    state,
                }
            })
            .collect();

        Ok(statuses)
    }

    /// Compute actions that bring shared folders of the working set up to
    /// date, i.e., the plan of a mount pass.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Mount`] if mount table cannot be parsed.
    /// - Return [`EngineError::Lookup`] if a group is unknown and the
    ///   missing group policy is [`MissingGroupPolicy::Fail`], or if the
    ///   teachers group is unknown while something needs to be mounted.
    #[instrument(skip(self, groups, mounts), level = "debug")]
    pub fn reconcile(
        &self,
        candidates: Option<&[String]>,
        groups: &GroupDirectory,
        mounts: &MountTable,
    ) -> Result<Plan> {
        let settings = &self.settings;
        if settings.disable_shared_folders {
            info!("shared folders are disabled");
            return Ok(Plan::default());
        }

        let mut actions = Vec::new();
        let mut pending = Vec::new();
        for status in self.status(candidates, groups, mounts)? {
            let dir = settings.group_dir(&status.group);
            match (status.state, status.gid) {
                (GroupState::MountedCorrectGid, _) => {
                    debug!("{:?} already mounted correctly", dir.display());
                }
                (GroupState::MountedStaleGid, Some(gid)) => {
                    info!(
                        "{:?} mounted with stale gid {:?}, remount with gid {gid}",
                        dir.display(),
                        status.observed_gid
                    );
                    actions.push(Action::Unmount { dir });
                    pending.push((status.group, gid));
                }
                (GroupState::NotMounted, Some(gid)) => {
                    pending.push((status.group, gid));
                }
                _ => {
                    if let Err(err) = groups.gid(&status.group) {
                        match settings.missing_groups {
                            MissingGroupPolicy::Skip => warn!("skip shared folder: {err}"),
                            MissingGroupPolicy::Fail => return Err(err.into()),
                        }
                    }
                }
            }
        }

        if pending.is_empty() {
            return Ok(Plan { actions });
        }

        // INVARIANT: Ancestors exist and are owned correctly before any group
        // directory gets created below them.
        let teachers_gid = groups.gid(&settings.teachers)?;
        actions.push(Action::EnsureDir {
            dir: settings.share_dir.clone(),
            mode: SHARE_DIR_MODE,
            uid: settings.adm_uid,
            gid: settings.adm_gid,
        });
        actions.push(Action::EnsureDir {
            dir: settings.symlinks_dir(),
            mode: SYMLINKS_MODE,
            uid: settings.adm_uid,
            gid: teachers_gid,
        });

        for (group, gid) in pending {
            let dir = settings.group_dir(&group);
            actions.push(Action::EnsureDir {
                dir: dir.clone(),
                mode: GROUP_DIR_MODE,
                uid: settings.adm_uid,
                gid,
            });
            actions.push(Action::BindMount {
                dir,
                uid: settings.adm_uid,
                gid,
            });
        }

        if settings.disable_nfs_exports {
            debug!("NFS exports are disabled");
        } else {
            actions.push(Action::WriteExports {
                file: self.exporter.exports_file().to_path_buf(),
                share_dir: settings.share_dir.clone(),
            });
            actions.push(Action::ReloadExports);
        }

        Ok(Plan { actions })
    }

    /// Compute actions that unmount shared folders of the working set.
    ///
    /// Directories and their contents are left in place.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Mount`] if mount table cannot be parsed.
    #[instrument(skip(self, mounts), level = "debug")]
    pub fn plan_unmount(&self, candidates: Option<&[String]>, mounts: &MountTable) -> Result<Plan> {
        let working_set = self.working_set(candidates);
        let mounted = self.mounted_groups(&working_set, mounts)?;
        let actions = working_set
            .iter()
            .filter(|group| mounted.contains(group.as_str()))
            .map(|group| Action::Unmount {
                dir: self.settings.group_dir(group),
            })
            .collect();

        Ok(Plan { actions })
    }

    /// Compute actions that unmount and delete shared folders of target
    /// groups.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Mount`] if mount table cannot be parsed.
    #[instrument(skip(self, mounts), level = "debug")]
    pub fn plan_remove(&self, candidates: &[String], mounts: &MountTable) -> Result<Plan> {
        let working_set = self.working_set(Some(candidates));
        let mounted = self.mounted_groups(&working_set, mounts)?;
        let mut actions = Vec::new();
        for group in &working_set {
            let dir = self.settings.group_dir(group);
            if mounted.contains(group.as_str()) {
                actions.push(Action::Unmount { dir: dir.clone() });
            }
            actions.push(Action::RemoveDir { dir });
        }

        Ok(Plan { actions })
    }

    /// Apply every action of target plan in order.
    ///
    /// Under [`FailurePolicy::Continue`] a failed action is logged and
    /// recorded, and later actions on the same directory or below it (or on
    /// the NFS exports) are skipped.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Action`] on the first failed action under
    ///   [`FailurePolicy::Abort`].
    #[instrument(skip(self, plan), level = "debug")]
    pub fn apply(&self, plan: &Plan) -> Result<Report> {
        let mut report = Report::default();
        let mut broken: Vec<Target<'_>> = Vec::new();
        for action in &plan.actions {
            let target = action.target();
            if broken.iter().any(|failed| target.depends_on(failed)) {
                warn!("skip {action}: earlier action it depends on failed");
                report.skipped.push(action.clone());
                continue;
            }

            info!("{action}");
            match self.perform(action) {
                Ok(()) => report.applied.push(action.clone()),
                Err(err) => match self.failure_policy {
                    FailurePolicy::Abort => {
                        return Err(EngineError::Action {
                            source: err,
                            action: Box::new(action.clone()),
                        })
                    }
                    FailurePolicy::Continue => {
                        warn!("failed to {action}: {err}");
                        broken.push(target);
                        report.failed.push(Failure {
                            action: action.clone(),
                            error: err.to_string(),
                        });
                    }
                },
            }
        }

        Ok(report)
    }

    /// Mount or remount shared folders of the working set.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError`] if planning fails, or if applying fails under
    ///   [`FailurePolicy::Abort`].
    pub fn mount(
        &self,
        candidates: Option<&[String]>,
        groups: &GroupDirectory,
        mounts: &MountTable,
    ) -> Result<Report> {
        let plan = self.reconcile(candidates, groups, mounts)?;
        if plan.is_empty() {
            info!("shared folders are up to date");
        }

        self.apply(&plan)
    }

    /// Unmount shared folders of the working set.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError`] if planning fails, or if applying fails under
    ///   [`FailurePolicy::Abort`].
    pub fn unmount(&self, candidates: Option<&[String]>, mounts: &MountTable) -> Result<Report> {
        self.apply(&self.plan_unmount(candidates, mounts)?)
    }

    /// Unmount and delete shared folders of target groups.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError`] if planning fails, or if applying fails under
    ///   [`FailurePolicy::Abort`].
    pub fn remove(&self, candidates: &[String], mounts: &MountTable) -> Result<Report> {
        self.apply(&self.plan_remove(candidates, mounts)?)
    }

    fn perform(&self, action: &Action) -> Result<(), HostError> {
        match action {
            Action::Unmount { dir } => {
                self.host.run("umount", &[dir.as_os_str().to_os_string()])?;
            }
            Action::EnsureDir {
                dir,
                mode,
                uid,
                gid,
            } => self.host.ensure_dir(dir, *mode, *uid, *gid)?,
            Action::BindMount { dir, uid, gid } => {
                self.host.run("bindfs", &bindfs_args(dir, *uid, *gid))?;
            }
            Action::WriteExports { share_dir, .. } => {
                self.exporter.write_definitions(&self.host, share_dir)?
            }
            Action::ReloadExports => self.exporter.reload(&self.host)?,
            Action::RemoveDir { dir } => self.host.remove_dir(dir)?,
        }

        Ok(())
    }

    fn mounted_groups(
        &self,
        working_set: &[String],
        mounts: &MountTable,
    ) -> Result<HashSet<String>> {
        let mut mounted = HashSet::new();
        for record in mounts.current_mounts(&self.settings.share_dir)? {
            let record = record?;
            if working_set.contains(&record.group) {
                mounted.insert(record.group);
            }
        }

        Ok(mounted)
    }
}

fn bindfs_args(dir: &Path, uid: u32, gid: u32) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-u".into(),
        uid.to_string().into(),
        format!("--create-for-user={uid}").into(),
        "-g".into(),
        gid.to_string().into(),
        format!("--create-for-group={gid}").into(),
        "-p".into(),
        "770,af-x".into(),
        "--chown-deny".into(),
        "--chgrp-deny".into(),
        "--chmod-deny".into(),
    ];
    args.push(dir.into());
    args.push(dir.into());
    args
}

fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Reconciliation error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Group lookup fails.
    #[error(transparent)]
    Lookup(#[from] crate::group::LookupError),

    /// Mount table cannot be read or parsed.
    #[error(transparent)]
    Mount(#[from] crate::mounts::MountError),

    /// Applying an action fails.
    #[error("failed to {action}")]
    Action {
        #[source]
        source: HostError,
        action: Box<Action>,
    },
}

/// Friendly result alias :3
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

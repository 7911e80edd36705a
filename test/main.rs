// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use shared_folders::{
    config::ConfigStore,
    engine::{Action, FailurePolicy, ReconciliationEngine},
    exports::NfsExporter,
    group::GroupDirectory,
    host::{CommandError, Host, HostError, LocalHost, Result as HostResult},
    mounts::MountTable,
};

use anyhow::Result;
use indoc::formatdoc;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{
    cell::RefCell,
    env::current_dir,
    ffi::OsString,
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

/// Host that touches the file system for real, but only records commands.
#[derive(Debug, Default)]
pub(crate) struct HostFixture {
    local: LocalHost,
    commands: RefCell<Vec<String>>,
    failing: Option<String>,
}

impl HostFixture {
    pub(crate) fn failing(program: impl Into<String>) -> Self {
        Self {
            failing: Some(program.into()),
            ..Default::default()
        }
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl Host for HostFixture {
    fn ensure_dir(&self, dir: &Path, mode: u32, uid: u32, gid: u32) -> HostResult<()> {
        self.local.ensure_dir(dir, mode, uid, gid)
    }

    fn remove_dir(&self, dir: &Path) -> HostResult<()> {
        self.local.remove_dir(dir)
    }

    fn write_file(&self, path: &Path, contents: &str) -> HostResult<()> {
        self.local.write_file(path, contents)
    }

    fn run(&self, program: &str, args: &[OsString]) -> HostResult<String> {
        let mut command = vec![program.to_string()];
        command.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        self.commands.borrow_mut().push(command.join(" "));

        if self.failing.as_deref() == Some(program) {
            return Err(HostError::Command(CommandError::Failed {
                program: program.into(),
                status: Some(1),
                message: "stderr: injected".into(),
            }));
        }

        Ok(String::new())
    }
}

/// Lab layout in the current directory, owned by the current user.
pub(crate) struct LabFixture {
    root: PathBuf,
    uid: u32,
    gid: u32,
}

impl LabFixture {
    pub(crate) fn new(config: &str) -> Result<Self> {
        let root = current_dir()?;
        let meta = fs::metadata(&root)?;
        let lab = Self {
            root,
            uid: meta.uid(),
            gid: meta.gid(),
        };

        // INVARIANT: Every group maps to our own gid, chown must work
        // without privileges.
        fs::write(
            "shared-folders",
            formatdoc! {r#"
                # Shared folders of the lab.
                SHARE_DIR={share_dir}
                ADM_UID={uid}
                ADM_GID={gid}
                {config}
            "#,
                share_dir = lab.share_dir().display(),
                uid = lab.uid,
                gid = lab.gid,
            },
        )?;
        fs::write(
            "group",
            formatdoc! {r#"
                root:x:0:
                teachers:x:{gid}:alice
                students:x:{gid}:bob
                ghost:x::
            "#,
                gid = lab.gid,
            },
        )?;
        fs::write("mounts", "")?;

        Ok(lab)
    }

    pub(crate) fn share_dir(&self) -> PathBuf {
        self.root.join("Shared")
    }

    pub(crate) fn exports_file(&self) -> PathBuf {
        self.root.join("exports.d").join("shared-folders.exports")
    }

    pub(crate) fn engine(&self, host: HostFixture) -> Result<ReconciliationEngine<HostFixture>> {
        let settings = ConfigStore::new("shared-folders").load()?.settings()?;
        let exporter = NfsExporter::new(self.exports_file());
        Ok(ReconciliationEngine::new(settings, host).with_exporter(exporter))
    }

    pub(crate) fn groups(&self) -> Result<GroupDirectory> {
        Ok(GroupDirectory::load_from("group")?)
    }

    pub(crate) fn mount_table(&self) -> MountTable {
        MountTable::from_path("mounts")
    }

    pub(crate) fn set_mounted(&self, mounted: &[(&str, u32)]) -> Result<()> {
        let mut contents = String::from("proc /proc proc rw,nosuid 0 0\n");
        for (group, gid) in mounted {
            let dir = self.share_dir().join(group);
            contents.push_str(&format!(
                "{dir} {dir} fuse rw,nosuid,nodev,default_permissions,gid={gid} 0 0\n",
                dir = dir.display()
            ));
        }
        fs::write("mounts", contents)?;

        Ok(())
    }

    pub(crate) fn bindfs(&self, group: &str) -> String {
        let dir = self.share_dir().join(group);
        format!(
            "bindfs -u {uid} --create-for-user={uid} -g {gid} --create-for-group={gid} \
             -p 770,af-x --chown-deny --chgrp-deny --chmod-deny {dir} {dir}",
            uid = self.uid,
            gid = self.gid,
            dir = dir.display()
        )
    }
}

fn mode_of(path: impl AsRef<Path>) -> Result<u32> {
    Ok(fs::metadata(path)?.mode() & 0o7777)
}

#[sealed_test]
fn mount_provisions_fresh_lab() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS='teachers students'")?;
    let engine = lab.engine(HostFixture::default())?;
    let report = engine.mount(None, &lab.groups()?, &lab.mount_table())?;
    assert!(report.is_success());

    assert_eq!(mode_of(lab.share_dir())?, 0o711);
    assert_eq!(mode_of(lab.share_dir().join(".symlinks"))?, 0o731);
    assert_eq!(mode_of(lab.share_dir().join("teachers"))?, 0o770);
    assert_eq!(mode_of(lab.share_dir().join("students"))?, 0o770);

    let share_dir = lab.share_dir();
    let expect = formatdoc! {r#"
        {share}/ *(ro,async,no_subtree_check,insecure)
        {share}/* *(rw,async,no_subtree_check,insecure)
    "#,
        share = share_dir.display(),
    };
    assert_eq!(fs::read_to_string(lab.exports_file())?, expect);

    let expect = vec![
        lab.bindfs("teachers"),
        lab.bindfs("students"),
        "exportfs -a".to_string(),
    ];
    assert_eq!(engine.host().commands(), expect);

    Ok(())
}

#[sealed_test]
fn mount_twice_changes_nothing() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS='teachers students'")?;
    lab.engine(HostFixture::default())?
        .mount(None, &lab.groups()?, &lab.mount_table())?;
    lab.set_mounted(&[("teachers", lab.gid), ("students", lab.gid)])?;

    let engine = lab.engine(HostFixture::default())?;
    let plan = engine.reconcile(None, &lab.groups()?, &lab.mount_table())?;
    assert!(plan.is_empty());

    let report = engine.mount(None, &lab.groups()?, &lab.mount_table())?;
    assert!(report.applied.is_empty());
    assert!(engine.host().commands().is_empty());

    Ok(())
}

#[sealed_test]
fn stale_gid_is_remounted() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS='teachers students' DISABLE_NFS_EXPORTS=true")?;
    lab.set_mounted(&[("teachers", lab.gid), ("students", lab.gid + 1)])?;

    let engine = lab.engine(HostFixture::default())?;
    engine.mount(None, &lab.groups()?, &lab.mount_table())?;
    let expect = vec![
        format!("umount {}", lab.share_dir().join("students").display()),
        lab.bindfs("students"),
    ];
    assert_eq!(engine.host().commands(), expect);
    assert!(!lab.exports_file().exists());

    Ok(())
}

#[sealed_test]
fn share_root_mode_ignores_restrict_dirs() -> Result<()> {
    let lab = LabFixture::new("RESTRICT_DIRS=false")?;
    lab.engine(HostFixture::default())?
        .mount(None, &lab.groups()?, &lab.mount_table())?;
    assert_eq!(mode_of(lab.share_dir())?, 0o711);

    Ok(())
}

#[sealed_test]
fn disabled_shared_folders_leave_lab_alone() -> Result<()> {
    let lab = LabFixture::new("DISABLE_SHARED_FOLDERS=true")?;
    let engine = lab.engine(HostFixture::default())?;
    engine.mount(None, &lab.groups()?, &lab.mount_table())?;
    assert!(!lab.share_dir().exists());
    assert!(engine.host().commands().is_empty());

    Ok(())
}

#[sealed_test]
fn unlisted_folders_survive_a_pass() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS=teachers")?;
    let stray = lab.share_dir().join("old-class");
    fs::create_dir_all(&stray)?;
    fs::write(stray.join("homework.txt"), "keep me\n")?;
    lab.set_mounted(&[("old-class", 4242)])?;

    let engine = lab.engine(HostFixture::default())?;
    engine.mount(None, &lab.groups()?, &lab.mount_table())?;
    assert_eq!(fs::read_to_string(stray.join("homework.txt"))?, "keep me\n");
    assert!(!engine
        .host()
        .commands()
        .iter()
        .any(|command| command.contains("old-class")));

    Ok(())
}

#[sealed_test]
fn missing_group_policy_from_config() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS='ghost students' MISSING_GROUPS=fail")?;
    let engine = lab.engine(HostFixture::default())?;
    assert!(engine
        .mount(None, &lab.groups()?, &lab.mount_table())
        .is_err());
    assert!(!lab.share_dir().exists());

    let lab = LabFixture::new("SHARE_GROUPS='ghost students'")?;
    let engine = lab.engine(HostFixture::default())?;
    let report = engine.mount(None, &lab.groups()?, &lab.mount_table())?;
    assert!(report.is_success());
    assert!(lab.share_dir().join("students").exists());
    assert!(!lab.share_dir().join("ghost").exists());

    Ok(())
}

#[sealed_test]
fn failed_bind_mount_is_reported() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS='teachers students'")?;
    let engine = lab.engine(HostFixture::failing("bindfs"))?;
    let report = engine.mount(None, &lab.groups()?, &lab.mount_table())?;
    assert_eq!(report.failed.len(), 2);
    assert!(report.applied.contains(&Action::ReloadExports));

    let engine = lab
        .engine(HostFixture::failing("bindfs"))?
        .with_failure_policy(FailurePolicy::Abort);
    assert!(engine
        .mount(None, &lab.groups()?, &lab.mount_table())
        .is_err());
    assert_eq!(engine.host().commands(), vec![lab.bindfs("teachers")]);

    Ok(())
}

#[sealed_test]
fn remove_deletes_group_folder() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS='teachers students'")?;
    lab.engine(HostFixture::default())?
        .mount(None, &lab.groups()?, &lab.mount_table())?;
    fs::write(lab.share_dir().join("students").join("notes.txt"), "bye\n")?;
    lab.set_mounted(&[("teachers", lab.gid), ("students", lab.gid)])?;

    let engine = lab.engine(HostFixture::default())?;
    let report = engine.remove(&["students".to_string()], &lab.mount_table())?;
    assert!(report.is_success());
    assert!(!lab.share_dir().join("students").exists());
    assert!(lab.share_dir().join("teachers").exists());
    assert_eq!(
        engine.host().commands(),
        vec![format!(
            "umount {}",
            lab.share_dir().join("students").display()
        )]
    );

    Ok(())
}

#[sealed_test]
fn unmount_keeps_contents() -> Result<()> {
    let lab = LabFixture::new("SHARE_GROUPS='teachers students'")?;
    lab.set_mounted(&[("teachers", lab.gid)])?;

    let engine = lab.engine(HostFixture::default())?;
    let report = engine.unmount(None, &lab.mount_table())?;
    assert_eq!(
        report.applied,
        vec![Action::Unmount {
            dir: lab.share_dir().join("teachers"),
        }]
    );

    Ok(())
}

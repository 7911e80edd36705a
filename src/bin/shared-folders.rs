// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use shared_folders::{
    config::{ConfigStore, MissingGroupPolicy, DEFAULT_CONFIG_FILE},
    engine::{FailurePolicy, Report, ReconciliationEngine, StatusReport},
    exports::NfsExporter,
    group::{GroupDirectory, DEFAULT_GROUP_FILE},
    host::LocalHost,
    mounts::{MountTable, DEFAULT_MOUNTS_FILE},
};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use inquire::Confirm;
use std::{path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "shared-folders [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub sources: Sources,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let sources = self.sources;
        match self.command {
            Command::Mount(opts) => run_mount(sources, opts),
            Command::Unmount(opts) => run_unmount(sources, opts),
            Command::Remove(opts) => run_remove(sources, opts),
            Command::Status(opts) => run_status(sources, opts),
            Command::Exports(opts) => run_exports(sources, opts),
            Command::Config => run_config(sources),
        }
    }
}

#[derive(Debug, Clone, Args)]
struct Sources {
    /// Path to configuration file.
    #[arg(long, global = true, value_name = "path", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Path to group database.
    #[arg(long, global = true, value_name = "path", default_value = DEFAULT_GROUP_FILE)]
    pub group_file: PathBuf,

    /// Path to mount table.
    #[arg(long, global = true, value_name = "path", default_value = DEFAULT_MOUNTS_FILE)]
    pub mounts: PathBuf,
}

impl Sources {
    fn engine(&self) -> Result<ReconciliationEngine> {
        let settings = ConfigStore::new(&self.config).load()?.settings()?;
        Ok(ReconciliationEngine::new(settings, LocalHost::new()))
    }

    fn groups(&self) -> Result<GroupDirectory> {
        Ok(GroupDirectory::load_from(&self.group_file)?)
    }

    fn mount_table(&self) -> MountTable {
        MountTable::from_path(&self.mounts)
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Create and mount shared folders, remounting those with a stale gid.
    #[command(override_usage = "shared-folders mount [options] [<group>]...")]
    Mount(MountOptions),

    /// Unmount shared folders, leaving their contents in place.
    #[command(override_usage = "shared-folders unmount [options] [<group>]...")]
    Unmount(UnmountOptions),

    /// Unmount and delete shared folders of removed groups.
    #[command(override_usage = "shared-folders remove [options] <group>...")]
    Remove(RemoveOptions),

    /// Show state of each shared folder.
    #[command(override_usage = "shared-folders status [options] [<group>]...")]
    Status(StatusOptions),

    /// Write NFS export definitions and reload NFS exports.
    #[command(override_usage = "shared-folders exports [options]")]
    Exports(ExportsOptions),

    /// Print effective configuration.
    #[command(override_usage = "shared-folders config")]
    Config,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MountOptions {
    /// Groups to mount instead of configured share groups.
    #[arg(value_name = "group")]
    pub groups: Vec<String>,

    /// Print planned actions without applying them.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Stop at the first failed action.
    #[arg(long)]
    pub fail_fast: bool,

    /// What to do with groups that do not exist.
    #[arg(long, value_name = "skip|fail")]
    pub missing_groups: Option<MissingGroupPolicy>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UnmountOptions {
    /// Groups to unmount instead of configured share groups.
    #[arg(value_name = "group")]
    pub groups: Vec<String>,

    /// Stop at the first failed action.
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoveOptions {
    /// Groups whose shared folders get deleted.
    #[arg(required = true, value_name = "group")]
    pub groups: Vec<String>,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,

    /// Stop at the first failed action.
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Groups to show instead of configured share groups.
    #[arg(value_name = "group")]
    pub groups: Vec<String>,

    /// Print status as TOML.
    #[arg(long)]
    pub toml: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ExportsOptions {
    /// Print export definitions without writing them.
    #[arg(short, long)]
    pub print: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = Cli::parse().run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn failure_policy(fail_fast: bool) -> FailurePolicy {
    if fail_fast {
        FailurePolicy::Abort
    } else {
        FailurePolicy::Continue
    }
}

fn candidates(groups: &[String]) -> Option<&[String]> {
    if groups.is_empty() {
        None
    } else {
        Some(groups)
    }
}

fn check_report(report: Report) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }

    Err(anyhow!(
        "{} action(s) failed, {} skipped",
        report.failed.len(),
        report.skipped.len()
    ))
}

fn run_mount(sources: Sources, opts: MountOptions) -> Result<()> {
    let mut engine = sources
        .engine()?
        .with_failure_policy(failure_policy(opts.fail_fast));
    if let Some(policy) = opts.missing_groups {
        engine = engine.with_missing_group_policy(policy);
    }

    let groups = sources.groups()?;
    let mounts = sources.mount_table();
    if opts.dry_run {
        let plan = engine.reconcile(candidates(&opts.groups), &groups, &mounts)?;
        print!("{plan}");
        return Ok(());
    }

    check_report(engine.mount(candidates(&opts.groups), &groups, &mounts)?)
}

fn run_unmount(sources: Sources, opts: UnmountOptions) -> Result<()> {
    let engine = sources
        .engine()?
        .with_failure_policy(failure_policy(opts.fail_fast));
    check_report(engine.unmount(candidates(&opts.groups), &sources.mount_table())?)
}

fn run_remove(sources: Sources, opts: RemoveOptions) -> Result<()> {
    let engine = sources
        .engine()?
        .with_failure_policy(failure_policy(opts.fail_fast));
    let plan = engine.plan_remove(&opts.groups, &sources.mount_table())?;
    if plan.is_empty() {
        info!("nothing to remove");
        return Ok(());
    }

    if !opts.yes {
        print!("{plan}");
        let confirmed = Confirm::new("Delete these shared folders and all their files?")
            .with_default(false)
            .prompt()?;
        if !confirmed {
            warn!("removal cancelled");
            return Ok(());
        }
    }

    check_report(engine.apply(&plan)?)
}

fn run_status(sources: Sources, opts: StatusOptions) -> Result<()> {
    let engine = sources.engine()?;
    let groups = engine.status(
        candidates(&opts.groups),
        &sources.groups()?,
        &sources.mount_table(),
    )?;

    if opts.toml {
        print!("{}", toml::to_string_pretty(&StatusReport { groups })?);
    } else {
        for status in groups {
            println!("{status}");
        }
    }

    Ok(())
}

fn run_exports(sources: Sources, opts: ExportsOptions) -> Result<()> {
    let engine = sources.engine()?;
    let settings = engine.settings();
    if opts.print {
        print!("{}", NfsExporter::render(&settings.share_dir));
        return Ok(());
    }

    if settings.disable_nfs_exports {
        warn!("NFS exports are disabled");
        return Ok(());
    }

    engine
        .exporter()
        .write_exports(engine.host(), &settings.share_dir)?;

    Ok(())
}

fn run_config(sources: Sources) -> Result<()> {
    let config = ConfigStore::new(&sources.config).load()?;
    print!("{config}");

    Ok(())
}

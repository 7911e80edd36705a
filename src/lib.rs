// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shared folders for groups of users.
//!
//! A __shared folder__ is a directory below the share root that every member
//! of one group can read and write, e.g., `/home/Shared/teachers`. Each one
//! is bind mounted onto itself through bindfs, so that new files always
//! belong to the administrator and the group regardless of who created them.
//! Thin clients then reach the share root over NFS.
//!
//! The crate is split along the things a reconciliation pass needs to know:
//!
//! - [`config`]: administrator settings in shell assignment syntax.
//! - [`group`]: snapshot of the group database.
//! - [`mounts`]: live mount table.
//! - [`exports`]: NFS export definitions.
//! - [`host`]: side effects on the local system.
//! - [`engine`]: comparison of desired and observed state, and the plan that
//!   closes the gap.

pub mod config;
pub mod engine;
pub mod exports;
pub mod group;
pub mod host;
pub mod mounts;

pub use config::{ConfigStore, Configuration, MissingGroupPolicy, Settings};
pub use engine::{
    Action, FailurePolicy, GroupState, GroupStatus, Plan, ReconciliationEngine, Report,
};
pub use exports::NfsExporter;
pub use group::{Group, GroupDirectory};
pub use host::{Host, LocalHost};
pub use mounts::{MountRecord, MountTable};

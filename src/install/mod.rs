// src/install/mod.rs

//! Installing specs into the install root
//!
//! [`installer::PackageInstaller`] builds a [`graph::BuildGraph`] of what is
//! missing, then runs one worker process per build under a shared
//! [`jobserver::JobServer`] budget, recording results in the
//! [`database::Database`].

pub mod database;
pub mod graph;
pub mod installer;
pub mod jobserver;
pub mod lock;
pub mod protocol;
pub mod status;
pub mod worker;

pub use database::{Database, InstallRecord, InstalledSet};
pub use graph::{BuildGraph, GraphOptions};
pub use installer::{BuildOutcome, BuildRecord, InstallReport, InstallerOptions, PackageInstaller};
pub use jobserver::JobServer;
pub use worker::{BuildSource, WorkerRequest};

// src/lib.rs

//! Strata package manager
//!
//! Installs concrete specs for scientific software stacks, from source or
//! from binary build caches.
//!
//! # Architecture
//!
//! - Buildcache: content-addressed blobs behind (optionally clearsigned)
//!   JSON manifests on any URL-addressable store, with migration from the
//!   legacy layout, pruning and mirror-to-mirror sync
//! - Installer: one worker process per build, scheduled from a single
//!   event loop under a GNU make compatible jobserver
//! - Installed packages are tracked in a SQLite database under the
//!   install root

pub mod buildcache;
pub mod config;
mod error;
pub mod hash;
pub mod install;
pub mod mirror;
pub mod signing;
pub mod spec;
pub mod web;

pub use config::{Config, InstallPolicy, MirrorConfig};
pub use error::{Error, Result};
pub use mirror::Mirror;
pub use spec::{DepTypes, Spec, SpecBuilder, SpecDocument};

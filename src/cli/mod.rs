// src/cli/mod.rs
//! CLI definitions for strata
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations live in the `commands` module.
//!
//! - `install` - Install concrete specs, from a buildcache or from source
//! - `buildcache` - Push, list, check, migrate, prune and sync mirrors
//! - `gpg` - Manage the keyring used to sign and verify manifests

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod buildcache;
mod gpg;

pub use buildcache::BuildcacheCommands;
pub use gpg::GpgCommands;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Install scientific software stacks from source or binary caches", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file (default: $STRATA_CONFIG or ~/.config/strata/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install concrete specs and their dependencies
    Install {
        /// Concrete spec files (JSON)
        #[arg(required = true)]
        specs: Vec<PathBuf>,

        /// Number of concurrent builds
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Only install from the buildcache
        #[arg(long, conflicts_with = "source_only")]
        cache_only: bool,

        /// Never use the buildcache
        #[arg(long)]
        source_only: bool,

        /// Install only the requested specs or only their dependencies
        #[arg(long, value_parser = ["package", "dependencies"])]
        only: Option<String>,

        /// Reinstall requested specs that are already installed
        #[arg(long)]
        overwrite: bool,

        /// Stop starting builds after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Accept unsigned buildcache entries
        #[arg(long)]
        no_check_signature: bool,
    },

    /// Binary buildcache operations
    #[command(subcommand)]
    Buildcache(BuildcacheCommands),

    /// Signing key management
    #[command(subcommand)]
    Gpg(GpgCommands),

    /// Build one spec as a child of `install` (internal)
    #[command(name = "__build-worker", hide = true)]
    BuildWorker {
        /// Request file written by the parent
        request: PathBuf,
    },
}

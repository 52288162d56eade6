// src/cli/buildcache.rs
//! Buildcache commands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum BuildcacheCommands {
    /// Push installed specs and their link/run dependencies to a mirror
    Push {
        /// Mirror name or URL
        mirror: String,

        /// DAG hashes (or unique prefixes) of installed specs
        #[arg(required = true)]
        hashes: Vec<String>,

        /// Overwrite entries already on the mirror
        #[arg(short, long)]
        force: bool,

        /// Fingerprint of the signing key
        #[arg(short, long)]
        key: Option<String>,

        /// Push without signing
        #[arg(long, conflicts_with = "key")]
        unsigned: bool,

        /// Stop at the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Regenerate the mirror index afterwards
        #[arg(long)]
        update_index: bool,
    },

    /// List specs available from mirror indexes
    List {
        /// Include specs built for other architectures
        #[arg(short, long)]
        allarch: bool,

        /// Only this mirror (name or URL)
        #[arg(long)]
        mirror: Option<String>,
    },

    /// Exit non-zero when any spec needs to be rebuilt
    Check {
        /// Concrete spec files (JSON)
        #[arg(required = true)]
        specs: Vec<PathBuf>,

        /// Only this mirror (name or URL)
        #[arg(long)]
        mirror: Option<String>,
    },

    /// Regenerate a mirror's index from its spec manifests
    UpdateIndex {
        /// Mirror name or URL
        mirror: String,

        /// Fingerprint of the signing key (unsigned when none is available)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// List, or install and trust, the keys a mirror publishes
    Keys {
        /// Download the keys
        #[arg(short, long)]
        install: bool,

        /// Trust the downloaded keys
        #[arg(short, long, requires = "install")]
        trust: bool,

        /// Only this mirror (name or URL)
        #[arg(long)]
        mirror: Option<String>,
    },

    /// Convert a mirror from the legacy layout to the current one
    Migrate {
        /// Mirror name or URL
        mirror: String,

        /// Write unsigned manifests
        #[arg(short, long)]
        unsigned: bool,

        /// Delete the legacy layout after a fully successful migration
        #[arg(short, long)]
        delete_existing: bool,

        /// Do not ask before deleting
        #[arg(short, long)]
        yes_to_all: bool,

        /// Fingerprint of the signing key
        #[arg(short, long, conflicts_with = "unsigned")]
        key: Option<String>,
    },

    /// Delete unreferenced or unwanted entries from a mirror
    Prune {
        /// Mirror name or URL
        mirror: String,

        /// File of DAG hashes to keep; everything else is deleted
        #[arg(short, long)]
        keeplist: Option<PathBuf>,

        /// Report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Copy entries between mirrors
    Sync {
        /// Source mirror name or URL
        #[arg(requires = "dest", conflicts_with = "manifest_glob")]
        src: Option<String>,

        /// Destination mirror name or URL
        dest: Option<String>,

        /// Glob over copy manifests ({"src": url, "dest": url} pairs)
        #[arg(long)]
        manifest_glob: Option<String>,
    },
}

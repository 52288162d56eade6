// src/commands/mod.rs
//! Command handlers for the strata CLI

mod buildcache;
mod gpg;
mod install;
mod worker;

pub use buildcache::{
    cmd_buildcache_check, cmd_buildcache_keys, cmd_buildcache_list, cmd_buildcache_migrate,
    cmd_buildcache_prune, cmd_buildcache_push, cmd_buildcache_sync, cmd_buildcache_update_index,
};
pub use gpg::{cmd_gpg_create, cmd_gpg_export, cmd_gpg_list, cmd_gpg_trust};
pub use install::cmd_install;
pub use worker::cmd_build_worker;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use strata::signing::Keyring;
use strata::{Config, Spec};

/// Load `path` when given, else the default configuration
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load()?,
    };
    Ok(config)
}

fn open_keyring(config: &Config) -> Result<Keyring> {
    Keyring::new(&config.keyring_dir).with_context(|| {
        format!(
            "Failed to open keyring at {}",
            config.keyring_dir.display()
        )
    })
}

/// Read concrete spec files
fn read_spec_files(paths: &[PathBuf]) -> Result<Vec<Spec>> {
    paths
        .iter()
        .map(|path| {
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Spec::from_json(&data).with_context(|| format!("Invalid spec file {}", path.display()))
        })
        .collect()
}

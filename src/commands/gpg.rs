// src/commands/gpg.rs
//! Keyring commands

use super::open_keyring;
use anyhow::{Context, Result};
use std::path::Path;
use strata::Config;
use tracing::info;

/// Trust the public key in `keyfile`
pub fn cmd_gpg_trust(config: &Config, keyfile: &Path) -> Result<()> {
    let keyring = open_keyring(config)?;
    let fingerprint = keyring
        .trust(keyfile)
        .with_context(|| format!("Failed to import {}", keyfile.display()))?;
    println!("Trusted key {}", fingerprint);
    Ok(())
}

/// List trusted keys
pub fn cmd_gpg_list(config: &Config) -> Result<()> {
    let keyring = open_keyring(config)?;
    let keys = keyring.list()?;
    if keys.is_empty() {
        println!("No keys in {}", keyring.dir().display());
        return Ok(());
    }
    for key in keys {
        let mark = if key.can_sign { "sec" } else { "pub" };
        println!("{}  {}", mark, key.fingerprint);
        for uid in &key.user_ids {
            println!("      {}", uid);
        }
    }
    Ok(())
}

/// Create a signing key
pub fn cmd_gpg_create(config: &Config, name: &str, email: &str) -> Result<()> {
    info!("Creating signing key for {} <{}>", name, email);
    let keyring = open_keyring(config)?;
    let fingerprint = keyring.create_key(name, email)?;
    println!("Created signing key {}", fingerprint);
    Ok(())
}

/// Write the armored public key for `fingerprint` to `file`
pub fn cmd_gpg_export(config: &Config, fingerprint: &str, file: &Path) -> Result<()> {
    let keyring = open_keyring(config)?;
    let armored = keyring.export_public(fingerprint)?;
    std::fs::write(file, armored)
        .with_context(|| format!("Failed to write {}", file.display()))?;
    println!("Exported {} to {}", fingerprint, file.display());
    Ok(())
}

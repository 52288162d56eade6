// src/commands/buildcache.rs
//! Buildcache commands

use super::{open_keyring, read_spec_files};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use strata::buildcache::index::{self, BinaryIndex};
use strata::buildcache::migrate::{self, MigrateOptions};
use strata::buildcache::push::{self, PushOptions};
use strata::buildcache::{check, keys, prune, sync};
use strata::install::Database;
use strata::signing::ManifestSigner;
use strata::{Config, Mirror, Spec};
use tracing::{info, warn};

fn selected_mirrors(config: &Config, mirror: Option<&str>) -> Result<Vec<Mirror>> {
    let mirrors = match mirror {
        Some(name) => vec![config.mirror(name)],
        None => config.mirrors(),
    };
    if mirrors.is_empty() {
        anyhow::bail!("No mirrors configured; add one to the configuration or pass --mirror");
    }
    Ok(mirrors)
}

/// Resolve full or abbreviated DAG hashes against the install database
fn resolve_installed(db: &Database, hashes: &[String]) -> Result<Vec<Spec>> {
    let records = db.all()?;
    let mut specs = Vec::new();
    for wanted in hashes {
        let matches: Vec<_> = records.iter().filter(|r| r.hash.starts_with(wanted.as_str())).collect();
        match matches.as_slice() {
            [] => anyhow::bail!("No installed spec matches hash '{}'", wanted),
            [record] => specs.push(record.spec()?),
            _ => anyhow::bail!(
                "Hash '{}' is ambiguous: {}",
                wanted,
                matches
                    .iter()
                    .map(|r| format!("{}/{}", r.name, &r.hash[..7]))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
    Ok(specs)
}

/// Push installed specs to a mirror
pub fn cmd_buildcache_push(
    config: &Config,
    mirror: &str,
    hashes: &[String],
    options: PushOptions,
) -> Result<()> {
    let mirror = config.mirror(mirror);
    let db = Database::open(&config.database_path())?;
    let keyring = open_keyring(config)?;
    let specs = resolve_installed(&db, hashes)?;
    info!("Pushing {} specs to {}", specs.len(), mirror);

    let result = push::push(&specs, &mirror, &db, &keyring, &options)?;
    for spec in &result.pushed {
        println!("Pushed {}", spec.cformat());
    }
    for spec in &result.skipped {
        println!("Skipped {} (already on the mirror, use --force to overwrite)", spec.cformat());
    }
    for (spec, error) in &result.failed {
        eprintln!("Failed to push {}: {}", spec.cformat(), error);
    }
    if !result.failed.is_empty() {
        anyhow::bail!("{} specs failed to push to {}", result.failed.len(), mirror);
    }
    Ok(())
}

/// List specs available from mirror indexes
pub fn cmd_buildcache_list(config: &Config, allarch: bool, mirror: Option<&str>) -> Result<()> {
    let mirrors = selected_mirrors(config, mirror)?;
    let keyring = open_keyring(config)?;
    let index = BinaryIndex::new(mirrors, Some(&keyring), true);

    let mut listed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (mirror, spec) in index.all_specs() {
        if !allarch && !spec.arch().matches_host() {
            continue;
        }
        let label = format!("{} {} [{}]", spec.short_hash(), spec.cformat(), spec.os_arch());
        listed.entry(label).or_default().push(mirror.name().to_string());
    }

    if listed.is_empty() {
        println!("No specs found");
        return Ok(());
    }
    println!("{} specs:", listed.len());
    for (label, mirrors) in listed {
        println!("  {} ({})", label, mirrors.join(", "));
    }
    Ok(())
}

/// Exit status 1 when any spec needs rebuilding
pub fn cmd_buildcache_check(
    config: &Config,
    spec_files: &[PathBuf],
    mirror: Option<&str>,
) -> Result<()> {
    let specs = read_spec_files(spec_files)?;
    let mirrors = selected_mirrors(config, mirror)?;
    let keyring = open_keyring(config)?;
    let index = BinaryIndex::new(mirrors, Some(&keyring), config.unsigned);

    let missing = check::specs_needing_rebuild(&specs, &index);
    if missing.is_empty() {
        println!("No specs need to be rebuilt");
        return Ok(());
    }
    for spec in &missing {
        println!("{} needs to be rebuilt", spec.cformat());
    }
    std::process::exit(1);
}

/// Regenerate a mirror's index
pub fn cmd_buildcache_update_index(config: &Config, mirror: &str, key: Option<&str>) -> Result<()> {
    let mirror = config.mirror(mirror);
    let keyring = open_keyring(config)?;
    let fingerprint = match keyring.signing_key(key) {
        Ok(fpr) => Some(fpr),
        Err(e) if key.is_some() => return Err(e.into()),
        Err(e) => {
            warn!("Writing an unsigned index: {}", e);
            None
        }
    };
    let signer = fingerprint
        .as_deref()
        .map(|fpr| ManifestSigner::new(&keyring, fpr));

    let count = index::generate_index(&mirror, Some(&keyring), signer.as_ref())?;
    println!("Indexed {} specs on {}", count, mirror);
    Ok(())
}

/// List or install the keys mirrors publish
pub fn cmd_buildcache_keys(
    config: &Config,
    install: bool,
    trust: bool,
    mirror: Option<&str>,
) -> Result<()> {
    let keyring = open_keyring(config)?;
    for mirror in selected_mirrors(config, mirror)? {
        let fingerprints = if install {
            keys::fetch_keys(mirror.fetch_url(), &keyring, trust)
        } else {
            keys::read_key_index(mirror.fetch_url())
                .map(|index| index.keys.keys().cloned().collect())
        };
        match fingerprints {
            Ok(fingerprints) if fingerprints.is_empty() => {
                println!("{}: no keys published", mirror);
            }
            Ok(fingerprints) => {
                println!("{}:", mirror);
                for fpr in fingerprints {
                    let mark = if trust { " (trusted)" } else { "" };
                    println!("  {}{}", fpr, mark);
                }
            }
            Err(e) => warn!("Cannot read keys from {}: {}", mirror, e),
        }
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Convert a mirror from the legacy layout
pub fn cmd_buildcache_migrate(
    config: &Config,
    mirror: &str,
    unsigned: bool,
    delete_existing: bool,
    yes_to_all: bool,
    key: Option<String>,
) -> Result<()> {
    let mirror = config.mirror(mirror);
    let keyring = open_keyring(config)?;

    let delete_existing = delete_existing
        && (yes_to_all
            || confirm(&format!(
                "Delete the legacy layout on {} once migration finishes?",
                mirror
            ))?);

    let options = MigrateOptions {
        unsigned,
        delete_existing,
        signing_key: key,
    };
    let results = migrate::migrate(&mirror, &keyring, &options)?;

    let mut failed = 0;
    for result in &results {
        if result.success {
            println!("{}", result.message);
        } else {
            failed += 1;
            eprintln!("{}", result.message);
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} specs failed to migrate", failed, results.len());
    }
    println!("Migrated {} specs on {}", results.len(), mirror);
    Ok(())
}

/// Delete unwanted or unreferenced entries from a mirror
pub fn cmd_buildcache_prune(
    config: &Config,
    mirror: &str,
    keeplist: Option<&Path>,
    dry_run: bool,
) -> Result<()> {
    let mirror = config.mirror(mirror);
    let report = prune::prune(&mirror, keeplist, dry_run)?;

    let verb = if report.dry_run { "Would delete" } else { "Deleted" };
    for url in report.manifests.iter().chain(&report.blobs) {
        println!("{} {}", verb, url);
    }
    if !report.skipped_recent.is_empty() {
        println!(
            "Kept {} entries written after the prune started",
            report.skipped_recent.len()
        );
    }
    if !report.unreadable.is_empty() {
        eprintln!("No blobs were pruned because these manifests could not be read:");
        for url in &report.unreadable {
            eprintln!("  {}", url);
        }
    }
    println!(
        "{} {} manifests and {} blobs from {}",
        verb,
        report.manifests.len(),
        report.blobs.len(),
        mirror
    );
    if !report.dry_run && report.total() > 0 {
        println!(
            "Run `strata buildcache update-index {}` to refresh the index",
            mirror.name()
        );
    }
    Ok(())
}

/// Copy entries between mirrors
pub fn cmd_buildcache_sync(
    config: &Config,
    src: Option<&str>,
    dest: Option<&str>,
    manifest_glob: Option<&str>,
) -> Result<()> {
    let report = match (src, dest, manifest_glob) {
        (_, _, Some(pattern)) => sync::sync_from_manifest_glob(pattern)?,
        (Some(src), Some(dest), None) => {
            let src = config.mirror(src);
            let dest = config.mirror(dest);
            sync::sync(&src, &dest, &[])
                .with_context(|| format!("Failed to sync {} to {}", src, dest))?
        }
        _ => anyhow::bail!("Pass a source and destination mirror, or --manifest-glob"),
    };

    println!(
        "Copied {} entries, {} already present",
        report.copied.len(),
        report.skipped.len()
    );
    for (url, error) in &report.failed {
        eprintln!("Failed to copy {}: {}", url, error);
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} entries failed to copy", report.failed.len());
    }
    Ok(())
}

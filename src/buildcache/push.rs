// src/buildcache/push.rs

//! Uploading installed packages to a mirror
//!
//! Specs are pushed dependencies first over link/run edges. Prefixes are
//! resolved from the installed-package database up front; the uploads
//! themselves run in parallel and a failure of one spec never stops the
//! others.

use super::entry::{BuildcacheEntry, UrlBuildcacheEntry};
use super::{Component, archive, index, keys, push_layout_if_absent};
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::install::database::Database;
use crate::mirror::Mirror;
use crate::signing::{Keyring, ManifestSigner};
use crate::spec::{DepTypes, Spec};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Overwrite entries that are already on the mirror
    pub force: bool,
    /// Key to sign with; the only secret key when unset
    pub signing_key: Option<String>,
    /// Push without signing manifests
    pub unsigned: bool,
    /// Stop at the first spec that is not installed
    pub fail_fast: bool,
    /// Regenerate the mirror index afterwards
    pub update_index: bool,
}

#[derive(Debug, Default)]
pub struct PushResult {
    pub pushed: Vec<Spec>,
    pub skipped: Vec<Spec>,
    pub failed: Vec<(Spec, String)>,
}

enum Outcome {
    Pushed,
    Skipped,
}

/// Specs to push in dependency order, each once
fn specs_to_push(roots: &[Spec]) -> Vec<Spec> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for root in roots {
        for spec in root.traverse_deps_first(DepTypes::LINK | DepTypes::RUN) {
            if seen.insert(spec.dag_hash().to_string()) {
                out.push(spec);
            }
        }
    }
    out
}

fn push_one(
    spec: &Spec,
    prefix: &Path,
    mirror_url: &str,
    signer: Option<&ManifestSigner<'_>>,
    force: bool,
) -> Result<Outcome> {
    let mut entry = UrlBuildcacheEntry::new(mirror_url, Some(spec), true, None);
    if !force && entry.exists(&[Component::Spec, Component::Tarball]) {
        entry.destroy();
        return Ok(Outcome::Skipped);
    }

    let tmpdir = tempfile::Builder::new().prefix("strata-push-").tempdir()?;
    let tarball = tmpdir.path().join(format!("{}.tar.gz", spec.dag_hash()));
    let result = archive::create_tarball(spec, prefix, &tarball).and_then(|checksum| {
        entry.push_binary_package(
            spec,
            &tarball,
            HashAlgorithm::Sha256,
            &checksum,
            tmpdir.path(),
            signer,
        )
    });
    entry.destroy();
    result.map(|()| Outcome::Pushed)
}

/// Push `specs` and their link/run dependencies to `mirror`
pub fn push(
    specs: &[Spec],
    mirror: &Mirror,
    db: &Database,
    keyring: &Keyring,
    options: &PushOptions,
) -> Result<PushResult> {
    // Key problems surface before anything is uploaded
    let fingerprint = if options.unsigned {
        None
    } else {
        Some(keyring.signing_key(options.signing_key.as_deref())?)
    };
    let signer = fingerprint
        .as_deref()
        .map(|fpr| ManifestSigner::new(keyring, fpr));

    let mut installed: Vec<(Spec, PathBuf)> = Vec::new();
    let mut missing = Vec::new();
    for spec in specs_to_push(specs) {
        match db.get(spec.dag_hash())? {
            Some(record) => installed.push((spec, record.prefix)),
            None if options.fail_fast => return Err(Error::PackageNotInstalled(spec.cformat())),
            None => {
                warn!("{} is not installed, not pushing it", spec);
                missing.push(spec.cformat());
            }
        }
    }

    push_layout_if_absent(mirror.push_url(), signer.is_some())?;

    let outcomes: Vec<(Spec, Result<Outcome>)> = installed
        .par_iter()
        .map(|(spec, prefix)| {
            let outcome = push_one(spec, prefix, mirror.push_url(), signer.as_ref(), options.force);
            (spec.clone(), outcome)
        })
        .collect();

    let mut result = PushResult::default();
    for (spec, outcome) in outcomes {
        match outcome {
            Ok(Outcome::Pushed) => result.pushed.push(spec),
            Ok(Outcome::Skipped) => {
                info!("{} is already on {}", spec, mirror);
                result.skipped.push(spec);
            }
            Err(e) => {
                warn!("Failed to push {}: {}", spec, e);
                result.failed.push((spec, e.to_string()));
            }
        }
    }

    if !result.pushed.is_empty() {
        if let Some(fpr) = &fingerprint {
            keys::push_keys(mirror.push_url(), std::slice::from_ref(fpr), keyring)?;
        }
    }
    if options.update_index {
        index::generate_index(mirror, Some(keyring), signer.as_ref())?;
    }

    info!(
        "Pushed {}, skipped {}, failed {} on {}",
        result.pushed.len(),
        result.skipped.len(),
        result.failed.len(),
        mirror
    );

    if !missing.is_empty() {
        return Err(Error::PackagesAreNotInstalled(missing));
    }
    Ok(result)
}

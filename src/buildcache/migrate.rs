// src/buildcache/migrate.rs

//! Migrating a layout version 2 mirror to version 3
//!
//! Each spec listed in the legacy index is migrated independently:
//!
//! 1. skip it when the v3 entry already has both spec and tarball
//! 2. read the v2 spec file, verifying the signature when one exists
//! 3. download the v2 tarball and check it against the embedded checksum
//! 4. push tarball, spec metadata and manifest in the v3 layout
//!
//! A failing spec produces an unsuccessful [`MigrateSpecResult`] and the
//! batch carries on. Afterwards the layout file, the index and the signing
//! key are published, and the v2 tree is deleted only when asked.

use super::entry::{BuildcacheEntry, UrlBuildcacheEntry};
use super::legacy::UrlBuildcacheEntryV2;
use super::{Component, LEGACY_ROOT, index, keys, push_layout_if_absent};
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::mirror::Mirror;
use crate::signing::{Keyring, ManifestSigner};
use crate::spec::{Spec, SpecDocument};
use crate::web;
use rayon::prelude::*;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Write unsigned v3 manifests and accept unsigned v2 spec files
    pub unsigned: bool,
    /// Delete `build_cache/` once everything has been processed
    pub delete_existing: bool,
    /// Key to sign with; the only secret key when unset
    pub signing_key: Option<String>,
}

/// Outcome of migrating one spec
#[derive(Debug, Clone)]
pub struct MigrateSpecResult {
    pub spec: Spec,
    pub success: bool,
    pub message: String,
}

impl MigrateSpecResult {
    fn ok(spec: &Spec, message: String) -> Self {
        Self {
            spec: spec.clone(),
            success: true,
            message,
        }
    }

    fn failed(spec: &Spec, message: String) -> Self {
        Self {
            spec: spec.clone(),
            success: false,
            message,
        }
    }
}

fn display_name(spec: &Spec) -> String {
    format!("{}/{}", spec.name(), spec.short_hash())
}

fn repackage(
    v2: &mut UrlBuildcacheEntryV2<'_>,
    doc: &SpecDocument,
    spec: &Spec,
    mirror: &Mirror,
    signer: Option<&ManifestSigner<'_>>,
) -> Result<()> {
    let checksum = doc.binary_cache_checksum.clone().ok_or_else(|| {
        Error::BuildcacheEntry(format!("no tarball checksum in metadata of {}", spec))
    })?;
    let algorithm: HashAlgorithm = checksum
        .hash_algorithm
        .parse()
        .map_err(|e| Error::BuildcacheEntry(format!("{}", e)))?;
    let tarball = v2.fetch_archive()?;
    let legacy_spec = doc.to_spec()?;

    let tmpdir = tempfile::Builder::new().prefix("strata-migrate-").tempdir()?;
    let mut v3 = UrlBuildcacheEntry::new(mirror.push_url(), Some(spec), true, None);
    let pushed = v3.push_binary_package(
        &legacy_spec,
        &tarball,
        algorithm,
        &checksum.hash,
        tmpdir.path(),
        signer,
    );
    v3.destroy();
    pushed
}

fn migrate_spec(
    spec: &Spec,
    mirror: &Mirror,
    keyring: &Keyring,
    signer: Option<&ManifestSigner<'_>>,
    unsigned: bool,
) -> MigrateSpecResult {
    let name = display_name(spec);

    let mut v3 = UrlBuildcacheEntry::new(mirror.push_url(), Some(spec), true, None);
    let exists = v3.exists(&[Component::Spec, Component::Tarball]);
    v3.destroy();
    if exists {
        return MigrateSpecResult::ok(spec, format!("No need to migrate {}", name));
    }

    let mut v2 = UrlBuildcacheEntryV2::new(mirror.fetch_url(), spec, unsigned, Some(keyring));
    let doc = match v2.fetch_metadata() {
        Ok(doc) => doc,
        Err(Error::NoVerify(msg)) => {
            debug!("Verification of {} failed: {}", name, msg);
            return MigrateSpecResult::failed(spec, format!("Failed to verify signature of {}", name));
        }
        Err(e) => {
            return MigrateSpecResult::failed(
                spec,
                format!("Unable to read metadata for {}: {}", name, e),
            );
        }
    };

    let result = repackage(&mut v2, &doc, spec, mirror, signer);
    v2.destroy();

    match result {
        Ok(()) => MigrateSpecResult::ok(spec, format!("Successfully migrated {}", name)),
        Err(e) => MigrateSpecResult::failed(spec, format!("Failed to migrate {}: {}", name, e)),
    }
}

/// Migrate every spec in the legacy index of `mirror` to layout version 3
pub fn migrate(
    mirror: &Mirror,
    keyring: &Keyring,
    options: &MigrateOptions,
) -> Result<Vec<MigrateSpecResult>> {
    // Resolved before any mirror access
    let fingerprint = if options.unsigned {
        None
    } else {
        Some(
            keyring
                .signing_key(options.signing_key.as_deref())
                .map_err(|e| Error::Migration(format!("signed migration needs a key: {}", e)))?,
        )
    };
    let signer = fingerprint
        .as_deref()
        .map(|fpr| ManifestSigner::new(keyring, fpr));

    let legacy_index = index::fetch_legacy_index(mirror.fetch_url()).map_err(|e| {
        Error::Migration(format!(
            "cannot read the layout version 2 index of {}: {}",
            mirror, e
        ))
    })?;
    let specs = legacy_index.specs();
    info!("Migrating {} specs on {}", specs.len(), mirror);

    let results: Vec<MigrateSpecResult> = specs
        .par_iter()
        .map(|spec| migrate_spec(spec, mirror, keyring, signer.as_ref(), options.unsigned))
        .collect();

    for result in &results {
        if result.success {
            info!("{}", result.message);
        } else {
            warn!("{}", result.message);
        }
    }

    push_layout_if_absent(mirror.push_url(), signer.is_some())?;
    index::generate_index(mirror, Some(keyring), signer.as_ref())?;
    if let Some(fpr) = &fingerprint {
        keys::push_keys(mirror.push_url(), std::slice::from_ref(fpr), keyring)?;
    }

    if options.delete_existing {
        let legacy = web::url_join(mirror.push_url(), &[LEGACY_ROOT]);
        info!("Deleting {}", legacy);
        web::remove_url(&legacy, true)?;
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_signed_migration_needs_a_key_before_network() {
        let dir = TempDir::new().unwrap();
        // nothing exists at this mirror; the key check fails first
        let mirror = Mirror::from_url(&dir.path().join("nowhere").to_string_lossy());
        let keyring = Keyring::new(dir.path().join("keys")).unwrap();
        let err = migrate(&mirror, &keyring, &MigrateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
    }

    #[test]
    fn test_missing_legacy_index() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::from_url(&dir.path().join("mirror").to_string_lossy());
        let keyring = Keyring::new(dir.path().join("keys")).unwrap();
        let options = MigrateOptions {
            unsigned: true,
            ..Default::default()
        };
        assert!(matches!(
            migrate(&mirror, &keyring, &options),
            Err(Error::Migration(_))
        ));
    }
}

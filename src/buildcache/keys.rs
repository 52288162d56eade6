// src/buildcache/keys.rs

//! Public keys published on a mirror
//!
//! Each key is a KEY blob behind `v3/manifests/key/<fingerprint>.key.manifest.json`;
//! `v3/manifests/key/keys.manifest.json` points at a KEY_INDEX blob of the
//! form `{"keys": {"<fingerprint>": {}}}`. Key manifests are never signed,
//! since they are how a client obtains the keys to verify with.

use super::entry::{BuildcacheEntry, UrlBuildcacheEntry, push_manifest};
use super::manifest::{BlobRecord, BuildcacheManifest};
use super::{CURRENT_BUILD_CACHE_LAYOUT_VERSION, Component};
use crate::error::Result;
use crate::hash::HashAlgorithm;
use crate::signing::Keyring;
use crate::web;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIndex {
    pub keys: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

fn read_component(mirror_url: &str, manifest_url: &str, component: Component) -> Result<Vec<u8>> {
    let mut entry = UrlBuildcacheEntry::new(mirror_url, None, true, None);
    let result = entry
        .read_manifest(Some(manifest_url))
        .and_then(|_| entry.read_blob(component));
    entry.destroy();
    result
}

fn push_component(
    mirror_url: &str,
    manifest_url: &str,
    component: Component,
    local: &Path,
    tmpdir: &Path,
) -> Result<()> {
    let record = BlobRecord::for_file(component, local, HashAlgorithm::Sha256)?;
    web::push_to_url(local, &record.url(mirror_url))?;
    let manifest = BuildcacheManifest::new(CURRENT_BUILD_CACHE_LAYOUT_VERSION, vec![record]);
    push_manifest(&manifest, manifest_url, tmpdir, None)
}

/// The key index of a mirror, empty when absent
pub fn read_key_index(mirror_url: &str) -> Result<KeyIndex> {
    let url = UrlBuildcacheEntry::key_index_manifest_url(mirror_url);
    if !web::url_exists(&url)? {
        return Ok(KeyIndex::default());
    }
    let data = read_component(mirror_url, &url, Component::KeyIndex)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Publish public keys and add them to the key index
pub fn push_keys(mirror_url: &str, fingerprints: &[String], keyring: &Keyring) -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let mut key_index = read_key_index(mirror_url)?;

    for fingerprint in fingerprints {
        let local = tmpdir.path().join(format!("{}.pub", fingerprint));
        std::fs::write(&local, keyring.export_public(fingerprint)?)?;
        push_component(
            mirror_url,
            &UrlBuildcacheEntry::key_manifest_url(mirror_url, fingerprint),
            Component::Key,
            &local,
            tmpdir.path(),
        )?;
        key_index
            .keys
            .insert(fingerprint.clone(), serde_json::Map::new());
        info!("Published key {} to {}", fingerprint, mirror_url);
    }

    let local = tmpdir.path().join("keys.json");
    std::fs::write(&local, serde_json::to_vec(&key_index)?)?;
    push_component(
        mirror_url,
        &UrlBuildcacheEntry::key_index_manifest_url(mirror_url),
        Component::KeyIndex,
        &local,
        tmpdir.path(),
    )
}

/// Download the keys a mirror publishes, importing them when `trust` is set
///
/// Returns the fingerprints that were found.
pub fn fetch_keys(mirror_url: &str, keyring: &Keyring, trust: bool) -> Result<Vec<String>> {
    let key_index = read_key_index(mirror_url)?;
    let mut found = Vec::new();
    for fingerprint in key_index.keys.keys() {
        let url = UrlBuildcacheEntry::key_manifest_url(mirror_url, fingerprint);
        let armored = match read_component(mirror_url, &url, Component::Key) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot fetch key {}: {}", fingerprint, e);
                continue;
            }
        };
        if trust {
            keyring.import(&armored)?;
        }
        found.push(fingerprint.clone());
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_publish_and_fetch_keys() {
        let dir = TempDir::new().unwrap();
        let mirror = format!("file://{}", dir.path().join("mirror").display());
        let publisher = Keyring::new(dir.path().join("pub")).unwrap();
        let fpr = publisher.create_key("Bot", "bot@example.org").unwrap();

        assert!(read_key_index(&mirror).unwrap().keys.is_empty());
        push_keys(&mirror, std::slice::from_ref(&fpr), &publisher).unwrap();
        // pushing again keeps one entry
        push_keys(&mirror, std::slice::from_ref(&fpr), &publisher).unwrap();
        assert_eq!(read_key_index(&mirror).unwrap().keys.len(), 1);

        let consumer = Keyring::new(dir.path().join("consumer")).unwrap();
        assert_eq!(fetch_keys(&mirror, &consumer, false).unwrap(), vec![fpr.clone()]);
        assert!(consumer.list().unwrap().is_empty());

        fetch_keys(&mirror, &consumer, true).unwrap();
        let listed = consumer.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].fingerprint, fpr);
        assert!(!listed[0].can_sign);
    }
}

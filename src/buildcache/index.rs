// src/buildcache/index.rs

//! Mirror index
//!
//! The index is a database-style JSON document listing every spec node known
//! to the mirror, published as an INDEX blob behind
//! `v3/manifests/index/index.manifest.json`:
//!
//! ```json
//! {"database": {"version": "8", "installs": {
//!   "<hash>": {"spec": {...node...}, "ref_count": 0, "in_buildcache": true}
//! }}}
//! ```
//!
//! Dependencies of a binary package appear in `installs` so the DAG can be
//! rebuilt, but only nodes whose binaries are on the mirror carry
//! `in_buildcache: true`.

use super::entry::{BuildcacheEntry, UrlBuildcacheEntry, push_manifest};
use super::legacy::UrlBuildcacheEntryV2;
use super::manifest::{BlobRecord, BuildcacheManifest};
use super::{CURRENT_BUILD_CACHE_LAYOUT_VERSION, Component, list_spec_manifests};
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::mirror::Mirror;
use crate::signing::{Keyring, ManifestSigner};
use crate::spec::{Spec, SpecDocument, SpecNode};
use crate::web;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const INDEX_DATABASE_VERSION: &str = "8";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub spec: SpecNode,
    #[serde(default)]
    pub ref_count: u32,
    #[serde(default)]
    pub in_buildcache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDatabase {
    pub version: String,
    #[serde(default)]
    pub installs: BTreeMap<String, IndexRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildcacheIndex {
    pub database: IndexDatabase,
}

impl Default for BuildcacheIndex {
    fn default() -> Self {
        Self {
            database: IndexDatabase {
                version: INDEX_DATABASE_VERSION.to_string(),
                installs: BTreeMap::new(),
            },
        }
    }
}

impl BuildcacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::BuildcacheEntry(format!("invalid index: {}", e)))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Record a binary package and its dependency nodes
    pub fn add_document(&mut self, doc: &SpecDocument) {
        for (i, node) in doc.spec.nodes.iter().enumerate() {
            let record = self
                .database
                .installs
                .entry(node.hash.clone())
                .or_insert_with(|| IndexRecord {
                    spec: node.clone(),
                    ref_count: 0,
                    in_buildcache: false,
                });
            if i == 0 {
                record.in_buildcache = true;
            }
        }
    }

    /// Recompute how many indexed nodes depend on each node
    pub fn update_ref_counts(&mut self) {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for record in self.database.installs.values() {
            for dep in &record.spec.dependencies {
                *counts.entry(dep.hash.clone()).or_default() += 1;
            }
        }
        for (hash, record) in self.database.installs.iter_mut() {
            record.ref_count = counts.get(hash).copied().unwrap_or(0);
        }
    }

    /// Whether the binary for `hash` is on the mirror
    pub fn contains(&self, hash: &str) -> bool {
        self.database
            .installs
            .get(hash)
            .is_some_and(|r| r.in_buildcache)
    }

    pub fn len(&self) -> usize {
        self.database
            .installs
            .values()
            .filter(|r| r.in_buildcache)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node_map(&self) -> HashMap<String, SpecNode> {
        self.database
            .installs
            .iter()
            .map(|(hash, record)| {
                let mut node = record.spec.clone();
                if node.hash.is_empty() {
                    node.hash = hash.clone();
                }
                (hash.clone(), node)
            })
            .collect()
    }

    /// Rebuild the spec for `hash`
    pub fn get(&self, hash: &str) -> Option<Spec> {
        if !self.database.installs.contains_key(hash) {
            return None;
        }
        match Spec::from_node_map(&self.node_map(), hash) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!("Index entry {} is incomplete: {}", hash, e);
                None
            }
        }
    }

    /// Every spec whose binary is on the mirror
    pub fn specs(&self) -> Vec<Spec> {
        let nodes = self.node_map();
        self.database
            .installs
            .iter()
            .filter(|(_, record)| record.in_buildcache)
            .filter_map(|(hash, _)| match Spec::from_node_map(&nodes, hash) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    warn!("Index entry {} is incomplete: {}", hash, e);
                    None
                }
            })
            .collect()
    }
}

/// Read the v3 index of a mirror; `None` when the mirror has none
pub fn fetch_index(
    mirror_url: &str,
    allow_unsigned: bool,
    keyring: Option<&Keyring>,
) -> Result<Option<BuildcacheIndex>> {
    let url = UrlBuildcacheEntry::index_manifest_url(mirror_url);
    if !web::url_exists(&url)? {
        return Ok(None);
    }
    let mut entry = UrlBuildcacheEntry::new(mirror_url, None, allow_unsigned, keyring);
    let result = entry
        .read_manifest(Some(&url))
        .and_then(|_| entry.read_blob(Component::Index))
        .and_then(|bytes| BuildcacheIndex::from_json(&bytes));
    entry.destroy();
    result.map(Some)
}

/// Read the legacy `build_cache/index.json`
pub fn fetch_legacy_index(mirror_url: &str) -> Result<BuildcacheIndex> {
    let url = UrlBuildcacheEntryV2::index_url(mirror_url);
    let data = web::read_from_url(&url)?;
    BuildcacheIndex::from_json(&data)
}

/// Upload an index blob and its manifest
pub fn push_index(
    mirror_url: &str,
    index: &BuildcacheIndex,
    tmpdir: &Path,
    signer: Option<&ManifestSigner<'_>>,
) -> Result<()> {
    let path = tmpdir.join("index.json");
    std::fs::write(&path, index.to_json()?)?;
    let record = BlobRecord::for_file(Component::Index, &path, HashAlgorithm::Sha256)?;
    web::push_to_url(&path, &record.url(mirror_url))?;

    let manifest = BuildcacheManifest::new(CURRENT_BUILD_CACHE_LAYOUT_VERSION, vec![record]);
    push_manifest(
        &manifest,
        &UrlBuildcacheEntry::index_manifest_url(mirror_url),
        tmpdir,
        signer,
    )
}

/// Rebuild a mirror's index from the spec manifests it holds
///
/// Returns the number of binary packages indexed.
pub fn generate_index(
    mirror: &Mirror,
    keyring: Option<&Keyring>,
    signer: Option<&ManifestSigner<'_>>,
) -> Result<usize> {
    let read_url = mirror.fetch_url();
    let manifests = list_spec_manifests(read_url)?;
    debug!("Indexing {} manifests on {}", manifests.len(), read_url);

    let docs: Vec<SpecDocument> = manifests
        .par_iter()
        .filter_map(|url| {
            let mut entry = UrlBuildcacheEntry::new(read_url, None, true, keyring);
            let result = entry
                .read_manifest(Some(url))
                .and_then(|_| entry.fetch_metadata());
            entry.destroy();
            match result {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!("Skipping {} while indexing: {}", url, e);
                    None
                }
            }
        })
        .collect();

    let mut index = BuildcacheIndex::new();
    for doc in &docs {
        index.add_document(doc);
    }
    index.update_ref_counts();

    let tmpdir = tempfile::tempdir()?;
    push_index(mirror.push_url(), &index, tmpdir.path(), signer)?;
    info!("Indexed {} binary packages on {}", index.len(), mirror);
    Ok(index.len())
}

/// Per-run cache of mirror indexes
///
/// Construct one per command and pass it by reference; each mirror's index
/// is fetched at most once unless [`BinaryIndex::update`] is called.
pub struct BinaryIndex<'a> {
    mirrors: Vec<Mirror>,
    keyring: Option<&'a Keyring>,
    allow_unsigned: bool,
    cache: Mutex<HashMap<String, Option<Arc<BuildcacheIndex>>>>,
}

impl<'a> BinaryIndex<'a> {
    pub fn new(mirrors: Vec<Mirror>, keyring: Option<&'a Keyring>, allow_unsigned: bool) -> Self {
        Self {
            mirrors,
            keyring,
            allow_unsigned,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn mirrors(&self) -> &[Mirror] {
        &self.mirrors
    }

    fn index_for(&self, mirror: &Mirror) -> Option<Arc<BuildcacheIndex>> {
        let key = mirror.fetch_url().to_string();
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return cached.clone();
            }
        }
        let fetched = match fetch_index(mirror.fetch_url(), self.allow_unsigned, self.keyring) {
            Ok(index) => index.map(Arc::new),
            Err(e) => {
                warn!("Cannot read index of {}: {}", mirror, e);
                None
            }
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, fetched.clone());
        }
        fetched
    }

    /// Drop cached indexes and fetch them again
    pub fn update(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        for mirror in &self.mirrors {
            self.index_for(mirror);
        }
    }

    /// Mirrors whose index lists the spec
    pub fn binary_cache_for_spec(&self, spec: &Spec) -> Vec<Mirror> {
        self.mirrors
            .iter()
            .filter(|m| {
                self.index_for(m)
                    .is_some_and(|index| index.contains(spec.dag_hash()))
            })
            .cloned()
            .collect()
    }

    pub fn find_by_hash(&self, hash: &str) -> Vec<(Mirror, Spec)> {
        self.mirrors
            .iter()
            .filter_map(|m| {
                let index = self.index_for(m)?;
                if !index.contains(hash) {
                    return None;
                }
                index.get(hash).map(|spec| (m.clone(), spec))
            })
            .collect()
    }

    /// Every binary package on every mirror
    pub fn all_specs(&self) -> Vec<(Mirror, Spec)> {
        self.mirrors
            .iter()
            .flat_map(|m| {
                self.index_for(m)
                    .map(|index| index.specs())
                    .unwrap_or_default()
                    .into_iter()
                    .map(move |spec| (m.clone(), spec))
            })
            .collect()
    }
}

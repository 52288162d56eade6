// src/buildcache/mod.rs

//! Binary buildcache protocol
//!
//! A mirror stores binary packages as content-addressed blobs described by
//! small JSON manifests. Two layout versions can live side by side on one
//! mirror:
//!
//! ```text
//! v3/manifests/spec/<name>/<name>-<version>-<hash>.spec.manifest.json
//! v3/manifests/index/index.manifest.json
//! v3/manifests/key/<fingerprint>.key.manifest.json
//! v3/manifests/key/keys.manifest.json
//! v3/layout.json
//! blobs/<alg>/<checksum[:2]>/<checksum>
//!
//! build_cache/<os-arch>/<compiler>/<name>-<version>/<...>.spec.json[.sig]   (v2, read-only)
//! build_cache/<os-arch>/<compiler>/<name>-<version>/<...>.spack
//! ```
//!
//! Manifests are written after the blobs they reference, so a reader never
//! sees a manifest pointing at a blob that has not landed yet.

pub mod archive;
pub mod check;
pub mod entry;
pub mod fetch;
pub mod index;
pub mod keys;
pub mod legacy;
pub mod manifest;
pub mod migrate;
pub mod prune;
pub mod push;
pub mod sync;

pub use entry::{BuildcacheEntry, UrlBuildcacheEntry, entry_for_layout};
pub use legacy::UrlBuildcacheEntryV2;
pub use manifest::{BlobRecord, BuildcacheManifest, Compression};

use crate::error::{Error, Result};
use crate::web;
use serde::{Deserialize, Serialize};

/// Layout version written by this crate
pub const CURRENT_BUILD_CACHE_LAYOUT_VERSION: u32 = 3;

/// Layout versions that can be read
pub const SUPPORTED_LAYOUT_VERSIONS: [u32; 2] = [2, 3];

/// Root of the v3 layout
pub const LAYOUT_DIR: &str = "v3";

/// Root of the legacy v2 layout
pub const LEGACY_ROOT: &str = "build_cache";

pub const BLOBS_DIR: &str = "blobs";

pub const LAYOUT_FILE: &str = "layout.json";

pub const SPEC_MANIFEST_SUFFIX: &str = ".spec.manifest.json";

pub const KEY_MANIFEST_SUFFIX: &str = ".key.manifest.json";

pub const INDEX_MANIFEST_FILE: &str = "index.manifest.json";

pub const KEY_INDEX_MANIFEST_FILE: &str = "keys.manifest.json";

/// Kinds of blob a manifest can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// Compressed spec metadata of a binary package
    Spec,
    /// Install tree of a binary package
    Tarball,
    /// Mirror index
    Index,
    /// Armored public key
    Key,
    /// List of published keys
    KeyIndex,
}

impl Component {
    pub const fn media_type(self) -> &'static str {
        match self {
            Self::Spec => "application/vnd.spack.spec.v5+json",
            Self::Tarball => "application/vnd.spack.install.v2.tar+gzip",
            Self::Index => "application/vnd.spack.db.v8+json",
            Self::Key => "application/pgp-keys",
            Self::KeyIndex => "application/vnd.spack.keyindex.v1+json",
        }
    }

    pub const fn compression(self) -> Compression {
        match self {
            Self::Spec | Self::Tarball => Compression::Gzip,
            Self::Index | Self::Key | Self::KeyIndex => Compression::None,
        }
    }

    /// Directory under `v3/manifests` holding manifests for this component
    pub const fn manifest_dir(self) -> &'static str {
        match self {
            Self::Spec | Self::Tarball => "spec",
            Self::Index => "index",
            Self::Key | Self::KeyIndex => "key",
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        [Self::Spec, Self::Tarball, Self::Index, Self::Key, Self::KeyIndex]
            .into_iter()
            .find(|c| c.media_type() == media_type)
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Spec => "spec",
            Self::Tarball => "tarball",
            Self::Index => "index",
            Self::Key => "key",
            Self::KeyIndex => "key index",
        };
        write!(f, "{}", name)
    }
}

/// `<mirror>/v3/manifests[/<component dir>]`
pub fn manifests_url(mirror_url: &str, component: Option<Component>) -> String {
    match component {
        Some(c) => web::url_join(mirror_url, &[LAYOUT_DIR, "manifests", c.manifest_dir()]),
        None => web::url_join(mirror_url, &[LAYOUT_DIR, "manifests"]),
    }
}

pub fn blobs_url(mirror_url: &str) -> String {
    web::url_join(mirror_url, &[BLOBS_DIR])
}

pub fn layout_url(mirror_url: &str) -> String {
    web::url_join(mirror_url, &[LAYOUT_DIR, LAYOUT_FILE])
}

/// URLs of every spec manifest on a mirror
pub fn list_spec_manifests(mirror_url: &str) -> Result<Vec<String>> {
    let base = manifests_url(mirror_url, Some(Component::Spec));
    Ok(web::list_url(&base, true)?
        .into_iter()
        .filter(|rel| rel.ends_with(SPEC_MANIFEST_SUFFIX))
        .map(|rel| web::url_join(&base, &[&rel]))
        .collect())
}

/// Content of `v3/layout.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutFile {
    pub signing: Option<String>,
}

impl LayoutFile {
    pub fn new(signed: bool) -> Self {
        Self {
            signing: signed.then(|| "gpg".to_string()),
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signing.is_some()
    }
}

/// Read `v3/layout.json`, `None` when absent
pub fn read_layout(mirror_url: &str) -> Result<Option<LayoutFile>> {
    match web::read_from_url(&layout_url(mirror_url)) {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::BuildcacheEntry(format!("invalid {}: {}", LAYOUT_FILE, e))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write `v3/layout.json` unless one exists already
pub fn push_layout_if_absent(mirror_url: &str, signed: bool) -> Result<bool> {
    let url = layout_url(mirror_url);
    if web::url_exists(&url)? {
        return Ok(false);
    }
    let data = serde_json::to_vec(&LayoutFile::new(signed))?;
    web::push_bytes(&data, &url)?;
    Ok(true)
}

// src/buildcache/sync.rs

//! Copying entries between mirrors
//!
//! A copy moves the manifest exactly as stored (signature included) after
//! every blob it references has landed in the destination.

use super::manifest::BuildcacheManifest;
use super::{LAYOUT_DIR, list_spec_manifests, manifests_url};
use crate::buildcache::entry::UrlBuildcacheEntry;
use crate::error::{Error, Result};
use crate::mirror::Mirror;
use crate::signing;
use crate::spec::Spec;
use crate::web;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SyncReport {
    pub copied: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// One record of a manifest-copy file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestCopy {
    pub src: String,
    pub dest: String,
}

enum Copied {
    Yes,
    AlreadyPresent,
}

/// Mirror root of a manifest URL (everything before `/v3/manifests/`)
pub fn mirror_root(manifest_url: &str) -> Result<&str> {
    let marker = format!("/{}/manifests/", LAYOUT_DIR);
    manifest_url
        .find(&marker)
        .map(|i| &manifest_url[..i])
        .ok_or_else(|| Error::BuildcacheEntry(format!("{} is not a manifest URL", manifest_url)))
}

fn copy_blob(src: &str, dest: &str) -> Result<()> {
    let tmp = tempfile::NamedTempFile::new()?;
    web::fetch_to_file(src, tmp.path())?;
    web::push_to_url(tmp.path(), dest)
}

fn copy_manifest(src_manifest: &str, dest_manifest: &str) -> Result<Copied> {
    let src_root = mirror_root(src_manifest)?;
    let dest_root = mirror_root(dest_manifest)?;

    let raw = web::read_from_url(src_manifest)?;
    let manifest = BuildcacheManifest::from_json(&signing::strip_clearsign(&raw)?)?;

    let mut missing = Vec::new();
    for record in &manifest.data {
        let dest = record.url(dest_root);
        if !web::url_exists(&dest)? {
            missing.push((record.url(src_root), dest));
        }
    }
    if missing.is_empty() && web::url_exists(dest_manifest)? {
        return Ok(Copied::AlreadyPresent);
    }

    for (src, dest) in &missing {
        debug!("Copying {} to {}", src, dest);
        copy_blob(src, dest)?;
    }
    web::push_bytes(&raw, dest_manifest)?;
    Ok(Copied::Yes)
}

fn copy_all(pairs: Vec<(String, String)>) -> SyncReport {
    let results: Vec<(String, Result<Copied>)> = pairs
        .into_par_iter()
        .map(|(src, dest)| {
            let result = copy_manifest(&src, &dest);
            (src, result)
        })
        .collect();

    let mut report = SyncReport::default();
    for (src, result) in results {
        match result {
            Ok(Copied::Yes) => report.copied.push(src),
            Ok(Copied::AlreadyPresent) => report.skipped.push(src),
            Err(e) => {
                warn!("Failed to copy {}: {}", src, e);
                report.failed.push((src, e.to_string()));
            }
        }
    }
    report
}

/// Copy the entries of `specs` from `src` to `dest`; every spec on `src` when empty
pub fn sync(src: &Mirror, dest: &Mirror, specs: &[Spec]) -> Result<SyncReport> {
    let pairs: Vec<(String, String)> = if specs.is_empty() {
        let src_base = manifests_url(src.fetch_url(), None);
        let dest_base = manifests_url(dest.push_url(), None);
        list_spec_manifests(src.fetch_url())?
            .into_iter()
            .map(|url| {
                let rel = url[src_base.len()..].trim_start_matches('/').to_string();
                let dest_url = web::url_join(&dest_base, &[&rel]);
                (url, dest_url)
            })
            .collect()
    } else {
        specs
            .iter()
            .map(|spec| {
                (
                    UrlBuildcacheEntry::spec_manifest_url(src.fetch_url(), spec),
                    UrlBuildcacheEntry::spec_manifest_url(dest.push_url(), spec),
                )
            })
            .collect()
    };

    info!("Syncing {} entries from {} to {}", pairs.len(), src, dest);
    Ok(copy_all(pairs))
}

/// Copy the manifests named by every manifest-copy file matching `pattern`
///
/// Each file is `{"<hash>": {"src": "<manifest url>", "dest": "<manifest url>"}}`.
pub fn sync_from_manifest_glob(pattern: &str) -> Result<SyncReport> {
    let paths = glob::glob(pattern)
        .map_err(|e| Error::Config(format!("invalid manifest glob '{}': {}", pattern, e)))?;

    let mut pairs = Vec::new();
    for path in paths {
        let path = path.map_err(|e| Error::Io(std::io::Error::new(e.error().kind(), e.to_string())))?;
        let data = std::fs::read(&path)?;
        let copies: BTreeMap<String, ManifestCopy> = serde_json::from_slice(&data)?;
        debug!("{} lists {} manifests", path.display(), copies.len());
        pairs.extend(copies.into_values().map(|c| (c.src, c.dest)));
    }
    Ok(copy_all(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildcache::Component;
    use crate::buildcache::entry::{BuildcacheEntry, write_gzip};
    use crate::hash::{self, HashAlgorithm};
    use crate::spec::SpecBuilder;
    use std::fs;
    use tempfile::TempDir;

    fn push(dir: &TempDir, mirror: &Mirror, spec: &Spec) {
        let work = dir.path().join("work").join(spec.dag_hash());
        fs::create_dir_all(&work).unwrap();
        let tarball = work.join("pkg.tar.gz");
        write_gzip(spec.name().as_bytes(), &tarball).unwrap();
        let checksum = hash::checksum_file(HashAlgorithm::Sha256, &tarball).unwrap();
        UrlBuildcacheEntry::new(mirror.push_url(), Some(spec), true, None)
            .push_binary_package(spec, &tarball, HashAlgorithm::Sha256, &checksum, &work, None)
            .unwrap();
    }

    fn present(mirror: &Mirror, spec: &Spec) -> bool {
        UrlBuildcacheEntry::new(mirror.fetch_url(), Some(spec), true, None)
            .exists(&[Component::Spec, Component::Tarball])
    }

    #[test]
    fn test_mirror_root() {
        assert_eq!(
            mirror_root("s3://b/x/v3/manifests/spec/z/z-1-h.spec.manifest.json").unwrap(),
            "s3://b/x"
        );
        assert!(mirror_root("s3://b/x/blobs/sha256/ab/cd").is_err());
    }

    #[test]
    fn test_sync_specs_and_skip_present() {
        let dir = TempDir::new().unwrap();
        let src = Mirror::from_url(&dir.path().join("src").to_string_lossy());
        let dest = Mirror::from_url(&dir.path().join("dest").to_string_lossy());
        let zlib = SpecBuilder::new("zlib", "1.3").build();
        let bzip2 = SpecBuilder::new("bzip2", "1.0.8").build();
        push(&dir, &src, &zlib);
        push(&dir, &src, &bzip2);

        let report = sync(&src, &dest, std::slice::from_ref(&zlib)).unwrap();
        assert_eq!(report.copied.len(), 1);
        assert!(present(&dest, &zlib));
        assert!(!present(&dest, &bzip2));

        let report = sync(&src, &dest, &[]).unwrap();
        assert_eq!(report.copied.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(present(&dest, &bzip2));
    }

    #[test]
    fn test_sync_from_manifest_glob() {
        let dir = TempDir::new().unwrap();
        let src = Mirror::from_url(&dir.path().join("src").to_string_lossy());
        let dest = Mirror::from_url(&dir.path().join("dest").to_string_lossy());
        let zlib = SpecBuilder::new("zlib", "1.3").build();
        push(&dir, &src, &zlib);

        let copies = serde_json::json!({
            (zlib.dag_hash()): {
                "src": UrlBuildcacheEntry::spec_manifest_url(src.fetch_url(), &zlib),
                "dest": UrlBuildcacheEntry::spec_manifest_url(dest.push_url(), &zlib),
            }
        });
        let lists = dir.path().join("lists");
        fs::create_dir_all(&lists).unwrap();
        fs::write(lists.join("copy.json"), serde_json::to_vec(&copies).unwrap()).unwrap();

        let pattern = format!("{}/*.json", lists.display());
        let report = sync_from_manifest_glob(&pattern).unwrap();
        assert_eq!(report.copied.len(), 1);
        assert!(report.failed.is_empty());
        assert!(present(&dest, &zlib));
    }

    #[test]
    fn test_manifest_glob_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            sync_from_manifest_glob("lists/[.json"),
            Err(Error::Config(_))
        ));

        // a match that cannot be read as a file
        fs::create_dir_all(dir.path().join("lists").join("nested.json")).unwrap();
        let pattern = format!("{}/lists/*.json", dir.path().display());
        assert!(matches!(sync_from_manifest_glob(&pattern), Err(Error::Io(_))));

        let nothing = format!("{}/none/*.json", dir.path().display());
        assert_eq!(sync_from_manifest_glob(&nothing).unwrap().copied.len(), 0);
    }
}

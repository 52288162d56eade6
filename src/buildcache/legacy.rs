// src/buildcache/legacy.rs

//! Read-only access to layout version 2 mirrors
//!
//! Version 2 stores each binary package as a tarball at a fixed path next
//! to its spec file, optionally clearsigned as `.spec.json.sig`:
//!
//! ```text
//! build_cache/<os-arch>/<compiler>/<name>-<version>/<os-arch>-<compiler>-<name>-<version>-<hash>.spec.json[.sig]
//! build_cache/<os-arch>/<compiler>/<name>-<version>/<os-arch>-<compiler>-<name>-<version>-<hash>.spack
//! ```
//!
//! There is no manifest on the mirror; one with `version: 2` is synthesized
//! from the spec file so callers see the same interface as for version 3.
//! A signed spec file is always verified. `allow_unsigned` only permits
//! falling back to the plain `.spec.json` when no signed file exists.

use super::entry::BuildcacheEntry;
use super::manifest::{BlobRecord, BuildcacheManifest, Compression};
use super::{Component, LEGACY_ROOT};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::signing::{Keyring, ManifestSigner};
use crate::spec::{Spec, SpecDocument};
use crate::web;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Layout version served by this entry
pub const LEGACY_LAYOUT_VERSION: u32 = 2;

const READ_ONLY: &str = "layout version 2 buildcaches are read-only";

/// Layout version 2 entry
pub struct UrlBuildcacheEntryV2<'a> {
    mirror_url: String,
    spec: Spec,
    allow_unsigned: bool,
    keyring: Option<&'a Keyring>,
    metadata: Option<SpecDocument>,
    manifest: Option<BuildcacheManifest>,
    signed: bool,
    stage: Option<TempDir>,
    archive: Option<PathBuf>,
    destroyed: bool,
}

impl<'a> UrlBuildcacheEntryV2<'a> {
    pub fn new(
        mirror_url: &str,
        spec: &Spec,
        allow_unsigned: bool,
        keyring: Option<&'a Keyring>,
    ) -> Self {
        Self {
            mirror_url: mirror_url.trim_end_matches('/').to_string(),
            spec: spec.clone(),
            allow_unsigned,
            keyring,
            metadata: None,
            manifest: None,
            signed: false,
            stage: None,
            archive: None,
            destroyed: false,
        }
    }

    fn stem(spec: &Spec) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            spec.os_arch(),
            spec.compiler_string(),
            spec.name(),
            spec.version(),
            spec.dag_hash()
        )
    }

    /// Directory holding a spec's files
    pub fn entry_dir_url(mirror_url: &str, spec: &Spec) -> String {
        web::url_join(
            mirror_url,
            &[
                LEGACY_ROOT,
                &spec.os_arch(),
                &spec.compiler_string(),
                &format!("{}-{}", spec.name(), spec.version()),
            ],
        )
    }

    pub fn spec_url(mirror_url: &str, spec: &Spec, signed: bool) -> String {
        let suffix = if signed { ".spec.json.sig" } else { ".spec.json" };
        web::url_join(
            &Self::entry_dir_url(mirror_url, spec),
            &[&format!("{}{}", Self::stem(spec), suffix)],
        )
    }

    pub fn tarball_url(mirror_url: &str, spec: &Spec) -> String {
        web::url_join(
            &Self::entry_dir_url(mirror_url, spec),
            &[&format!("{}.spack", Self::stem(spec))],
        )
    }

    pub fn index_url(mirror_url: &str) -> String {
        web::url_join(mirror_url, &[LEGACY_ROOT, "index.json"])
    }

    /// Whether the metadata came from a verified `.sig` file
    pub fn was_signed(&self) -> bool {
        self.signed
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return Err(Error::BuildcacheEntry(
                "buildcache entry used after destroy".to_string(),
            ));
        }
        Ok(())
    }

    fn read_spec_file(&mut self) -> Result<(Vec<u8>, SpecDocument)> {
        let signed_url = Self::spec_url(&self.mirror_url, &self.spec, true);
        let (body, signed) = match web::read_from_url(&signed_url) {
            Ok(raw) => {
                let keyring = self.keyring.ok_or_else(|| {
                    Error::NoVerify(format!("no keyring to verify {}", signed_url))
                })?;
                let body = keyring
                    .verify_clearsigned(&raw)
                    .map_err(|e| Error::NoVerify(format!("{}: {}", signed_url, e)))?;
                (body, true)
            }
            Err(e) if e.is_not_found() && self.allow_unsigned => {
                let url = Self::spec_url(&self.mirror_url, &self.spec, false);
                debug!("No signed metadata for {}, trying {}", self.spec, url);
                let body = web::read_from_url(&url).map_err(|e| {
                    Error::BuildcacheEntry(format!("failed to read {}: {}", url, e))
                })?;
                (body, false)
            }
            Err(e) if e.is_not_found() => {
                return Err(Error::BuildcacheEntry(format!(
                    "no signed metadata at {}",
                    signed_url
                )));
            }
            Err(e) => {
                return Err(Error::BuildcacheEntry(format!(
                    "failed to read {}: {}",
                    signed_url, e
                )));
            }
        };

        let doc = SpecDocument::from_json(&body)
            .map_err(|e| Error::BuildcacheEntry(format!("invalid spec metadata: {}", e)))?;
        if let Some(version) = doc.buildcache_layout_version {
            if version > LEGACY_LAYOUT_VERSION {
                return Err(Error::BuildcacheEntry(format!(
                    "legacy spec file declares layout version {}",
                    version
                )));
            }
        }
        let root = doc
            .spec
            .nodes
            .first()
            .map(|n| n.hash.as_str())
            .unwrap_or_default();
        if root != self.spec.dag_hash() {
            return Err(Error::BuildcacheEntry(format!(
                "spec file for {} describes {}",
                self.spec, root
            )));
        }
        self.signed = signed;
        Ok((body, doc))
    }

    fn metadata(&mut self) -> Result<SpecDocument> {
        self.ensure_live()?;
        if let Some(doc) = &self.metadata {
            return Ok(doc.clone());
        }
        let (body, doc) = self.read_spec_file()?;

        let checksum = doc.binary_cache_checksum.as_ref().ok_or_else(|| {
            Error::BuildcacheEntry(format!("spec file for {} has no tarball checksum", self.spec))
        })?;
        let algorithm: HashAlgorithm = checksum
            .hash_algorithm
            .parse()
            .map_err(|e| Error::BuildcacheEntry(format!("{}", e)))?;
        let tarball_size = web::stat_url(&Self::tarball_url(&self.mirror_url, &self.spec))
            .ok()
            .flatten()
            .map(|s| s.size)
            .unwrap_or(0);

        self.manifest = Some(BuildcacheManifest::new(
            LEGACY_LAYOUT_VERSION,
            vec![
                BlobRecord::new(
                    body.len() as u64,
                    Component::Spec.media_type(),
                    Compression::None,
                    HashAlgorithm::Sha256,
                    &hash::sha256(&body),
                ),
                BlobRecord::new(
                    tarball_size,
                    Component::Tarball.media_type(),
                    Compression::Gzip,
                    algorithm,
                    &checksum.hash,
                ),
            ],
        ));
        self.metadata = Some(doc.clone());
        Ok(doc)
    }

    fn fetch_archive_inner(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.archive {
            return Ok(path.clone());
        }
        let doc = self.metadata()?;
        let expected = doc.binary_cache_checksum.ok_or_else(|| {
            Error::BuildcacheEntry(format!("spec file for {} has no tarball checksum", self.spec))
        })?;
        let algorithm: HashAlgorithm = expected
            .hash_algorithm
            .parse()
            .map_err(|e| Error::BuildcacheEntry(format!("{}", e)))?;

        if self.stage.is_none() {
            self.stage = Some(tempfile::Builder::new().prefix("strata-legacy-").tempdir()?);
        }
        let stage = self
            .stage
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| Error::BuildcacheEntry("no stage directory".to_string()))?;

        let url = Self::tarball_url(&self.mirror_url, &self.spec);
        let local = stage.join(web::basename(&url));
        web::fetch_to_file(&url, &local).map_err(|e| {
            if e.is_not_found() {
                Error::NoSuchBlob(url.clone())
            } else {
                Error::BuildcacheEntry(format!("failed to fetch {}: {}", url, e))
            }
        })?;

        let actual = hash::checksum_file(algorithm, &local)?;
        if actual != expected.hash {
            return Err(Error::BuildcacheEntry(format!(
                "checksum mismatch for {}: expected {}, got {}",
                url, expected.hash, actual
            )));
        }
        self.archive = Some(local.clone());
        Ok(local)
    }
}

impl BuildcacheEntry for UrlBuildcacheEntryV2<'_> {
    fn layout_version(&self) -> u32 {
        LEGACY_LAYOUT_VERSION
    }

    fn manifest_url(&self) -> Result<String> {
        Ok(Self::spec_url(&self.mirror_url, &self.spec, !self.allow_unsigned))
    }

    fn read_manifest(&mut self, _manifest_url: Option<&str>) -> Result<BuildcacheManifest> {
        self.metadata()?;
        self.manifest
            .clone()
            .ok_or_else(|| Error::BuildcacheEntry("no manifest".to_string()))
    }

    fn fetch_metadata(&mut self) -> Result<SpecDocument> {
        match self.metadata() {
            Ok(doc) => Ok(doc),
            Err(e) => {
                self.destroy();
                Err(e)
            }
        }
    }

    fn fetch_archive(&mut self) -> Result<PathBuf> {
        self.ensure_live()?;
        self.fetch_archive_inner()
    }

    fn exists(&mut self, components: &[Component]) -> bool {
        if self.metadata().is_err() {
            return false;
        }
        components.iter().all(|component| match component {
            Component::Spec => true,
            Component::Tarball => {
                web::url_exists(&Self::tarball_url(&self.mirror_url, &self.spec)).unwrap_or(false)
            }
            _ => false,
        })
    }

    fn push_binary_package(
        &mut self,
        _spec: &Spec,
        _tarball: &Path,
        _checksum_alg: HashAlgorithm,
        _checksum: &str,
        _tmpdir: &Path,
        _signer: Option<&ManifestSigner<'_>>,
    ) -> Result<()> {
        Err(Error::BuildcacheEntry(READ_ONLY.to_string()))
    }

    fn remove(&mut self) -> Result<()> {
        Err(Error::BuildcacheEntry(READ_ONLY.to_string()))
    }

    fn destroy(&mut self) {
        self.metadata = None;
        self.manifest = None;
        self.archive = None;
        self.stage = None;
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{BinaryCacheChecksum, SpecBuilder};
    use std::fs;

    fn write_legacy(mirror: &str, spec: &Spec, tarball: &[u8], keyring: Option<(&Keyring, &str)>) {
        let mut doc = spec.to_document();
        doc.buildcache_layout_version = Some(2);
        doc.binary_cache_checksum = Some(BinaryCacheChecksum {
            hash_algorithm: "sha256".to_string(),
            hash: hash::sha256(tarball),
        });
        let body = doc.to_json_pretty().unwrap();
        match keyring {
            Some((keyring, fpr)) => {
                let signed = keyring.clearsign(fpr, &body).unwrap();
                web::push_bytes(&signed, &UrlBuildcacheEntryV2::spec_url(mirror, spec, true)).unwrap();
            }
            None => {
                web::push_bytes(&body, &UrlBuildcacheEntryV2::spec_url(mirror, spec, false)).unwrap();
            }
        }
        web::push_bytes(tarball, &UrlBuildcacheEntryV2::tarball_url(mirror, spec)).unwrap();
    }

    fn spec() -> Spec {
        SpecBuilder::new("libelf", "0.8.13")
            .arch("linux", "ubuntu22.04", "x86_64")
            .compiler("gcc", "12.3.0")
            .build()
    }

    #[test]
    fn test_paths() {
        let s = spec();
        let url = UrlBuildcacheEntryV2::spec_url("file:///m", &s, true);
        assert_eq!(
            url,
            format!(
                "file:///m/build_cache/linux-ubuntu22.04-x86_64/gcc-12.3.0/libelf-0.8.13/linux-ubuntu22.04-x86_64-gcc-12.3.0-libelf-0.8.13-{}.spec.json.sig",
                s.dag_hash()
            )
        );
        assert!(UrlBuildcacheEntryV2::tarball_url("file:///m", &s).ends_with(".spack"));
    }

    #[test]
    fn test_unsigned_entry_read() {
        let dir = TempDir::new().unwrap();
        let mirror = format!("file://{}", dir.path().display());
        let s = spec();
        write_legacy(&mirror, &s, b"tarball bytes", None);

        let mut strict = UrlBuildcacheEntryV2::new(&mirror, &s, false, None);
        assert!(strict.fetch_metadata().is_err());

        let mut entry = UrlBuildcacheEntryV2::new(&mirror, &s, true, None);
        assert!(entry.exists(&[Component::Spec, Component::Tarball]));
        let manifest = entry.read_manifest(None).unwrap();
        assert_eq!(manifest.version, 2);
        let archive = entry.fetch_archive().unwrap();
        assert_eq!(fs::read(&archive).unwrap(), b"tarball bytes");
        assert!(!entry.was_signed());
    }

    #[test]
    fn test_signed_entry_always_verified() {
        let dir = TempDir::new().unwrap();
        let mirror = format!("file://{}", dir.path().join("m").display());
        let keys = dir.path().join("keys");
        let keyring = Keyring::new(&keys).unwrap();
        let fpr = keyring.create_key("Bot", "bot@example.org").unwrap();
        let s = spec();
        write_legacy(&mirror, &s, b"tarball bytes", Some((&keyring, &fpr)));

        let empty = Keyring::new(dir.path().join("empty")).unwrap();
        let mut untrusted = UrlBuildcacheEntryV2::new(&mirror, &s, true, Some(&empty));
        assert!(matches!(untrusted.fetch_metadata(), Err(Error::NoVerify(_))));

        let mut trusted = UrlBuildcacheEntryV2::new(&mirror, &s, false, Some(&keyring));
        assert!(trusted.fetch_metadata().is_ok());
        assert!(trusted.was_signed());
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let mirror = format!("file://{}", dir.path().display());
        let s = spec();
        write_legacy(&mirror, &s, b"tarball bytes", None);
        web::push_bytes(b"corrupted", &UrlBuildcacheEntryV2::tarball_url(&mirror, &s)).unwrap();

        let mut entry = UrlBuildcacheEntryV2::new(&mirror, &s, true, None);
        let err = entry.fetch_archive().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_writes_are_refused() {
        let s = spec();
        let mut entry = UrlBuildcacheEntryV2::new("file:///nonexistent", &s, true, None);
        assert!(matches!(entry.remove(), Err(Error::BuildcacheEntry(_))));
        assert!(
            entry
                .push_binary_package(
                    &s,
                    Path::new("/dev/null"),
                    HashAlgorithm::Sha256,
                    "",
                    Path::new("/tmp"),
                    None
                )
                .is_err()
        );
    }
}

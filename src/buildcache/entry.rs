// src/buildcache/entry.rs

//! Per-spec access to a mirror
//!
//! A [`BuildcacheEntry`] binds a mirror URL, an optional spec and a
//! signature policy to at most one fetched manifest plus the blobs staged
//! locally for it. The staged files belong to the entry; `destroy()` (or
//! dropping the entry) releases them and the entry must not be read from
//! afterwards.
//!
//! Layout version 3 is implemented here; the read-only version 2 lives in
//! [`super::legacy`]. Use [`entry_for_layout`] when the version is only
//! known at run time.

use super::manifest::{BlobRecord, BuildcacheManifest, Compression};
use super::{
    CURRENT_BUILD_CACHE_LAYOUT_VERSION, Component, INDEX_MANIFEST_FILE, KEY_INDEX_MANIFEST_FILE,
    KEY_MANIFEST_SUFFIX, SPEC_MANIFEST_SUFFIX, legacy::UrlBuildcacheEntryV2, manifests_url,
};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::signing::{self, Keyring, ManifestSigner};
use crate::spec::{Spec, SpecDocument};
use crate::web;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Operations common to every layout version
pub trait BuildcacheEntry {
    fn layout_version(&self) -> u32;

    /// Where this entry's manifest (or metadata file) lives
    fn manifest_url(&self) -> Result<String>;

    /// Fetch, verify and parse the manifest; cached per URL
    fn read_manifest(&mut self, manifest_url: Option<&str>) -> Result<BuildcacheManifest>;

    /// Fetch the spec metadata blob. Local state is destroyed on failure.
    fn fetch_metadata(&mut self) -> Result<SpecDocument>;

    /// Fetch the tarball blob and return its staged path
    fn fetch_archive(&mut self) -> Result<PathBuf>;

    /// Whether the manifest is readable and every requested blob is present
    fn exists(&mut self, components: &[Component]) -> bool;

    /// Replace whatever is stored for `spec` with a new binary package
    fn push_binary_package(
        &mut self,
        spec: &Spec,
        tarball: &Path,
        checksum_alg: HashAlgorithm,
        checksum: &str,
        tmpdir: &Path,
        signer: Option<&ManifestSigner<'_>>,
    ) -> Result<()>;

    /// Best-effort deletion of the manifest and the blobs it references
    fn remove(&mut self) -> Result<()>;

    /// Release staged files
    fn destroy(&mut self);
}

/// Build the entry implementation for a layout version
pub fn entry_for_layout<'a>(
    layout_version: u32,
    mirror_url: &str,
    spec: Option<&Spec>,
    allow_unsigned: bool,
    keyring: Option<&'a Keyring>,
) -> Result<Box<dyn BuildcacheEntry + 'a>> {
    match layout_version {
        3 => Ok(Box::new(UrlBuildcacheEntry::new(
            mirror_url,
            spec,
            allow_unsigned,
            keyring,
        ))),
        2 => {
            let spec = spec.ok_or_else(|| {
                Error::BuildcacheEntry("layout version 2 entries need a spec".to_string())
            })?;
            Ok(Box::new(UrlBuildcacheEntryV2::new(
                mirror_url,
                spec,
                allow_unsigned,
                keyring,
            )))
        }
        other => Err(Error::UnknownBuildcacheLayout(other)),
    }
}

/// Turn raw manifest bytes into the JSON body, enforcing the signature policy
pub(crate) fn decode_signed(
    raw: &[u8],
    url: &str,
    allow_unsigned: bool,
    keyring: Option<&Keyring>,
) -> Result<Vec<u8>> {
    let signed = signing::is_clearsigned(raw);
    if allow_unsigned {
        return if signed {
            signing::strip_clearsign(raw)
        } else {
            Ok(raw.to_vec())
        };
    }
    if !signed {
        return Err(Error::NoVerify(format!("{} is not signed", url)));
    }
    let keyring =
        keyring.ok_or_else(|| Error::NoVerify(format!("no keyring to verify {}", url)))?;
    keyring.verify_clearsigned(raw).map_err(|e| match e {
        Error::NoVerify(msg) => Error::NoVerify(format!("{}: {}", url, msg)),
        other => Error::NoVerify(format!("{}: {}", url, other)),
    })
}

/// Upload a manifest, clearsigned when a signer is given
pub(crate) fn push_manifest(
    manifest: &BuildcacheManifest,
    url: &str,
    tmpdir: &Path,
    signer: Option<&ManifestSigner<'_>>,
) -> Result<()> {
    let mut body = manifest.to_json()?;
    if let Some(signer) = signer {
        body = signer.sign(&body)?;
    }
    let path = tmpdir.join(web::basename(url));
    fs::write(&path, &body)?;
    web::push_to_url(&path, url)?;
    debug!("Pushed manifest {}", url);
    Ok(())
}

/// Gzip `data` into `dest`
pub(crate) fn write_gzip(data: &[u8], dest: &Path) -> Result<()> {
    let mut encoder = GzEncoder::new(fs::File::create(dest)?, flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(())
}

/// Read a staged blob, decompressing per its record
pub(crate) fn read_blob_file(path: &Path, compression: Compression) -> Result<Vec<u8>> {
    let file = fs::File::open(path)?;
    let mut out = Vec::new();
    match compression {
        Compression::None => {
            let mut file = file;
            file.read_to_end(&mut out)?;
        }
        Compression::Gzip => {
            GzDecoder::new(file).read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

/// Layout version 3 entry: manifests plus content-addressed blobs
pub struct UrlBuildcacheEntry<'a> {
    mirror_url: String,
    spec: Option<Spec>,
    allow_unsigned: bool,
    keyring: Option<&'a Keyring>,
    manifest: Option<BuildcacheManifest>,
    remote_manifest_url: Option<String>,
    stage: Option<TempDir>,
    staged: HashMap<Component, PathBuf>,
    destroyed: bool,
}

impl<'a> UrlBuildcacheEntry<'a> {
    pub fn new(
        mirror_url: &str,
        spec: Option<&Spec>,
        allow_unsigned: bool,
        keyring: Option<&'a Keyring>,
    ) -> Self {
        Self {
            mirror_url: mirror_url.trim_end_matches('/').to_string(),
            spec: spec.cloned(),
            allow_unsigned,
            keyring,
            manifest: None,
            remote_manifest_url: None,
            stage: None,
            staged: HashMap::new(),
            destroyed: false,
        }
    }

    pub fn mirror_url(&self) -> &str {
        &self.mirror_url
    }

    /// `v3/manifests/spec/<name>/<name>-<version>-<hash>.spec.manifest.json`
    pub fn spec_manifest_url(mirror_url: &str, spec: &Spec) -> String {
        web::url_join(
            &manifests_url(mirror_url, Some(Component::Spec)),
            &[
                spec.name(),
                &format!(
                    "{}-{}-{}{}",
                    spec.name(),
                    spec.version(),
                    spec.dag_hash(),
                    SPEC_MANIFEST_SUFFIX
                ),
            ],
        )
    }

    pub fn index_manifest_url(mirror_url: &str) -> String {
        web::url_join(
            &manifests_url(mirror_url, Some(Component::Index)),
            &[INDEX_MANIFEST_FILE],
        )
    }

    pub fn key_manifest_url(mirror_url: &str, fingerprint: &str) -> String {
        web::url_join(
            &manifests_url(mirror_url, Some(Component::Key)),
            &[&format!("{}{}", fingerprint, KEY_MANIFEST_SUFFIX)],
        )
    }

    pub fn key_index_manifest_url(mirror_url: &str) -> String {
        web::url_join(
            &manifests_url(mirror_url, Some(Component::KeyIndex)),
            &[KEY_INDEX_MANIFEST_FILE],
        )
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return Err(Error::BuildcacheEntry(
                "buildcache entry used after destroy".to_string(),
            ));
        }
        Ok(())
    }

    fn stage_dir(&mut self) -> Result<PathBuf> {
        if self.stage.is_none() {
            self.stage = Some(tempfile::Builder::new().prefix("strata-blobs-").tempdir()?);
        }
        self.stage
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| Error::BuildcacheEntry("no stage directory".to_string()))
    }

    fn current_manifest(&mut self) -> Result<BuildcacheManifest> {
        match &self.manifest {
            Some(manifest) => Ok(manifest.clone()),
            None => self.read_manifest(None),
        }
    }

    /// Download the blob of `component` into the stage and validate it
    pub fn fetch_blob(&mut self, component: Component) -> Result<PathBuf> {
        self.ensure_live()?;
        if let Some(path) = self.staged.get(&component) {
            return Ok(path.clone());
        }
        let manifest = self.current_manifest()?;
        let record = manifest.blob_record(component)?;
        let url = record.url(&self.mirror_url);
        let local = self.stage_dir()?.join(&record.checksum);

        web::fetch_to_file(&url, &local).map_err(|e| {
            if e.is_not_found() {
                Error::NoSuchBlob(url.clone())
            } else {
                Error::BuildcacheEntry(format!("failed to fetch {}: {}", url, e))
            }
        })?;

        let size = fs::metadata(&local)?.len();
        if size != record.content_length {
            return Err(Error::BuildcacheEntry(format!(
                "{}: expected {} bytes, got {}",
                url, record.content_length, size
            )));
        }
        let actual = hash::checksum_file(record.algorithm()?, &local)?;
        if actual != record.checksum {
            return Err(Error::BuildcacheEntry(format!(
                "checksum mismatch for {}: expected {}, got {}",
                url, record.checksum, actual
            )));
        }

        self.staged.insert(component, local.clone());
        Ok(local)
    }

    /// Fetch and decompress a blob
    pub fn read_blob(&mut self, component: Component) -> Result<Vec<u8>> {
        let path = self.fetch_blob(component)?;
        let compression = self.current_manifest()?.blob_record(component)?.compression_alg;
        read_blob_file(&path, compression)
    }

    fn fetch_metadata_inner(&mut self) -> Result<SpecDocument> {
        let bytes = self.read_blob(Component::Spec)?;
        let doc = SpecDocument::from_json(&bytes)
            .map_err(|e| Error::BuildcacheEntry(format!("invalid spec metadata: {}", e)))?;
        if let Some(version) = doc.buildcache_layout_version {
            if version > CURRENT_BUILD_CACHE_LAYOUT_VERSION {
                return Err(Error::BuildcacheEntry(format!(
                    "spec metadata uses layout version {}, newest supported is {}",
                    version, CURRENT_BUILD_CACHE_LAYOUT_VERSION
                )));
            }
        }
        Ok(doc)
    }
}

impl BuildcacheEntry for UrlBuildcacheEntry<'_> {
    fn layout_version(&self) -> u32 {
        CURRENT_BUILD_CACHE_LAYOUT_VERSION
    }

    fn manifest_url(&self) -> Result<String> {
        self.spec
            .as_ref()
            .map(|spec| Self::spec_manifest_url(&self.mirror_url, spec))
            .ok_or_else(|| Error::BuildcacheEntry("entry has no spec".to_string()))
    }

    fn read_manifest(&mut self, manifest_url: Option<&str>) -> Result<BuildcacheManifest> {
        self.ensure_live()?;
        let url = match manifest_url {
            Some(url) => url.to_string(),
            None => self.manifest_url()?,
        };
        if self.remote_manifest_url.as_deref() == Some(url.as_str()) {
            if let Some(manifest) = &self.manifest {
                return Ok(manifest.clone());
            }
        }

        let raw = web::read_from_url(&url).map_err(|e| {
            if e.is_not_found() {
                Error::BuildcacheEntry(format!("no manifest at {}", url))
            } else {
                Error::BuildcacheEntry(format!("failed to read {}: {}", url, e))
            }
        })?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::BuildcacheEntry(format!("empty manifest at {}", url)));
        }

        let body = decode_signed(&raw, &url, self.allow_unsigned, self.keyring)?;
        let manifest = BuildcacheManifest::from_json(&body)?;
        if manifest.version != CURRENT_BUILD_CACHE_LAYOUT_VERSION {
            return Err(Error::BuildcacheEntry(format!(
                "manifest {} has layout version {}, expected {}",
                url, manifest.version, CURRENT_BUILD_CACHE_LAYOUT_VERSION
            )));
        }

        self.staged.clear();
        self.manifest = Some(manifest.clone());
        self.remote_manifest_url = Some(url);
        Ok(manifest)
    }

    fn fetch_metadata(&mut self) -> Result<SpecDocument> {
        match self.fetch_metadata_inner() {
            Ok(doc) => Ok(doc),
            Err(e) => {
                self.destroy();
                Err(e)
            }
        }
    }

    fn fetch_archive(&mut self) -> Result<PathBuf> {
        self.fetch_blob(Component::Tarball)
    }

    fn exists(&mut self, components: &[Component]) -> bool {
        if self.destroyed {
            return false;
        }
        let manifest = match self.current_manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!("No usable manifest: {}", e);
                return false;
            }
        };
        components.iter().all(|component| {
            match manifest.get_blob_records(component.media_type()) {
                Ok(records) => records.iter().all(|record| {
                    web::url_exists(&record.url(&self.mirror_url)).unwrap_or(false)
                }),
                Err(_) => false,
            }
        })
    }

    fn push_binary_package(
        &mut self,
        spec: &Spec,
        tarball: &Path,
        checksum_alg: HashAlgorithm,
        checksum: &str,
        tmpdir: &Path,
        signer: Option<&ManifestSigner<'_>>,
    ) -> Result<()> {
        self.ensure_live()?;
        self.spec = Some(spec.clone());
        let manifest_url = Self::spec_manifest_url(&self.mirror_url, spec);

        if let Err(e) = self.remove() {
            warn!("Could not clear previous entry for {}: {}", spec, e);
        }
        self.manifest = None;
        self.remote_manifest_url = None;
        self.staged.clear();

        let tarball_record = BlobRecord::new(
            fs::metadata(tarball)?.len(),
            Component::Tarball.media_type(),
            Component::Tarball.compression(),
            checksum_alg,
            checksum,
        );
        web::push_to_url(tarball, &tarball_record.url(&self.mirror_url))?;

        let mut doc = spec.to_document();
        doc.buildcache_layout_version = Some(CURRENT_BUILD_CACHE_LAYOUT_VERSION);
        let spec_file = tmpdir.join(format!("{}.spec.json.gz", spec.dag_hash()));
        write_gzip(&doc.to_json_pretty()?, &spec_file)?;
        let spec_record = BlobRecord::for_file(Component::Spec, &spec_file, checksum_alg)?;
        web::push_to_url(&spec_file, &spec_record.url(&self.mirror_url))?;

        let manifest = BuildcacheManifest::new(
            CURRENT_BUILD_CACHE_LAYOUT_VERSION,
            vec![tarball_record, spec_record],
        );
        push_manifest(&manifest, &manifest_url, tmpdir, signer)?;
        info!("Pushed {} to {}", spec, self.mirror_url);
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        self.ensure_live()?;
        let url = self.manifest_url()?;
        let raw = match web::read_from_url(&url) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        // Deletion needs the blob list, not trust in it
        let manifest = BuildcacheManifest::from_json(&signing::strip_clearsign(&raw)?)?;

        if let Err(e) = web::remove_url(&url, false) {
            warn!("Failed to remove {}: {}", url, e);
        }
        for component in [Component::Tarball, Component::Spec] {
            let Ok(records) = manifest.get_blob_records(component.media_type()) else {
                continue;
            };
            for record in records {
                let blob = record.url(&self.mirror_url);
                if let Err(e) = web::remove_url(&blob, false) {
                    warn!("Failed to remove {}: {}", blob, e);
                }
            }
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.staged.clear();
        self.manifest = None;
        self.remote_manifest_url = None;
        if let Some(stage) = self.stage.take() {
            if let Err(e) = stage.close() {
                debug!("Failed to remove stage directory: {}", e);
            }
        }
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SpecBuilder;

    struct Fixture {
        _dir: TempDir,
        mirror: String,
        work: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mirror = format!("file://{}", dir.path().join("mirror").display());
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        Fixture {
            _dir: dir,
            mirror,
            work,
        }
    }

    fn push(f: &Fixture, spec: &Spec, signer: Option<&ManifestSigner<'_>>) -> String {
        let tarball = f.work.join("pkg.tar.gz");
        write_gzip(b"not really a tarball", &tarball).unwrap();
        let checksum = hash::checksum_file(HashAlgorithm::Sha256, &tarball).unwrap();
        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(spec), true, None);
        entry
            .push_binary_package(spec, &tarball, HashAlgorithm::Sha256, &checksum, &f.work, signer)
            .unwrap();
        checksum
    }

    #[test]
    fn test_push_then_fetch() {
        let f = fixture();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        let checksum = push(&f, &spec, None);

        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        assert!(entry.exists(&[Component::Spec, Component::Tarball]));

        let doc = entry.fetch_metadata().unwrap();
        assert_eq!(doc.to_spec().unwrap(), spec);
        assert_eq!(doc.buildcache_layout_version, Some(3));

        let archive = entry.fetch_archive().unwrap();
        assert_eq!(
            hash::checksum_file(HashAlgorithm::Sha256, &archive).unwrap(),
            checksum
        );

        entry.destroy();
        assert!(!archive.exists());
        assert!(entry.read_manifest(None).is_err());
    }

    #[test]
    fn test_read_manifest_is_cached_per_url() {
        let f = fixture();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        push(&f, &spec, None);

        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        let first = entry.read_manifest(None).unwrap();
        fs::remove_file(web::local_path(&entry.manifest_url().unwrap())).unwrap();
        assert_eq!(entry.read_manifest(None).unwrap(), first);
    }

    #[test]
    fn test_unsigned_manifest_rejected_when_signature_required() {
        let f = fixture();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        push(&f, &spec, None);

        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), false, None);
        assert!(matches!(entry.read_manifest(None), Err(Error::NoVerify(_))));
    }

    #[test]
    fn test_signed_manifest_verification() {
        let f = fixture();
        let keys = TempDir::new().unwrap();
        let keyring = Keyring::new(keys.path()).unwrap();
        let fpr = keyring.create_key("Bot", "bot@example.org").unwrap();
        let signer = ManifestSigner::new(&keyring, &fpr);

        let spec = SpecBuilder::new("zlib", "1.3").build();
        push(&f, &spec, Some(&signer));

        let mut verified = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), false, Some(&keyring));
        assert!(verified.fetch_metadata().is_ok());

        let empty = TempDir::new().unwrap();
        let untrusted = Keyring::new(empty.path()).unwrap();
        let mut rejected = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), false, Some(&untrusted));
        assert!(matches!(rejected.read_manifest(None), Err(Error::NoVerify(_))));

        let mut stripped = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        assert!(stripped.fetch_metadata().is_ok());
    }

    #[test]
    fn test_wrong_version_is_entry_error() {
        let f = fixture();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        let entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        let url = entry.manifest_url().unwrap();
        web::push_bytes(br#"{"version": 2, "data": []}"#, &url).unwrap();

        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        let err = entry.read_manifest(None).unwrap_err();
        assert!(matches!(err, Error::BuildcacheEntry(_)));
        assert!(!entry.exists(&[Component::Spec]));
    }

    #[test]
    fn test_missing_blob_fails_fetch_and_exists() {
        let f = fixture();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        push(&f, &spec, None);

        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        let manifest = entry.read_manifest(None).unwrap();
        let tarball = manifest.blob_record(Component::Tarball).unwrap();
        fs::remove_file(web::local_path(&tarball.url(&f.mirror))).unwrap();

        assert!(entry.exists(&[Component::Spec]));
        assert!(!entry.exists(&[Component::Spec, Component::Tarball]));
        assert!(matches!(entry.fetch_archive(), Err(Error::NoSuchBlob(_))));
    }

    #[test]
    fn test_corrupt_blob_destroys_on_metadata_failure() {
        let f = fixture();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        push(&f, &spec, None);

        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        let manifest = entry.read_manifest(None).unwrap();
        let record = manifest.blob_record(Component::Spec).unwrap();
        let path = web::local_path(&record.url(&f.mirror));
        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xff;
        fs::write(&path, data).unwrap();

        assert!(entry.fetch_metadata().is_err());
        // destroyed: further reads are refused
        assert!(entry.read_manifest(None).is_err());
    }

    #[test]
    fn test_repush_and_remove() {
        let f = fixture();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        push(&f, &spec, None);
        push(&f, &spec, None);

        let mut entry = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        let manifest = entry.read_manifest(None).unwrap();
        entry.remove().unwrap();

        assert!(!web::url_exists(&entry.manifest_url().unwrap()).unwrap());
        for record in &manifest.data {
            assert!(!web::url_exists(&record.url(&f.mirror)).unwrap());
        }
        // Removing again is a no-op
        let mut again = UrlBuildcacheEntry::new(&f.mirror, Some(&spec), true, None);
        assert!(again.remove().is_ok());
    }

    #[test]
    fn test_factory() {
        let spec = SpecBuilder::new("zlib", "1.3").build();
        let v3 = entry_for_layout(3, "file:///m", Some(&spec), true, None).unwrap();
        assert_eq!(v3.layout_version(), 3);
        let v2 = entry_for_layout(2, "file:///m", Some(&spec), true, None).unwrap();
        assert_eq!(v2.layout_version(), 2);
        assert!(matches!(
            entry_for_layout(4, "file:///m", Some(&spec), true, None),
            Err(Error::UnknownBuildcacheLayout(4))
        ));
    }
}

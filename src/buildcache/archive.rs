// src/buildcache/archive.rs

//! Binary package tarballs
//!
//! A tarball is a gzip-compressed tar of an install prefix with paths
//! relative to the prefix. It always carries `.strata/spec.json`, the spec
//! the prefix was built from. Prefixes are not relocated: producer and
//! consumer are expected to use the same install root.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::spec::Spec;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::debug;

/// Per-prefix metadata directory
pub const METADATA_DIR: &str = ".strata";

pub const SPEC_FILE: &str = "spec.json";

pub fn metadata_path(prefix: &Path) -> PathBuf {
    prefix.join(METADATA_DIR).join(SPEC_FILE)
}

/// Record the spec a prefix was installed from
pub fn write_spec_metadata(spec: &Spec, prefix: &Path) -> Result<()> {
    let path = metadata_path(prefix);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, spec.to_json()?)?;
    Ok(())
}

/// Write a tarball of `prefix` to `out` and return its SHA-256
pub fn create_tarball(spec: &Spec, prefix: &Path, out: &Path) -> Result<String> {
    if !prefix.is_dir() {
        return Err(Error::PackageNotInstalled(format!(
            "{} (no prefix at {})",
            spec,
            prefix.display()
        )));
    }
    if !metadata_path(prefix).exists() {
        write_spec_metadata(spec, prefix)?;
    }

    let encoder = GzEncoder::new(File::create(out)?, flate2::Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", prefix)?;
    builder.into_inner()?.finish()?;

    let checksum = hash::checksum_file(HashAlgorithm::Sha256, out)?;
    debug!("Created tarball {} ({})", out.display(), checksum);
    Ok(checksum)
}

/// Unpack a tarball into `prefix`, refusing entries that escape it
pub fn extract_tarball(tarball: &Path, prefix: &Path) -> Result<()> {
    fs::create_dir_all(prefix)?;
    let mut archive = Archive::new(GzDecoder::new(File::open(tarball)?));
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !entry.unpack_in(prefix)? {
            return Err(Error::BuildcacheEntry(format!(
                "archive entry {} escapes the install prefix",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SpecBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_tarball_roundtrip() {
        let dir = TempDir::new().unwrap();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        let prefix = dir.path().join("prefix");
        fs::create_dir_all(prefix.join("lib")).unwrap();
        fs::write(prefix.join("lib/libz.a"), b"archive").unwrap();

        let out = dir.path().join("zlib.tar.gz");
        let checksum = create_tarball(&spec, &prefix, &out).unwrap();
        assert_eq!(checksum, hash::checksum_file(HashAlgorithm::Sha256, &out).unwrap());

        let target = dir.path().join("target");
        extract_tarball(&out, &target).unwrap();
        assert_eq!(fs::read(target.join("lib/libz.a")).unwrap(), b"archive");
        let meta = fs::read(metadata_path(&target)).unwrap();
        assert_eq!(Spec::from_json(&meta).unwrap(), spec);
    }

    #[test]
    fn test_missing_prefix_is_not_installed() {
        let dir = TempDir::new().unwrap();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        let err = create_tarball(&spec, &dir.path().join("nope"), &dir.path().join("o")).unwrap_err();
        assert!(matches!(err, Error::PackageNotInstalled(_)));
    }

    #[test]
    fn test_escaping_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("evil.tar.gz");
        {
            let encoder = GzEncoder::new(File::create(&out).unwrap(), flate2::Compression::default());
            let mut builder = Builder::new(encoder);
            let data = b"x";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            // set_path refuses "..", so write the name bytes directly
            header.as_old_mut().name[..9].copy_from_slice(b"../escape");
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let target = dir.path().join("target");
        assert!(extract_tarball(&out, &target).is_err());
        assert!(!dir.path().join("escape").exists());
    }
}

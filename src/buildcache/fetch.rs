// src/buildcache/fetch.rs

//! Installing binary packages from mirrors

use super::archive;
use super::entry::{BuildcacheEntry, UrlBuildcacheEntry};
use crate::error::{Error, Result};
use crate::mirror::Mirror;
use crate::signing::Keyring;
use crate::spec::Spec;
use std::path::Path;
use tracing::{info, warn};

fn install_from_entry(entry: &mut UrlBuildcacheEntry<'_>, prefix: &Path) -> Result<()> {
    entry.read_manifest(None)?;
    let tarball = entry.fetch_archive()?;
    if let Err(e) = archive::extract_tarball(&tarball, prefix) {
        if let Err(cleanup) = std::fs::remove_dir_all(prefix) {
            warn!("Failed to clean up {}: {}", prefix.display(), cleanup);
        }
        return Err(e);
    }
    Ok(())
}

/// Install `spec` into `prefix` from the first mirror that can serve it
///
/// Mirrors whose entry is missing, unverifiable or corrupt are skipped.
/// Returns the mirror that was used.
pub fn install_from_buildcache(
    spec: &Spec,
    mirrors: &[Mirror],
    keyring: Option<&Keyring>,
    allow_unsigned: bool,
    prefix: &Path,
) -> Result<Mirror> {
    let mut last_error = None;
    for mirror in mirrors {
        let mut entry = UrlBuildcacheEntry::new(mirror.fetch_url(), Some(spec), allow_unsigned, keyring);
        let result = install_from_entry(&mut entry, prefix);
        entry.destroy();

        match result {
            Ok(()) => {
                info!("Installed {} from {}", spec, mirror);
                return Ok(mirror.clone());
            }
            Err(e) if e.is_buildcache_entry_error() => {
                warn!("Cannot install {} from {}: {}", spec, mirror, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        Error::BuildcacheEntry(format!("no mirror provides a binary for {}", spec))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildcache::Component;
    use crate::hash::HashAlgorithm;
    use crate::spec::SpecBuilder;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_falls_back_to_next_mirror() {
        let dir = TempDir::new().unwrap();
        let spec = SpecBuilder::new("zlib", "1.3").build();
        let prefix = dir.path().join("build");
        fs::create_dir_all(prefix.join("include")).unwrap();
        fs::write(prefix.join("include/zlib.h"), b"#define Z").unwrap();

        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let tarball = work.join("zlib.tar.gz");
        let checksum = archive::create_tarball(&spec, &prefix, &tarball).unwrap();

        let empty = Mirror::from_url(&dir.path().join("empty").to_string_lossy());
        let full = Mirror::from_url(&dir.path().join("full").to_string_lossy());
        let mut entry = UrlBuildcacheEntry::new(full.push_url(), Some(&spec), true, None);
        entry
            .push_binary_package(&spec, &tarball, HashAlgorithm::Sha256, &checksum, &work, None)
            .unwrap();
        assert!(entry.exists(&[Component::Tarball]));

        let target = dir.path().join("installed");
        let used = install_from_buildcache(&spec, &[empty.clone(), full.clone()], None, true, &target)
            .unwrap();
        assert_eq!(used, full);
        assert_eq!(fs::read(target.join("include/zlib.h")).unwrap(), b"#define Z");

        let err = install_from_buildcache(&spec, &[empty], None, true, &dir.path().join("x"))
            .unwrap_err();
        assert!(err.is_buildcache_entry_error());
    }
}

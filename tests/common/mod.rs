// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use strata::buildcache::index::BuildcacheIndex;
use strata::buildcache::{BuildcacheEntry, UrlBuildcacheEntry, UrlBuildcacheEntryV2};
use strata::hash::{self, HashAlgorithm};
use strata::signing::Keyring;
use strata::spec::BinaryCacheChecksum;
use strata::{DepTypes, Mirror, Spec, SpecBuilder, web};
use tempfile::TempDir;

/// A mirror rooted in a fresh directory under `dir`
pub fn file_mirror(dir: &TempDir, name: &str) -> Mirror {
    Mirror::from_url(&dir.path().join(name).to_string_lossy())
}

/// libelf and libdwarf, where libdwarf depends on libelf
pub fn libdwarf_specs() -> Vec<Spec> {
    let libelf = SpecBuilder::new("libelf", "0.8.13").build();
    let libdwarf = SpecBuilder::new("libdwarf", "20180129")
        .depends_on(&libelf, DepTypes::BUILD | DepTypes::LINK)
        .build();
    vec![libelf, libdwarf]
}

/// Write specs to a mirror in the legacy layout, clearsigned when `signer` is given
pub fn write_legacy(mirror_url: &str, specs: &[Spec], signer: Option<(&Keyring, &str)>) {
    let mut legacy_index = BuildcacheIndex::new();
    for spec in specs {
        let tarball = format!("tarball of {}", spec.name()).into_bytes();
        let mut doc = spec.to_document();
        doc.buildcache_layout_version = Some(2);
        doc.binary_cache_checksum = Some(BinaryCacheChecksum {
            hash_algorithm: "sha256".to_string(),
            hash: hash::sha256(&tarball),
        });
        let body = doc.to_json_pretty().unwrap();
        match signer {
            Some((keyring, fpr)) => web::push_bytes(
                &keyring.clearsign(fpr, &body).unwrap(),
                &UrlBuildcacheEntryV2::spec_url(mirror_url, spec, true),
            )
            .unwrap(),
            None => web::push_bytes(
                &body,
                &UrlBuildcacheEntryV2::spec_url(mirror_url, spec, false),
            )
            .unwrap(),
        }
        web::push_bytes(&tarball, &UrlBuildcacheEntryV2::tarball_url(mirror_url, spec)).unwrap();
        legacy_index.add_document(&doc);
    }
    web::push_bytes(
        &legacy_index.to_json().unwrap(),
        &UrlBuildcacheEntryV2::index_url(mirror_url),
    )
    .unwrap();
}

/// Push an unsigned entry for `spec` in the current layout
pub fn push_entry(dir: &TempDir, mirror: &Mirror, spec: &Spec) {
    let work = dir.path().join(format!("work-{}", spec.dag_hash()));
    fs::create_dir_all(&work).unwrap();
    let tarball = work.join("pkg.tar.gz");
    fs::write(&tarball, format!("binary package of {}", spec.name())).unwrap();
    let checksum = hash::checksum_file(HashAlgorithm::Sha256, &tarball).unwrap();
    let mut entry = UrlBuildcacheEntry::new(mirror.push_url(), Some(spec), true, None);
    entry
        .push_binary_package(spec, &tarball, HashAlgorithm::Sha256, &checksum, &work, None)
        .unwrap();
}

/// Write a concrete spec file and return its path
pub fn write_spec_file(dir: &Path, spec: &Spec) -> std::path::PathBuf {
    let path = dir.join(format!("{}.json", spec.name()));
    fs::write(&path, spec.to_json().unwrap()).unwrap();
    path
}

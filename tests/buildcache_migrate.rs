// tests/buildcache_migrate.rs

//! Migrating a signed legacy mirror to the current layout

mod common;

use common::{file_mirror, libdwarf_specs, write_legacy};
use strata::buildcache::UrlBuildcacheEntryV2;
use strata::buildcache::index::{BinaryIndex, fetch_index};
use strata::buildcache::migrate::{MigrateOptions, migrate};
use strata::signing::Keyring;
use strata::web;
use tempfile::TempDir;

#[test]
fn test_unsigned_migration_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mirror = file_mirror(&dir, "mirror");
    let keyring = Keyring::new(dir.path().join("keys")).unwrap();
    write_legacy(mirror.fetch_url(), &libdwarf_specs(), None);

    let options = MigrateOptions {
        unsigned: true,
        ..Default::default()
    };
    let results = migrate(&mirror, &keyring, &options).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));
    assert!(results.iter().all(|r| r.message.starts_with("Successfully migrated")));

    let index = fetch_index(mirror.fetch_url(), true, None).unwrap().unwrap();
    assert_eq!(index.len(), 2);

    let again = migrate(&mirror, &keyring, &options).unwrap();
    assert!(again.iter().all(|r| r.message.starts_with("No need to migrate")));
}

#[test]
fn test_corrupt_tarball_fails_only_that_spec() {
    let dir = TempDir::new().unwrap();
    let mirror = file_mirror(&dir, "mirror");
    let keyring = Keyring::new(dir.path().join("keys")).unwrap();
    let specs = libdwarf_specs();
    write_legacy(mirror.fetch_url(), &specs, None);
    web::push_bytes(
        b"garbage",
        &UrlBuildcacheEntryV2::tarball_url(mirror.fetch_url(), &specs[0]),
    )
    .unwrap();

    let options = MigrateOptions {
        unsigned: true,
        delete_existing: true,
        ..Default::default()
    };
    let results = migrate(&mirror, &keyring, &options).unwrap();
    let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].spec, specs[0]);
    assert!(failed[0].message.contains("checksum mismatch"));
    assert!(!dir.path().join("mirror/build_cache").exists());
}

#[test]
fn test_migrate_signed_mirror_needs_trusted_key() {
    let dir = TempDir::new().unwrap();
    let mirror = file_mirror(&dir, "mirror");
    let specs = libdwarf_specs();

    let publisher = Keyring::new(dir.path().join("publisher")).unwrap();
    let fpr = publisher.create_key("Build Bot", "bot@example.org").unwrap();
    write_legacy(mirror.fetch_url(), &specs, Some((&publisher, &fpr)));

    let keyring = Keyring::new(dir.path().join("keys")).unwrap();
    let options = MigrateOptions {
        unsigned: true,
        ..Default::default()
    };

    let results = migrate(&mirror, &keyring, &options).unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert!(!result.success);
        assert!(
            result.message.starts_with(&format!(
                "Failed to verify signature of {}/",
                result.spec.name()
            )),
            "unexpected message: {}",
            result.message
        );
    }

    keyring.import(&publisher.export_public(&fpr).unwrap()).unwrap();
    let results = migrate(&mirror, &keyring, &options).unwrap();
    assert!(results.iter().all(|r| r.success));
    assert!(results.iter().all(|r| r.message.starts_with("Successfully migrated")));

    let index = BinaryIndex::new(vec![mirror], Some(&keyring), true);
    let mut names: Vec<String> = index
        .all_specs()
        .into_iter()
        .map(|(_, spec)| spec.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["libdwarf", "libelf"]);
}

#[test]
fn test_signed_migration_keeps_signatures() {
    let dir = TempDir::new().unwrap();
    let mirror = file_mirror(&dir, "mirror");
    let keyring = Keyring::new(dir.path().join("keys")).unwrap();
    let fpr = keyring.create_key("Migrator", "migrate@example.org").unwrap();
    write_legacy(mirror.fetch_url(), &libdwarf_specs(), Some((&keyring, &fpr)));

    let options = MigrateOptions {
        signing_key: Some(fpr),
        delete_existing: true,
        ..Default::default()
    };
    let results = migrate(&mirror, &keyring, &options).unwrap();
    assert!(results.iter().all(|r| r.success), "{:?}", results);
    assert!(!dir.path().join("mirror").join("build_cache").exists());

    // unsigned entries would be rejected here
    let index = BinaryIndex::new(vec![mirror], Some(&keyring), false);
    assert_eq!(index.all_specs().len(), 2);
}

// src/buildcache/prune.rs

//! Removing unwanted objects from a mirror
//!
//! Two passes, usable separately or together:
//!
//! - **Direct**: delete every spec manifest whose hash is not in a keeplist.
//! - **Orphan**: delete blobs no manifest references and manifests that
//!   reference a missing blob, repeated until a pass removes nothing.
//!
//! Mirrors have no locks, so both passes compare each candidate's mtime with
//! a start time read from the mirror's own clock and leave anything newer
//! alone: it was uploaded while the prune was running.

use super::manifest::BuildcacheManifest;
use super::{Component, LAYOUT_DIR, blobs_url, list_spec_manifests, manifests_url};
use crate::error::{Error, Result};
use crate::hash::DAG_HASH_LEN;
use crate::mirror::Mirror;
use crate::signing;
use crate::web;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const MANIFEST_NAME_PATTERN: &str = r"^(.+)-([^-]+)-([a-z0-9]{32})\.spec\.manifest\.json$";

const KEEPLIST_HASH_PATTERN: &str = r"^[a-z0-9]{32}$";

/// What a prune removed, or would remove on a dry run
#[derive(Debug, Default)]
pub struct PruneReport {
    pub manifests: Vec<String>,
    pub blobs: Vec<String>,
    /// Candidates left alone because they are newer than the prune
    pub skipped_recent: BTreeSet<String>,
    /// Manifests that could not be read; no blobs are removed while any exist
    pub unreadable: BTreeSet<String>,
    pub passes: usize,
    pub dry_run: bool,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.manifests.len() + self.blobs.len()
    }

    fn merge(&mut self, other: PruneReport) {
        self.manifests.extend(other.manifests);
        self.blobs.extend(other.blobs);
        self.skipped_recent.extend(other.skipped_recent);
        self.unreadable.extend(other.unreadable);
        self.passes += other.passes;
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::BuildcachePruning(e.to_string()))
}

/// Read a keeplist: one 32-character hash per line, blank lines ignored
pub fn read_keeplist(path: &Path) -> Result<HashSet<String>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::MalformedKeepList(format!("cannot read {}: {}", path.display(), e)))?;
    let pattern = compile(KEEPLIST_HASH_PATTERN)?;

    let mut keep = HashSet::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !pattern.is_match(line) {
            return Err(Error::MalformedKeepList(format!(
                "{}:{}: '{}' is not a {}-character hash",
                path.display(),
                lineno + 1,
                line,
                DAG_HASH_LEN
            )));
        }
        keep.insert(line.to_string());
    }
    if keep.is_empty() {
        return Err(Error::MalformedKeepList(format!("{} is empty", path.display())));
    }
    Ok(keep)
}

/// Start time of a prune on the mirror's clock
///
/// The mtime of the index manifest when there is one, otherwise the mtime
/// of a marker object written for the purpose.
pub fn pruning_started_at(mirror_url: &str) -> Result<DateTime<Utc>> {
    let index = super::entry::UrlBuildcacheEntry::index_manifest_url(mirror_url);
    if let Some(stat) = web::stat_url(&index)? {
        debug!("Pruning relative to index time {}", stat.mtime);
        return Ok(stat.mtime);
    }

    let marker = web::url_join(
        mirror_url,
        &[LAYOUT_DIR, &format!(".prune-marker-{}", uuid::Uuid::new_v4())],
    );
    web::push_bytes(b"", &marker)?;
    let stat = web::stat_url(&marker);
    if let Err(e) = web::remove_url(&marker, false) {
        warn!("Failed to remove {}: {}", marker, e);
    }
    let stat = stat?.ok_or_else(|| {
        Error::BuildcachePruning(format!("cannot read the mirror time from {}", marker))
    })?;
    debug!("Pruning relative to marker time {}", stat.mtime);
    Ok(stat.mtime)
}

/// Split candidates into those safe to delete and those newer than `started_at`
fn filter_recent(candidates: Vec<String>, started_at: DateTime<Utc>) -> (Vec<String>, Vec<String>) {
    let stats: Vec<(String, Option<DateTime<Utc>>)> = candidates
        .into_par_iter()
        .map(|url| {
            let mtime = match web::stat_url(&url) {
                Ok(stat) => stat.map(|s| s.mtime),
                Err(e) => {
                    warn!("Cannot stat {}: {}", url, e);
                    None
                }
            };
            (url, mtime)
        })
        .collect();

    let mut delete = Vec::new();
    let mut recent = Vec::new();
    for (url, mtime) in stats {
        match mtime {
            Some(mtime) if mtime > started_at => {
                debug!("Keeping {}: modified after the prune started", url);
                recent.push(url);
            }
            Some(_) => delete.push(url),
            // vanished or unreadable
            None => {}
        }
    }
    (delete, recent)
}

/// Delete objects in parallel; returns the ones that were removed
fn delete_objects(urls: &[String]) -> Vec<String> {
    urls.par_iter()
        .filter_map(|url| match web::remove_url(url, false) {
            Ok(()) => Some(url.clone()),
            Err(e) => {
                warn!("Failed to delete {}: {}", url, e);
                None
            }
        })
        .collect()
}

/// Bulk manifest deletion with `aws s3 rm`
///
/// The doomed manifests are named one by one in include filters, so the
/// call cannot remove anything uploaded after the candidates were listed.
fn delete_manifests_with_aws(manifests: &[String], mirror_url: &str) -> Result<Vec<String>> {
    let remote = manifests_url(mirror_url, None);
    let prefix = format!("{}/", remote);
    let keys = manifests
        .iter()
        .map(|url| {
            url.strip_prefix(&prefix)
                .ok_or_else(|| Error::BuildcachePruning(format!("{} is outside {}", url, remote)))
        })
        .collect::<Result<Vec<&str>>>()?;
    web::aws_remove_keys(&remote, &keys)
}

/// Delete manifests, in bulk on S3 when possible
fn delete_manifests(manifests: &[String], mirror_url: &str) -> Vec<String> {
    if manifests.is_empty() {
        return Vec::new();
    }
    let mut deleted = Vec::new();
    if web::scheme(mirror_url) == "s3" {
        match delete_manifests_with_aws(manifests, mirror_url) {
            Ok(removed) => {
                debug!("aws s3 rm removed {} manifests", removed.len());
                deleted = removed;
            }
            Err(e) => warn!("Bulk manifest deletion failed, deleting one by one: {}", e),
        }
    }
    let done: HashSet<&str> = deleted.iter().map(String::as_str).collect();
    let rest: Vec<String> = manifests
        .iter()
        .filter(|url| !done.contains(url.as_str()))
        .cloned()
        .collect();
    if !rest.is_empty() && !deleted.is_empty() {
        warn!(
            "aws s3 rm removed {} of {} manifests, deleting the rest one by one",
            deleted.len(),
            manifests.len()
        );
    }
    // Already-deleted objects are not errors for the local and S3 stores
    deleted.extend(delete_objects(&rest));
    deleted
}

/// Delete spec manifests whose hash is not in `keep`
pub fn prune_direct(
    mirror: &Mirror,
    keep: &HashSet<String>,
    started_at: DateTime<Utc>,
    dry_run: bool,
) -> Result<PruneReport> {
    if keep.is_empty() {
        return Err(Error::MalformedKeepList("keeplist is empty".to_string()));
    }
    let url = mirror.push_url();
    let pattern = compile(MANIFEST_NAME_PATTERN)?;

    let manifests = list_spec_manifests(url)?;
    let total = manifests.len();
    let mut candidates = Vec::new();
    for manifest in manifests {
        let name = web::basename(&manifest);
        let captures = pattern.captures(name).ok_or_else(|| {
            Error::BuildcachePruning(format!("unexpected spec manifest name {}", manifest))
        })?;
        if !keep.contains(&captures[3]) {
            candidates.push(manifest);
        }
    }
    if total > 0 && candidates.len() == total && !dry_run {
        return Err(Error::BuildcachePruning(format!(
            "keeplist matches none of the {} specs on {}; refusing to delete all of them \
             (is the keeplist empty or malformed?)",
            total, mirror
        )));
    }

    let mut report = PruneReport {
        dry_run,
        passes: 1,
        ..Default::default()
    };
    let (delete, recent) = filter_recent(candidates, started_at);
    report.skipped_recent.extend(recent);
    if dry_run {
        report.manifests = delete;
    } else {
        report.manifests = delete_manifests(&delete, url);
    }
    info!(
        "{} {} of {} spec manifests on {}",
        if dry_run { "Would prune" } else { "Pruned" },
        report.manifests.len(),
        total,
        mirror
    );
    Ok(report)
}

/// Blob URLs referenced by a manifest
fn manifest_references(manifest_url: &str, mirror_url: &str) -> Result<Vec<String>> {
    let raw = web::read_from_url(manifest_url)?;
    let manifest = BuildcacheManifest::from_json(&signing::strip_clearsign(&raw)?)?;
    Ok(manifest.data.iter().map(|r| r.url(mirror_url)).collect())
}

fn list_manifests(mirror_url: &str) -> Result<Vec<String>> {
    let base = manifests_url(mirror_url, None);
    Ok(web::list_url(&base, true)?
        .into_iter()
        .filter(|rel| rel.ends_with(".manifest.json"))
        .map(|rel| web::url_join(&base, &[&rel]))
        .collect())
}

fn list_blobs(mirror_url: &str) -> Result<HashSet<String>> {
    let base = blobs_url(mirror_url);
    Ok(web::list_url(&base, true)?
        .into_iter()
        .map(|rel| web::url_join(&base, &[&rel]))
        .collect())
}

/// One orphan pass; returns how many objects it removed (or would remove)
fn orphan_pass(
    mirror_url: &str,
    started_at: DateTime<Utc>,
    dry_run: bool,
    report: &mut PruneReport,
) -> Result<usize> {
    let manifests = list_manifests(mirror_url)?;
    let blobs = list_blobs(mirror_url)?;

    let read: Vec<(String, Result<Vec<String>>)> = manifests
        .par_iter()
        .map(|url| (url.clone(), manifest_references(url, mirror_url)))
        .collect();
    let mut references = Vec::with_capacity(read.len());
    let mut unreadable = Vec::new();
    for (url, refs) in read {
        match refs {
            Ok(refs) => references.push((url, refs)),
            Err(e) => {
                warn!("Cannot read manifest {}: {}", url, e);
                unreadable.push(url);
            }
        }
    }

    let mut blob_to_manifests: HashMap<&str, Vec<&str>> = HashMap::new();
    for (manifest, refs) in &references {
        for blob in refs {
            blob_to_manifests
                .entry(blob.as_str())
                .or_default()
                .push(manifest.as_str());
        }
    }

    // An unreadable manifest may reference any blob
    let mut orphaned_blobs: Vec<String> = if unreadable.is_empty() {
        blobs
            .iter()
            .filter(|b| !blob_to_manifests.contains_key(b.as_str()))
            .cloned()
            .collect()
    } else {
        warn!(
            "{} manifests on {} are unreadable, not deleting any blobs",
            unreadable.len(),
            mirror_url
        );
        Vec::new()
    };
    orphaned_blobs.sort();
    report.unreadable.extend(unreadable);

    let nonexisting: HashSet<&str> = blob_to_manifests
        .keys()
        .copied()
        .filter(|b| !blobs.contains(*b))
        .collect();
    let mut orphaned_manifests: Vec<String> = nonexisting
        .iter()
        .flat_map(|b| blob_to_manifests[b].iter().map(|m| m.to_string()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    orphaned_manifests.sort();

    debug!(
        "{} orphaned blobs, {} missing blobs, {} orphaned manifests",
        orphaned_blobs.len(),
        nonexisting.len(),
        orphaned_manifests.len()
    );

    let (manifests, recent_manifests) = filter_recent(orphaned_manifests, started_at);
    let (blobs, recent_blobs) = filter_recent(orphaned_blobs, started_at);
    report.skipped_recent.extend(recent_manifests);
    report.skipped_recent.extend(recent_blobs);

    let (manifests, blobs) = if dry_run {
        (manifests, blobs)
    } else {
        (delete_manifests(&manifests, mirror_url), delete_objects(&blobs))
    };
    let count = manifests.len() + blobs.len();
    report.manifests.extend(manifests);
    report.blobs.extend(blobs);
    report.passes += 1;
    Ok(count)
}

/// Orphan pruning against a start time that was already taken
pub fn prune_orphan_with_start(
    mirror: &Mirror,
    started_at: DateTime<Utc>,
    dry_run: bool,
) -> Result<PruneReport> {
    let mut report = PruneReport {
        dry_run,
        ..Default::default()
    };
    loop {
        let removed = orphan_pass(mirror.push_url(), started_at, dry_run, &mut report)?;
        debug!("Orphan pass {} removed {} objects", report.passes, removed);
        // A dry run cannot observe its own deletions
        if dry_run || removed == 0 {
            break;
        }
    }
    info!(
        "{} {} manifests and {} blobs on {} in {} passes",
        if dry_run { "Would prune" } else { "Pruned" },
        report.manifests.len(),
        report.blobs.len(),
        mirror,
        report.passes
    );
    Ok(report)
}

/// Delete orphaned blobs and manifests until nothing more can go
pub fn prune_orphan(mirror: &Mirror, dry_run: bool) -> Result<PruneReport> {
    let started_at = pruning_started_at(mirror.push_url())?;
    prune_orphan_with_start(mirror, started_at, dry_run)
}

/// Direct pruning when a keeplist is given, then orphan pruning
pub fn prune(mirror: &Mirror, keeplist: Option<&Path>, dry_run: bool) -> Result<PruneReport> {
    // The keeplist is checked before touching the mirror
    let keep = keeplist.map(read_keeplist).transpose()?;
    let started_at = pruning_started_at(mirror.push_url())?;

    let mut report = PruneReport {
        dry_run,
        ..Default::default()
    };
    if let Some(keep) = &keep {
        report.merge(prune_direct(mirror, keep, started_at, dry_run)?);
    }
    report.merge(prune_orphan_with_start(mirror, started_at, dry_run)?);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildcache::entry::{BuildcacheEntry, UrlBuildcacheEntry, write_gzip};
    use crate::hash::{self, HashAlgorithm};
    use crate::spec::{Spec, SpecBuilder};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        mirror: Mirror,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::from_url(&dir.path().join("mirror").to_string_lossy());
        Fixture { dir, mirror }
    }

    fn push(f: &Fixture, spec: &Spec) -> BuildcacheManifest {
        let work = f.dir.path().join(format!("work-{}", spec.dag_hash()));
        fs::create_dir_all(&work).unwrap();
        let tarball = work.join("pkg.tar.gz");
        write_gzip(spec.name().as_bytes(), &tarball).unwrap();
        let checksum = hash::checksum_file(HashAlgorithm::Sha256, &tarball).unwrap();
        let mut entry = UrlBuildcacheEntry::new(f.mirror.push_url(), Some(spec), true, None);
        entry
            .push_binary_package(spec, &tarball, HashAlgorithm::Sha256, &checksum, &work, None)
            .unwrap();
        entry.read_manifest(None).unwrap()
    }

    fn exists(url: &str) -> bool {
        web::url_exists(url).unwrap()
    }

    #[test]
    fn test_read_keeplist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keep.txt");

        fs::write(&path, "\n\n").unwrap();
        assert!(matches!(read_keeplist(&path), Err(Error::MalformedKeepList(_))));

        fs::write(&path, "not-a-hash\n").unwrap();
        assert!(matches!(read_keeplist(&path), Err(Error::MalformedKeepList(_))));

        let hash = "a".repeat(32);
        fs::write(&path, format!("  {}  \n\n", hash)).unwrap();
        assert_eq!(read_keeplist(&path).unwrap(), HashSet::from([hash]));
    }

    #[test]
    fn test_direct_prune() {
        let f = fixture();
        let keep = SpecBuilder::new("zlib", "1.3").build();
        let drop = SpecBuilder::new("bzip2", "1.0.8").build();
        push(&f, &keep);
        push(&f, &drop);

        let started = pruning_started_at(f.mirror.push_url()).unwrap();
        let keep_set = HashSet::from([keep.dag_hash().to_string()]);

        let dry = prune_direct(&f.mirror, &keep_set, started, true).unwrap();
        assert_eq!(dry.manifests.len(), 1);
        let drop_url = UrlBuildcacheEntry::spec_manifest_url(f.mirror.push_url(), &drop);
        assert!(exists(&drop_url));

        let report = prune_direct(&f.mirror, &keep_set, started, false).unwrap();
        assert_eq!(report.manifests, vec![drop_url.clone()]);
        assert!(!exists(&drop_url));
        assert!(exists(&UrlBuildcacheEntry::spec_manifest_url(f.mirror.push_url(), &keep)));
    }

    #[test]
    fn test_direct_prune_refuses_to_delete_everything() {
        let f = fixture();
        let a = SpecBuilder::new("zlib", "1.3").build();
        let b = SpecBuilder::new("bzip2", "1.0.8").build();
        push(&f, &a);
        push(&f, &b);
        let started = pruning_started_at(f.mirror.push_url()).unwrap();
        let keep = HashSet::from(["0".repeat(32)]);

        let err = prune_direct(&f.mirror, &keep, started, false).unwrap_err();
        assert!(matches!(err, Error::BuildcachePruning(_)));
        assert!(err.to_string().contains("keeplist"));

        let dry = prune_direct(&f.mirror, &keep, started, true).unwrap();
        assert_eq!(dry.manifests.len(), 2);
        assert!(exists(&UrlBuildcacheEntry::spec_manifest_url(f.mirror.push_url(), &a)));
    }

    #[test]
    fn test_unexpected_manifest_name() {
        let f = fixture();
        let url = web::url_join(
            &manifests_url(f.mirror.push_url(), Some(Component::Spec)),
            &["zlib", "garbage.spec.manifest.json"],
        );
        web::push_bytes(br#"{"version": 3, "data": []}"#, &url).unwrap();
        let started = pruning_started_at(f.mirror.push_url()).unwrap();
        let keep = HashSet::from(["a".repeat(32)]);
        assert!(matches!(
            prune_direct(&f.mirror, &keep, started, true),
            Err(Error::BuildcachePruning(_))
        ));
    }

    #[test]
    fn test_orphan_prune_reaches_fixed_point() {
        let f = fixture();
        let healthy = SpecBuilder::new("zlib", "1.3").build();
        let broken = SpecBuilder::new("bzip2", "1.0.8").build();
        let healthy_manifest = push(&f, &healthy);
        let broken_manifest = push(&f, &broken);

        let stray = web::url_join(&blobs_url(f.mirror.push_url()), &["sha256", "ab", &"ab".repeat(32)]);
        web::push_bytes(b"stray", &stray).unwrap();
        let tarball = broken_manifest.blob_record(Component::Tarball).unwrap();
        web::remove_url(&tarball.url(f.mirror.push_url()), false).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let started = Utc::now();

        let dry = prune_orphan_with_start(&f.mirror, started, true).unwrap();
        assert_eq!(dry.passes, 1);
        assert_eq!(dry.manifests.len(), 1);
        assert_eq!(dry.blobs, vec![stray.clone()]);
        assert!(exists(&stray));

        let report = prune_orphan_with_start(&f.mirror, started, false).unwrap();
        assert!(report.passes >= 2);
        assert!(!exists(&stray));
        assert!(!exists(&UrlBuildcacheEntry::spec_manifest_url(f.mirror.push_url(), &broken)));
        // the spec blob of the broken entry goes on the next pass
        let spec_blob = broken_manifest.blob_record(Component::Spec).unwrap();
        assert!(!exists(&spec_blob.url(f.mirror.push_url())));
        for record in &healthy_manifest.data {
            assert!(exists(&record.url(f.mirror.push_url())));
        }

        let again = prune_orphan_with_start(&f.mirror, started, false).unwrap();
        assert_eq!(again.total(), 0);
    }

    #[test]
    fn test_unreadable_manifest_keeps_all_blobs() {
        let f = fixture();
        let zlib = SpecBuilder::new("zlib", "1.3").build();
        let manifest = push(&f, &zlib);
        let manifest_url = UrlBuildcacheEntry::spec_manifest_url(f.mirror.push_url(), &zlib);

        // a manifest from a newer format this version cannot parse
        let mut value: serde_json::Value =
            serde_json::from_slice(&web::read_from_url(&manifest_url).unwrap()).unwrap();
        value["future_field"] = serde_json::json!(true);
        web::push_bytes(&serde_json::to_vec(&value).unwrap(), &manifest_url).unwrap();

        let stray = web::url_join(&blobs_url(f.mirror.push_url()), &["sha256", "ef", &"ef".repeat(32)]);
        web::push_bytes(b"stray", &stray).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let started = Utc::now();

        let report = prune_orphan_with_start(&f.mirror, started, false).unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.unreadable.contains(&manifest_url));
        assert!(exists(&manifest_url));
        assert!(exists(&stray));
        for record in &manifest.data {
            assert!(exists(&record.url(f.mirror.push_url())));
        }
    }

    #[test]
    fn test_objects_newer_than_start_survive() {
        let f = fixture();
        fs::create_dir_all(f.dir.path().join("mirror")).unwrap();
        let started = pruning_started_at(f.mirror.push_url()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let late = web::url_join(&blobs_url(f.mirror.push_url()), &["sha256", "cd", &"cd".repeat(32)]);
        web::push_bytes(b"uploaded during prune", &late).unwrap();

        let report = prune_orphan_with_start(&f.mirror, started, false).unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.skipped_recent.contains(&late));
        assert!(exists(&late));
    }
}

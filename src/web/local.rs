// src/web/local.rs
//! `file://` mirrors

use super::{BlobStore, ObjectStat};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Local filesystem path of a `file://` URL (or bare path)
pub fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

fn not_found(url: &str, err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotFound(url.to_string())
    } else {
        Error::Io(err)
    }
}

pub struct LocalStore;

impl BlobStore for LocalStore {
    fn read_from_url(&self, url: &str) -> Result<Vec<u8>> {
        fs::read(local_path(url)).map_err(|e| not_found(url, e))
    }

    fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        fs::copy(local_path(url), dest).map_err(|e| not_found(url, e))
    }

    fn push_to_url(&self, local: &Path, url: &str) -> Result<()> {
        let dest = local_path(url);
        let parent = dest
            .parent()
            .ok_or_else(|| Error::Web(format!("cannot push to {}", url)))?;
        fs::create_dir_all(parent)?;

        // Write beside the destination, then rename over it
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        fs::copy(local, temp.path())?;
        temp.persist(&dest).map_err(|e| Error::Io(e.error))?;
        debug!("Stored {}", dest.display());
        Ok(())
    }

    fn remove_url(&self, url: &str, recursive: bool) -> Result<()> {
        let path = local_path(url);
        let result = if recursive && path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| not_found(url, e))
    }

    fn list_url(&self, url: &str, recursive: bool) -> Result<Vec<String>> {
        let root = local_path(url);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let depth = if recursive { usize::MAX } else { 1 };
        let mut out = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).max_depth(depth) {
            let entry = entry.map_err(|e| Error::Web(format!("listing {}: {}", url, e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&root) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    fn stat_url(&self, url: &str) -> Result<Option<ObjectStat>> {
        match fs::metadata(local_path(url)) {
            Ok(meta) => Ok(Some(ObjectStat {
                size: meta.len(),
                mtime: DateTime::<Utc>::from(meta.modified()?),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

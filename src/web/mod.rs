// src/web/mod.rs

//! Generic blob store over mirror URLs
//!
//! The buildcache only needs five operations from a mirror: read an object,
//! write an object, delete an object (or a prefix), list objects under a
//! prefix, and stat an object for its size and server-side mtime. Each URL
//! scheme gets a [`BlobStore`] implementation:
//!
//! | Scheme | Backend |
//! |--------|---------|
//! | `file://` | local filesystem |
//! | `http://`, `https://` | blocking HTTP client (GET/HEAD/PUT/DELETE) |
//! | `s3://` | the `aws` command line tool |
//!
//! The free functions at the bottom of this module dispatch on the URL, so
//! callers rarely need to hold a store themselves.

mod http;
mod local;
mod s3;

pub use http::HttpStore;
pub use local::{LocalStore, local_path};
pub use s3::{S3Store, aws_remove_keys, split_url};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::OnceLock;

/// Size and server-reported modification time of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Operations a mirror backend must provide
pub trait BlobStore: Send + Sync {
    /// Read a whole object. Missing objects are `Error::NotFound`.
    fn read_from_url(&self, url: &str) -> Result<Vec<u8>>;

    /// Upload a local file to `url`, replacing any existing object
    fn push_to_url(&self, local: &Path, url: &str) -> Result<()>;

    /// Delete an object, or every object under a prefix when `recursive`
    fn remove_url(&self, url: &str, recursive: bool) -> Result<()>;

    /// Object paths relative to `url`. A missing prefix lists as empty.
    fn list_url(&self, url: &str, recursive: bool) -> Result<Vec<String>>;

    /// `None` when the object does not exist
    fn stat_url(&self, url: &str) -> Result<Option<ObjectStat>>;

    /// Download an object into a local file
    fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let data = self.read_from_url(url)?;
        std::fs::write(dest, &data)?;
        Ok(data.len() as u64)
    }

    fn url_exists(&self, url: &str) -> Result<bool> {
        Ok(self.stat_url(url)?.is_some())
    }
}

static LOCAL: LocalStore = LocalStore;
static S3: S3Store = S3Store;
static HTTP: OnceLock<HttpStore> = OnceLock::new();

/// Pick the backend for a URL
pub fn store_for(url: &str) -> Result<&'static dyn BlobStore> {
    match scheme(url) {
        "file" | "" => Ok(&LOCAL),
        "s3" => Ok(&S3),
        "http" | "https" => {
            if let Some(store) = HTTP.get() {
                return Ok(store);
            }
            let store = HttpStore::new()?;
            Ok(HTTP.get_or_init(|| store))
        }
        other => Err(Error::Web(format!("unsupported URL scheme '{}' in {}", other, url))),
    }
}

/// Scheme of a URL, or an empty string for bare paths
pub fn scheme(url: &str) -> &str {
    url.split_once("://").map(|(s, _)| s).unwrap_or("")
}

/// Join path segments onto a URL with single slashes
pub fn url_join(base: &str, parts: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in parts {
        let part = part.trim_matches('/');
        if part.is_empty() {
            continue;
        }
        url.push('/');
        url.push_str(part);
    }
    url
}

/// Final path component of a URL
pub fn basename(url: &str) -> &str {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
}

pub fn read_from_url(url: &str) -> Result<Vec<u8>> {
    store_for(url)?.read_from_url(url)
}

pub fn fetch_to_file(url: &str, dest: &Path) -> Result<u64> {
    store_for(url)?.fetch_to_file(url, dest)
}

pub fn push_to_url(local: &Path, url: &str) -> Result<()> {
    store_for(url)?.push_to_url(local, url)
}

/// Upload in-memory bytes through a temporary file
pub fn push_bytes(data: &[u8], url: &str) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut tmp, data)?;
    push_to_url(tmp.path(), url)
}

pub fn remove_url(url: &str, recursive: bool) -> Result<()> {
    store_for(url)?.remove_url(url, recursive)
}

pub fn list_url(url: &str, recursive: bool) -> Result<Vec<String>> {
    store_for(url)?.list_url(url, recursive)
}

pub fn stat_url(url: &str) -> Result<Option<ObjectStat>> {
    store_for(url)?.stat_url(url)
}

pub fn url_exists(url: &str) -> Result<bool> {
    store_for(url)?.url_exists(url)
}

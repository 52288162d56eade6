// src/web/http.rs

//! HTTP(S) mirrors
//!
//! Reads use GET and HEAD. Writes use PUT and DELETE, which works against
//! WebDAV-style servers and presigned object stores. Listing follows the
//! links of an HTML directory index, descending into `.../` links when
//! asked to recurse.

use super::{BlobStore, ObjectStat};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for HTTP requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum attempts for idempotent requests
const MAX_RETRIES: u32 = 3;

const RETRY_DELAY_MS: u64 = 500;

pub struct HttpStore {
    client: Client,
}

impl HttpStore {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Web(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    return Err(Error::NotFound(url.to_string()));
                }
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if attempt >= MAX_RETRIES || response.status().is_client_error() => {
                    return Err(Error::Web(format!("GET {}: HTTP {}", url, response.status())));
                }
                Err(e) if attempt >= MAX_RETRIES => {
                    return Err(Error::Web(format!("GET {}: {e}", url)));
                }
                Ok(response) => {
                    warn!("GET {} returned {} (attempt {})", url, response.status(), attempt);
                }
                Err(e) => {
                    warn!("GET {} failed (attempt {}): {e}", url, attempt);
                }
            }
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
        }
    }

    fn links(&self, url: &str) -> Result<Vec<String>> {
        static HREF: OnceLock<Option<Regex>> = OnceLock::new();
        let href = HREF
            .get_or_init(|| Regex::new(r#"href="([^"?#]+)""#).ok())
            .as_ref()
            .ok_or_else(|| Error::Web("invalid link pattern".to_string()))?;

        let dir_url = format!("{}/", url.trim_end_matches('/'));
        let body = match self.get(&dir_url) {
            Ok(response) => response
                .text()
                .map_err(|e| Error::Web(format!("reading {}: {e}", dir_url)))?,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(href
            .captures_iter(&body)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .filter(|link| !link.starts_with('/') && !link.contains("://") && !link.starts_with(".."))
            .collect())
    }
}

impl BlobStore for HttpStore {
    fn read_from_url(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url)?;
        let bytes = response
            .bytes()
            .map_err(|e| Error::Web(format!("reading {}: {e}", url)))?;
        Ok(bytes.to_vec())
    }

    fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.get(url)?;
        let mut file = File::create(dest)?;
        let n = response
            .copy_to(&mut file)
            .map_err(|e| Error::Web(format!("downloading {}: {e}", url)))?;
        debug!("Downloaded {} bytes from {}", n, url);
        Ok(n)
    }

    fn push_to_url(&self, local: &Path, url: &str) -> Result<()> {
        let file = File::open(local)?;
        let response = self
            .client
            .put(url)
            .body(file)
            .send()
            .map_err(|e| Error::Web(format!("PUT {}: {e}", url)))?;
        if !response.status().is_success() {
            return Err(Error::Web(format!("PUT {}: HTTP {}", url, response.status())));
        }
        Ok(())
    }

    fn remove_url(&self, url: &str, recursive: bool) -> Result<()> {
        if recursive {
            for rel in self.list_url(url, true)? {
                self.remove_url(&super::url_join(url, &[&rel]), false)?;
            }
            return Ok(());
        }
        let response = self
            .client
            .delete(url)
            .send()
            .map_err(|e| Error::Web(format!("DELETE {}: {e}", url)))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(url.to_string())),
            s => Err(Error::Web(format!("DELETE {}: HTTP {}", url, s))),
        }
    }

    fn list_url(&self, url: &str, recursive: bool) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(prefix) = pending.pop() {
            let here = super::url_join(url, &[&prefix]);
            for link in self.links(&here)? {
                let rel = format!("{}{}", prefix, link);
                if link.ends_with('/') {
                    if recursive {
                        pending.push(rel);
                    }
                } else {
                    out.push(rel);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn stat_url(&self, url: &str) -> Result<Option<ObjectStat>> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|e| Error::Web(format!("HEAD {}: {e}", url)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Web(format!("HEAD {}: HTTP {}", url, response.status())));
        }

        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mtime = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| Error::Web(format!("HEAD {}: no Last-Modified header", url)))?;
        Ok(Some(ObjectStat { size, mtime }))
    }
}

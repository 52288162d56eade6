// src/mirror.rs
//! Buildcache mirrors
//!
//! A mirror may be read from one location and written to another (for
//! example an HTTPS front for reads and the S3 bucket behind it for writes).

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    name: String,
    fetch_url: String,
    push_url: String,
}

impl Mirror {
    pub fn new(name: &str, fetch_url: &str, push_url: &str) -> Self {
        Self {
            name: name.to_string(),
            fetch_url: normalize(fetch_url),
            push_url: normalize(push_url),
        }
    }

    /// Anonymous mirror for a single URL used for both directions
    pub fn from_url(url: &str) -> Self {
        Self::new(url, url, url)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fetch_url(&self) -> &str {
        &self.fetch_url
    }

    pub fn push_url(&self) -> &str {
        &self.push_url
    }
}

impl fmt::Display for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.fetch_url {
            write!(f, "{}", self.fetch_url)
        } else {
            write!(f, "{} ({})", self.name, self.fetch_url)
        }
    }
}

/// Bare paths become `file://` URLs; trailing slashes are dropped
fn normalize(url: &str) -> String {
    let url = if url.contains("://") {
        url.to_string()
    } else {
        let path = std::path::Path::new(url);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        format!("file://{}", absolute.display())
    };
    match url.trim_end_matches('/') {
        "file:" => "file:///".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_path_becomes_file_url() {
        let mirror = Mirror::from_url("/srv/mirror/");
        assert_eq!(mirror.fetch_url(), "file:///srv/mirror");
        assert_eq!(mirror.push_url(), "file:///srv/mirror");
    }

    #[test]
    fn test_split_urls() {
        let mirror = Mirror::new("cache", "https://cache.example.org/", "s3://bucket");
        assert_eq!(mirror.fetch_url(), "https://cache.example.org");
        assert_eq!(mirror.push_url(), "s3://bucket");
        assert_eq!(mirror.to_string(), "cache (https://cache.example.org)");
    }
}

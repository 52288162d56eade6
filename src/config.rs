// src/config.rs
//! User configuration
//!
//! Loaded from `$STRATA_CONFIG`, else `$XDG_CONFIG_HOME/strata/config.toml`.
//! Every field is optional; command line flags override what is read here.

use crate::error::{Error, Result};
use crate::mirror::Mirror;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "STRATA_CONFIG";

/// Where packages may come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Use the buildcache when an index lists the spec, else build from source
    #[default]
    Auto,
    /// Only install from the buildcache
    CacheOnly,
    /// Never consult the buildcache
    SourceOnly,
}

impl std::fmt::Display for InstallPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallPolicy::Auto => write!(f, "auto"),
            InstallPolicy::CacheOnly => write!(f, "cache_only"),
            InstallPolicy::SourceOnly => write!(f, "source_only"),
        }
    }
}

/// A configured mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub name: String,
    pub url: String,
    /// Upload location; defaults to `url`
    #[serde(default)]
    pub push_url: Option<String>,
}

impl MirrorConfig {
    pub fn to_mirror(&self) -> Mirror {
        Mirror::new(
            &self.name,
            &self.url,
            self.push_url.as_deref().unwrap_or(&self.url),
        )
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub install_root: PathBuf,
    pub jobs: usize,
    pub keyring_dir: PathBuf,
    pub install_policy: InstallPolicy,
    /// Accept unsigned buildcache entries
    pub unsigned: bool,
    pub mirrors: Vec<MirrorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let data = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("strata");
        Self {
            install_root: data.join("opt"),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            keyring_dir: data.join("keys"),
            install_policy: InstallPolicy::Auto,
            unsigned: false,
            mirrors: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)?;
        config.install_root = expand_home(&config.install_root);
        config.keyring_dir = expand_home(&config.keyring_dir);
        if config.jobs == 0 {
            return Err(Error::Config("jobs must be at least 1".to_string()));
        }
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|d| d.join("strata").join("config.toml"))
    }

    /// Configured mirrors in declaration order
    pub fn mirrors(&self) -> Vec<Mirror> {
        self.mirrors.iter().map(MirrorConfig::to_mirror).collect()
    }

    /// Look up a mirror by name, or treat the argument as a URL
    pub fn mirror(&self, name_or_url: &str) -> Mirror {
        self.mirrors
            .iter()
            .find(|m| m.name == name_or_url)
            .map(MirrorConfig::to_mirror)
            .unwrap_or_else(|| Mirror::from_url(name_or_url))
    }

    /// Directory for installer bookkeeping (database, logs, locks)
    pub fn state_dir(&self) -> PathBuf {
        self.install_root.join(".strata")
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir().join("db.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.jobs >= 1);
        assert_eq!(config.install_policy, InstallPolicy::Auto);
        assert!(config.mirrors.is_empty());
        assert!(config.database_path().ends_with(".strata/db.sqlite"));
    }

    #[test]
    fn test_parse_full() {
        let config = Config::from_toml(
            r#"
            install_root = "/opt/strata"
            jobs = 4
            install_policy = "cache_only"
            unsigned = true

            [[mirrors]]
            name = "local"
            url = "file:///srv/mirror"
            push_url = "s3://bucket/mirror"
            "#,
        )
        .unwrap();

        assert_eq!(config.install_root, PathBuf::from("/opt/strata"));
        assert_eq!(config.jobs, 4);
        assert_eq!(config.install_policy, InstallPolicy::CacheOnly);
        assert!(config.unsigned);

        let mirror = config.mirror("local");
        assert_eq!(mirror.fetch_url(), "file:///srv/mirror");
        assert_eq!(mirror.push_url(), "s3://bucket/mirror");
    }

    #[test]
    fn test_unknown_mirror_is_a_url() {
        let config = Config::default();
        let mirror = config.mirror("file:///tmp/cache");
        assert_eq!(mirror.fetch_url(), "file:///tmp/cache");
        assert_eq!(mirror.push_url(), "file:///tmp/cache");
    }

    #[test]
    fn test_zero_jobs_rejected() {
        assert!(matches!(
            Config::from_toml("jobs = 0"),
            Err(Error::Config(_))
        ));
    }
}

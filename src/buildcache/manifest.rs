// src/buildcache/manifest.rs

//! Blob records and buildcache manifests
//!
//! ```json
//! {"version": 3, "data": [
//!   {"contentLength": 10731083, "mediaType": "application/vnd.spack.install.v2.tar+gzip",
//!    "compression": "gzip", "checksumAlgorithm": "sha256", "checksum": "..."}
//! ]}
//! ```
//!
//! Unknown fields are rejected on both levels.

use super::{BLOBS_DIR, Component};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::web;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
}

/// One content-addressed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BlobRecord {
    pub content_length: u64,
    pub media_type: String,
    #[serde(rename = "compression")]
    pub compression_alg: Compression,
    #[serde(rename = "checksumAlgorithm")]
    pub checksum_alg: String,
    pub checksum: String,
}

impl BlobRecord {
    pub fn new(
        content_length: u64,
        media_type: &str,
        compression_alg: Compression,
        checksum_alg: HashAlgorithm,
        checksum: &str,
    ) -> Self {
        Self {
            content_length,
            media_type: media_type.to_string(),
            compression_alg,
            checksum_alg: checksum_alg.name().to_string(),
            checksum: checksum.to_string(),
        }
    }

    /// Record describing a local file as a blob of `component`
    pub fn for_file(component: Component, path: &Path, algorithm: HashAlgorithm) -> Result<Self> {
        let checksum = hash::checksum_file(algorithm, path)?;
        let len = std::fs::metadata(path)?.len();
        Ok(Self::new(
            len,
            component.media_type(),
            component.compression(),
            algorithm,
            &checksum,
        ))
    }

    pub fn algorithm(&self) -> Result<HashAlgorithm> {
        self.checksum_alg
            .parse()
            .map_err(|e| Error::BuildcacheEntry(format!("blob record: {}", e)))
    }

    fn validate(&self) -> Result<()> {
        let algorithm = self.algorithm()?;
        hash::validate_checksum(algorithm, &self.checksum)
            .map_err(|e| Error::BuildcacheEntry(format!("blob record: {}", e)))
    }

    /// `blobs/<alg>/<checksum[:2]>/<checksum>`
    pub fn relative_path(&self) -> String {
        let prefix = self.checksum.get(..2).unwrap_or(&self.checksum);
        format!(
            "{}/{}/{}/{}",
            BLOBS_DIR, self.checksum_alg, prefix, self.checksum
        )
    }

    /// Where this blob lives on a mirror
    pub fn url(&self, mirror_url: &str) -> String {
        web::url_join(mirror_url, &[&self.relative_path()])
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let record: Self = serde_json::from_value(value)
            .map_err(|e| Error::BuildcacheEntry(format!("invalid blob record: {}", e)))?;
        record.validate()?;
        Ok(record)
    }
}

/// Versioned list of blob records making up one logical entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildcacheManifest {
    pub version: u32,
    pub data: Vec<BlobRecord>,
}

impl BuildcacheManifest {
    pub fn new(version: u32, data: Vec<BlobRecord>) -> Self {
        Self { version, data }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::BuildcacheEntry(format!("invalid manifest: {}", e)))?;
        for record in &manifest.data {
            record.validate()?;
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Every record of `media_type`; at least one must exist
    pub fn get_blob_records(&self, media_type: &str) -> Result<Vec<&BlobRecord>> {
        let records: Vec<&BlobRecord> = self
            .data
            .iter()
            .filter(|r| r.media_type == media_type)
            .collect();
        if records.is_empty() {
            return Err(Error::NoSuchBlob(format!(
                "manifest has no blob of type {}",
                media_type
            )));
        }
        Ok(records)
    }

    /// The first record for a component expected exactly once
    pub fn blob_record(&self, component: Component) -> Result<&BlobRecord> {
        Ok(self.get_blob_records(component.media_type())?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tarball_record() -> BlobRecord {
        BlobRecord::new(
            10,
            Component::Tarball.media_type(),
            Compression::Gzip,
            HashAlgorithm::Sha256,
            &hash::sha256(b"tarball"),
        )
    }

    #[test]
    fn test_record_dict_roundtrip() {
        let record = tarball_record();
        let value = record.to_value().unwrap();
        assert_eq!(value["contentLength"], 10);
        assert_eq!(value["compression"], "gzip");
        assert_eq!(value["checksumAlgorithm"], "sha256");
        assert_eq!(BlobRecord::from_value(value).unwrap(), record);
    }

    #[test]
    fn test_record_rejects_unknown_fields() {
        let mut value = tarball_record().to_value().unwrap();
        value["extra"] = json!(1);
        assert!(BlobRecord::from_value(value).is_err());
    }

    #[test]
    fn test_record_rejects_bad_checksum() {
        let mut value = tarball_record().to_value().unwrap();
        value["checksum"] = json!("abc");
        assert!(matches!(
            BlobRecord::from_value(value),
            Err(Error::BuildcacheEntry(_))
        ));
    }

    #[test]
    fn test_relative_path() {
        let record = tarball_record();
        let path = record.relative_path();
        assert_eq!(
            path,
            format!("blobs/sha256/{}/{}", &record.checksum[..2], record.checksum)
        );
        assert_eq!(record.url("file:///m/"), format!("file:///m/{}", path));
    }

    #[test]
    fn test_manifest_lookup() {
        let manifest = BuildcacheManifest::new(3, vec![tarball_record()]);
        let parsed = BuildcacheManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);

        assert_eq!(parsed.blob_record(Component::Tarball).unwrap(), &tarball_record());
        assert!(matches!(
            parsed.get_blob_records(Component::Spec.media_type()),
            Err(Error::NoSuchBlob(_))
        ));
    }

    #[test]
    fn test_manifest_rejects_unknown_top_level_field() {
        let raw = json!({"version": 3, "data": [], "signed": true});
        assert!(BuildcacheManifest::from_json(raw.to_string().as_bytes()).is_err());
    }
}

// src/signing.rs

//! OpenPGP keyring and clearsigned documents
//!
//! Buildcache manifests are optionally wrapped in an OpenPGP cleartext
//! signature. This module keeps a directory of armored certificates
//! (`<FINGERPRINT>.asc`), signs documents with a secret key from it and
//! verifies documents against every certificate it holds, using the
//! sequoia-openpgp library (pure Rust implementation).

use crate::error::{Error, Result};
use openpgp::cert::prelude::*;
use openpgp::parse::stream::{
    MessageLayer, MessageStructure, VerificationHelper, VerifierBuilder,
};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Message, Signer};
use openpgp::serialize::SerializeInto;
use openpgp::{Cert, KeyHandle};
use sequoia_openpgp as openpgp;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CLEARSIGN_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";

fn signing_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Signing(format!("{}: {}", context, e))
}

/// Summary of a certificate in the keyring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub user_ids: Vec<String>,
    /// Whether a usable unencrypted signing key is present
    pub can_sign: bool,
}

/// Directory of trusted certificates and secret keys
pub struct Keyring {
    dir: PathBuf,
    policy: StandardPolicy<'static>,
}

impl Keyring {
    /// Open (and create if needed) the keyring at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            policy: StandardPolicy::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn cert_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.asc", fingerprint))
    }

    fn load_certs(&self) -> Result<Vec<Cert>> {
        let mut certs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("asc") {
                continue;
            }
            match fs::read(&path).map_err(Error::from).and_then(|data| {
                Cert::from_bytes(&data).map_err(|e| signing_error("parse", e))
            }) {
                Ok(cert) => certs.push(cert),
                Err(e) => warn!("Skipping unreadable key {}: {}", path.display(), e),
            }
        }
        certs.sort_by_key(|c| c.fingerprint().to_hex());
        Ok(certs)
    }

    fn find(&self, id: &str) -> Result<Cert> {
        let wanted = id.to_uppercase();
        let mut matches: Vec<Cert> = self
            .load_certs()?
            .into_iter()
            .filter(|c| c.fingerprint().to_hex().ends_with(&wanted))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::Signing(format!("no key matching '{}'", id))),
            _ => Err(Error::Signing(format!("'{}' matches more than one key", id))),
        }
    }

    fn can_sign(&self, cert: &Cert) -> bool {
        cert.keys()
            .unencrypted_secret()
            .with_policy(&self.policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .is_some()
    }

    fn info(&self, cert: &Cert) -> KeyInfo {
        KeyInfo {
            fingerprint: cert.fingerprint().to_hex(),
            user_ids: cert
                .userids()
                .map(|u| String::from_utf8_lossy(u.userid().value()).into_owned())
                .collect(),
            can_sign: self.can_sign(cert),
        }
    }

    fn store(&self, cert: &Cert) -> Result<()> {
        let armored = if cert.is_tsk() {
            cert.as_tsk().armored().to_vec()
        } else {
            cert.armored().to_vec()
        }
        .map_err(|e| signing_error("serialize key", e))?;
        fs::write(self.cert_path(&cert.fingerprint().to_hex()), armored)?;
        Ok(())
    }

    /// Import an armored or binary certificate, merging with any existing copy
    pub fn import(&self, data: &[u8]) -> Result<String> {
        let cert = Cert::from_bytes(data).map_err(|e| signing_error("parse key", e))?;
        let fingerprint = cert.fingerprint().to_hex();

        let merged = match fs::read(self.cert_path(&fingerprint)) {
            Ok(existing) => Cert::from_bytes(&existing)
                .and_then(|old| old.merge_public_and_secret(cert.clone()))
                .unwrap_or(cert),
            Err(_) => cert,
        };
        self.store(&merged)?;
        info!("Imported key {}", fingerprint);
        Ok(fingerprint)
    }

    /// Trust the public key stored in a file
    pub fn trust(&self, path: &Path) -> Result<String> {
        self.import(&fs::read(path)?)
    }

    pub fn list(&self) -> Result<Vec<KeyInfo>> {
        Ok(self.load_certs()?.iter().map(|c| self.info(c)).collect())
    }

    /// Keys that can sign
    pub fn secret_keys(&self) -> Result<Vec<KeyInfo>> {
        Ok(self.list()?.into_iter().filter(|k| k.can_sign).collect())
    }

    /// Resolve the key to sign with
    ///
    /// With no explicit request there must be exactly one usable secret key.
    pub fn signing_key(&self, requested: Option<&str>) -> Result<String> {
        if let Some(id) = requested {
            let cert = self.find(id)?;
            if !self.can_sign(&cert) {
                return Err(Error::Signing(format!("key '{}' cannot sign", id)));
            }
            return Ok(cert.fingerprint().to_hex());
        }

        let mut keys = self.secret_keys()?;
        match keys.len() {
            1 => Ok(keys.remove(0).fingerprint),
            0 => Err(Error::Signing(
                "no secret key available for signing; create one or pass --unsigned".to_string(),
            )),
            n => Err(Error::Signing(format!(
                "{} secret keys available; choose one with --key",
                n
            ))),
        }
    }

    /// Wrap `data` in a cleartext signature made with `fingerprint`
    pub fn clearsign(&self, fingerprint: &str, data: &[u8]) -> Result<Vec<u8>> {
        let cert = self.find(fingerprint)?;
        let keypair = cert
            .keys()
            .unencrypted_secret()
            .with_policy(&self.policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| Error::Signing(format!("key {} cannot sign", fingerprint)))?
            .key()
            .clone()
            .into_keypair()
            .map_err(|e| signing_error("load secret key", e))?;

        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let mut signer = Signer::new(message, keypair)
                .cleartext()
                .build()
                .map_err(|e| signing_error("clearsign", e))?;
            signer.write_all(data)?;
            signer.finalize().map_err(|e| signing_error("clearsign", e))?;
        }
        debug!("Clearsigned {} bytes with {}", data.len(), fingerprint);
        Ok(sink)
    }

    /// Verify a clearsigned document and return its body
    pub fn verify_clearsigned(&self, data: &[u8]) -> Result<Vec<u8>> {
        let certs = self.load_certs()?;
        if certs.is_empty() {
            return Err(Error::NoVerify("no trusted keys in keyring".to_string()));
        }

        let helper = TrustedCerts { certs };
        let mut verifier = VerifierBuilder::from_bytes(data)
            .and_then(|b| b.with_policy(&self.policy, None, helper))
            .map_err(|e| Error::NoVerify(e.to_string()))?;

        let mut body = Vec::new();
        verifier
            .read_to_end(&mut body)
            .map_err(|e| Error::NoVerify(e.to_string()))?;
        Ok(body)
    }

    /// Armored public half of a key
    pub fn export_public(&self, fingerprint: &str) -> Result<Vec<u8>> {
        let cert = self.find(fingerprint)?;
        cert.armored()
            .to_vec()
            .map_err(|e| signing_error("export key", e))
    }

    /// Generate a new signing key and store it
    pub fn create_key(&self, name: &str, email: &str) -> Result<String> {
        let (cert, _revocation) = CertBuilder::new()
            .add_userid(format!("{} <{}>", name, email))
            .add_signing_subkey()
            .generate()
            .map_err(|e| signing_error("generate key", e))?;
        self.store(&cert)?;
        let fingerprint = cert.fingerprint().to_hex();
        info!("Created signing key {}", fingerprint);
        Ok(fingerprint)
    }
}

/// A keyring paired with the key that signs manifests
#[derive(Clone, Copy)]
pub struct ManifestSigner<'a> {
    pub keyring: &'a Keyring,
    pub fingerprint: &'a str,
}

impl<'a> ManifestSigner<'a> {
    pub fn new(keyring: &'a Keyring, fingerprint: &'a str) -> Self {
        Self {
            keyring,
            fingerprint,
        }
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.keyring.clearsign(self.fingerprint, data)
    }
}

struct TrustedCerts {
    certs: Vec<Cert>,
}

impl VerificationHelper for TrustedCerts {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(|r| r.is_ok()) {
                    return Ok(());
                }
                return Err(anyhow::anyhow!("no valid signature from a trusted key"));
            }
        }
        Err(anyhow::anyhow!("document is not signed"))
    }
}

/// Whether `data` looks like a cleartext-signed document
pub fn is_clearsigned(data: &[u8]) -> bool {
    String::from_utf8_lossy(data)
        .trim_start()
        .starts_with(CLEARSIGN_HEADER)
}

/// Extract the body of a clearsigned document without verifying it
///
/// Documents that are not clearsigned are returned unchanged.
pub fn strip_clearsign(data: &[u8]) -> Result<Vec<u8>> {
    if !is_clearsigned(data) {
        return Ok(data.to_vec());
    }
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::BuildcacheEntry(format!("clearsigned document is not UTF-8: {}", e)))?;

    let mut lines = text.lines().skip_while(|l| l.trim_end() != CLEARSIGN_HEADER).skip(1);
    // Armor headers (`Hash: ...`) end at the first blank line
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
    }

    let mut body = Vec::new();
    let mut terminated = false;
    for line in lines {
        if line.trim_end() == SIGNATURE_HEADER {
            terminated = true;
            break;
        }
        body.push(line.strip_prefix("- ").unwrap_or(line));
    }
    if !terminated {
        return Err(Error::BuildcacheEntry(
            "clearsigned document has no signature block".to_string(),
        ));
    }
    Ok(body.join("\n").into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keyring_creation() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("keys");
        let keyring = Keyring::new(&dir).unwrap();
        assert!(dir.exists());
        assert!(keyring.list().unwrap().is_empty());
        assert!(keyring.signing_key(None).is_err());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let keyring = Keyring::new(temp_dir.path()).unwrap();
        let fpr = keyring.create_key("Build Bot", "bot@example.org").unwrap();
        assert_eq!(keyring.signing_key(None).unwrap(), fpr);

        let doc = b"{\"version\": 3, \"data\": []}\n";
        let signed = keyring.clearsign(&fpr, doc).unwrap();
        assert!(is_clearsigned(&signed));

        let body = keyring.verify_clearsigned(&signed).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["version"], 3);

        let stripped = strip_clearsign(&signed).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&stripped).unwrap();
        assert_eq!(parsed["version"], 3);
    }

    #[test]
    fn test_verify_requires_trusted_key() {
        let signer_dir = TempDir::new().unwrap();
        let signer = Keyring::new(signer_dir.path()).unwrap();
        let fpr = signer.create_key("Build Bot", "bot@example.org").unwrap();
        let signed = signer.clearsign(&fpr, b"{}\n").unwrap();

        let other_dir = TempDir::new().unwrap();
        let other = Keyring::new(other_dir.path()).unwrap();
        assert!(matches!(
            other.verify_clearsigned(&signed),
            Err(Error::NoVerify(_))
        ));

        other.import(&signer.export_public(&fpr).unwrap()).unwrap();
        assert!(other.verify_clearsigned(&signed).is_ok());
        // Public half only: cannot be used for signing
        assert!(other.secret_keys().unwrap().is_empty());
    }

    #[test]
    fn test_tampered_document_fails() {
        let temp_dir = TempDir::new().unwrap();
        let keyring = Keyring::new(temp_dir.path()).unwrap();
        let fpr = keyring.create_key("Build Bot", "bot@example.org").unwrap();
        let signed = keyring.clearsign(&fpr, b"{\"a\": 1}\n").unwrap();
        let tampered = String::from_utf8(signed)
            .unwrap()
            .replace("\"a\": 1", "\"a\": 2");
        assert!(keyring.verify_clearsigned(tampered.as_bytes()).is_err());
    }

    #[test]
    fn test_multiple_secret_keys_need_a_choice() {
        let temp_dir = TempDir::new().unwrap();
        let keyring = Keyring::new(temp_dir.path()).unwrap();
        let first = keyring.create_key("One", "one@example.org").unwrap();
        keyring.create_key("Two", "two@example.org").unwrap();
        assert!(matches!(keyring.signing_key(None), Err(Error::Signing(_))));
        assert_eq!(keyring.signing_key(Some(&first)).unwrap(), first);
    }

    #[test]
    fn test_strip_clearsign_undoes_dash_escaping() {
        let doc = "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA512\n\n- -----x\nbody\n-----BEGIN PGP SIGNATURE-----\nabc\n-----END PGP SIGNATURE-----\n";
        assert_eq!(strip_clearsign(doc.as_bytes()).unwrap(), b"-----x\nbody");
        assert_eq!(strip_clearsign(b"plain").unwrap(), b"plain");
    }
}

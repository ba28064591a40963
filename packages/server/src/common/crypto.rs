//! Sealing of sensitive header values at the storage boundary.
//!
//! Endpoint headers often carry bearer tokens or API keys. When a process-wide
//! key is configured, sensitive values are sealed with AES-256-GCM before they
//! reach the database and only opened again when a dispatch is being built.
//! Sealed values are self-describing (`enc:v1:<base64(nonce || ciphertext)>`)
//! so reads of legacy plaintext rows keep working.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

const SEALED_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

/// Header names whose values are sealed at rest.
const SENSITIVE_MARKERS: &[&str] = &["authorization", "api-key", "apikey", "token", "secret", "cookie"];

/// Whether a header name should be sealed before persistence.
pub fn is_sensitive_header(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lowered.contains(m))
}

/// AES-256-GCM cipher over a key derived from the configured secret.
#[derive(Clone)]
pub struct HeaderCipher {
    cipher: Aes256Gcm,
}

impl HeaderCipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }

    /// Seal a plaintext value. Already-sealed values pass through unchanged so
    /// repeated writes stay idempotent.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        if Self::is_sealed(plaintext) {
            return Ok(plaintext.to_string());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("header sealing failed"))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(nonce.as_slice());
        packed.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(packed)))
    }

    /// Open a value. Plaintext (unsealed) input passes through unchanged.
    pub fn open(&self, value: &str) -> Result<String> {
        let Some(encoded) = value.strip_prefix(SEALED_PREFIX) else {
            return Ok(value.to_string());
        };
        let packed = STANDARD
            .decode(encoded)
            .context("sealed header is not valid base64")?;
        if packed.len() <= NONCE_LEN {
            bail!("sealed header is too short");
        }
        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("header unsealing failed"))?;
        String::from_utf8(plaintext).context("unsealed header is not utf-8")
    }
}

/// Seal the sensitive entries of a header map for persistence.
pub fn seal_headers(
    cipher: Option<&HeaderCipher>,
    headers: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let Some(cipher) = cipher else {
        return Ok(headers.clone());
    };
    let mut sealed = BTreeMap::new();
    for (name, value) in headers {
        let stored = if is_sensitive_header(name) {
            cipher.seal(value)?
        } else {
            value.clone()
        };
        sealed.insert(name.clone(), stored);
    }
    Ok(sealed)
}

/// Open every sealed entry of a header map for dispatch.
pub fn open_headers(
    cipher: Option<&HeaderCipher>,
    headers: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut opened = BTreeMap::new();
    for (name, value) in headers {
        let plain = match cipher {
            Some(cipher) => cipher.open(value)?,
            None if HeaderCipher::is_sealed(value) => {
                bail!("sealed header {name:?} but no cipher key is configured")
            }
            None => value.clone(),
        };
        opened.insert(name.clone(), plain);
    }
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let cipher = HeaderCipher::from_secret("test-secret");
        let sealed = cipher.seal("Bearer abc123").unwrap();

        assert!(HeaderCipher::is_sealed(&sealed));
        assert_eq!(cipher.open(&sealed).unwrap(), "Bearer abc123");
    }

    #[test]
    fn seal_is_idempotent_on_sealed_input() {
        let cipher = HeaderCipher::from_secret("test-secret");
        let sealed = cipher.seal("value").unwrap();

        assert_eq!(cipher.seal(&sealed).unwrap(), sealed);
    }

    #[test]
    fn open_passes_plaintext_through() {
        let cipher = HeaderCipher::from_secret("test-secret");
        assert_eq!(cipher.open("plain").unwrap(), "plain");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = HeaderCipher::from_secret("key-a").seal("value").unwrap();
        assert!(HeaderCipher::from_secret("key-b").open(&sealed).is_err());
    }

    #[test]
    fn sensitive_header_detection() {
        assert!(is_sensitive_header("Authorization"));
        assert!(is_sensitive_header("X-Api-Key"));
        assert!(!is_sensitive_header("Content-Type"));
    }

    #[test]
    fn seal_headers_only_touches_sensitive_names() {
        let cipher = HeaderCipher::from_secret("s");
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer tok".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());

        let sealed = seal_headers(Some(&cipher), &headers).unwrap();

        assert!(HeaderCipher::is_sealed(&sealed["Authorization"]));
        assert_eq!(sealed["Accept"], "application/json");
    }
}

//! Protection of key material at rest
//!
//! [`KeyProtector`] is the seam between the rotation manager and whatever
//! encrypts key material: a master key held by the host, a data-protection
//! key ring (see [`crate::data_protection`]), or a future KMS/HSM backend.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{ProtectionError, ProtectionResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Envelope format version
const ENVELOPE_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;

/// Trait for protection-at-rest backends
#[async_trait]
pub trait KeyProtector: Send + Sync {
    /// Encrypt plaintext key material into a storable string
    async fn protect(&self, plaintext: &[u8]) -> ProtectionResult<String>;

    /// Protect as of `now`. Backends whose keys age override this.
    async fn protect_at(&self, plaintext: &[u8], _now: DateTime<Utc>) -> ProtectionResult<String> {
        self.protect(plaintext).await
    }

    /// Recover plaintext key material
    async fn unprotect(&self, protected: &str) -> ProtectionResult<Zeroizing<Vec<u8>>>;
}

/// A named 256-bit key-encryption key
#[derive(Clone)]
pub struct ProtectionKey {
    id: String,
    key: Zeroizing<[u8; 32]>,
}

impl ProtectionKey {
    pub fn new(id: impl Into<String>, key: &[u8]) -> ProtectionResult<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > u8::MAX as usize {
            return Err(ProtectionError::ProtectionFailure(format!(
                "Protection key id must be 1-{} bytes",
                u8::MAX
            )));
        }
        let key: [u8; 32] = key.try_into().map_err(|_| {
            ProtectionError::ProtectionFailure(format!(
                "Protection key must be exactly 32 bytes, got {}",
                key.len()
            ))
        })?;

        Ok(Self {
            id,
            key: Zeroizing::new(key),
        })
    }

    /// Build from a configured secret: 64 hex characters are used verbatim,
    /// anything else is hashed with SHA-256.
    pub fn from_secret(id: impl Into<String>, secret: &str) -> ProtectionResult<Self> {
        if let Ok(bytes) = hex::decode(secret) {
            if bytes.len() == 32 {
                let bytes = Zeroizing::new(bytes);
                return Self::new(id, &bytes);
            }
        }

        let hash = Sha256::digest(secret.as_bytes());
        Self::new(id, hash.as_slice())
    }

    /// Fresh random key
    pub fn generate(id: impl Into<String>) -> ProtectionResult<Self> {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self::new(id, key.as_slice())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    fn cipher(&self) -> ProtectionResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|e| ProtectionError::ProtectionFailure(format!("Invalid key length: {}", e)))
    }

    /// Encrypt `plaintext` and wrap it in a self-describing envelope
    pub fn seal(&self, plaintext: &[u8]) -> ProtectionResult<String> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: self.id.as_bytes(),
                },
            )
            .map_err(|e| ProtectionError::ProtectionFailure(format!("Encryption failed: {}", e)))?;

        let mut envelope = Vec::with_capacity(2 + self.id.len() + NONCE_LEN + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.push(self.id.len() as u8);
        envelope.extend_from_slice(self.id.as_bytes());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(envelope))
    }

    /// Decrypt an envelope previously produced by [`seal`](Self::seal) with this key
    pub fn open(&self, envelope: &Envelope) -> ProtectionResult<Zeroizing<Vec<u8>>> {
        if envelope.key_id != self.id {
            return Err(ProtectionError::UnknownProtectionKey(envelope.key_id.clone()));
        }

        let cipher = self.cipher()?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &envelope.ciphertext,
                    aad: envelope.key_id.as_bytes(),
                },
            )
            .map_err(|_| {
                ProtectionError::CorruptOrTampered(format!(
                    "Authentication failed under key {}",
                    envelope.key_id
                ))
            })?;

        Ok(Zeroizing::new(plaintext))
    }
}

impl fmt::Debug for ProtectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Parsed protection envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key_id: String,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn parse(protected: &str) -> ProtectionResult<Self> {
        let bytes = STANDARD
            .decode(protected.trim())
            .map_err(|e| ProtectionError::CorruptOrTampered(format!("Invalid encoding: {}", e)))?;

        let (&version, rest) = bytes
            .split_first()
            .ok_or_else(|| ProtectionError::CorruptOrTampered("Empty payload".to_string()))?;
        if version != ENVELOPE_VERSION {
            return Err(ProtectionError::CorruptOrTampered(format!(
                "Unsupported envelope version {}",
                version
            )));
        }

        let (&id_len, rest) = rest
            .split_first()
            .ok_or_else(|| ProtectionError::CorruptOrTampered("Truncated header".to_string()))?;
        let id_len = id_len as usize;
        if rest.len() < id_len + NONCE_LEN {
            return Err(ProtectionError::CorruptOrTampered(
                "Encrypted data too short".to_string(),
            ));
        }

        let (id, rest) = rest.split_at(id_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let key_id = String::from_utf8(id.to_vec())
            .map_err(|_| ProtectionError::CorruptOrTampered("Invalid key id".to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);

        Ok(Self {
            key_id,
            nonce: nonce_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Protects key material with a host-held master key.
///
/// Retired master keys can still unprotect, so the master key can be rotated
/// without stranding existing rows.
pub struct MasterKeyProtector {
    current: Option<ProtectionKey>,
    retired: HashMap<String, ProtectionKey>,
}

impl MasterKeyProtector {
    pub fn new(current: ProtectionKey) -> Self {
        info!(protection_key_id = current.id(), "Master key protector configured");
        Self {
            current: Some(current),
            retired: HashMap::new(),
        }
    }

    /// A protector with no key; every operation reports `NoProtectionKeyConfigured`
    pub fn unconfigured() -> Self {
        Self {
            current: None,
            retired: HashMap::new(),
        }
    }

    pub fn with_retired_key(mut self, key: ProtectionKey) -> Self {
        debug!(protection_key_id = key.id(), "Retired master key registered");
        self.retired.insert(key.id.clone(), key);
        self
    }

    /// Fail at startup rather than on first use
    pub fn ensure_configured(&self) -> ProtectionResult<()> {
        self.current
            .as_ref()
            .map(|_| ())
            .ok_or(ProtectionError::NoProtectionKeyConfigured)
    }

    pub fn current_key_id(&self) -> Option<&str> {
        self.current.as_ref().map(|k| k.id())
    }

    pub fn seal(&self, plaintext: &[u8]) -> ProtectionResult<String> {
        self.current
            .as_ref()
            .ok_or(ProtectionError::NoProtectionKeyConfigured)?
            .seal(plaintext)
    }

    pub fn open(&self, protected: &str) -> ProtectionResult<Zeroizing<Vec<u8>>> {
        let envelope = Envelope::parse(protected)?;

        let key = match &self.current {
            Some(current) if current.id == envelope.key_id => current,
            Some(_) => self
                .retired
                .get(&envelope.key_id)
                .ok_or_else(|| ProtectionError::UnknownProtectionKey(envelope.key_id.clone()))?,
            None if self.retired.is_empty() => {
                return Err(ProtectionError::NoProtectionKeyConfigured)
            }
            None => self
                .retired
                .get(&envelope.key_id)
                .ok_or_else(|| ProtectionError::UnknownProtectionKey(envelope.key_id.clone()))?,
        };

        key.open(&envelope)
    }
}

#[async_trait]
impl KeyProtector for MasterKeyProtector {
    async fn protect(&self, plaintext: &[u8]) -> ProtectionResult<String> {
        self.seal(plaintext)
    }

    async fn unprotect(&self, protected: &str) -> ProtectionResult<Zeroizing<Vec<u8>>> {
        self.open(protected)
    }
}

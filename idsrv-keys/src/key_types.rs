//! Key type definitions
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


use crate::error::{KeyError, KeyResult};
use crate::policy::KeyStatus;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Unique identifier for a key (the `Name` column)
pub type KeyId = String;

/// Signing algorithm recorded in serialized key material
pub const SIGNING_ALGORITHM: &str = "EdDSA";

/// A persisted key row. `value` is always protected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub id: KeyId,
    pub created: DateTime<Utc>,
    pub value: String,
}

/// Row of the `SigningKeys` table
pub type SigningKey = StoredKey;

/// Row of the `DataProtectionKeys` table
pub type DataProtectionKey = StoredKey;

impl StoredKey {
    pub fn new(id: impl Into<KeyId>, created: DateTime<Utc>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created,
            value: value.into(),
        }
    }
}

/// Generate a fresh key identifier
pub fn new_key_id() -> KeyId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Plaintext signing key material. Only ever lives in memory.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub kid: KeyId,
    pub alg: String,
    #[zeroize(skip)]
    pub created: DateTime<Utc>,
    /// Base64 Ed25519 seed
    d: String,
}

impl KeyMaterial {
    /// Generate new Ed25519 material
    pub fn generate(kid: KeyId, created: DateTime<Utc>) -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut seed[..]);

        Self {
            kid,
            alg: SIGNING_ALGORITHM.to_string(),
            created,
            d: STANDARD.encode(&seed[..]),
        }
    }

    pub fn to_bytes(&self) -> KeyResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> KeyResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Turn the material into a usable credential
    pub fn to_credential(&self) -> KeyResult<SigningCredential> {
        if self.alg != SIGNING_ALGORITHM {
            return Err(KeyError::InvalidFormat(format!(
                "Unsupported algorithm: {}",
                self.alg
            )));
        }

        let seed = Zeroizing::new(
            STANDARD
                .decode(&self.d)
                .map_err(|e| KeyError::InvalidFormat(format!("Invalid key encoding: {}", e)))?,
        );
        let seed: &[u8; 32] = seed.as_slice().try_into().map_err(|_| {
            KeyError::InvalidFormat(format!("Expected 32 byte seed, got {}", seed.len()))
        })?;

        Ok(SigningCredential {
            kid: self.kid.clone(),
            created: self.created,
            key: ed25519_dalek::SigningKey::from_bytes(seed),
        })
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// Unprotected signing key held by the cache
pub struct SigningCredential {
    kid: KeyId,
    created: DateTime<Utc>,
    key: ed25519_dalek::SigningKey,
}

impl SigningCredential {
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Take the lifecycle timestamp from the store row
    pub(crate) fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    pub fn algorithm(&self) -> &'static str {
        SIGNING_ALGORITHM
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.verifying_key().verify(message, &signature).is_ok(),
            Err(_) => false,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Public key, base64 encoded, for publishing to relying parties
    pub fn verifying_key_base64(&self) -> String {
        STANDARD.encode(self.verifying_key().as_bytes())
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("kid", &self.kid)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// A credential together with its lifecycle state at the time of the read
#[derive(Debug, Clone)]
pub struct ClassifiedKey {
    pub credential: Arc<SigningCredential>,
    pub status: KeyStatus,
}

/// What token issuance consumes: one key to sign with, every key to validate with
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    pub signing_key: Option<Arc<SigningCredential>>,
    pub validation_keys: Vec<Arc<SigningCredential>>,
}

impl KeySet {
    /// Build from classified keys. The most recently activated Active key
    /// signs; ties on creation time fall back to the identifier.
    pub fn from_classified(keys: &[ClassifiedKey]) -> Self {
        let signing_key = keys
            .iter()
            .filter(|k| k.status.can_sign())
            .max_by(|a, b| {
                a.credential
                    .created()
                    .cmp(&b.credential.created())
                    .then_with(|| a.credential.kid().cmp(b.credential.kid()))
            })
            .map(|k| Arc::clone(&k.credential));

        let validation_keys = keys
            .iter()
            .filter(|k| k.status.can_validate())
            .map(|k| Arc::clone(&k.credential))
            .collect();

        Self {
            signing_key,
            validation_keys,
        }
    }

    /// The current signing key; fails closed when none is Active
    pub fn require_signing_key(&self) -> KeyResult<Arc<SigningCredential>> {
        self.signing_key
            .clone()
            .ok_or(KeyError::NoSigningKeyAvailable)
    }

    pub fn find(&self, kid: &str) -> Option<&Arc<SigningCredential>> {
        self.validation_keys.iter().find(|k| k.kid() == kid)
    }
}

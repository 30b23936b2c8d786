//! Data-protection key ring
//!
//! Signing keys are not encrypted with the master key directly. They are
//! encrypted with data-protection keys, which live in the
//! `DataProtectionKeys` table and are themselves wrapped by the master key
//! protector. The master key therefore only ever touches a handful of
//! small rows, and every host sharing the database shares the ring.
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


use crate::error::{ProtectionError, ProtectionResult, StoreError};
use crate::key_store::KeyStore;
use crate::key_types::{new_key_id, KeyId, StoredKey};
use crate::protector::{Envelope, KeyProtector, ProtectionKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Default lifetime of a data-protection key before a new one is created
pub const DEFAULT_KEY_LIFETIME: Duration = Duration::from_secs(90 * 24 * 60 * 60);

struct RingEntry {
    key: ProtectionKey,
    created: DateTime<Utc>,
}

/// Protector backed by a ring of data-protection keys.
///
/// Old data-protection keys are never deleted: signing keys protected under
/// them must stay readable until they themselves are purged.
pub struct DataProtector {
    store: Arc<dyn KeyStore>,
    master: Arc<dyn KeyProtector>,
    key_lifetime: Duration,
    ring: RwLock<HashMap<KeyId, RingEntry>>,
    creation: Mutex<()>,
}

impl DataProtector {
    pub fn new(store: Arc<dyn KeyStore>, master: Arc<dyn KeyProtector>) -> Self {
        Self {
            store,
            master,
            key_lifetime: DEFAULT_KEY_LIFETIME,
            ring: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
        }
    }

    pub fn with_key_lifetime(mut self, key_lifetime: Duration) -> Self {
        self.key_lifetime = key_lifetime;
        self
    }

    /// Number of data-protection keys currently loaded
    pub async fn ring_size(&self) -> usize {
        self.ring.read().await.len()
    }

    async fn current_key(&self, now: DateTime<Utc>) -> ProtectionResult<ProtectionKey> {
        if let Some(key) = self.newest_usable(now).await {
            return Ok(key);
        }

        let _guard = self.creation.lock().await;

        // Another task, or another host, may have created one meanwhile
        self.reload().await?;
        if let Some(key) = self.newest_usable(now).await {
            return Ok(key);
        }

        self.create_key(now).await
    }

    async fn newest_usable(&self, now: DateTime<Utc>) -> Option<ProtectionKey> {
        let ring = self.ring.read().await;
        ring.values()
            .filter(|entry| {
                (now - entry.created)
                    .to_std()
                    .map(|age| age < self.key_lifetime)
                    .unwrap_or(true)
            })
            .max_by(|a, b| {
                a.created
                    .cmp(&b.created)
                    .then_with(|| a.key.id().cmp(b.key.id()))
            })
            .map(|entry| entry.key.clone())
    }

    async fn create_key(&self, now: DateTime<Utc>) -> ProtectionResult<ProtectionKey> {
        let key = ProtectionKey::generate(new_key_id())?;
        let wrapped = self.master.protect(key.key_bytes()).await?;

        let row = StoredKey::new(key.id(), now, wrapped);
        self.store.put(&row).await.map_err(|e| match e {
            StoreError::DuplicateKey(id) => {
                ProtectionError::ProtectionFailure(format!("Data-protection key {} already exists", id))
            }
            StoreError::StoreUnavailable(msg) | StoreError::InvalidKeyId(msg) => {
                ProtectionError::ProtectionFailure(format!(
                    "Failed to persist data-protection key: {}",
                    msg
                ))
            }
        })?;

        info!(data_protection_key_id = key.id(), "Created data-protection key");

        self.ring.write().await.insert(
            key.id().to_string(),
            RingEntry {
                key: key.clone(),
                created: now,
            },
        );
        Ok(key)
    }

    /// Load every data-protection key the ring does not hold yet
    async fn reload(&self) -> ProtectionResult<()> {
        let rows = self.store.get_all().await.map_err(|e| {
            ProtectionError::ProtectionFailure(format!("Failed to load data-protection keys: {}", e))
        })?;

        let known: Vec<KeyId> = self.ring.read().await.keys().cloned().collect();
        let mut loaded = Vec::new();

        for row in rows.into_iter().filter(|row| !known.contains(&row.id)) {
            match self.unwrap_row(&row).await {
                Ok(key) => loaded.push(RingEntry {
                    key,
                    created: row.created,
                }),
                Err(e) => {
                    warn!(
                        data_protection_key_id = %row.id,
                        error = %e,
                        "Skipping unreadable data-protection key"
                    );
                }
            }
        }

        if !loaded.is_empty() {
            debug!(count = loaded.len(), "Loaded data-protection keys");
            let mut ring = self.ring.write().await;
            for entry in loaded {
                ring.insert(entry.key.id().to_string(), entry);
            }
        }

        Ok(())
    }

    async fn unwrap_row(&self, row: &StoredKey) -> ProtectionResult<ProtectionKey> {
        let bytes: Zeroizing<Vec<u8>> = self.master.unprotect(&row.value).await?;
        ProtectionKey::new(row.id.clone(), &bytes)
            .map_err(|e| ProtectionError::CorruptOrTampered(e.to_string()))
    }

    async fn lookup(&self, key_id: &str) -> Option<ProtectionKey> {
        self.ring.read().await.get(key_id).map(|entry| entry.key.clone())
    }
}

#[async_trait]
impl KeyProtector for DataProtector {
    async fn protect(&self, plaintext: &[u8]) -> ProtectionResult<String> {
        self.protect_at(plaintext, Utc::now()).await
    }

    /// Protect using the data-protection key that is current at `now`
    async fn protect_at(&self, plaintext: &[u8], now: DateTime<Utc>) -> ProtectionResult<String> {
        let key = self.current_key(now).await?;
        key.seal(plaintext)
    }

    async fn unprotect(&self, protected: &str) -> ProtectionResult<Zeroizing<Vec<u8>>> {
        let envelope = Envelope::parse(protected)?;

        let key = match self.lookup(&envelope.key_id).await {
            Some(key) => key,
            None => {
                self.reload().await?;
                self.lookup(&envelope.key_id)
                    .await
                    .ok_or_else(|| ProtectionError::UnknownProtectionKey(envelope.key_id.clone()))?
            }
        };

        key.open(&envelope)
    }
}

//! In-memory key store, for tests and single-node development
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


use crate::error::{StoreError, StoreResult};
use crate::key_store::{validate_key_id, KeyStore};
use crate::key_types::{KeyId, StoredKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Key store backed by a map. Can be switched offline to simulate an outage.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<KeyId, StoredKey>>,
    offline: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::StoreUnavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn put(&self, key: &StoredKey) -> StoreResult<()> {
        validate_key_id(&key.id)?;
        self.check_online()?;

        let mut keys = self.keys.write().await;
        if keys.contains_key(&key.id) {
            return Err(StoreError::DuplicateKey(key.id.clone()));
        }
        keys.insert(key.id.clone(), key.clone());

        debug!(key_id = %key.id, "Key stored");
        Ok(())
    }

    async fn get_all(&self) -> StoreResult<Vec<StoredKey>> {
        self.check_online()?;
        Ok(self.keys.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.check_online()?;

        if self.keys.write().await.remove(id).is_some() {
            debug!(key_id = id, "Key deleted");
        }
        Ok(())
    }
}

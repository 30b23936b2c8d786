//! In-memory view of the signing keys
//!
//! The cache holds unprotected credentials for every stored key and is
//! rebuilt wholesale from the key store when it is older than its TTL or has
//! been invalidated. Lifecycle status is computed at read time against the
//! caller's `now`, so a stale snapshot can never hand out a key that has
//! since expired; it can only be late to notice a key that has since
//! activated, which is why the TTL must be shorter than the activation delay.
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
use crate::key_store::KeyStore;
use crate::key_types::{ClassifiedKey, KeyMaterial, KeySet, SigningCredential, StoredKey};
use crate::policy::KeyPolicy;
use crate::protector::KeyProtector;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Minimum wait between store reads after a failed refresh
pub const REFRESH_RETRY_BACKOFF: Duration = Duration::from_secs(5);

struct CachedKey {
    credential: Arc<SigningCredential>,
    created: DateTime<Utc>,
}

struct Snapshot {
    refreshed_at: DateTime<Utc>,
    generation: u64,
    keys: Vec<CachedKey>,
}

/// Time-bounded cache of unprotected signing keys
pub struct KeyCache {
    store: Arc<dyn KeyStore>,
    protector: Arc<dyn KeyProtector>,
    policy: KeyPolicy,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    /// Serializes refreshes so concurrent readers trigger one store read
    refresh_lock: Mutex<()>,
    /// Bumped by every invalidation
    generation: AtomicU64,
    /// When the last refresh failed, and under which generation
    last_failure: RwLock<Option<(DateTime<Utc>, u64)>>,
}

impl KeyCache {
    pub fn new(
        store: Arc<dyn KeyStore>,
        protector: Arc<dyn KeyProtector>,
        policy: KeyPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            protector,
            policy,
            ttl,
            snapshot: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            last_failure: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Keys that are Active as of `now`
    pub async fn get_active_keys(&self, now: DateTime<Utc>) -> Vec<Arc<SigningCredential>> {
        self.classified(now)
            .await
            .into_iter()
            .filter(|k| k.status.can_sign())
            .map(|k| k.credential)
            .collect()
    }

    /// Current signing key plus every key valid for verification
    pub async fn get_key_set(&self, now: DateTime<Utc>) -> KeySet {
        KeySet::from_classified(&self.classified(now).await)
    }

    /// Every cached key with its status as of `now`
    pub async fn classified(&self, now: DateTime<Utc>) -> Vec<ClassifiedKey> {
        let snapshot = self.snapshot_for(now).await;

        snapshot
            .map(|snapshot| {
                snapshot
                    .keys
                    .iter()
                    .map(|k| ClassifiedKey {
                        credential: Arc::clone(&k.credential),
                        status: self.policy.classify(k.created, now),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Force the next read to go to the store
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!("Key cache invalidated");
    }

    /// When the current snapshot was built, if there is one
    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().await.as_ref().map(|s| s.refreshed_at)
    }

    fn is_fresh(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> bool {
        if snapshot.generation != self.generation.load(Ordering::SeqCst) {
            return false;
        }
        // A clock that moved backwards keeps the snapshot
        match (now - snapshot.refreshed_at).to_std() {
            Ok(age) => age < self.ttl,
            Err(_) => true,
        }
    }

    /// A recent failure under the current generation defers the next store read
    async fn backing_off(&self, now: DateTime<Utc>) -> bool {
        match *self.last_failure.read().await {
            Some((failed_at, generation))
                if generation == self.generation.load(Ordering::SeqCst) =>
            {
                match (now - failed_at).to_std() {
                    Ok(elapsed) => elapsed < REFRESH_RETRY_BACKOFF,
                    Err(_) => true,
                }
            }
            _ => false,
        }
    }

    async fn snapshot_for(&self, now: DateTime<Utc>) -> Option<Arc<Snapshot>> {
        let current = self.snapshot.read().await.clone();
        if let Some(snapshot) = &current {
            if self.is_fresh(snapshot, now) {
                return current;
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Someone else may have refreshed while we waited
        let current = self.snapshot.read().await.clone();
        if let Some(snapshot) = &current {
            if self.is_fresh(snapshot, now) {
                return current;
            }
        }

        if self.backing_off(now).await {
            return current;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        match self.refresh(now).await {
            Ok(snapshot) => {
                *self.last_failure.write().await = None;
                Some(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "Key cache refresh failed, serving previous snapshot");
                *self.last_failure.write().await = Some((now, generation));
                current
            }
        }
    }

    async fn refresh(&self, now: DateTime<Utc>) -> KeyResult<Arc<Snapshot>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let rows = self.store.get_all().await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.load_credential(row).await {
                Ok(credential) => keys.push(CachedKey {
                    credential: Arc::new(credential),
                    created: row.created,
                }),
                Err(e) => {
                    warn!(key_id = %row.id, error = %e, "Excluding unreadable signing key");
                }
            }
        }

        debug!(loaded = keys.len(), stored = rows.len(), "Key cache refreshed");

        let snapshot = Arc::new(Snapshot {
            refreshed_at: now,
            generation,
            keys,
        });
        *self.snapshot.write().await = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub(crate) async fn load_credential(&self, row: &StoredKey) -> KeyResult<SigningCredential> {
        let plaintext = self.protector.unprotect(&row.value).await?;
        let material = KeyMaterial::from_bytes(&plaintext)?;

        if material.kid != row.id {
            return Err(KeyError::InvalidFormat(format!(
                "Key material belongs to {}",
                material.kid
            )));
        }

        Ok(material.to_credential()?.with_created(row.created))
    }
}

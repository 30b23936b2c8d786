//! Signing-key rotation
//!
//! [`KeyRotationManager`] owns every lifecycle transition. Each cycle:
//!
//! 1. loads all keys from the store
//! 2. classifies them against the policy as of `now`
//! 3. generates, protects and stores a new key if no readable key is Pending
//!    or Active
//! 4. deletes every Expired key
//! 5. invalidates the cache
//!
//! Several hosts may run cycles against the same store at once. No lock is
//! taken: key ids are random, so concurrent generation only yields an extra
//! key, and deletes are idempotent.
//!
//! [`RotationTask`] drives the manager on a fixed interval until cancelled.
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


use crate::error::KeyResult;
use crate::key_cache::KeyCache;
use crate::key_store::KeyStore;
use crate::key_types::{new_key_id, KeyId, KeyMaterial, KeySet, SigningCredential, StoredKey};
use crate::policy::{KeyStatus, RotationSchedule};
use crate::protector::KeyProtector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stored key with its status as of a given instant
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub id: KeyId,
    pub created: DateTime<Utc>,
    pub status: KeyStatus,
}

/// Outcome of one rotation cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    pub pending: usize,
    pub active: usize,
    pub retired: usize,
    pub expired: usize,
    pub generated: Option<KeyId>,
    pub deleted: Vec<KeyId>,
    pub failures: Vec<String>,
}

impl RotationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn count(&mut self, status: KeyStatus) {
        match status {
            KeyStatus::Pending => self.pending += 1,
            KeyStatus::Active => self.active += 1,
            KeyStatus::Retired => self.retired += 1,
            KeyStatus::Expired => self.expired += 1,
        }
    }
}

/// Orchestrates generation, activation and purge of signing keys
pub struct KeyRotationManager {
    store: Arc<dyn KeyStore>,
    protector: Arc<dyn KeyProtector>,
    cache: Arc<KeyCache>,
    schedule: RotationSchedule,
}

impl KeyRotationManager {
    /// Create a manager; refuses to start with an invalid schedule
    pub fn new(
        store: Arc<dyn KeyStore>,
        protector: Arc<dyn KeyProtector>,
        schedule: RotationSchedule,
    ) -> KeyResult<Self> {
        schedule.validate()?;

        let cache = Arc::new(KeyCache::new(
            Arc::clone(&store),
            Arc::clone(&protector),
            schedule.policy,
            schedule.cache_ttl,
        ));

        Ok(Self {
            store,
            protector,
            cache,
            schedule,
        })
    }

    pub fn schedule(&self) -> &RotationSchedule {
        &self.schedule
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// Run one full rotation cycle as of `now`.
    ///
    /// Only a store read failure aborts the cycle. A failed generation or a
    /// failed delete is recorded in the report and retried next cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> KeyResult<RotationReport> {
        let keys = self.store.get_all().await?;
        let policy = &self.schedule.policy;

        let mut report = RotationReport::default();
        let mut usable = Vec::new();
        for key in &keys {
            let status = policy.classify(key.created, now);
            report.count(status);

            // Only keys this host can unprotect count towards coverage
            if matches!(status, KeyStatus::Pending | KeyStatus::Active) {
                match self.cache.load_credential(key).await {
                    Ok(_) => usable.push(key.created),
                    Err(e) => {
                        warn!(key_id = %key.id, error = %e, "Unreadable signing key does not count as usable");
                        report.failures.push(format!("unreadable {}: {}", key.id, e));
                    }
                }
            }
        }

        if policy.needs_new_key(usable, now) {
            match self.generate_key(now).await {
                Ok(id) => report.generated = Some(id),
                Err(e) => {
                    warn!(error = %e, "Key generation failed, will retry next cycle");
                    report.failures.push(format!("generate: {}", e));
                }
            }
        }

        self.delete_expired(&keys, now, &mut report).await;

        self.cache.invalidate();

        debug!(
            pending = report.pending,
            active = report.active,
            retired = report.retired,
            expired = report.expired,
            "Rotation cycle complete"
        );
        Ok(report)
    }

    /// Delete Expired keys without considering generation
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> KeyResult<RotationReport> {
        let keys = self.store.get_all().await?;

        let mut report = RotationReport::default();
        for key in &keys {
            report.count(self.schedule.policy.classify(key.created, now));
        }

        self.delete_expired(&keys, now, &mut report).await;
        self.cache.invalidate();
        Ok(report)
    }

    /// Every stored key with its status, oldest first
    pub async fn list_keys(&self, now: DateTime<Utc>) -> KeyResult<Vec<KeyInfo>> {
        let mut keys: Vec<KeyInfo> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|k| KeyInfo {
                status: self.schedule.policy.classify(k.created, now),
                id: k.id,
                created: k.created,
            })
            .collect();

        keys.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(keys)
    }

    /// Active keys as of `now`, served from the cache
    pub async fn get_active_keys(&self, now: DateTime<Utc>) -> Vec<Arc<SigningCredential>> {
        self.cache.get_active_keys(now).await
    }

    /// Signing key and verification keys as of `now`, served from the cache
    pub async fn get_key_set(&self, now: DateTime<Utc>) -> KeySet {
        self.cache.get_key_set(now).await
    }

    /// The key to sign with; `NoSigningKeyAvailable` when none is Active
    pub async fn signing_key(&self, now: DateTime<Utc>) -> KeyResult<Arc<SigningCredential>> {
        self.get_key_set(now).await.require_signing_key()
    }

    async fn generate_key(&self, now: DateTime<Utc>) -> KeyResult<KeyId> {
        let id = new_key_id();

        // Plaintext is zeroized when these drop, whatever the outcome
        let material = KeyMaterial::generate(id.clone(), now);
        let plaintext = material.to_bytes()?;

        let value = self.protector.protect_at(&plaintext, now).await?;
        self.store.put(&StoredKey::new(id.clone(), now, value)).await?;

        info!(key_id = %id, created = %now, "Generated new signing key");
        Ok(id)
    }

    async fn delete_expired(
        &self,
        keys: &[StoredKey],
        now: DateTime<Utc>,
        report: &mut RotationReport,
    ) {
        let expired = keys
            .iter()
            .filter(|k| self.schedule.policy.classify(k.created, now) == KeyStatus::Expired);

        for key in expired {
            match self.store.delete(&key.id).await {
                Ok(()) => {
                    info!(key_id = %key.id, created = %key.created, "Deleted expired signing key");
                    report.deleted.push(key.id.clone());
                }
                Err(e) => {
                    warn!(key_id = %key.id, error = %e, "Failed to delete expired signing key");
                    report.failures.push(format!("delete {}: {}", key.id, e));
                }
            }
        }
    }
}

/// Periodic background task driving a [`KeyRotationManager`]
pub struct RotationTask {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

impl RotationTask {
    /// Spawn the task. The first cycle runs immediately.
    ///
    /// Cancellation is only observed between cycles: a cycle that has started
    /// runs to completion, so a generated key is either fully persisted or
    /// not persisted at all.
    pub fn spawn(manager: Arc<KeyRotationManager>, token: CancellationToken) -> Self {
        let interval = manager.schedule().rotation_interval;
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = interval.as_secs(), "Key rotation task started");

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => {
                        info!("Key rotation task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match manager.run_cycle(Utc::now()).await {
                            Ok(report) if report.is_clean() => {
                                if report.generated.is_some() || !report.deleted.is_empty() {
                                    info!(
                                        generated = ?report.generated,
                                        deleted = report.deleted.len(),
                                        "Key rotation cycle applied changes"
                                    );
                                }
                            }
                            Ok(report) => {
                                warn!(failures = ?report.failures, "Key rotation cycle partially failed");
                            }
                            Err(e) => {
                                error!(error = %e, "Key rotation cycle aborted, retrying next interval");
                            }
                        }
                    }
                }
            }
        });

        Self { handle, token }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and wait for the in-flight cycle, if any, to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Key rotation task ended abnormally");
        }
    }
}

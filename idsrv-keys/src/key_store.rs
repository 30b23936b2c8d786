//! Key store interface
//!
//! A key store is a passive persistence collaborator: it knows nothing about
//! key lifecycles. Implementations must make every write durable before
//! returning, must not retry internally, and must treat `delete` of a missing
//! key as success so that several hosts can prune the same shared store.
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
use crate::key_types::StoredKey;
use async_trait::async_trait;

/// Maximum length of a key id (the `Name` column)
pub const MAX_KEY_ID_LENGTH: usize = 200;

/// Reject ids no backend can persist
pub fn validate_key_id(id: &str) -> StoreResult<()> {
    if id.is_empty() || id.chars().count() > MAX_KEY_ID_LENGTH {
        return Err(StoreError::InvalidKeyId(format!(
            "key id must be 1-{} characters, got {}",
            MAX_KEY_ID_LENGTH,
            id.chars().count()
        )));
    }
    Ok(())
}

/// Trait for key persistence backends
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert a new key. Fails with `DuplicateKey` if the id is taken and
    /// `InvalidKeyId` if it is empty or too long.
    async fn put(&self, key: &StoredKey) -> StoreResult<()>;

    /// Every persisted key, in no particular order
    async fn get_all(&self) -> StoreResult<Vec<StoredKey>>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

//! Signing-key lifecycle management for the identity provider
//!
//! Generates, ages and retires token signing keys on a schedule, persists
//! them to the shared SQLite database and protects them at rest.
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


pub mod data_protection;
pub mod error;
pub mod key_cache;
pub mod key_store;
pub mod key_types;
pub mod memory_store;
pub mod policy;
pub mod protector;
pub mod rotation;
pub mod service_integration;
pub mod sqlite_store;

pub use data_protection::DataProtector;
pub use error::{KeyError, KeyResult, ProtectionError, StoreError};
pub use key_cache::KeyCache;
pub use key_store::KeyStore;
pub use key_types::{KeyId, KeySet, SigningCredential, SigningKey, StoredKey};
pub use memory_store::MemoryKeyStore;
pub use policy::{KeyPolicy, KeyStatus, RotationSchedule};
pub use protector::{KeyProtector, MasterKeyProtector, ProtectionKey};
pub use rotation::{KeyInfo, KeyRotationManager, RotationReport, RotationTask};
pub use service_integration::*;
pub use sqlite_store::{KeyTable, SqliteDatabase, SqliteKeyStore};

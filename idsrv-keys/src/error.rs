//! Error types for signing-key management
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


use thiserror::Error;

/// Persistence errors. Always transient from the rotation manager's point of
/// view: the cycle is abandoned and retried on the next interval.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Key already exists: {0}")]
    DuplicateKey(String),

    #[error("Key store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid key id: {0}")]
    InvalidKeyId(String),
}

/// Protection-at-rest errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtectionError {
    #[error("No protection key configured")]
    NoProtectionKeyConfigured,

    #[error("Protection failed: {0}")]
    ProtectionFailure(String),

    #[error("Protected payload is corrupt or has been tampered with: {0}")]
    CorruptOrTampered(String),

    #[error("Unknown protection key: {0}")]
    UnknownProtectionKey(String),
}

impl ProtectionError {
    /// Errors that only affect the single key being read
    pub fn is_per_key(&self) -> bool {
        matches!(
            self,
            ProtectionError::CorruptOrTampered(_) | ProtectionError::UnknownProtectionKey(_)
        )
    }
}

/// Key management errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protection(#[from] ProtectionError),

    #[error("Invalid key policy: {0}")]
    PolicyViolation(String),

    #[error("No signing key available")]
    NoSigningKeyAvailable,

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;

/// Result type for key store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for protection operations
pub type ProtectionResult<T> = Result<T, ProtectionError>;

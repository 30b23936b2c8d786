//! Service integration helpers for wiring key management into a host
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


use crate::data_protection::{DataProtector, DEFAULT_KEY_LIFETIME};
use crate::error::{KeyError, KeyResult};
use crate::policy::RotationSchedule;
use crate::protector::{KeyProtector, MasterKeyProtector, ProtectionKey};
use crate::rotation::{KeyRotationManager, RotationTask};
use crate::sqlite_store::{KeyTable, SqliteDatabase};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything needed to stand up key management in a host
#[derive(Debug, Clone)]
pub struct KeyManagementOptions {
    /// SQLite path, or `:memory:`
    pub connection_string: String,
    pub schedule: RotationSchedule,
    /// Master key that wraps the data-protection keys
    pub protection_key: Option<ProtectionKey>,
    /// Previous master keys, kept so existing rows stay readable
    pub retired_protection_keys: Vec<ProtectionKey>,
    pub data_protection_key_lifetime: Duration,
}

impl KeyManagementOptions {
    pub fn new(connection_string: impl Into<String>, schedule: RotationSchedule) -> Self {
        Self {
            connection_string: connection_string.into(),
            schedule,
            protection_key: None,
            retired_protection_keys: Vec::new(),
            data_protection_key_lifetime: DEFAULT_KEY_LIFETIME,
        }
    }

    pub fn with_protection_key(mut self, key: ProtectionKey) -> Self {
        self.protection_key = Some(key);
        self
    }

    pub fn with_retired_protection_key(mut self, key: ProtectionKey) -> Self {
        self.retired_protection_keys.push(key);
        self
    }
}

/// Initialized key management: the manager and the database behind it
pub struct KeyManagement {
    pub manager: Arc<KeyRotationManager>,
    pub database: SqliteDatabase,
}

impl KeyManagement {
    /// Start the periodic rotation task
    pub fn start(&self, token: CancellationToken) -> RotationTask {
        RotationTask::spawn(Arc::clone(&self.manager), token)
    }
}

/// Initialize key management for a host.
///
/// Startup-fatal conditions (invalid policy, no protection key, unreachable
/// database) are returned as errors; the caller should refuse to run.
pub async fn init_key_management(options: KeyManagementOptions) -> KeyResult<KeyManagement> {
    options.schedule.validate()?;
    if options.data_protection_key_lifetime.is_zero() {
        return Err(KeyError::PolicyViolation(
            "data-protection key lifetime must be positive".to_string(),
        ));
    }

    let mut master = match options.protection_key {
        Some(key) => MasterKeyProtector::new(key),
        None => MasterKeyProtector::unconfigured(),
    };
    for key in options.retired_protection_keys {
        master = master.with_retired_key(key);
    }
    master.ensure_configured()?;

    info!(
        connection = %options.connection_string,
        "Initializing signing key management"
    );

    let database = SqliteDatabase::open(&options.connection_string)?;
    let master: Arc<dyn KeyProtector> = Arc::new(master);

    let protector: Arc<dyn KeyProtector> = Arc::new(
        DataProtector::new(
            Arc::new(database.key_store(KeyTable::DataProtectionKeys)),
            master,
        )
        .with_key_lifetime(options.data_protection_key_lifetime),
    );

    let manager = KeyRotationManager::new(
        Arc::new(database.key_store(KeyTable::SigningKeys)),
        protector,
        options.schedule,
    )?;

    Ok(KeyManagement {
        manager: Arc::new(manager),
        database,
    })
}

//! SQLite-backed key store
//!
//! Both key tables share one shape and one database file, which is also the
//! database the rest of the identity provider keeps its configuration and
//! operational data in.
//!
//! ## Tables
//!
//! - `SigningKeys` - token signing keys
//! - `DataProtectionKeys` - keys that protect signing keys at rest
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
use crate::key_store::{validate_key_id, KeyStore, MAX_KEY_ID_LENGTH};
use crate::key_types::StoredKey;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ffi, params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection string that selects a private in-memory database
pub const IN_MEMORY: &str = ":memory:";

/// How long a writer waits on another host's lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Which of the two key tables a store reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTable {
    SigningKeys,
    DataProtectionKeys,
}

impl KeyTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            KeyTable::SigningKeys => "SigningKeys",
            KeyTable::DataProtectionKeys => "DataProtectionKeys",
        }
    }

    fn schema(&self) -> String {
        let table = self.table_name();
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                Id INTEGER PRIMARY KEY AUTOINCREMENT,
                Created TEXT NOT NULL,
                Name TEXT NULL CHECK (Name IS NULL OR length(Name) <= {MAX_KEY_ID_LENGTH}),
                Value TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS IX_{table}_Name ON {table} (Name);
            "#
        )
    }
}

/// Shared handle to the SQLite database holding both key tables
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open the database named by a connection string: a file path, or
    /// [`IN_MEMORY`].
    pub fn open(connection_string: &str) -> StoreResult<Self> {
        let conn = if connection_string == IN_MEMORY {
            debug!("Opening in-memory SQLite database");
            Connection::open_in_memory().map_err(unavailable)?
        } else {
            info!(path = connection_string, "Opening SQLite key database");
            Connection::open(Path::new(connection_string)).map_err(unavailable)?
        };

        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(unavailable)?;

        for table in [KeyTable::SigningKeys, KeyTable::DataProtectionKeys] {
            conn.execute_batch(&table.schema()).map_err(|e| {
                StoreError::StoreUnavailable(format!(
                    "Failed to create {} table: {}",
                    table.table_name(),
                    e
                ))
            })?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Key store over one of the tables
    pub fn key_store(&self, table: KeyTable) -> SqliteKeyStore {
        SqliteKeyStore {
            db: self.clone(),
            table,
        }
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::StoreUnavailable(format!("Lock poisoned: {}", e)))?;
            f(&*conn)
        })
        .await
        .map_err(|e| StoreError::StoreUnavailable(format!("Store task failed: {}", e)))?
    }
}

/// Key store over a single table of a [`SqliteDatabase`]
#[derive(Clone)]
pub struct SqliteKeyStore {
    db: SqliteDatabase,
    table: KeyTable,
}

impl SqliteKeyStore {
    /// Open a database and return a store over one of its tables
    pub fn open(connection_string: &str, table: KeyTable) -> StoreResult<Self> {
        Ok(SqliteDatabase::open(connection_string)?.key_store(table))
    }

    pub fn table(&self) -> KeyTable {
        self.table
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn put(&self, key: &StoredKey) -> StoreResult<()> {
        validate_key_id(&key.id)?;

        let sql = format!(
            "INSERT INTO {} (Created, Name, Value) VALUES (?1, ?2, ?3)",
            self.table.table_name()
        );
        let key = key.clone();

        self.db
            .with_conn(move |conn| {
                let created = key.created.to_rfc3339_opts(SecondsFormat::Micros, true);
                conn.execute(&sql, params![created, key.id, key.value])
                    .map(|_| ())
                    .map_err(|e| insert_error(e, &key.id))
            })
            .await?;

        debug!(table = self.table.table_name(), "Key row inserted");
        Ok(())
    }

    async fn get_all(&self) -> StoreResult<Vec<StoredKey>> {
        let table = self.table.table_name();
        // Rows written without a Name are addressed by their numeric Id
        let sql = format!(
            "SELECT COALESCE(Name, CAST(Id AS TEXT)), Created, Value FROM {}",
            table
        );

        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })
                    .map_err(unavailable)?;

                let mut keys = Vec::new();
                for row in rows {
                    let (id, created, value) = row.map_err(unavailable)?;
                    match DateTime::parse_from_rfc3339(&created) {
                        Ok(created) => keys.push(StoredKey {
                            id,
                            created: created.with_timezone(&Utc),
                            value,
                        }),
                        Err(e) => {
                            warn!(table, key_id = %id, error = %e, "Unreadable Created column, skipping row");
                        }
                    }
                }
                Ok(keys)
            })
            .await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE Name = ?1 OR (Name IS NULL AND CAST(Id AS TEXT) = ?1)",
            self.table.table_name()
        );
        let id = id.to_string();

        let removed = self
            .db
            .with_conn(move |conn| conn.execute(&sql, params![id]).map_err(unavailable))
            .await?;

        debug!(table = self.table.table_name(), removed, "Key delete executed");
        Ok(())
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::StoreUnavailable(e.to_string())
}

/// Only the unique index on `Name` means the id is taken
fn insert_error(e: rusqlite::Error, id: &str) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(ref failure, _)
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StoreError::DuplicateKey(id.to_string())
        }
        e => unavailable(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(id: &str) -> StoredKey {
        StoredKey::new(id, Utc.timestamp_opt(1_700_000_000, 123_000).unwrap(), "cHJvdGVjdGVk")
    }

    #[tokio::test]
    async fn test_put_and_get_all() {
        let store = SqliteKeyStore::open(IN_MEMORY, KeyTable::SigningKeys).unwrap();
        store.put(&key("a")).await.unwrap();
        store.put(&key("b")).await.unwrap();

        let mut keys = store.get_all().await.unwrap();
        keys.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(keys, vec![key("a"), key("b")]);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let store = SqliteKeyStore::open(IN_MEMORY, KeyTable::SigningKeys).unwrap();
        store.put(&key("a")).await.unwrap();

        assert_eq!(
            store.put(&key("a")).await,
            Err(StoreError::DuplicateKey("a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_overlong_id_is_invalid_not_unavailable() {
        let store = SqliteKeyStore::open(IN_MEMORY, KeyTable::SigningKeys).unwrap();

        assert!(matches!(
            store.put(&key(&"k".repeat(MAX_KEY_ID_LENGTH + 1))).await,
            Err(StoreError::InvalidKeyId(_))
        ));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_unique_violation_maps_to_duplicate() {
        let db = SqliteDatabase::open(IN_MEMORY).unwrap();
        let insert = |value: Option<&'static str>| {
            db.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO SigningKeys (Created, Name, Value) VALUES ('2024-01-01T00:00:00Z', 'k', ?1)",
                    params![value],
                )
                .map(|_| ())
                .map_err(|e| insert_error(e, "k"))
            })
        };

        // NOT NULL failure on Value
        assert!(matches!(
            insert(None).await,
            Err(StoreError::StoreUnavailable(_))
        ));

        insert(Some("v")).await.unwrap();
        assert_eq!(
            insert(Some("v")).await,
            Err(StoreError::DuplicateKey("k".to_string()))
        );
    }

    #[tokio::test]
    async fn test_tables_are_independent() {
        let db = SqliteDatabase::open(IN_MEMORY).unwrap();
        let signing = db.key_store(KeyTable::SigningKeys);
        let protection = db.key_store(KeyTable::DataProtectionKeys);

        signing.put(&key("shared-name")).await.unwrap();
        protection.put(&key("shared-name")).await.unwrap();

        assert_eq!(signing.get_all().await.unwrap().len(), 1);
        assert_eq!(protection.get_all().await.unwrap().len(), 1);

        signing.delete("shared-name").await.unwrap();
        assert!(signing.get_all().await.unwrap().is_empty());
        assert_eq!(protection.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rows_without_name_are_addressable_by_id() {
        let db = SqliteDatabase::open(IN_MEMORY).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO SigningKeys (Created, Name, Value) VALUES ('2024-01-01T00:00:00Z', NULL, 'v')",
                [],
            )
            .map_err(unavailable)
        })
        .await
        .unwrap();

        let store = db.key_store(KeyTable::SigningKeys);
        let keys = store.get_all().await.unwrap();
        assert_eq!(keys.len(), 1);

        store.delete(&keys[0].id).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }
}

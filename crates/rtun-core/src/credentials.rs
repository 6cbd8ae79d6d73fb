//! Credential store (component D): maps a [`GroupId`] to the SHA-256 hash of its shared
//! password. `register`/`validate`/`remove` are the only operations; a store that can't
//! prove a password correct must fail closed, never open.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use snafu::{ensure, ResultExt, Snafu};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::types::GroupId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CredentialError {
    #[snafu(display("credential group {group_id} is not registered"))]
    UnknownGroup { group_id: String },

    #[snafu(display("i/o error reading or writing the credential store"))]
    Io { source: std::io::Error },

    #[snafu(display("credential file at {} contains invalid data: {reason}", path.display()))]
    Corrupt { path: PathBuf, reason: String },

    #[snafu(display("table name {name:?} is not a valid SQL identifier"))]
    InvalidTableName { name: String },

    #[cfg(feature = "sql-credentials")]
    #[snafu(display("sql credential store error"))]
    Sql { source: sqlx::Error },
}

fn hash_password(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn hash_hex(password: &str) -> String {
    hex::encode(hash_password(password))
}

/// Looks up and validates group passwords. Implementations must never return a
/// password in cleartext, and must treat "group not found" and "password wrong"
/// identically from the caller's point of view (both are simply `Ok(false)`).
pub trait CredentialStore: Send + Sync + 'static {
    fn register(
        &self,
        group_id: GroupId,
        password: &str,
    ) -> impl Future<Output = Result<(), CredentialError>> + Send;

    fn validate(
        &self,
        group_id: &GroupId,
        password: &str,
    ) -> impl Future<Output = Result<bool, CredentialError>> + Send;

    fn remove(&self, group_id: &GroupId) -> impl Future<Output = Result<(), CredentialError>> + Send;

    fn exists(&self, group_id: &GroupId) -> impl Future<Output = Result<bool, CredentialError>> + Send;
}

/// In-memory credential store. Has no durability; intended for tests and for
/// deployments where the Gateway is reconfigured only by restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    hashes: RwLock<HashMap<GroupId, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    async fn register(&self, group_id: GroupId, password: &str) -> Result<(), CredentialError> {
        self.hashes.write().await.insert(group_id, hash_hex(password));
        Ok(())
    }

    async fn validate(&self, group_id: &GroupId, password: &str) -> Result<bool, CredentialError> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(group_id).is_some_and(|stored| *stored == hash_hex(password)))
    }

    async fn remove(&self, group_id: &GroupId) -> Result<(), CredentialError> {
        self.hashes.write().await.remove(group_id);
        Ok(())
    }

    async fn exists(&self, group_id: &GroupId) -> Result<bool, CredentialError> {
        Ok(self.hashes.read().await.contains_key(group_id))
    }
}

/// Credential store backed by a JSON file on disk. Every mutation is flushed by writing
/// a temp file next to the target and atomically renaming it over the original, so a
/// crash mid-write never leaves a half-written credential file behind.
pub struct FileCredentialStore {
    path: PathBuf,
    hashes: RwLock<HashMap<GroupId, String>>,
    // Serializes writers so two concurrent `register` calls can't race each other's
    // temp-file-then-rename sequence.
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let hashes = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| CredentialError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(CredentialError::Io { source }),
        };
        Ok(Self { path, hashes: RwLock::new(hashes), write_lock: Mutex::new(()) })
    }

    async fn flush(&self, hashes: &HashMap<GroupId, String>) -> Result<(), CredentialError> {
        let _serialize_guard = self.write_lock.lock().await;
        let body = serde_json::to_vec_pretty(hashes).expect("GroupId/String map always serializes");
        let tmp_path = tmp_path_for(&self.path);
        let mut tmp = tokio::fs::File::create(&tmp_path).await.context(IoSnafu)?;
        tmp.write_all(&body).await.context(IoSnafu)?;
        tmp.flush().await.context(IoSnafu)?;
        tokio::fs::rename(&tmp_path, &self.path).await.context(IoSnafu)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

impl CredentialStore for FileCredentialStore {
    async fn register(&self, group_id: GroupId, password: &str) -> Result<(), CredentialError> {
        let snapshot = {
            let mut hashes = self.hashes.write().await;
            hashes.insert(group_id, hash_hex(password));
            hashes.clone()
        };
        self.flush(&snapshot).await
    }

    async fn validate(&self, group_id: &GroupId, password: &str) -> Result<bool, CredentialError> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(group_id).is_some_and(|stored| *stored == hash_hex(password)))
    }

    async fn remove(&self, group_id: &GroupId) -> Result<(), CredentialError> {
        let snapshot = {
            let mut hashes = self.hashes.write().await;
            hashes.remove(group_id);
            hashes.clone()
        };
        self.flush(&snapshot).await
    }

    async fn exists(&self, group_id: &GroupId) -> Result<bool, CredentialError> {
        Ok(self.hashes.read().await.contains_key(group_id))
    }
}

/// Validates a SQL table name against `^[A-Za-z_][A-Za-z0-9_]*$` before it is
/// interpolated into a query string. Only ever applied to operator-configured table
/// names, never to request data.
fn validate_table_name(name: &str) -> Result<(), CredentialError> {
    let mut chars = name.chars();
    let starts_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    ensure!(starts_ok && rest_ok, InvalidTableNameSnafu { name });
    Ok(())
}

/// SQL-backed credential store (feature `sql-credentials`). Enabled backends are
/// whatever `sqlx` drivers the binary was built with; the default build ships `sqlite`.
#[cfg(feature = "sql-credentials")]
pub struct SqlCredentialStore {
    pool: sqlx::SqlitePool,
    table: String,
}

#[cfg(feature = "sql-credentials")]
impl SqlCredentialStore {
    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, CredentialError> {
        let table = table.into();
        validate_table_name(&table)?;
        let pool = sqlx::SqlitePool::connect(database_url).await.context(SqlSnafu)?;
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (group_id TEXT PRIMARY KEY, password_hash TEXT NOT NULL)"
        );
        sqlx::query(&create).execute(&pool).await.context(SqlSnafu)?;
        Ok(Self { pool, table })
    }
}

#[cfg(feature = "sql-credentials")]
impl CredentialStore for SqlCredentialStore {
    async fn register(&self, group_id: GroupId, password: &str) -> Result<(), CredentialError> {
        let hash = hash_hex(password);
        let upsert = format!(
            "INSERT INTO {table} (group_id, password_hash) VALUES (?1, ?2)
             ON CONFLICT(group_id) DO UPDATE SET password_hash = excluded.password_hash",
            table = self.table
        );
        sqlx::query(&upsert)
            .bind(group_id.as_str())
            .bind(hash)
            .execute(&self.pool)
            .await
            .context(SqlSnafu)?;
        Ok(())
    }

    async fn validate(&self, group_id: &GroupId, password: &str) -> Result<bool, CredentialError> {
        let select = format!("SELECT password_hash FROM {table} WHERE group_id = ?1", table = self.table);
        let row: Option<(String,)> = sqlx::query_as(&select)
            .bind(group_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context(SqlSnafu)?;
        Ok(row.is_some_and(|(stored,)| stored == hash_hex(password)))
    }

    async fn remove(&self, group_id: &GroupId) -> Result<(), CredentialError> {
        let delete = format!("DELETE FROM {table} WHERE group_id = ?1", table = self.table);
        sqlx::query(&delete).bind(group_id.as_str()).execute(&self.pool).await.context(SqlSnafu)?;
        Ok(())
    }

    async fn exists(&self, group_id: &GroupId) -> Result<bool, CredentialError> {
        let select = format!("SELECT 1 FROM {table} WHERE group_id = ?1", table = self.table);
        let row: Option<(i64,)> =
            sqlx::query_as(&select).bind(group_id.as_str()).fetch_optional(&self.pool).await.context(SqlSnafu)?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> GroupId {
        GroupId::new(name).unwrap()
    }

    #[tokio::test]
    async fn memory_store_validates_registered_passwords_only() {
        let store = MemoryCredentialStore::new();
        store.register(group("alpha"), "correct-horse").await.unwrap();

        assert!(store.validate(&group("alpha"), "correct-horse").await.unwrap());
        assert!(!store.validate(&group("alpha"), "wrong").await.unwrap());
        assert!(!store.validate(&group("missing"), "anything").await.unwrap());
    }

    #[tokio::test]
    async fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        {
            let store = FileCredentialStore::open(&path).await.unwrap();
            store.register(group("alpha"), "hunter2").await.unwrap();
        }

        let reopened = FileCredentialStore::open(&path).await.unwrap();
        assert!(reopened.validate(&group("alpha"), "hunter2").await.unwrap());
        assert!(!tmp_path_for(&path).exists(), "temp file must not survive a successful flush");
    }

    #[test]
    fn table_name_validation_rejects_sql_metacharacters() {
        assert!(validate_table_name("credentials").is_ok());
        assert!(validate_table_name("_private_1").is_ok());
        assert!(validate_table_name("1bad").is_err());
        assert!(validate_table_name("creds; DROP TABLE users;--").is_err());
    }
}

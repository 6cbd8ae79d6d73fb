//! Picks the configured credential backend and exposes it as one concrete type so
//! `rtun-gateway`'s generic `CredentialStore` bound doesn't need a trait object — the
//! same match-on-an-enum dispatch the underlying trait's `impl Future` return types push
//! every caller toward.

use rtun_core::credentials::{CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore};
use rtun_core::types::GroupId;

#[cfg(feature = "sql-credentials")]
use rtun_core::credentials::SqlCredentialStore;

use crate::conf::persistent::CredentialBackendConfig;

pub enum CredentialBackend {
    Memory(MemoryCredentialStore),
    File(FileCredentialStore),
    #[cfg(feature = "sql-credentials")]
    Sql(SqlCredentialStore),
}

impl CredentialBackend {
    pub async fn from_config(config: CredentialBackendConfig) -> eyre::Result<Self> {
        Ok(match config {
            CredentialBackendConfig::Memory => CredentialBackend::Memory(MemoryCredentialStore::new()),
            CredentialBackendConfig::File { path } => CredentialBackend::File(FileCredentialStore::open(path).await?),
            #[cfg(feature = "sql-credentials")]
            CredentialBackendConfig::Sql { database_url, table } => {
                CredentialBackend::Sql(SqlCredentialStore::connect(&database_url, table).await?)
            }
        })
    }
}

impl CredentialStore for CredentialBackend {
    async fn register(&self, group_id: GroupId, password: &str) -> Result<(), CredentialError> {
        match self {
            CredentialBackend::Memory(store) => store.register(group_id, password).await,
            CredentialBackend::File(store) => store.register(group_id, password).await,
            #[cfg(feature = "sql-credentials")]
            CredentialBackend::Sql(store) => store.register(group_id, password).await,
        }
    }

    async fn validate(&self, group_id: &GroupId, password: &str) -> Result<bool, CredentialError> {
        match self {
            CredentialBackend::Memory(store) => store.validate(group_id, password).await,
            CredentialBackend::File(store) => store.validate(group_id, password).await,
            #[cfg(feature = "sql-credentials")]
            CredentialBackend::Sql(store) => store.validate(group_id, password).await,
        }
    }

    async fn remove(&self, group_id: &GroupId) -> Result<(), CredentialError> {
        match self {
            CredentialBackend::Memory(store) => store.remove(group_id).await,
            CredentialBackend::File(store) => store.remove(group_id).await,
            #[cfg(feature = "sql-credentials")]
            CredentialBackend::Sql(store) => store.remove(group_id).await,
        }
    }

    async fn exists(&self, group_id: &GroupId) -> Result<bool, CredentialError> {
        match self {
            CredentialBackend::Memory(store) => store.exists(group_id).await,
            CredentialBackend::File(store) => store.exists(group_id).await,
            #[cfg(feature = "sql-credentials")]
            CredentialBackend::Sql(store) => store.exists(group_id).await,
        }
    }
}

//! Trait contracts for the external collaborators named in §6.
//! These are consumed, not implemented, by the core: concrete hot/warm/cold
//! backing stores are explicitly out of scope (§1). The metadata
//! storage backend contract (`exec(sql, ...) -> cursor`) is fulfilled
//! directly by `sqlx::SqlitePool`, which already exposes the equivalent
//! `query`/`fetch_one`/`fetch_all` shape, so no adapter trait is introduced
//! for it.

use async_trait::async_trait;

use crate::error::Result;

/// Hot storage: key-value store keyed by path (§6).
#[async_trait]
pub trait HotStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn head(&self, path: &str) -> Result<bool>;
}

/// Warm/cold storage: object stores with the same operation shape (§6).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn head(&self, key: &str) -> Result<bool>;
}

#[cfg(test)]
pub mod in_memory {
    //! Simple in-memory stand-ins for tests; never used in production —
    //! the real hot/warm/cold backends are external collaborators (§1).

    use std::sync::Mutex;

    use dashmap::DashMap;

    use super::*;

    #[derive(Default)]
    pub struct InMemoryStore {
        data: DashMap<String, Vec<u8>>,
        pub fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl HotStore for InMemoryStore {
        async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.data.get(path).map(|v| v.clone()))
        }

        async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
            self.data.insert(path.to_string(), bytes.to_vec());
            Ok(())
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.data.remove(path);
            Ok(())
        }

        async fn head(&self, path: &str) -> Result<bool> {
            Ok(self.data.contains_key(path))
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            HotStore::get(self, key).await
        }

        async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
            HotStore::put(self, key, bytes).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            HotStore::delete(self, key).await
        }

        async fn head(&self, key: &str) -> Result<bool> {
            HotStore::head(self, key).await
        }
    }
}

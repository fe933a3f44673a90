//! Refresh token registry abstractions
//!
//! `TokenRegistry` is the minimal surface shared by the cache and the
//! durable store. `FallbackTokenStore` layers the two: the durable store is
//! the source of truth, the cache only short-circuits lookups.

use crate::models::auth::{NewRefreshToken, RefreshTokenRecord, RotateOutcome};
use crate::repository::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait TokenRegistry: Send + Sync {
    /// Record a newly issued refresh token, returning jtis it superseded
    async fn register(&self, token: &NewRefreshToken) -> Result<Vec<String>, StoreError>;

    async fn is_active(&self, jti: &str) -> Result<bool, StoreError>;

    /// Idempotent
    async fn revoke(&self, jti: &str) -> Result<(), StoreError>;
}

/// Durable refresh token store
#[async_trait]
pub trait RefreshTokenStore: TokenRegistry {
    async fn find(&self, jti: &str) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Revoke the presented token and insert its replacement atomically.
    /// Only one of several concurrent callers presenting the same jti wins.
    async fn rotate(
        &self,
        presented_jti: &str,
        presented_hash: &str,
        replacement: &NewRefreshToken,
    ) -> Result<RotateOutcome, StoreError>;

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError>;

    /// Delete expired rows, returning how many were removed
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Cache-first registry backed by a durable store
pub struct FallbackTokenStore {
    cache: Arc<dyn TokenRegistry>,
    store: Arc<dyn RefreshTokenStore>,
}

impl FallbackTokenStore {
    pub fn new(cache: Arc<dyn TokenRegistry>, store: Arc<dyn RefreshTokenStore>) -> Self {
        Self { cache, store }
    }

    async fn cache_register(&self, token: &NewRefreshToken) {
        if let Err(e) = self.cache.register(token).await {
            tracing::warn!(jti = %token.jti, error = %e, "Token cache write failed, running degraded");
        }
    }

    async fn cache_evict(&self, jti: &str) {
        if let Err(e) = self.cache.revoke(jti).await {
            tracing::warn!(jti = %jti, error = %e, "Token cache eviction failed, running degraded");
        }
    }

    async fn cache_evict_all(&self, jtis: &[String]) {
        join_all(jtis.iter().map(|jti| self.cache_evict(jti))).await;
    }
}

#[async_trait]
impl TokenRegistry for FallbackTokenStore {
    async fn register(&self, token: &NewRefreshToken) -> Result<Vec<String>, StoreError> {
        let superseded = self.store.register(token).await?;
        self.cache_evict_all(&superseded).await;
        self.cache_register(token).await;
        Ok(superseded)
    }

    async fn is_active(&self, jti: &str) -> Result<bool, StoreError> {
        match self.cache.is_active(jti).await {
            Ok(true) => {
                metrics::counter!("token_cache_lookups_total", "result" => "hit").increment(1);
                return Ok(true);
            }
            Ok(false) => {
                metrics::counter!("token_cache_lookups_total", "result" => "miss").increment(1);
            }
            Err(e) => {
                metrics::counter!("token_cache_lookups_total", "result" => "error").increment(1);
                tracing::warn!(jti = %jti, error = %e, "Token cache lookup failed, falling back to database");
            }
        }

        let Some(record) = self.store.find(jti).await? else {
            return Ok(false);
        };

        if !record.is_active_at(Utc::now()) {
            return Ok(false);
        }

        self.cache_register(&NewRefreshToken::from(&record)).await;

        // 回填期间可能有撤销落库，回填后再确认一次
        if !self.store.is_active(jti).await? {
            self.cache_evict(jti).await;
            return Ok(false);
        }

        Ok(true)
    }

    async fn revoke(&self, jti: &str) -> Result<(), StoreError> {
        self.cache_evict(jti).await;
        self.store.revoke(jti).await?;
        // a concurrent lookup may have re-warmed the entry in between
        self.cache_evict(jti).await;
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for FallbackTokenStore {
    async fn find(&self, jti: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        self.store.find(jti).await
    }

    async fn rotate(
        &self,
        presented_jti: &str,
        presented_hash: &str,
        replacement: &NewRefreshToken,
    ) -> Result<RotateOutcome, StoreError> {
        self.cache_evict(presented_jti).await;
        let outcome = self
            .store
            .rotate(presented_jti, presented_hash, replacement)
            .await?;

        if outcome == RotateOutcome::Rotated {
            self.cache_evict(presented_jti).await;
            self.cache_register(replacement).await;
        }

        Ok(outcome)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let revoked = self.store.revoke_all_for_user(user_id).await?;
        self.cache_evict_all(&revoked).await;
        Ok(revoked)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::cache::CacheRegistry;
    use crate::config::SessionPolicy;
    use crate::repository::memory::MemoryTokenStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Cache that fails every call
    struct BrokenCache;

    #[async_trait]
    impl TokenRegistry for BrokenCache {
        async fn register(&self, _: &NewRefreshToken) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("cache down".to_string()))
        }

        async fn is_active(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("cache down".to_string()))
        }

        async fn revoke(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("cache down".to_string()))
        }
    }

    /// Durable store whose first `find` stalls after reading the row
    struct StallingStore {
        inner: MemoryTokenStore,
        stall: AtomicBool,
        read: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl TokenRegistry for StallingStore {
        async fn register(&self, token: &NewRefreshToken) -> Result<Vec<String>, StoreError> {
            self.inner.register(token).await
        }

        async fn is_active(&self, jti: &str) -> Result<bool, StoreError> {
            self.inner.is_active(jti).await
        }

        async fn revoke(&self, jti: &str) -> Result<(), StoreError> {
            self.inner.revoke(jti).await
        }
    }

    #[async_trait]
    impl RefreshTokenStore for StallingStore {
        async fn find(&self, jti: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
            let record = self.inner.find(jti).await?;
            if self.stall.swap(false, Ordering::SeqCst) {
                self.read.notify_one();
                self.resume.notified().await;
            }
            Ok(record)
        }

        async fn rotate(
            &self,
            presented_jti: &str,
            presented_hash: &str,
            replacement: &NewRefreshToken,
        ) -> Result<RotateOutcome, StoreError> {
            self.inner
                .rotate(presented_jti, presented_hash, replacement)
                .await
        }

        async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
            self.inner.revoke_all_for_user(user_id).await
        }

        async fn purge_expired(&self) -> Result<u64, StoreError> {
            self.inner.purge_expired().await
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            self.inner.health_check().await
        }
    }

    fn new_token(user_id: Uuid, jti: &str) -> NewRefreshToken {
        NewRefreshToken {
            jti: jti.to_string(),
            user_id,
            token_hash: format!("hash-{}", jti),
            expires_at: Utc::now() + Duration::days(7),
        }
    }

    #[tokio::test]
    async fn test_fallback_with_failing_cache() {
        let durable = Arc::new(MemoryTokenStore::new(SessionPolicy::Multi));
        let store = FallbackTokenStore::new(Arc::new(BrokenCache), durable.clone());
        let user_id = Uuid::new_v4();

        store.register(&new_token(user_id, "a")).await.unwrap();
        assert!(store.is_active("a").await.unwrap());
        assert!(!store.is_active("missing").await.unwrap());

        store.revoke("a").await.unwrap();
        assert!(!store.is_active("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_miss_rewarms_from_store() {
        let cache = Arc::new(CacheRegistry::new(100));
        let durable = Arc::new(MemoryTokenStore::new(SessionPolicy::Multi));
        let store = FallbackTokenStore::new(cache.clone(), durable.clone());
        let user_id = Uuid::new_v4();

        // written behind the decorator's back
        durable.register(&new_token(user_id, "b")).await.unwrap();
        assert!(!cache.is_active("b").await.unwrap());

        assert!(store.is_active("b").await.unwrap());
        assert!(cache.is_active("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_revocation_evicts_cache() {
        let cache = Arc::new(CacheRegistry::new(100));
        let durable = Arc::new(MemoryTokenStore::new(SessionPolicy::Multi));
        let store = FallbackTokenStore::new(cache.clone(), durable.clone());
        let user_id = Uuid::new_v4();

        store.register(&new_token(user_id, "c")).await.unwrap();
        store.register(&new_token(user_id, "d")).await.unwrap();
        assert!(cache.is_active("c").await.unwrap());

        let revoked = store.revoke_all_for_user(user_id).await.unwrap();
        assert_eq!(revoked.len(), 2);
        assert!(!cache.is_active("c").await.unwrap());
        assert!(!store.is_active("d").await.unwrap());
    }

    #[tokio::test]
    async fn test_rotation_moves_cache_entry() {
        let cache = Arc::new(CacheRegistry::new(100));
        let durable = Arc::new(MemoryTokenStore::new(SessionPolicy::Single));
        let store = FallbackTokenStore::new(cache.clone(), durable.clone());
        let user_id = Uuid::new_v4();

        let old = new_token(user_id, "old");
        store.register(&old).await.unwrap();

        let outcome = store
            .rotate("old", &old.token_hash, &new_token(user_id, "new"))
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Rotated);
        assert!(!cache.is_active("old").await.unwrap());
        assert!(cache.is_active("new").await.unwrap());

        let again = store
            .rotate("old", &old.token_hash, &new_token(user_id, "other"))
            .await
            .unwrap();
        assert_eq!(again, RotateOutcome::NotActive);
    }

    #[tokio::test]
    async fn test_revoke_during_rewarm_is_not_cached() {
        let cache = Arc::new(CacheRegistry::new(100));
        let durable = Arc::new(StallingStore {
            inner: MemoryTokenStore::new(SessionPolicy::Multi),
            stall: AtomicBool::new(false),
            read: Notify::new(),
            resume: Notify::new(),
        });
        let store = Arc::new(FallbackTokenStore::new(cache.clone(), durable.clone()));
        let user_id = Uuid::new_v4();

        // 只写入持久层，迫使查询走回填路径
        durable.register(&new_token(user_id, "j1")).await.unwrap();
        durable.stall.store(true, Ordering::SeqCst);

        let lookup = {
            let store = store.clone();
            tokio::spawn(async move { store.is_active("j1").await })
        };

        durable.read.notified().await;
        store.revoke("j1").await.unwrap();
        durable.resume.notify_one();

        assert!(!lookup.await.unwrap().unwrap());
        assert!(!cache.is_active("j1").await.unwrap());
        assert!(!store.is_active("j1").await.unwrap());
    }
}

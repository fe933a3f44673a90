//! In-process refresh token cache
//!
//! Entries are keyed `refresh_token:<jti>` and expire when the token does,
//! so a cache hit never outlives the token itself.

use crate::auth::registry::TokenRegistry;
use crate::models::auth::NewRefreshToken;
use crate::repository::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::{future::Cache, Expiry};
use std::time::{Duration, Instant};
use uuid::Uuid;

const KEY_PREFIX: &str = "refresh_token:";

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Per-entry TTL equal to the token's remaining lifetime
struct TokenExpiry;

impl Expiry<String, CachedToken> for TokenExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedToken,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedToken,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining())
    }
}

#[derive(Clone)]
pub struct CacheRegistry {
    cache: Cache<String, CachedToken>,
}

impl CacheRegistry {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(TokenExpiry)
            .build();

        Self { cache }
    }

    fn key(jti: &str) -> String {
        format!("{}{}", KEY_PREFIX, jti)
    }

    pub async fn get(&self, jti: &str) -> Option<CachedToken> {
        self.cache.get(&Self::key(jti)).await
    }
}

#[async_trait]
impl TokenRegistry for CacheRegistry {
    /// The cache has no notion of sessions; supersession is driven by the durable store
    async fn register(&self, token: &NewRefreshToken) -> Result<Vec<String>, StoreError> {
        self.cache
            .insert(
                Self::key(&token.jti),
                CachedToken {
                    user_id: token.user_id,
                    expires_at: token.expires_at,
                },
            )
            .await;
        Ok(vec![])
    }

    async fn is_active(&self, jti: &str) -> Result<bool, StoreError> {
        Ok(self
            .get(jti)
            .await
            .is_some_and(|entry| entry.expires_at > Utc::now()))
    }

    async fn revoke(&self, jti: &str) -> Result<(), StoreError> {
        self.cache.invalidate(&Self::key(jti)).await;
        Ok(())
    }
}

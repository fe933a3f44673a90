//! In-memory stores for tests

use super::{StoreError, UserStore, USER_CONFLICT_MESSAGE};
use crate::auth::registry::{RefreshTokenStore, TokenRegistry};
use crate::config::SessionPolicy;
use crate::models::auth::{NewRefreshToken, RefreshTokenRecord, RotateOutcome};
use crate::models::user::{NewUser, User};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, User>>, StoreError> {
        self.users
            .lock()
            .map_err(|_| StoreError::Unavailable("user store lock poisoned".to_string()))
    }

    /// Overwrite the stored digest directly
    pub fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError> {
        if let Some(user) = self.lock()?.get_mut(&id) {
            user.password_hash = hash.to_string();
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .lock()?
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let mut users = self.lock()?;
        if users
            .values()
            .any(|u| u.username == user.username || u.email == user.email)
        {
            return Err(StoreError::Conflict(USER_CONFLICT_MESSAGE.to_string()));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError> {
        Ok(match self.lock()?.get_mut(&id) {
            Some(user) => {
                user.is_active = active;
                user.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<bool, StoreError> {
        Ok(match self.lock()?.get_mut(&id) {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                user.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(&id).is_some())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

/// Refresh token store with the same atomicity as the Postgres one
pub struct MemoryTokenStore {
    policy: SessionPolicy,
    tokens: Mutex<HashMap<String, RefreshTokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, RefreshTokenRecord>>, StoreError> {
        self.tokens
            .lock()
            .map_err(|_| StoreError::Unavailable("token store lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(token: &NewRefreshToken) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id: Uuid::new_v4(),
            jti: token.jti.clone(),
            user_id: token.user_id,
            token_hash: token.token_hash.clone(),
            expires_at: token.expires_at,
            is_revoked: false,
            created_at: Utc::now(),
            revoked_at: None,
            replaced_by: None,
        }
    }
}

#[async_trait]
impl TokenRegistry for MemoryTokenStore {
    async fn register(&self, token: &NewRefreshToken) -> Result<Vec<String>, StoreError> {
        let mut tokens = self.lock()?;
        if tokens.contains_key(&token.jti) {
            return Err(StoreError::Conflict(format!("duplicate jti {}", token.jti)));
        }

        let mut superseded = Vec::new();
        if self.policy == SessionPolicy::Single {
            let now = Utc::now();
            let mut active: Vec<(String, chrono::DateTime<Utc>)> = tokens
                .values()
                .filter(|r| r.user_id == token.user_id && r.is_active_at(now))
                .map(|r| (r.jti.clone(), r.created_at))
                .collect();
            active.sort_by(|a, b| b.1.cmp(&a.1));

            let mut rows = active.into_iter();
            // 最新的记录被原位替换，其余撤销
            if let Some((newest, _)) = rows.next() {
                tokens.remove(&newest);
                superseded.push(newest);
            }
            for (jti, _) in rows {
                if let Some(record) = tokens.get_mut(&jti) {
                    record.is_revoked = true;
                    record.revoked_at = Some(now);
                }
                superseded.push(jti);
            }
        }

        tokens.insert(token.jti.clone(), Self::record(token));
        Ok(superseded)
    }

    async fn is_active(&self, jti: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .get(jti)
            .is_some_and(|r| r.is_active_at(Utc::now())))
    }

    async fn revoke(&self, jti: &str) -> Result<(), StoreError> {
        if let Some(record) = self.lock()?.get_mut(jti) {
            if !record.is_revoked {
                record.is_revoked = true;
                record.revoked_at = Some(Utc::now());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryTokenStore {
    async fn find(&self, jti: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(self.lock()?.get(jti).cloned())
    }

    async fn rotate(
        &self,
        presented_jti: &str,
        presented_hash: &str,
        replacement: &NewRefreshToken,
    ) -> Result<RotateOutcome, StoreError> {
        let mut tokens = self.lock()?;
        let now = Utc::now();

        match tokens.get_mut(presented_jti) {
            Some(record) if record.token_hash == presented_hash && record.is_active_at(now) => {
                record.is_revoked = true;
                record.revoked_at = Some(now);
                record.replaced_by = Some(replacement.jti.clone());
            }
            _ => return Ok(RotateOutcome::NotActive),
        }

        tokens.insert(replacement.jti.clone(), Self::record(replacement));
        Ok(RotateOutcome::Rotated)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut revoked = Vec::new();
        for record in self.lock()?.values_mut() {
            if record.user_id == user_id && !record.is_revoked {
                record.is_revoked = true;
                record.revoked_at = Some(now);
                revoked.push(record.jti.clone());
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut tokens = self.lock()?;
        let before = tokens.len();
        tokens.retain(|_, r| r.expires_at >= now);
        Ok((before - tokens.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(user_id: Uuid, jti: &str, ttl: Duration) -> NewRefreshToken {
        NewRefreshToken {
            jti: jti.to_string(),
            user_id,
            token_hash: format!("hash-{}", jti),
            expires_at: Utc::now() + ttl,
        }
    }

    #[tokio::test]
    async fn test_single_session_supersedes() {
        let store = MemoryTokenStore::new(SessionPolicy::Single);
        let user = Uuid::new_v4();

        store.register(&token(user, "a", Duration::days(1))).await.unwrap();
        let superseded = store.register(&token(user, "b", Duration::days(1))).await.unwrap();

        assert_eq!(superseded, vec!["a".to_string()]);
        assert!(!store.is_active("a").await.unwrap());
        assert!(store.is_active("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_multi_session_keeps_both() {
        let store = MemoryTokenStore::new(SessionPolicy::Multi);
        let user = Uuid::new_v4();

        store.register(&token(user, "a", Duration::days(1))).await.unwrap();
        let superseded = store.register(&token(user, "b", Duration::days(1))).await.unwrap();

        assert!(superseded.is_empty());
        assert!(store.is_active("a").await.unwrap());
        assert!(store.is_active("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_rotate_requires_matching_hash() {
        let store = MemoryTokenStore::new(SessionPolicy::Multi);
        let user = Uuid::new_v4();
        store.register(&token(user, "a", Duration::days(1))).await.unwrap();

        let outcome = store
            .rotate("a", "wrong", &token(user, "b", Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::NotActive);
        assert!(store.is_active("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_rotate_records_replacement() {
        let store = MemoryTokenStore::new(SessionPolicy::Multi);
        let user = Uuid::new_v4();
        store.register(&token(user, "a", Duration::days(1))).await.unwrap();

        let outcome = store
            .rotate("a", "hash-a", &token(user, "b", Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Rotated);

        let old = store.find("a").await.unwrap().unwrap();
        assert_eq!(old.replaced_by.as_deref(), Some("b"));
        assert!(old.rotated_within(Duration::seconds(30), Utc::now()));
        assert!(!old.rotated_within(Duration::zero(), Utc::now()));

        // 手动撤销的记录不算轮换
        store.revoke("b").await.unwrap();
        let revoked = store.find("b").await.unwrap().unwrap();
        assert!(!revoked.rotated_within(Duration::seconds(30), Utc::now()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryTokenStore::new(SessionPolicy::Multi);
        let user = Uuid::new_v4();
        store.register(&token(user, "live", Duration::days(1))).await.unwrap();
        store.register(&token(user, "dead", Duration::seconds(-5))).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.find("dead").await.unwrap().is_none());
    }
}

//! Authentication repository (认证数据访问)

use super::StoreError;
use crate::auth::registry::{RefreshTokenStore, TokenRegistry};
use crate::config::SessionPolicy;
use crate::models::auth::{NewRefreshToken, RefreshTokenRecord, RotateOutcome};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

pub struct AuthRepository {
    db: PgPool,
    policy: SessionPolicy,
}

impl AuthRepository {
    pub fn new(db: PgPool, policy: SessionPolicy) -> Self {
        Self { db, policy }
    }

    /// 计算令牌哈希（数据库只保存哈希，不保存令牌原文）
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        token: &NewRefreshToken,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, jti, user_id, token_hash, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&token.jti)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// 单会话模式：复用最新的有效记录，撤销其余有效记录
    async fn register_single(&self, token: &NewRefreshToken) -> Result<Vec<String>, StoreError> {
        let mut tx = self.db.begin().await?;

        let active: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, jti FROM refresh_tokens
            WHERE user_id = $1 AND is_revoked = FALSE AND expires_at > NOW()
            ORDER BY created_at DESC
            FOR UPDATE
            "#,
        )
        .bind(token.user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut superseded = Vec::with_capacity(active.len());
        let mut rows = active.into_iter();

        match rows.next() {
            Some((id, old_jti)) => {
                sqlx::query(
                    r#"
                    UPDATE refresh_tokens
                    SET jti = $2, token_hash = $3, expires_at = $4,
                        is_revoked = FALSE, revoked_at = NULL, replaced_by = NULL,
                        created_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&token.jti)
                .bind(&token.token_hash)
                .bind(token.expires_at)
                .execute(&mut *tx)
                .await?;
                superseded.push(old_jti);
            }
            None => Self::insert(&mut tx, token).await?,
        }

        for (id, old_jti) in rows {
            sqlx::query(
                "UPDATE refresh_tokens SET is_revoked = TRUE, revoked_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            superseded.push(old_jti);
        }

        tx.commit().await?;
        Ok(superseded)
    }
}

#[async_trait]
impl TokenRegistry for AuthRepository {
    /// 存储刷新令牌
    async fn register(&self, token: &NewRefreshToken) -> Result<Vec<String>, StoreError> {
        match self.policy {
            SessionPolicy::Single => self.register_single(token).await,
            SessionPolicy::Multi => {
                let mut tx = self.db.begin().await?;
                Self::insert(&mut tx, token).await?;
                tx.commit().await?;
                Ok(vec![])
            }
        }
    }

    async fn is_active(&self, jti: &str) -> Result<bool, StoreError> {
        let active: Option<bool> = sqlx::query_scalar(
            "SELECT TRUE FROM refresh_tokens WHERE jti = $1 AND is_revoked = FALSE AND expires_at > NOW()",
        )
        .bind(jti)
        .fetch_optional(&self.db)
        .await?;

        Ok(active.unwrap_or(false))
    }

    /// 撤销刷新令牌
    async fn revoke(&self, jti: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = TRUE, revoked_at = NOW() WHERE jti = $1 AND is_revoked = FALSE",
        )
        .bind(jti)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for AuthRepository {
    /// 根据 jti 查找刷新令牌
    async fn find(&self, jti: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let record =
            sqlx::query_as::<_, RefreshTokenRecord>("SELECT * FROM refresh_tokens WHERE jti = $1")
                .bind(jti)
                .fetch_optional(&self.db)
                .await?;

        Ok(record)
    }

    /// 轮换刷新令牌：条件撤销旧令牌与插入新令牌在同一事务内完成
    async fn rotate(
        &self,
        presented_jti: &str,
        presented_hash: &str,
        replacement: &NewRefreshToken,
    ) -> Result<RotateOutcome, StoreError> {
        let mut tx = self.db.begin().await?;

        // 行锁保证并发请求中只有一个能撤销成功
        let revoked: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = NOW(), replaced_by = $3
            WHERE jti = $1 AND token_hash = $2 AND is_revoked = FALSE AND expires_at > NOW()
            RETURNING user_id
            "#,
        )
        .bind(presented_jti)
        .bind(presented_hash)
        .bind(&replacement.jti)
        .fetch_optional(&mut *tx)
        .await?;

        if revoked.is_none() {
            tx.rollback().await?;
            return Ok(RotateOutcome::NotActive);
        }

        Self::insert(&mut tx, replacement).await?;
        tx.commit().await?;

        Ok(RotateOutcome::Rotated)
    }

    /// 撤销用户的所有刷新令牌
    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let jtis: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = NOW()
            WHERE user_id = $1 AND is_revoked = FALSE
            RETURNING jti
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(jtis)
    }

    /// 清理过期的刷新令牌
    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < NOW()")
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        crate::db::health_check(&self.db).await?;
        Ok(())
    }
}

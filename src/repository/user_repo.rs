//! User repository (数据库访问层)

use super::StoreError;
use crate::models::user::{NewUser, User};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// 凭据存储：按用户名查找账户及其密码摘要
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// 用户名或邮箱重复时返回 `StoreError::Conflict`
    async fn create(&self, user: NewUser) -> Result<User, StoreError>;

    /// 返回是否找到该用户
    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError>;

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<bool, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

pub struct UserRepository {
    db: PgPool,
}

impl UserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for UserRepository {
    /// 根据用户名查找用户
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.db)
            .await?;

        Ok(user)
    }

    /// 根据 ID 查找用户
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(user)
    }

    /// 创建用户
    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, email, password_hash, is_active, is_superuser)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.is_superuser)
        .fetch_one(&self.db)
        .await?;

        Ok(user)
    }

    /// 激活 / 停用账户
    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE users SET is_active = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(active)
                .execute(&self.db)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 更新密码摘要
    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 删除用户（刷新令牌级联删除）
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        crate::db::health_check(&self.db).await?;
        Ok(())
    }
}

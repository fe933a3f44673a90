//! 用户服务：注册、激活、修改密码、删除

use crate::{
    auth::{
        error::AuthError,
        password::{PasswordHasher, PasswordPolicy},
        registry::RefreshTokenStore,
    },
    models::user::{NewUser, User},
    repository::{StoreError, UserStore},
};
use std::sync::Arc;
use uuid::Uuid;

pub struct UserService {
    users: Arc<dyn UserStore>,
    store: Arc<dyn RefreshTokenStore>,
    hasher: Arc<PasswordHasher>,
    policy: PasswordPolicy,
}

impl UserService {
    pub fn new(
        users: Arc<dyn UserStore>,
        store: Arc<dyn RefreshTokenStore>,
        hasher: Arc<PasswordHasher>,
        policy: PasswordPolicy,
    ) -> Self {
        Self {
            users,
            store,
            hasher,
            policy,
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();

        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Internal(format!("Password hashing task failed: {}", e)))?
            .map_err(AuthError::from)
    }

    /// 注册新用户（默认未激活，需管理员激活）
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        self.policy.validate(password)?;

        let password_hash = self.hash_password(password).await?;
        let user = self
            .users
            .create(NewUser {
                username: username.to_string(),
                email: email.to_string(),
                password_hash,
                is_active: false,
                is_superuser: false,
            })
            .await?;

        tracing::info!(user_id = %user.id, username = %user.username, "User registered");
        Ok(user)
    }

    /// 创建管理员账户（已激活）
    pub async fn create_superuser(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        self.policy.validate(password)?;

        let password_hash = self.hash_password(password).await?;
        let user = self
            .users
            .create(NewUser {
                username: username.to_string(),
                email: email.to_string(),
                password_hash,
                is_active: true,
                is_superuser: true,
            })
            .await?;

        tracing::info!(user_id = %user.id, username = %user.username, "Superuser created");
        Ok(user)
    }

    pub async fn get(&self, id: Uuid) -> Result<User, AuthError> {
        self.users
            .find_by_id(id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("user {}", id)))
    }

    /// 要求调用者为已激活的管理员
    pub async fn require_superuser(&self, caller: Uuid) -> Result<User, AuthError> {
        match self.users.find_by_id(caller).await? {
            Some(user) if user.is_active && user.is_superuser => Ok(user),
            _ => {
                tracing::warn!(caller = %caller, "Superuser privilege required");
                Err(AuthError::Forbidden)
            }
        }
    }

    async fn find_by_username(&self, username: &str) -> Result<User, AuthError> {
        self.users
            .find_by_username(username)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("user '{}'", username)))
    }

    /// 激活账户
    pub async fn activate(&self, username: &str) -> Result<User, AuthError> {
        let mut user = self.find_by_username(username).await?;

        if !user.is_active {
            self.users.set_active(user.id, true).await?;
            user.is_active = true;
            tracing::info!(user_id = %user.id, "User activated");
        }

        Ok(user)
    }

    /// 停用账户并撤销其所有会话
    pub async fn deactivate(&self, username: &str) -> Result<User, AuthError> {
        let mut user = self.find_by_username(username).await?;

        self.users.set_active(user.id, false).await?;
        user.is_active = false;

        let revoked = self.store.revoke_all_for_user(user.id).await?;
        tracing::info!(user_id = %user.id, revoked = revoked.len(), "User deactivated");

        Ok(user)
    }

    /// 修改密码：校验旧密码，成功后撤销所有会话
    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self.get(user_id).await?;

        let hasher = self.hasher.clone();
        let old = old_password.to_string();
        let digest = user.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || hasher.verify(&old, &digest))
            .await
            .map_err(|e| AuthError::Internal(format!("Password verification task failed: {}", e)))?
            .unwrap_or(false);

        if !verified {
            return Err(AuthError::InvalidCredentials);
        }

        self.policy.validate(new_password)?;

        let new_hash = self.hash_password(new_password).await?;
        self.users.update_password(user_id, &new_hash).await?;

        let revoked = self.store.revoke_all_for_user(user_id).await?;
        tracing::info!(user_id = %user_id, revoked = revoked.len(), "Password changed");

        Ok(())
    }

    /// 撤销指定用户的全部刷新令牌
    pub async fn revoke_user_tokens(&self, user_id: Uuid) -> Result<usize, AuthError> {
        let revoked = self.store.revoke_all_for_user(user_id).await?;
        tracing::info!(user_id = %user_id, revoked = revoked.len(), "User tokens revoked");
        Ok(revoked.len())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.users.health_check().await
    }

    /// 删除用户（令牌先撤销以清理缓存，数据库级联删除记录）
    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.store.revoke_all_for_user(user_id).await?;

        if !self.users.delete(user_id).await? {
            return Err(AuthError::NotFound(format!("user {}", user_id)));
        }

        tracing::info!(user_id = %user_id, "User deleted");
        Ok(())
    }
}

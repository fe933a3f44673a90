//! 认证服务：登录、登出、令牌刷新

use crate::{
    auth::{
        error::{AuthError, TokenError},
        jwt::{AccessClaims, TokenClaims, TokenKind, TokenService},
        password::PasswordHasher,
        registry::RefreshTokenStore,
    },
    models::auth::{NewRefreshToken, RotateOutcome, TokenResponse},
    repository::{AuthRepository, StoreError, UserStore},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const TOKEN_TYPE_BEARER: &str = "bearer";

pub struct AuthService {
    users: Arc<dyn UserStore>,
    store: Arc<dyn RefreshTokenStore>,
    tokens: Arc<TokenService>,
    hasher: Arc<PasswordHasher>,
    revoke_all_on_reuse: bool,
    /// 并发刷新的落败方在此窗口内不算重放
    rotation_grace: chrono::Duration,
    /// 未知用户登录时仍执行一次校验，避免通过耗时探测用户是否存在
    dummy_hash: String,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        store: Arc<dyn RefreshTokenStore>,
        tokens: Arc<TokenService>,
        hasher: Arc<PasswordHasher>,
        revoke_all_on_reuse: bool,
        rotation_grace: chrono::Duration,
    ) -> Result<Self, AuthError> {
        let dummy_hash = hasher.hash(&Uuid::new_v4().to_string())?;

        Ok(Self {
            users,
            store,
            tokens,
            hasher,
            revoke_all_on_reuse,
            rotation_grace,
            dummy_hash,
        })
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// 在阻塞线程池中校验密码；摘要格式错误按校验失败处理
    async fn verify_password(&self, password: &str, digest: String) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();

        let result = tokio::task::spawn_blocking(move || hasher.verify(&password, &digest))
            .await
            .map_err(|e| AuthError::Internal(format!("Password verification task failed: {}", e)))?;

        match result {
            Ok(matched) => Ok(matched),
            Err(e) => {
                tracing::warn!(error = %e, "Stored password digest could not be verified");
                Ok(false)
            }
        }
    }

    /// 旧格式或参数过时的摘要在登录成功后重新哈希（失败仅记录日志）
    async fn rehash_if_needed(&self, user_id: Uuid, password: &str, digest: &str) {
        if !self.hasher.needs_rehash(digest) {
            return;
        }

        let hasher = self.hasher.clone();
        let password = password.to_string();
        let new_hash = match tokio::task::spawn_blocking(move || hasher.hash(&password)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Password rehash failed");
                return;
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Password rehash task failed");
                return;
            }
        };

        match self.users.update_password(user_id, &new_hash).await {
            Ok(_) => tracing::info!(user_id = %user_id, "Password digest upgraded"),
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Failed to persist rehashed password"),
        }
    }

    /// 签发访问令牌与刷新令牌
    fn issue_pair(&self, user_id: Uuid) -> Result<(TokenResponse, NewRefreshToken), AuthError> {
        let access = self.tokens.issue_access_token(user_id)?;
        let refresh = self.tokens.issue_refresh_token(user_id)?;

        let record = NewRefreshToken {
            jti: refresh.jti.clone(),
            user_id,
            token_hash: AuthRepository::hash_token(&refresh.token),
            expires_at: refresh.expires_at,
        };

        let response = TokenResponse {
            access_token: access.token,
            refresh_token: refresh.token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            expires_in: access.expires_in,
            refresh_expires_in: refresh.expires_in,
        };

        Ok((response, record))
    }

    /// 用户登录
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenResponse, AuthError> {
        let result = self.try_login(username, password).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(AuthError::UserNotFound | AuthError::InvalidCredentials) => "invalid_credentials",
            Err(AuthError::AccountInactive) => "inactive",
            Err(_) => "error",
        };
        metrics::counter!("auth_login_total", "outcome" => outcome).increment(1);

        result
    }

    async fn try_login(&self, username: &str, password: &str) -> Result<TokenResponse, AuthError> {
        let user = self.users.find_by_username(username).await?;

        let digest = user
            .as_ref()
            .map(|u| u.password_hash.clone())
            .unwrap_or_else(|| self.dummy_hash.clone());
        let verified = self.verify_password(password, digest).await?;

        let Some(user) = user else {
            tracing::info!(username = %username, reason = "user_not_found", "Login failed");
            return Err(AuthError::UserNotFound);
        };

        if !verified {
            tracing::info!(user_id = %user.id, reason = "invalid_credentials", "Login failed");
            return Err(AuthError::InvalidCredentials);
        }

        // 检查账户状态
        if !user.is_active {
            tracing::info!(user_id = %user.id, reason = "inactive", "Login failed");
            return Err(AuthError::AccountInactive);
        }

        self.rehash_if_needed(user.id, password, &user.password_hash)
            .await;

        let (response, record) = self.issue_pair(user.id)?;
        let superseded = self.store.register(&record).await?;

        tracing::info!(
            user_id = %user.id,
            jti = %record.jti,
            superseded = superseded.len(),
            "User logged in"
        );

        Ok(response)
    }

    /// 刷新令牌（轮换：旧令牌撤销，签发新令牌）
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let result = self.try_refresh(refresh_token).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(AuthError::TokenReuse) => "reuse",
            Err(AuthError::AccountInactive) => "inactive",
            Err(AuthError::Store(_) | AuthError::Internal(_)) => "error",
            Err(_) => "invalid",
        };
        metrics::counter!("auth_refresh_total", "outcome" => outcome).increment(1);

        result
    }

    async fn try_refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let claims = self.tokens.verify_refresh(refresh_token)?;
        let user_id = claims.user_id()?;

        // 已删除或停用的用户不能续期
        match self.users.find_by_id(user_id).await? {
            Some(user) if user.is_active => {}
            _ => {
                tracing::info!(user_id = %user_id, reason = "inactive", "Refresh rejected");
                return Err(AuthError::AccountInactive);
            }
        }

        // 缓存快速路径：已撤销或未知的 jti 不进入轮换事务
        if !self.store.is_active(&claims.jti).await? {
            return Err(self.reject_inactive_refresh(&claims.jti).await);
        }

        let presented_hash = AuthRepository::hash_token(refresh_token);
        let (response, record) = self.issue_pair(user_id)?;

        match self
            .store
            .rotate(&claims.jti, &presented_hash, &record)
            .await?
        {
            RotateOutcome::Rotated => {
                tracing::info!(
                    user_id = %user_id,
                    old_jti = %claims.jti,
                    new_jti = %record.jti,
                    "Refresh token rotated"
                );
                Ok(response)
            }
            RotateOutcome::NotActive => Err(self.reject_inactive_refresh(&claims.jti).await),
        }
    }

    /// 旧令牌不可用：若已被撤销则视为重放，刚被并发请求轮换掉的除外
    async fn reject_inactive_refresh(&self, jti: &str) -> AuthError {
        let record = match self.store.find(jti).await {
            Ok(record) => record,
            Err(e) => return e.into(),
        };

        let Some(record) = record.filter(|r| r.is_revoked) else {
            tracing::info!(jti = %jti, reason = "revoked", "Refresh rejected");
            return AuthError::InvalidToken(TokenError::Revoked);
        };

        if record.rotated_within(self.rotation_grace, chrono::Utc::now()) {
            tracing::info!(
                user_id = %record.user_id,
                jti = %jti,
                reason = "concurrent_rotation",
                "Refresh rejected"
            );
            return AuthError::InvalidToken(TokenError::Revoked);
        }

        tracing::warn!(
            user_id = %record.user_id,
            jti = %jti,
            "Revoked refresh token presented again, possible token theft"
        );

        if self.revoke_all_on_reuse {
            match self.store.revoke_all_for_user(record.user_id).await {
                Ok(revoked) => tracing::warn!(
                    user_id = %record.user_id,
                    revoked = revoked.len(),
                    "All sessions revoked after refresh token reuse"
                ),
                Err(e) => tracing::error!(
                    user_id = %record.user_id,
                    error = %e,
                    "Failed to revoke sessions after refresh token reuse"
                ),
            }
        }

        AuthError::TokenReuse
    }

    /// 用户登出（幂等）
    pub async fn logout(&self, refresh_token: &str, caller: Uuid) -> Result<(), AuthError> {
        let claims = self.tokens.decode_refresh_for_revocation(refresh_token)?;

        if claims.user_id()? != caller {
            tracing::warn!(caller = %caller, jti = %claims.jti, "Attempt to revoke another user's token");
            return Err(AuthError::Forbidden);
        }

        self.store.revoke(&claims.jti).await?;
        tracing::info!(user_id = %caller, jti = %claims.jti, "User logged out");

        Ok(())
    }

    /// 撤销用户的所有会话，返回撤销数量
    pub async fn logout_all(&self, user_id: Uuid) -> Result<usize, AuthError> {
        let revoked = self.store.revoke_all_for_user(user_id).await?;
        tracing::info!(user_id = %user_id, revoked = revoked.len(), "All sessions revoked");
        Ok(revoked.len())
    }

    /// 校验令牌；刷新令牌还必须在存储中处于有效状态
    pub async fn verify(&self, token: &str, kind: TokenKind) -> Result<TokenClaims, AuthError> {
        let claims = self.tokens.verify(token, kind)?;

        if kind == TokenKind::Refresh && !self.store.is_active(&claims.claims().jti).await? {
            return Err(AuthError::InvalidToken(TokenError::Revoked));
        }

        Ok(claims)
    }

    /// 校验访问令牌（仅签名、过期时间、类型与作用域）
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        Ok(self.tokens.verify_access(token)?)
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }

    /// 定期清理过期的刷新令牌
    pub fn spawn_cleanup_task(&self, every: Duration) -> JoinHandle<()> {
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(purged = n, "Expired refresh tokens purged"),
                    Err(e) => tracing::warn!(error = %e, "Refresh token cleanup failed"),
                }
            }
        })
    }
}

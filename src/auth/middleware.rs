//! JWT 认证中间件

use crate::{auth::error::AuthError, error::AppError, middleware::AppState};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use regex::Regex;
use std::sync::Arc;
use uuid::Uuid;

/// 认证上下文（附加到请求扩展）
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    /// 访问令牌的 jti
    pub token_id: String,
}

// 实现 FromRequestParts 以便在 handler 中直接提取 AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// 公开路径白名单
///
/// 以 `^` 开头的条目按正则匹配，其余按路径精确匹配
#[derive(Debug, Clone)]
pub struct PublicPaths {
    exact: Vec<String>,
    patterns: Vec<Regex>,
}

impl PublicPaths {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Result<Self, regex::Error> {
        let mut exact = Vec::new();
        let mut patterns = Vec::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry.starts_with('^') {
                patterns.push(Regex::new(entry)?);
            } else {
                exact.push(entry.to_string());
            }
        }

        Ok(Self { exact, patterns })
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.exact.iter().any(|p| p == path) || self.patterns.iter().any(|re| re.is_match(path))
    }
}

/// 从 Authorization 头提取令牌（Bearer 方案，大小写不敏感）
pub fn extract_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;

    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::MissingCredentials)?;

    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MissingCredentials);
    }

    Ok(token.to_string())
}

/// 全局认证中间件：白名单路径直接放行，其余路径必须携带有效访问令牌
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if state.public_paths.is_public(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path().to_string();
    let result = match extract_token(req.headers()) {
        Ok(token) => state.auth_service.verify_access(&token),
        Err(e) => Err(e),
    };

    let claims = match result {
        Ok(claims) => claims,
        Err(e) => {
            tracing::info!(path = %path, reason = e.reason(), "Request rejected by auth middleware");
            metrics::counter!("auth_rejections_total", "reason" => e.reason()).increment(1);
            return Err(AppError::Unauthorized);
        }
    };

    let user_id = match claims.user_id() {
        Ok(id) => id,
        Err(_) => {
            tracing::info!(path = %path, reason = "malformed", "Request rejected by auth middleware");
            metrics::counter!("auth_rejections_total", "reason" => "malformed").increment(1);
            return Err(AppError::Unauthorized);
        }
    };

    // 附加到请求扩展
    req.extensions_mut().insert(AuthContext {
        user_id,
        token_id: claims.jti,
    });

    Ok(next.run(req).await)
}

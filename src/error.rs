//! 统一错误模型
//! 定义所有错误类型和错误响应格式

use crate::{auth::error::AuthError, repository::StoreError};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// 令牌缺失或无效，对外统一提示
    #[error("Could not validate credentials")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::Config(_) | AppError::Internal(_) | AppError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Unauthorized => "Could not validate credentials".to_string(),
            AppError::Forbidden => "Access denied".to_string(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::BadRequest(msg) => msg.clone(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::RateLimitExceeded => "Rate limit exceeded".to_string(),
            AppError::Store(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    // 便捷方法
    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        // 记录错误日志，服务端错误保留内部细节
        if status.is_server_error() {
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::debug!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Request failed"
            );
        }

        let mut response = (status, Json(error_response)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// 认证错误到 HTTP 错误的映射
impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials | AuthError::UserNotFound => {
                AppError::BadRequest("Invalid username or password".to_string())
            }
            AuthError::AccountInactive => AppError::BadRequest("User is not active".to_string()),
            AuthError::MissingCredentials
            | AuthError::InvalidToken(_)
            | AuthError::WrongTokenType
            | AuthError::TokenReuse => AppError::Unauthorized,
            AuthError::WeakPassword(msg) => AppError::Validation(msg),
            AuthError::Forbidden => AppError::Forbidden,
            AuthError::Conflict(msg) => AppError::Conflict(msg),
            AuthError::NotFound(msg) => AppError::NotFound(msg),
            AuthError::Store(e) => AppError::Store(e),
            AuthError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            other => AppError::Store(other),
        }
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::error::TokenError;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Unauthorized.code(), 401);
        assert_eq!(AppError::Forbidden.code(), 403);
        assert_eq!(AppError::NotFound("test".to_string()).code(), 404);
        assert_eq!(AppError::BadRequest("test".to_string()).code(), 400);
        assert_eq!(AppError::Conflict("test".to_string()).code(), 409);
        assert_eq!(AppError::RateLimitExceeded.code(), 429);
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Store(StoreError::Database(sqlx::Error::RowNotFound));
        let message = error.user_message();
        assert_eq!(message, "Database error occurred");
        assert!(!message.contains("sqlx"));

        let error = AppError::Internal("argon2 exploded".to_string());
        assert!(!error.user_message().contains("argon2"));
    }

    #[test]
    fn test_unknown_user_and_wrong_password_look_identical() {
        let a = AppError::from(AuthError::UserNotFound);
        let b = AppError::from(AuthError::InvalidCredentials);
        assert_eq!(a.code(), b.code());
        assert_eq!(a.user_message(), b.user_message());
        assert_eq!(a.user_message(), "Invalid username or password");
    }

    #[test]
    fn test_token_errors_are_unauthorized() {
        for e in [
            AuthError::MissingCredentials,
            AuthError::InvalidToken(TokenError::Expired),
            AuthError::InvalidToken(TokenError::InvalidSignature),
            AuthError::WrongTokenType,
            AuthError::TokenReuse,
        ] {
            assert_eq!(AppError::from(e).code(), 401);
        }
    }

    #[test]
    fn test_unauthorized_response_has_www_authenticate() {
        let response = AppError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }
}

//! Database repository layer

pub mod auth_repo;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod user_repo;

pub use auth_repo::*;
pub use user_repo::*;

/// 唯一约束冲突时返回的固定信息
pub const USER_CONFLICT_MESSAGE: &str = "Username or email already exists";

/// 存储层错误（数据库与缓存共用）
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            // 约束详情只写日志，不返回给调用方
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                tracing::debug!(constraint = ?db_err.constraint(), "Unique constraint violated");
                let message = match db_err.table() {
                    Some("refresh_tokens") => "Refresh token already exists",
                    _ => USER_CONFLICT_MESSAGE,
                };
                StoreError::Conflict(message.to_string())
            }
            _ => StoreError::Database(e),
        }
    }
}

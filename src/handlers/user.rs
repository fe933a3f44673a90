//! 用户管理的 HTTP 处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::user::*,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// 注册用户（创建后处于未激活状态）
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let user = state
        .user_service
        .register(&req.username, &req.email, &req.password)
        .await?;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

/// 修改当前用户密码，成功后所有会话失效
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .user_service
        .change_password(auth_context.user_id, &req.old_password, &req.new_password)
        .await?;

    Ok(Json(json!({ "message": "Password updated" })))
}

/// 删除用户（管理员）
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .user_service
        .require_superuser(auth_context.user_id)
        .await?;

    state.user_service.delete_user(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

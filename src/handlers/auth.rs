//! 认证相关的 HTTP 处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::{
        auth::*,
        user::{AccountStatusRequest, UserResponse},
    },
};
use axum::{
    extract::{FromRequest, Path, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    Form, Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// 登录凭据：支持 JSON 与表单两种请求体
pub struct LoginCredentials(pub LoginRequest);

impl<S> FromRequest<S> for LoginCredentials
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if is_json {
            let Json(body) = Json::<LoginRequest>::from_request(req, state)
                .await
                .map_err(|e| AppError::Validation(e.body_text()))?;
            Ok(Self(body))
        } else {
            let Form(body) = Form::<LoginRequest>::from_request(req, state)
                .await
                .map_err(|e| AppError::Validation(e.body_text()))?;
            Ok(Self(body))
        }
    }
}

/// 登录
pub async fn login(
    State(state): State<Arc<AppState>>,
    LoginCredentials(req): LoginCredentials,
) -> Result<impl IntoResponse, AppError> {
    let response = state
        .auth_service
        .login(&req.username, &req.password)
        .await?;

    Ok(Json(response))
}

/// OAuth2 密码模式获取令牌
pub async fn token(
    State(state): State<Arc<AppState>>,
    Form(req): Form<OAuth2TokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(grant_type) = req.grant_type.as_deref() {
        if grant_type != "password" {
            return Err(AppError::BadRequest(format!(
                "Unsupported grant_type: {}",
                grant_type
            )));
        }
    }

    let response = state
        .auth_service
        .login(&req.username, &req.password)
        .await?;

    Ok(Json(response))
}

/// 刷新令牌
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.auth_service.refresh(&req.refresh_token).await?;

    Ok(Json(response))
}

/// 登出
pub async fn logout(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<LogoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .logout(&req.refresh_token, auth_context.user_id)
        .await?;

    Ok(Json(json!({ "message": "Logged out" })))
}

/// 登出所有会话
pub async fn logout_all(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let revoked = state.auth_service.logout_all(auth_context.user_id).await?;

    Ok(Json(json!({ "message": "All sessions revoked", "revoked": revoked })))
}

/// 获取当前用户信息
pub async fn get_current_user(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .user_service
        .get(auth_context.user_id)
        .await
        .map_err(|_| AppError::Unauthorized)?;

    Ok(Json(UserResponse::from(user)))
}

/// 激活账户（管理员）
pub async fn activate(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<AccountStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .user_service
        .require_superuser(auth_context.user_id)
        .await?;

    let user = state.user_service.activate(&req.username).await?;

    Ok(Json(UserResponse::from(user)))
}

/// 停用账户（管理员），同时撤销其全部会话
pub async fn deactivate(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<AccountStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .user_service
        .require_superuser(auth_context.user_id)
        .await?;

    let user = state.user_service.deactivate(&req.username).await?;

    Ok(Json(UserResponse::from(user)))
}

/// 撤销指定用户的刷新令牌（管理员）
pub async fn revoke_user_tokens(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .user_service
        .require_superuser(auth_context.user_id)
        .await?;

    let revoked = state.user_service.revoke_user_tokens(user_id).await?;

    Ok((
        StatusCode::OK,
        Json(json!({ "user_id": user_id, "revoked": revoked })),
    ))
}

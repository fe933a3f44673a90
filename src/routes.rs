//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
};

use crate::{handlers, middleware::AppState};

/// 请求体大小上限
const MAX_BODY_BYTES: usize = 64 * 1024;

/// 创建应用路由
///
/// 认证中间件作用于全部路由，公开路径由白名单放行
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 认证路由（无需认证，但应用速率限制）
    let auth_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/token", post(handlers::auth::token))
        .route("/auth/refresh", post(handlers::auth::refresh_token))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::login_rate_limit_middleware,
        ));

    // 需要认证的路由
    let authenticated_routes = Router::new()
        .route("/auth/me", get(handlers::auth::get_current_user))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/logout-all", post(handlers::auth::logout_all))
        // 账户管理（需要管理员）
        .route("/auth/activate", post(handlers::auth::activate))
        .route("/auth/deactivate", post(handlers::auth::deactivate))
        .route(
            "/auth/{user_id}/refresh-tokens",
            delete(handlers::auth::revoke_user_tokens),
        )
        // 用户
        .route("/users/register", post(handlers::user::register))
        .route("/users/me/password", put(handlers::user::change_password))
        .route("/users/{id}", delete(handlers::user::delete_user));

    // 组合所有路由
    Router::new()
        .merge(public_routes)
        .merge(auth_routes)
        .merge(authenticated_routes)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::middleware::auth_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(
            crate::middleware::request_tracking_middleware,
        ))
        .layer(cors_layer(&state.config.server.cors_origins))
        .with_state(state)
}

/// 根据配置的来源列表构建 CORS 层
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .map(|origin| origin.trim())
        .filter(|origin| {
            // AllowOrigin::list 不接受通配符
            if *origin == "*" {
                tracing::warn!("Ignoring wildcard CORS origin, list explicit origins instead");
            }
            *origin != "*"
        })
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

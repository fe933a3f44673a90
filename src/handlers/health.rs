//! 健康检查处理器
//! 提供 /health 和 /ready 端点

use axum::{extract::State, http::StatusCode, Json};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::{db::HealthStatus, middleware::AppState};

/// 应用启动时间
static APP_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// 记录应用启动时间（在 main 中尽早调用）
pub fn set_start_time() {
    Lazy::force(&APP_START_TIME);
}

/// 获取应用运行时间（秒）
pub fn get_uptime() -> u64 {
    APP_START_TIME.elapsed().as_secs()
}

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn new(name: &str, status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => Self {
                name: name.to_string(),
                status: "healthy".to_string(),
                message: None,
            },
            HealthStatus::Unhealthy(msg) => {
                // 错误详情只写日志，公开端点不回显
                tracing::warn!(check = %name, error = %msg, "Readiness check failed");
                Self {
                    name: name.to_string(),
                    status: "unhealthy".to_string(),
                    message: Some("unavailable".to_string()),
                }
            }
        }
    }
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime(),
    })
}

/// 就绪探针
/// 检查凭据存储与令牌存储
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let checks = vec![
        HealthCheck::new(
            "credential_store",
            state.user_service.health_check().await.into(),
        ),
        HealthCheck::new(
            "token_store",
            state.auth_service.health_check().await.into(),
        ),
    ];

    let ready = checks.iter().all(|c| c.status == "healthy");
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, checks }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_check_hides_error_detail() {
        let check = HealthCheck::new(
            "token_store",
            HealthStatus::Unhealthy("connection to 10.0.0.5:5432 refused".to_string()),
        );

        assert_eq!(check.status, "unhealthy");
        assert_eq!(check.message.as_deref(), Some("unavailable"));

        let check = HealthCheck::new("credential_store", HealthStatus::Healthy);
        assert_eq!(check.status, "healthy");
        assert!(check.message.is_none());
    }
}

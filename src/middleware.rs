//! HTTP 中间件
//! 应用状态、请求追踪、认证接口限流

use crate::{
    auth::{
        cache::CacheRegistry,
        jwt::TokenService,
        middleware::PublicPaths,
        password::{PasswordHasher, PasswordPolicy},
        registry::{FallbackTokenStore, RefreshTokenStore},
    },
    config::AppConfig,
    error::AppError,
    repository::{AuthRepository, UserRepository, UserStore},
    services::{AuthService, UserService},
};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// 应用状态
///
/// 服务使用 Arc 包装，请求之间共享同一实例
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub auth_service: Arc<AuthService>,
    pub user_service: Arc<UserService>,
    pub public_paths: Arc<PublicPaths>,
    /// 认证接口 IP 限流器
    pub rate_limiter: Arc<IpRateLimiter>,
}

impl AppState {
    /// 由凭据存储与持久化令牌存储组装服务；启用缓存时在持久化存储前加一层缓存
    pub fn new(
        config: AppConfig,
        users: Arc<dyn UserStore>,
        durable: Arc<dyn RefreshTokenStore>,
    ) -> Result<Self, AppError> {
        let tokens = Arc::new(TokenService::from_config(&config)?);
        let hasher = Arc::new(
            PasswordHasher::from_config(&config.security)
                .map_err(|e| AppError::Config(e.to_string()))?,
        );

        let store: Arc<dyn RefreshTokenStore> = if config.cache.enabled {
            // 进程内缓存不在副本间共享，多副本部署应关闭
            tracing::info!(
                max_capacity = config.cache.max_capacity,
                "Refresh token cache enabled (per-process, set EXAM_CACHE__ENABLED=false for multi-replica deployments)"
            );
            let cache = Arc::new(CacheRegistry::new(config.cache.max_capacity));
            Arc::new(FallbackTokenStore::new(cache, durable))
        } else {
            durable
        };

        let auth_service = Arc::new(AuthService::new(
            users.clone(),
            store.clone(),
            tokens,
            hasher.clone(),
            config.security.revoke_all_on_reuse,
            chrono::Duration::seconds(config.security.rotation_grace_secs as i64),
        )?);

        let user_service = Arc::new(UserService::new(
            users,
            store,
            hasher,
            PasswordPolicy::from_config(&config.security),
        ));

        let public_paths = Arc::new(
            PublicPaths::new(&config.security.public_paths)
                .map_err(|e| AppError::Config(format!("Invalid public path pattern: {}", e)))?,
        );

        let rate_limiter = Arc::new(IpRateLimiter::new(
            config.security.login_rate_limit_max_requests as usize,
            Duration::from_secs(config.security.login_rate_limit_window_secs),
        ));

        Ok(Self {
            config,
            auth_service,
            user_service,
            public_paths,
            rate_limiter,
        })
    }

    /// 使用 Postgres 存储
    pub fn with_postgres(config: AppConfig, db: sqlx::PgPool) -> Result<Self, AppError> {
        let users = Arc::new(UserRepository::new(db.clone()));
        let tokens = Arc::new(AuthRepository::new(db, config.security.session_policy));
        Self::new(config, users, tokens)
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    // 生成或提取 trace_id/request_id
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // 创建 span
    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    async move {
        let start = Instant::now();

        // 继续处理请求
        let mut response = next.run(req).await;

        let elapsed = start.elapsed();
        let status = response.status().as_u16();

        // 记录指标 - 使用静态字符串
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            "PUT" => "PUT",
            "DELETE" => "DELETE",
            "PATCH" => "PATCH",
            _ => "OTHER",
        };
        let status_class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_class)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            status = status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        // 在响应头中添加 trace_id
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// 认证接口限流中间件（登录、令牌、刷新）
pub async fn login_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client_ip = get_client_ip(&req, state.config.security.trust_proxy);

    if !state.rate_limiter.check(client_ip) {
        tracing::warn!(
            client_ip = %client_ip,
            path = %req.uri().path(),
            "Rate limit exceeded"
        );
        return Err(AppError::RateLimitExceeded);
    }

    Ok(next.run(req).await)
}

/// 获取客户端 IP 地址
/// 信任代理时优先读取代理头，否则使用连接地址
pub fn get_client_ip(req: &Request, trust_proxy: bool) -> IpAddr {
    let headers = req.headers();

    if trust_proxy {
        // X-Forwarded-For 可能包含多个 IP，取第一个
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return ip;
        }
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip();
    }

    // 无连接信息（如测试中直接调用 Router）
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

// ==================== 限流服务 ====================

/// IP 级别的速率限制器
/// 使用滑动窗口算法实现
pub struct IpRateLimiter {
    /// 每个 IP 地址的请求时间戳
    requests: DashMap<IpAddr, Arc<Mutex<VecDeque<Instant>>>>,
    max_requests: usize,
    window: Duration,
}

impl IpRateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// 检查是否允许请求，允许时记录本次请求
    pub fn check(&self, ip: IpAddr) -> bool {
        let entry = self
            .requests
            .entry(ip)
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone();

        let Ok(mut requests) = entry.lock() else {
            // 锁中毒时放行
            return true;
        };
        let now = Instant::now();

        // 清理过期的请求记录
        while let Some(&front) = requests.front() {
            if now.duration_since(front) < self.window {
                break;
            }
            requests.pop_front();
        }

        if requests.len() < self.max_requests {
            requests.push_back(now);
            true
        } else {
            false
        }
    }

    /// 移除窗口内没有请求的 IP
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.requests.retain(|_, state| match state.lock() {
            Ok(requests) => requests
                .back()
                .is_some_and(|&last| now.duration_since(last) < self.window),
            Err(_) => false,
        });
    }

    pub fn tracked_ips(&self) -> usize {
        self.requests.len()
    }

    /// 定期移除空闲 IP，防止伪造来源地址撑大表
    pub fn spawn_cleanup_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let before = self.tracked_ips();
                self.cleanup();
                let removed = before.saturating_sub(self.tracked_ips());
                if removed > 0 {
                    tracing::debug!(removed = removed, "Idle rate limit entries removed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_or_generate_trace_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "test-trace-123".parse().unwrap());

        let trace_id = extract_or_generate_trace_id(&headers);
        assert_eq!(trace_id, "test-trace-123");

        let headers = HeaderMap::new();
        let trace_id = extract_or_generate_trace_id(&headers);
        assert!(!trace_id.is_empty());
        assert_ne!(trace_id, "test-trace-123");
    }

    #[test]
    fn test_ip_rate_limiter() {
        let limiter = IpRateLimiter::new(3, Duration::from_secs(60));
        let ip = IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 1));
        let other = IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 2));

        // 前 3 个请求应该通过
        for _ in 0..3 {
            assert!(limiter.check(ip));
        }

        // 第 4 个请求应该被限流
        assert!(!limiter.check(ip));
        assert!(limiter.check(other));
    }

    #[test]
    fn test_rate_limiter_window_expiry() {
        let limiter = IpRateLimiter::new(1, Duration::from_millis(20));
        let ip = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check(ip));

        std::thread::sleep(Duration::from_millis(30));
        limiter.cleanup();
        assert_eq!(limiter.tracked_ips(), 0);
    }

    #[tokio::test]
    async fn test_rate_limiter_cleanup_task_drops_idle_ips() {
        let limiter = Arc::new(IpRateLimiter::new(5, Duration::from_millis(20)));
        for last in 1..=50u8 {
            assert!(limiter.check(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last))));
        }
        assert_eq!(limiter.tracked_ips(), 50);

        let task = limiter.clone().spawn_cleanup_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();

        assert_eq!(limiter.tracked_ips(), 0);
    }

    #[test]
    fn test_client_ip_from_proxy_headers() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
            .body(axum::body::Body::empty())
            .unwrap();

        assert_eq!(get_client_ip(&req, true), "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(get_client_ip(&req, false), IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    }
}

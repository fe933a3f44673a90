//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use jsonwebtoken::Algorithm;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:8000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
    /// 允许的跨域来源
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

/// 刷新令牌会话策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// 每个用户只保留一个有效刷新令牌，新登录覆盖旧会话
    Single,
    /// 允许多个并发会话，按 jti 区分
    Multi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// JWT 密钥（使用 Secret 包装，防止日志泄露）
    pub jwt_secret: Secret<String>,
    /// 签名算法: HS256, HS384, HS512
    pub jwt_algorithm: String,
    /// 访问令牌过期时间（分钟）
    pub access_token_exp_minutes: u64,
    /// 刷新令牌过期时间（天）
    pub refresh_token_exp_days: u64,
    /// 会话策略: single, multi
    pub session_policy: SessionPolicy,
    /// 检测到刷新令牌重放时是否撤销该用户的全部会话
    pub revoke_all_on_reuse: bool,
    /// 轮换后旧令牌在此时间内再次出现按并发刷新处理，不视为重放（秒）
    pub rotation_grace_secs: u64,
    /// 密码最小长度
    pub password_min_length: usize,
    /// 密码必须包含大写字母
    pub password_require_uppercase: bool,
    /// 密码必须包含小写字母
    pub password_require_lowercase: bool,
    /// 密码必须包含数字
    pub password_require_digit: bool,
    /// 密码必须包含特殊字符
    pub password_require_special: bool,
    /// Argon2 内存开销（KiB）
    pub argon2_memory_kib: u32,
    /// Argon2 迭代次数
    pub argon2_iterations: u32,
    /// Argon2 并行度
    pub argon2_parallelism: u32,
    /// 认证接口限流：窗口内最大请求数
    pub login_rate_limit_max_requests: u32,
    /// 认证接口限流：窗口长度（秒）
    pub login_rate_limit_window_secs: u64,
    /// 是否信任 X-Forwarded-For 头
    pub trust_proxy: bool,
    /// 过期刷新令牌清理间隔（秒）
    pub token_cleanup_interval_secs: u64,
    /// 无需认证的路径（精确匹配，以 ^ 开头的按正则匹配）
    pub public_paths: Vec<String>,
}

impl SecurityConfig {
    /// 解析签名算法，仅支持 HMAC 对称算法
    pub fn algorithm(&self) -> Result<Algorithm, ConfigError> {
        match self.jwt_algorithm.to_uppercase().as_str() {
            "HS256" => Ok(Algorithm::HS256),
            "HS384" => Ok(Algorithm::HS384),
            "HS512" => Ok(Algorithm::HS512),
            other => Err(ConfigError::Message(format!(
                "Unsupported JWT algorithm: {}. Must be one of: HS256, HS384, HS512",
                other
            ))),
        }
    }
}

/// 刷新令牌缓存配置
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// 是否启用进程内缓存
    pub enabled: bool,
    /// 最大缓存条目数
    pub max_capacity: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub cache: CacheConfig,
}

/// 默认公开路径
pub const DEFAULT_PUBLIC_PATHS: &[&str] = &[
    "/",
    "/health",
    "/ready",
    "/auth/login",
    "/auth/token",
    "/auth/refresh",
    "/users/register",
    "^/public/.*$",
];

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("server.addr", "0.0.0.0:8000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("server.cors_origins", vec!["http://localhost:3000", "http://localhost:8000"])?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("security.jwt_algorithm", "HS256")?
            .set_default("security.access_token_exp_minutes", 30)?
            .set_default("security.refresh_token_exp_days", 7)?
            .set_default("security.session_policy", "single")?
            .set_default("security.revoke_all_on_reuse", true)?
            .set_default("security.rotation_grace_secs", 10)?
            .set_default("security.password_min_length", 8)?
            .set_default("security.password_require_uppercase", true)?
            .set_default("security.password_require_lowercase", true)?
            .set_default("security.password_require_digit", true)?
            .set_default("security.password_require_special", true)?
            .set_default("security.argon2_memory_kib", 65536)?
            .set_default("security.argon2_iterations", 3)?
            .set_default("security.argon2_parallelism", 4)?
            .set_default("security.login_rate_limit_max_requests", 10)?
            .set_default("security.login_rate_limit_window_secs", 60)?
            .set_default("security.trust_proxy", false)?
            .set_default("security.token_cleanup_interval_secs", 3600)?
            .set_default("security.public_paths", DEFAULT_PUBLIC_PATHS.to_vec())?
            .set_default("cache.enabled", true)?
            .set_default("cache.max_capacity", 100_000)?;

        // 从环境变量加载配置（前缀为 EXAM_）
        settings = settings.add_source(
            Environment::with_prefix("EXAM")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .with_list_parse_key("security.public_paths")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证端口范围
        if let Some(port_str) = self.server.addr.split(':').next_back() {
            if let Ok(port) = port_str.parse::<u16>() {
                if port != 0 && port < 1024 {
                    return Err(ConfigError::Message("Server port should be >= 1024".to_string()));
                }
            }
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        // 验证数据库连接池配置
        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        // 允许携带凭证时不能使用通配来源
        if self.server.cors_origins.iter().any(|o| o.trim() == "*") {
            return Err(ConfigError::Message(
                "server.cors_origins must list explicit origins, \"*\" is not allowed".to_string(),
            ));
        }

        // 验证 JWT 密钥长度（至少 32 字符）
        if self.security.jwt_secret.expose_secret().len() < 32 {
            return Err(ConfigError::Message(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        self.security.algorithm()?;

        // 验证令牌过期时间
        if self.security.access_token_exp_minutes < 1
            || self.security.access_token_exp_minutes > 1440
        {
            return Err(ConfigError::Message(
                "access_token_exp_minutes must be between 1 and 1440 (1 minute to 24 hours)"
                    .to_string(),
            ));
        }

        if self.security.refresh_token_exp_days < 1 || self.security.refresh_token_exp_days > 30 {
            return Err(ConfigError::Message(
                "refresh_token_exp_days must be between 1 and 30".to_string(),
            ));
        }

        if self.security.rotation_grace_secs > 60 {
            return Err(ConfigError::Message(
                "rotation_grace_secs must be between 0 and 60".to_string(),
            ));
        }

        // 验证密码策略
        if self.security.password_min_length < 8 || self.security.password_min_length > 128 {
            return Err(ConfigError::Message(
                "password_min_length must be between 8 and 128".to_string(),
            ));
        }

        // Argon2 要求 m >= 8 * p
        if self.security.argon2_parallelism == 0
            || self.security.argon2_iterations == 0
            || self.security.argon2_memory_kib < 8 * self.security.argon2_parallelism
        {
            return Err(ConfigError::Message(
                "argon2 parameters invalid: iterations and parallelism must be > 0, memory_kib >= 8 * parallelism"
                    .to_string(),
            ));
        }

        if self.security.login_rate_limit_max_requests == 0
            || self.security.login_rate_limit_window_secs == 0
        {
            return Err(ConfigError::Message(
                "login rate limit must allow at least one request per window".to_string(),
            ));
        }

        if self.security.token_cleanup_interval_secs < 60 {
            return Err(ConfigError::Message(
                "token_cleanup_interval_secs must be >= 60".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.max_capacity == 0 {
            return Err(ConfigError::Message(
                "cache.max_capacity must be > 0 when the cache is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

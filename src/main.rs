//! 考试系统认证服务主入口

use exam_auth::{config::AppConfig, db, handlers::health, middleware::AppState, routes, telemetry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();
    let mut superuser: Option<(String, String)> = None;

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("exam-auth {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            "--create-superuser" if args.len() == 4 => {
                superuser = Some((args[2].clone(), args[3].clone()));
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    // 按优先级加载：.env.local > .env.development > .env
    dotenv::from_filename(".env.local").ok();
    dotenv::from_filename(".env.development").ok();
    dotenv::dotenv().ok();

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "exam-auth starting...");

    // 3. 数据库连接池 + 迁移
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;

    // 4. 构建应用状态
    let cleanup_interval = Duration::from_secs(config.security.token_cleanup_interval_secs);
    let rate_limit_window = Duration::from_secs(config.security.login_rate_limit_window_secs);
    let shutdown_timeout = config.server.graceful_shutdown_timeout_secs;
    let addr = config.server.addr.clone();

    let app_state = Arc::new(AppState::with_postgres(config, db_pool)?);

    // 创建管理员后退出
    if let Some((username, email)) = superuser {
        let password = std::env::var("EXAM_SUPERUSER_PASSWORD")
            .map_err(|_| anyhow::anyhow!("EXAM_SUPERUSER_PASSWORD must be set"))?;
        let user = app_state
            .user_service
            .create_superuser(&username, &email, &password)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create superuser: {}", e))?;
        println!("Superuser created: {} ({})", user.username, user.id);
        return Ok(());
    }

    // 过期刷新令牌定期清理
    let cleanup_task = app_state.auth_service.spawn_cleanup_task(cleanup_interval);
    // 限流表按窗口长度清理空闲 IP
    let rate_limit_task = app_state
        .rate_limiter
        .clone()
        .spawn_cleanup_task(rate_limit_window);

    // 5. 构建路由
    let app = routes::create_router(app_state);

    // 6. 启动服务器
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    // 7. 优雅关闭
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_timeout))
    .await?;

    cleanup_task.abort();
    rate_limit_task.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    // 超时后强制退出
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("exam-auth {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: exam-auth [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!("  --create-superuser <用户名> <邮箱>");
    println!("                创建已激活的管理员账户后退出（密码读取 EXAM_SUPERUSER_PASSWORD）");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 EXAM_ 前缀的环境变量完成，例如:");
    println!("  EXAM_DATABASE__URL, EXAM_SECURITY__JWT_SECRET");
}

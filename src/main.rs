mod config;
mod engine;
mod monitor;
mod rotation;
mod session;
mod state;
mod supervisor;
mod web;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use config::AppConfig;
use engine::FfmpegEngine;
use state::AppState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use supervisor::SupervisorHandle;
use tracing::info;

/// Loopcast - Unattended Loop Streamer
/// 解析命令行参数，加载配置，启动推流监督器与 HTTP 控制面
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "loopcast.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    tracing_subscriber::fmt::init();

    // 解析命令行参数并加载配置
    let args = Args::parse();
    let config = Arc::new(AppConfig::load_or_default(&args.config)?);
    info!(
        "Loopcast initialized. {} endpoint(s), {} source(s), {} profile(s)",
        config.stream.endpoints.len(),
        config.stream.sources.len(),
        config.stream.profiles.len()
    );

    // 构建转码引擎 (内嵌降级图片落盘) 与监督器
    let ffmpeg = Arc::new(FfmpegEngine::new(config.server.ffmpeg_binary.clone())?);
    let handle = supervisor::spawn(config.clone(), ffmpeg);

    // 部署即推流：短暂延迟后自动开播
    if config.server.auto_start {
        let auto = handle.clone();
        let delay = Duration::from_millis(config.server.auto_start_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Auto-starting stream");
            auto.start();
        });
    }

    let app_state = Arc::new(AppState {
        supervisor: handle.clone(),
        started_at: Instant::now(),
    });

    // 注册HTTP路由
    let app = Router::new()
        .route("/", get(web::admin::index_handler)) // 控制台页面
        .route("/status", get(web::admin::stream_status)) // 会话状态快照
        .route("/sys/status", get(web::admin::sys_status)) // 系统状态
        .route("/health", get(web::admin::health)) // 探活
        .route("/control/:op", post(web::admin::handle_control)) // 操作员指令
        .route(
            "/control/auto-restart/:enabled",
            post(web::admin::handle_auto_restart), // 自动恢复开关
        )
        .with_state(app_state);

    // 启动HTTP服务；收到退出信号时先停掉子进程再退出
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(handle))
        .await?;

    Ok(())
}

/// 等待 SIGINT/SIGTERM，触发后先让监督器停流，避免 FFmpeg 成为孤儿进程
async fn shutdown_signal(handle: SupervisorHandle) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received. Stopping stream...");
    handle.stop();
    // 给监督器一点时间发出终止信号
    tokio::time::sleep(Duration::from_millis(500)).await;
}

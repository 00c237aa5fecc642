pub mod config;
pub mod error;
pub mod estimate;
pub mod gateway;
pub mod key_pool;
pub mod logging;
pub mod provider;
pub mod provision;
pub mod util;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);
    for warning in &cfg.warnings {
        tracing::warn!("{warning}");
    }

    // key 配置无效属于启动期致命错误。
    let definitions = provision::load(&cfg.config_path)
        .await
        .map_err(|e| error::AppError::config(e.to_string()))
        .with_context(|| format!("加载 key 配置失败: {}", cfg.config_path))?;

    let pool = Arc::new(key_pool::KeyPool::new(definitions, cfg.health_policy()));
    tracing::info!(
        records = pool.record_count(),
        health_policy = ?pool.health_policy(),
        "key 池初始化完成"
    );

    // 后台回收：没有流量的 key 也要按时重置窗口、恢复 healthy。
    key_pool::spawn_reclaim_task(pool.clone(), cfg.reclaim_interval());

    let provider =
        provider::ProviderClient::new(&cfg).context("初始化 ProviderClient 失败")?;

    let state = Arc::new(gateway::GatewayState {
        pool: pool.clone(),
        completion: Arc::new(provider),
        default_region: cfg.default_region.clone(),
        log_level: cfg.log_level(),
    });
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG=off 关闭全部日志；否则依赖库默认 warn，本项目自身至少 info，
    // 以免环境中预设的 RUST_LOG=warn 把关键日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,keypool=info")
        } else if env.contains("keypool") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},keypool=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}

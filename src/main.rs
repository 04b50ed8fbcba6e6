use gateants::r#const::subsystem_names;
use gateants::supervisor::{initial_load, LogLevelHandle, Supervisor};
use gateants::{Args, ProxyHandler, ProxyServer, Router};
use mimalloc::MiMalloc;
use std::process;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_graceful_shutdown::{IntoSubsystem, SubsystemBuilder, Toplevel};
use tracing::{error, info};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

// 使用 mimalloc 分配器提高内存效率
#[global_allocator]
static GLOBAL: MiMalloc = mimalloc::MiMalloc;

// 初始化日志，返回级别热更新句柄供配置重载使用
fn init_logging(args: &Args) -> LogLevelHandle {
    let initial_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let (filter, handle) = reload::Layer::new(initial_level);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    handle
}

// 程序入口
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 解析命令行参数
    let args = Args::parse_args();

    // 初始化日志
    let log_handle = init_logging(&args);

    // 验证参数
    if let Err(e) = args.validation() {
        error!("Invalid command line arguments: {}", e);
        process::exit(1);
    }

    info!("Starting Gateants rule-based HTTP/HTTPS forward proxy");

    // 解析配置路径，缺省时使用平台默认位置
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => match gateants::config::profile::config_path() {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to resolve configuration path: {}", e);
                process::exit(1);
            }
        },
    };

    // 初始加载仅使用磁盘缓存，启动绝不阻塞在网络上
    let (_config, ruleset) = match initial_load(&config_path).await {
        Ok(loaded) => {
            info!("Successfully loaded configuration: {:?}", config_path);
            loaded
        }
        Err(e) => {
            error!("Failed to load configuration file: {}", e);
            process::exit(1);
        }
    };

    // 如果是测试模式，成功验证配置后退出
    if args.test_config {
        info!("Configuration file validation successful");
        return Ok(());
    }

    // 配置中的日志级别在非调试模式下生效
    if !args.debug {
        let _ = log_handle.reload(ruleset.log_level.level_filter());
    }

    let auto_reload_hours = ruleset.auto_reload_hours;
    let listen_addr = ruleset.listen_addr.clone();

    // 创建应用组件
    let router = Arc::new(Router::new(ruleset));
    let handler = Arc::new(ProxyHandler::new(router.clone()));

    let (addr_tx, addr_rx) = watch::channel(listen_addr);

    let proxy_server = ProxyServer::new(handler, addr_rx);
    let supervisor = Supervisor::new(config_path, router, addr_tx, auto_reload_hours)
        .with_log_handle(log_handle, args.debug);

    // 创建优雅关闭顶层管理器
    let toplevel = Toplevel::new(|s| async move {
        // 启动代理服务器子系统
        s.start(SubsystemBuilder::new(
            subsystem_names::PROXY_SERVER,
            move |s| async move { proxy_server.run(s).await },
        ));
        // 启动配置监督子系统
        s.start(SubsystemBuilder::new(
            subsystem_names::SUPERVISOR,
            move |s| async move { supervisor.run(s).await },
        ));
    });

    // 等待关闭
    info!("All services started, waiting for requests...");
    match toplevel
        .catch_signals()
        .handle_shutdown_requests(tokio::time::Duration::from_secs(args.shutdown_timeout))
        .await
    {
        Ok(_) => {
            info!("Application gracefully shut down");
            Ok(())
        }
        Err(e) => {
            error!("Application shutdown error: {}", e);
            process::exit(1);
        }
    }
}

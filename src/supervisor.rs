use crate::config::{profile, Config};
use crate::error::AppError;
use crate::router::Router;
use crate::ruleset::{build_ruleset, ExternalFetcher, Ruleset};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_graceful_shutdown::{IntoSubsystem, SubsystemHandle};
use tracing::{debug, error, info};
use tracing_subscriber::{filter::LevelFilter, reload, Registry};

// 日志级别热更新句柄
pub type LogLevelHandle = reload::Handle<LevelFilter, Registry>;

// 托盘等协作方下发的控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    // 重新加载配置
    Reload,
    // 退出应用
    Quit,
}

// 启动期初始加载：仅用缓存模式编译规则集，绝不访问网络
pub async fn initial_load(config_path: &Path) -> Result<(Config, Ruleset), AppError> {
    let config = Config::from_file(config_path)?;

    let base_dir = config_dir(config_path);
    let cache_dir = profile::cache_dir().map_err(AppError::Io)?;
    let fetcher = ExternalFetcher::new(base_dir, cache_dir, true);

    let ruleset = build_ruleset(&config, &fetcher).await;
    Ok((config, ruleset))
}

// 配置监督者
//
// 负责配置生命周期：监听SIGHUP、控制信号与周期定时器，触发全量重载，
// 成功后原子替换规则集并向服务器下发监听地址。重载失败时保留旧规则集。
pub struct Supervisor {
    // 配置文件路径
    config_path: PathBuf,
    // 决策引擎
    router: Arc<Router>,
    // 监听地址下发通道
    addr_tx: watch::Sender<String>,
    // 协作方控制信号通道（可选）
    control_rx: Option<mpsc::Receiver<ControlSignal>>,
    // 日志级别热更新句柄（可选）
    log_handle: Option<LogLevelHandle>,
    // 命令行开启调试日志时不跟随配置调整级别
    debug_logging: bool,
    // 当前周期重载间隔（小时）
    auto_reload_hours: u32,
}

impl Supervisor {
    // 创建配置监督者
    pub fn new(
        config_path: PathBuf,
        router: Arc<Router>,
        addr_tx: watch::Sender<String>,
        auto_reload_hours: u32,
    ) -> Self {
        Self {
            config_path,
            router,
            addr_tx,
            control_rx: None,
            log_handle: None,
            debug_logging: false,
            auto_reload_hours,
        }
    }

    // 接入协作方控制信号通道
    pub fn with_control_channel(mut self, control_rx: mpsc::Receiver<ControlSignal>) -> Self {
        self.control_rx = Some(control_rx);
        self
    }

    // 接入日志级别热更新句柄
    pub fn with_log_handle(mut self, handle: LogLevelHandle, debug_logging: bool) -> Self {
        self.log_handle = Some(handle);
        self.debug_logging = debug_logging;
        self
    }

    // 全量重载：读文件 + 访问网络刷新外部规则，成功后原子切换
    async fn reload(&mut self, trigger: &str) {
        info!("{}: reloading configuration...", trigger);

        let config = match Config::from_file(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("Error reloading configuration: {}", e);
                return;
            }
        };

        let cache_dir = match profile::cache_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Failed to prepare cache directory: {}", e);
                return;
            }
        };

        // 外部规则拉取遵循当前（旧）规则集
        let fetcher = ExternalFetcher::new(config_dir(&self.config_path), cache_dir, false)
            .with_router(self.router.clone());
        let ruleset = build_ruleset(&config, &fetcher).await;

        if !self.debug_logging {
            if let Some(handle) = &self.log_handle {
                if let Err(e) = handle.reload(ruleset.log_level.level_filter()) {
                    debug!("Failed to update log level: {}", e);
                }
            }
        }

        self.auto_reload_hours = ruleset.auto_reload_hours;
        let listen_addr = ruleset.listen_addr.clone();

        self.router.replace_ruleset(ruleset);

        // 地址变化时通知服务器重建监听器
        self.addr_tx.send_if_modified(|current| {
            if *current != listen_addr {
                *current = listen_addr;
                true
            } else {
                debug!("Listen address unchanged ({}), no listener restart needed", current);
                false
            }
        });

        info!("Configuration reloaded");
    }
}

#[async_trait]
impl IntoSubsystem<AppError> for Supervisor {
    async fn run(mut self, subsys: SubsystemHandle) -> Result<(), AppError> {
        #[cfg(unix)]
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .map_err(AppError::Io)?;
        #[cfg(not(unix))]
        let mut sighup = ();

        // 控制通道移入局部变量，避免与重载时的可变借用冲突
        let mut control_rx = self.control_rx.take();
        let mut ticker = make_ticker(self.auto_reload_hours);
        let mut armed_hours = self.auto_reload_hours;

        loop {
            tokio::select! {
                _ = recv_sighup(&mut sighup) => {
                    self.reload("Received SIGHUP signal").await;
                }
                _ = tick(&mut ticker) => {
                    self.reload("Periodic update").await;
                }
                signal = recv_control(&mut control_rx) => match signal {
                    Some(ControlSignal::Reload) => self.reload("Manual reload").await,
                    Some(ControlSignal::Quit) => {
                        info!("Quit signal received, shutting down...");
                        subsys.request_shutdown();
                    }
                    None => {
                        debug!("Control channel closed");
                        control_rx = None;
                    }
                },
                _ = subsys.on_shutdown_requested() => {
                    info!("Supervisor received shutdown request");
                    break;
                }
            }

            // 重载可能调整了周期间隔
            if self.auto_reload_hours != armed_hours {
                ticker = make_ticker(self.auto_reload_hours);
                armed_hours = self.auto_reload_hours;
            }
        }

        Ok(())
    }
}

// 配置文件所在目录，作为相对路径来源的解析基准
fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

// 创建周期重载触发器，0小时表示关闭
fn make_ticker(hours: u32) -> Option<Interval> {
    if hours == 0 {
        return None;
    }

    let period = Duration::from_secs(u64::from(hours) * 3600);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

// 等待下一次周期触发，未配置时永不就绪
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

// 等待下一条控制信号，未接入时永不就绪
async fn recv_control(rx: &mut Option<mpsc::Receiver<ControlSignal>>) -> Option<ControlSignal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// 等待SIGHUP信号
#[cfg(unix)]
async fn recv_sighup(signal: &mut tokio::signal::unix::Signal) -> Option<()> {
    signal.recv().await
}

// 非unix平台没有SIGHUP
#[cfg(not(unix))]
async fn recv_sighup(_signal: &mut ()) -> Option<()> {
    std::future::pending().await
}

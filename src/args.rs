use crate::error::AppError;
use crate::r#const::shutdown_timeout;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

// 规则化HTTP/HTTPS正向代理服务
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gateants",
    author,
    version,
    about = "A lightweight rule-based HTTP/HTTPS forward proxy\n\n\
             Key Features:\n\
             - Forward Proxy: Plain HTTP proxying and opaque CONNECT tunneling\n\
             - Rule Routing: Ordered rules over URLs, hosts and resolved IPs (glob + CIDR)\n\
             - Upstream Dispositions: Direct, block, SOCKS5 and HTTP CONNECT upstreams with auth\n\
             - External Rules: HTTP(S) rule lists with on-disk fallback cache\n\
             - Hot Reload: SIGHUP, timed and manual reloads with atomic ruleset swap\n\
             - Performance: Multi-tier decision caches, TTL-bounded DNS cache\n\
             - Usability: Simple YAML configuration, Configuration validation, Command-line interface"
)]
pub struct Args {
    // 配置文件路径，缺省时使用平台默认路径
    #[arg(
        short,
        long,
        help = "Path to configuration file (defaults to the platform config path)"
    )]
    pub config: Option<PathBuf>,

    // 测试配置
    #[arg(
        short = 't',
        long = "test",
        action = ArgAction::SetTrue,
        help = "Test configuration file for validity and exit"
    )]
    pub test_config: bool,

    // 启用调试日志
    #[arg(
        short = 'd',
        long = "debug",
        action = ArgAction::SetTrue,
        help = "Enable debug level logging for detailed output"
    )]
    pub debug: bool,

    // 关闭超时
    #[arg(
        long = "shutdown-timeout",
        help = "Maximum time in seconds to wait for complete shutdown",
        default_value_t = shutdown_timeout::DEFAULT
    )]
    pub shutdown_timeout: u64,
}

impl Args {
    // 解析命令行参数
    pub fn parse_args() -> Self {
        Args::parse()
    }

    // 验证参数
    pub fn validation(&self) -> Result<(), AppError> {
        if self.shutdown_timeout < shutdown_timeout::MIN
            || self.shutdown_timeout > shutdown_timeout::MAX
        {
            return Err(AppError::InvalidShutdownTimeout);
        }
        Ok(())
    }
}

use crate::error::ConfigError;
use crate::r#const::config_defaults;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::{fs, io};
use tracing::{debug, info};
use validator::{Validate, ValidationError, ValidationErrors};

pub mod profile;
pub mod rule;

pub use rule::{RuleBaseConfig, RuleConfig};

// 配置结果类型别名
pub type ConfigResult<T> = Result<T, ConfigError>;

// 自定义验证函数 - 验证监听地址格式（允许 ":8080" 简写）
pub fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    match resolve_listen_addr(addr) {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::new("invalid_listen_addr")),
    }
}

// 将配置中的监听地址解析为套接字地址，":8080" 等价于 "0.0.0.0:8080"
pub fn resolve_listen_addr(addr: &str) -> ConfigResult<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };

    SocketAddr::from_str(&normalized)
        .map_err(|_| ConfigError::InvalidListenAddress(addr.to_string()))
}

// 日志级别
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    None,
}

impl LogLevel {
    // 转换为tracing过滤级别
    pub fn level_filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::None => LevelFilter::OFF,
        }
    }
}

// 应用配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    // 未命中任何规则时使用的代理键
    pub default_proxy: String,
    // 代理键到上游描述符的映射
    pub proxies: BTreeMap<String, String>,
    // 监听地址
    #[validate(custom(
        function = "validate_listen_addr",
        message = "Invalid listen address format"
    ))]
    pub listen_addr: String,
    // 日志级别
    pub log_level: LogLevel,
    // 日志文件（由日志协作方处理滚动）
    pub log_file: String,
    // 单个日志文件大小上限（MB）
    pub max_log_size: u32,
    // 日志文件数量上限
    pub max_log_files: u32,
    // 周期性重载间隔（小时），0表示关闭
    pub auto_reload_hours: u32,
    // 有序规则列表
    pub rules: Vec<RuleConfig>,
}

impl Config {
    // 从文件加载配置，文件不存在时生成并持久化默认配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            info!("Created default configuration file: {:?}", path);
            return Ok(config);
        }

        debug!("Loading configuration file: {:?}", path);
        let content = fs::read_to_string(path).map_err(ConfigError::Load)?;
        let config: Config = serde_yaml::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    // 将配置序列化写入文件
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                profile::ensure_dir(parent)
                    .map_err(|e: io::Error| ConfigError::WriteDefault(e.to_string()))?;
            }
        }

        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::WriteDefault(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::WriteDefault(e.to_string()))?;
        Ok(())
    }

    // 验证配置有效性
    pub fn validate(&self) -> ConfigResult<()> {
        if let Err(errors) = Validate::validate(self) {
            return Err(ConfigError::Validation(format_validation_errors(&errors)));
        }
        Ok(())
    }
}

// 将 ValidationErrors 转换为友好的错误信息
fn format_validation_errors(errors: &ValidationErrors) -> String {
    let mut messages = Vec::new();

    for (field, error_kind) in errors.errors() {
        match error_kind {
            validator::ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| error.code.to_string());
                    messages.push(format!("Field '{}': {}", field, message));
                }
            }
            validator::ValidationErrorsKind::Struct(struct_errors) => {
                messages.push(format!(
                    "Struct '{}' validation failed: {}",
                    field,
                    format_validation_errors(struct_errors)
                ));
            }
            validator::ValidationErrorsKind::List(list_errors) => {
                for (index, err) in list_errors {
                    messages.push(format!(
                        "List '{}' at index {}: {}",
                        field,
                        index,
                        format_validation_errors(err)
                    ));
                }
            }
        }
    }

    if messages.is_empty() {
        "Unknown validation error".to_string()
    } else {
        messages.join("\n")
    }
}

// 默认配置实现
impl Default for Config {
    fn default() -> Self {
        let mut proxies = BTreeMap::new();
        proxies.insert("direct".to_string(), String::new());
        proxies.insert("block".to_string(), "#".to_string());
        proxies.insert("socks5".to_string(), "socks5://localhost:1080".to_string());
        proxies.insert("http".to_string(), "http://localhost:8081".to_string());

        Config {
            default_proxy: config_defaults::DEFAULT_PROXY.to_string(),
            proxies,
            listen_addr: config_defaults::LISTEN_ADDR.to_string(),
            log_level: LogLevel::Info,
            log_file: config_defaults::LOG_FILE.to_string(),
            max_log_size: config_defaults::MAX_LOG_SIZE_MB,
            max_log_files: config_defaults::MAX_LOG_FILES,
            auto_reload_hours: 0,
            rules: vec![
                RuleConfig {
                    name: "Local Networks".to_string(),
                    proxy: "direct".to_string(),
                    ips: "192.168.1.0/24 10.0.0.0/8 172.16.0.0/12".to_string(),
                    hosts: "localhost *.local *.example.com internal.company.com".to_string(),
                    urls: "http://internal-api.company.com/v1/* https://*.internal.com/api/*"
                        .to_string(),
                    ..RuleConfig::default()
                },
                RuleConfig {
                    name: "Inverted Proxy Rule".to_string(),
                    proxy: "socks5".to_string(),
                    not: true,
                    hosts: "*.google.com *.youtube.com".to_string(),
                    ..RuleConfig::default()
                },
                RuleConfig {
                    name: "External Domains".to_string(),
                    proxy: "http".to_string(),
                    hosts: "*.external.com api.*.com".to_string(),
                    ..RuleConfig::default()
                },
                RuleConfig {
                    name: "Blocked Domains".to_string(),
                    proxy: "block".to_string(),
                    hosts: "*.malicious.com *.spam.com".to_string(),
                    ..RuleConfig::default()
                },
            ],
        }
    }
}

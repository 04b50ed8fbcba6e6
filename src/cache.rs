use crate::error::{AppError, ConfigError};
use crate::r#const::{decision_cache, dns_cache};
use globset::{Glob, GlobMatcher};
use ipnet::IpNet;
use moka::future::Cache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::debug;

// 决策命中的匹配类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    // URL模式命中
    Url,
    // 主机模式命中（含取反命中）
    Host,
    // 解析IP命中
    Ip,
    // 未命中任何规则
    Default,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Url => "url",
            MatchType::Host => "host",
            MatchType::Ip => "ip",
            MatchType::Default => "default",
        }
    }
}

// 一次上游决策的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionResult {
    // 选中的代理键
    pub proxy: String,
    // 命中规则的展示名称
    pub rule_name: String,
    // 匹配类别
    pub match_type: MatchType,
}

// 模式缓存
//
// 三张读多写少的映射：通配模式、CIDR网络、DNS解析结果。
// 通配与CIDR映射在每次规则集切换时整体重建，DNS子缓存跨切换保留。
pub struct PatternCache {
    // 模式文本 -> 已编译匹配器
    globs: RwLock<HashMap<String, GlobMatcher>>,
    // 文本形式 -> 网络，裸IP提升为主机掩码
    cidrs: RwLock<HashMap<String, IpNet>>,
    // 主机名 -> 解析地址，TTL限定
    dns: Cache<String, Arc<Vec<IpAddr>>>,
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternCache {
    // 创建新的模式缓存
    pub fn new() -> Self {
        Self {
            globs: RwLock::new(HashMap::new()),
            cidrs: RwLock::new(HashMap::new()),
            dns: Cache::builder()
                .max_capacity(dns_cache::SIZE)
                .time_to_live(Duration::from_secs(dns_cache::TTL_SECS))
                .build(),
        }
    }

    // 获取编译后的通配模式，结果记忆化，编译错误不缓存
    pub fn glob(&self, pattern: &str) -> Result<GlobMatcher, ConfigError> {
        if let Some(matcher) = self.globs.read().get(pattern) {
            return Ok(matcher.clone());
        }

        let matcher = compile_glob(pattern)?;
        self.globs
            .write()
            .insert(pattern.to_string(), matcher.clone());
        Ok(matcher)
    }

    // 获取解析后的CIDR网络，结果记忆化，解析错误不缓存
    pub fn cidr(&self, text: &str) -> Result<IpNet, ConfigError> {
        if let Some(net) = self.cidrs.read().get(text) {
            return Ok(*net);
        }

        let net = parse_cidr(text)?;
        self.cidrs.write().insert(text.to_string(), net);
        Ok(net)
    }

    // 解析主机名到IP集合，命中TTL-LRU缓存时直接返回，错误不缓存
    pub async fn resolve_host(&self, hostname: &str) -> Result<Arc<Vec<IpAddr>>, AppError> {
        if let Some(ips) = self.dns.get(hostname).await {
            return Ok(ips);
        }

        let addrs = lookup_host((hostname, 0u16))
            .await
            .map_err(|e| AppError::Dns(format!("{}: {}", hostname, e)))?;

        let mut ips = Vec::new();
        for addr in addrs {
            let ip = addr.ip();
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }

        if ips.is_empty() {
            return Err(AppError::Dns(format!("no addresses found for {}", hostname)));
        }

        let ips = Arc::new(ips);
        self.dns.insert(hostname.to_string(), ips.clone()).await;
        Ok(ips)
    }

    // 规则集切换时整体重建通配与CIDR映射，必须在新规则集发布前完成
    pub fn precompile(
        &self,
        host_patterns: &[String],
        url_patterns: &[String],
        ip_patterns: &[String],
    ) {
        let mut globs = HashMap::new();
        for pattern in host_patterns.iter().chain(url_patterns.iter()) {
            match compile_glob(pattern) {
                Ok(matcher) => {
                    globs.insert(pattern.clone(), matcher);
                }
                Err(e) => debug!("Skipping uncompilable pattern: {}", e),
            }
        }

        let mut cidrs = HashMap::new();
        for pattern in ip_patterns {
            match parse_cidr(pattern) {
                Ok(net) => {
                    cidrs.insert(pattern.clone(), net);
                }
                // IP列表里允许出现域名条目，匹配时按域名解析处理
                Err(_) => debug!("IP pattern '{}' is not a CIDR", pattern),
            }
        }

        *self.globs.write() = globs;
        *self.cidrs.write() = cidrs;
    }
}

// 编译单个通配模式
fn compile_glob(pattern: &str) -> Result<GlobMatcher, ConfigError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| ConfigError::InvalidPattern(format!("{}: {}", pattern, e)))
}

// 解析CIDR文本，裸IP提升为 /32 或 /128
fn parse_cidr(text: &str) -> Result<IpNet, ConfigError> {
    if !text.contains('/') {
        let ip: IpAddr = text
            .parse()
            .map_err(|_| ConfigError::InvalidCidr(text.to_string()))?;
        return Ok(IpNet::from(ip));
    }

    text.parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| ConfigError::InvalidCidr(text.to_string()))
}

// 决策缓存
//
// URL与主机缓存为纯LRU；IP缓存附带TTL，因为其中可能嵌入DNS解析结果。
// 三者在每次规则集切换时全部清空。
pub struct DecisionCaches {
    url: Cache<String, DecisionResult>,
    host: Cache<String, DecisionResult>,
    ip: Cache<String, DecisionResult>,
}

impl Default for DecisionCaches {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionCaches {
    // 创建三张决策缓存
    pub fn new() -> Self {
        Self {
            url: Cache::builder()
                .max_capacity(decision_cache::SIZE)
                .build(),
            host: Cache::builder()
                .max_capacity(decision_cache::SIZE)
                .build(),
            ip: Cache::builder()
                .max_capacity(decision_cache::SIZE)
                .time_to_live(Duration::from_secs(decision_cache::IP_TTL_SECS))
                .build(),
        }
    }

    pub async fn get_url(&self, full_url: &str) -> Option<DecisionResult> {
        self.url.get(full_url).await
    }

    pub async fn get_host(&self, host: &str) -> Option<DecisionResult> {
        self.host.get(host).await
    }

    pub async fn get_ip(&self, host: &str) -> Option<DecisionResult> {
        self.ip.get(host).await
    }

    pub async fn set_url(&self, full_url: String, result: DecisionResult) {
        self.url.insert(full_url, result).await;
    }

    pub async fn set_host(&self, host: String, result: DecisionResult) {
        self.host.insert(host, result).await;
    }

    pub async fn set_ip(&self, host: String, result: DecisionResult) {
        self.ip.insert(host, result).await;
    }

    // 规则集切换时清空全部决策
    pub fn purge(&self) {
        self.url.invalidate_all();
        self.host.invalidate_all();
        self.ip.invalidate_all();
    }
}

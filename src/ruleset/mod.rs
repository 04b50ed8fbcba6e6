mod loader;
mod parser;

pub use self::loader::ExternalFetcher;
pub use self::parser::{dedup_patterns, parse_string_list};

use crate::config::{Config, LogLevel, RuleBaseConfig};
use crate::r#const::rules as rule_consts;
use std::collections::BTreeMap;
use tracing::{info, warn};

// 编译后的单条规则，模式列表已合并、展开并去重
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledRule {
    // 规则名称，可为空
    pub name: String,
    // 命中后使用的代理键
    pub proxy: String,
    // 取反标志
    pub not: bool,
    // IP/CIDR模式
    pub ips: Vec<String>,
    // 主机模式
    pub hosts: Vec<String>,
    // URL模式
    pub urls: Vec<String>,
}

impl CompiledRule {
    // 三类模式是否全部为空
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.hosts.is_empty() && self.urls.is_empty()
    }

    // 日志与决策结果中使用的展示名称
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            rule_consts::UNNAMED
        } else {
            &self.name
        }
    }
}

// 可服务的完整规则集，经原子句柄整体替换
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ruleset {
    // 未命中任何规则时使用的代理键
    pub default_proxy: String,
    // 代理键到上游描述符的映射
    pub proxies: BTreeMap<String, String>,
    // 监听地址
    pub listen_addr: String,
    // 日志级别
    pub log_level: LogLevel,
    // 周期性重载间隔（小时）
    pub auto_reload_hours: u32,
    // 有序规则列表
    pub rules: Vec<CompiledRule>,
}

impl Ruleset {
    // 查找代理键对应的上游描述符
    pub fn proxy_descriptor(&self, key: &str) -> Option<&str> {
        self.proxies.get(key).map(String::as_str)
    }

    // 汇总所有规则的主机模式，用于模式缓存预编译
    pub fn all_host_patterns(&self) -> Vec<String> {
        self.rules.iter().flat_map(|r| r.hosts.clone()).collect()
    }

    // 汇总所有规则的URL模式
    pub fn all_url_patterns(&self) -> Vec<String> {
        self.rules.iter().flat_map(|r| r.urls.clone()).collect()
    }

    // 汇总所有规则的IP模式
    pub fn all_ip_patterns(&self) -> Vec<String> {
        self.rules.iter().flat_map(|r| r.ips.clone()).collect()
    }
}

/// 将配置编译为可服务的规则集
///
/// 逐条规则：先并入外部规则文档，再解析内联列表，三类外部列表并发拉取后追加。
/// 单个来源失败只记录告警并跳过，不影响整体编译。
pub async fn build_ruleset(config: &Config, fetcher: &ExternalFetcher) -> Ruleset {
    let mut compiled_rules = Vec::with_capacity(config.rules.len());

    for rule_config in &config.rules {
        let mut rule_config = rule_config.clone();

        // 外部规则文档只做一层展开
        if !rule_config.external_rule.is_empty() {
            let source = rule_config.external_rule.clone();
            match fetcher.fetch(&source).await {
                Ok(content) => match serde_yaml::from_str::<RuleBaseConfig>(&content) {
                    Ok(external) => rule_config.merge_base(&external),
                    Err(e) => {
                        warn!("Failed to parse external rule file from {}: {}", source, e)
                    }
                },
                Err(e) => warn!("Failed to load external rule file from {}: {}", source, e),
            }
        }

        let mut ips = parse_string_list(&rule_config.ips, false);
        let mut hosts = parse_string_list(&rule_config.hosts, true);
        let mut urls = parse_string_list(&rule_config.urls, false);

        // 三类外部列表并发拉取
        let (external_ips, external_hosts, external_urls) = tokio::join!(
            load_list_sources(fetcher, &rule_config.external_ips, false),
            load_list_sources(fetcher, &rule_config.external_hosts, true),
            load_list_sources(fetcher, &rule_config.external_urls, false),
        );

        ips.extend(external_ips);
        hosts.extend(external_hosts);
        urls.extend(external_urls);

        compiled_rules.push(CompiledRule {
            name: rule_config.name.clone(),
            proxy: rule_config.proxy.clone(),
            not: rule_config.not,
            ips: dedup_patterns(ips),
            hosts: dedup_patterns(hosts),
            urls: dedup_patterns(urls),
        });
    }

    let ruleset = Ruleset {
        default_proxy: config.default_proxy.clone(),
        proxies: config.proxies.clone(),
        listen_addr: config.listen_addr.clone(),
        log_level: config.log_level,
        auto_reload_hours: config.auto_reload_hours,
        rules: compiled_rules,
    };

    info!(
        "Ruleset compiled with {} rules: {} ip, {} host, {} url patterns",
        ruleset.rules.len(),
        ruleset.all_ip_patterns().len(),
        ruleset.all_host_patterns().len(),
        ruleset.all_url_patterns().len()
    );

    ruleset
}

// 读取一个类别的全部来源并解析为模式列表
async fn load_list_sources(
    fetcher: &ExternalFetcher,
    sources: &str,
    expand_wildcard_domains: bool,
) -> Vec<String> {
    let mut patterns = Vec::new();

    for source in parse_string_list(sources, false) {
        match fetcher.fetch(&source).await {
            Ok(content) => {
                patterns.extend(parse_string_list(&content, expand_wildcard_domains));
            }
            Err(e) => {
                warn!("Failed to load external rules from {}: {}", source, e);
            }
        }
    }

    patterns
}

use crate::cache::{DecisionCaches, DecisionResult, MatchType, PatternCache};
use crate::error::AppError;
use crate::r#const::rules;
use crate::ruleset::{CompiledRule, Ruleset};
use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

// 上游决策引擎
//
// 持有规则集的原子快照句柄与两级缓存。请求按 URL缓存 -> 主机缓存 -> IP缓存 ->
// 顺序规则求值 的次序得到处置结果；规则集切换先重建模式缓存并清空决策缓存，
// 再原子发布，读者始终看到自洽的快照。
pub struct Router {
    // 当前规则集
    ruleset: ArcSwap<Ruleset>,
    // 模式缓存（通配/CIDR/DNS）
    patterns: PatternCache,
    // 三张决策缓存
    decisions: DecisionCaches,
}

impl Router {
    // 基于初始规则集创建决策引擎
    pub fn new(ruleset: Ruleset) -> Self {
        let patterns = PatternCache::new();
        patterns.precompile(
            &ruleset.all_host_patterns(),
            &ruleset.all_url_patterns(),
            &ruleset.all_ip_patterns(),
        );
        warn_empty_negated_rules(&ruleset);

        Self {
            ruleset: ArcSwap::from_pointee(ruleset),
            patterns,
            decisions: DecisionCaches::new(),
        }
    }

    // 原子替换规则集
    // 模式重建与决策清空必须在新规则集发布之前完成
    pub fn replace_ruleset(&self, ruleset: Ruleset) {
        self.patterns.precompile(
            &ruleset.all_host_patterns(),
            &ruleset.all_url_patterns(),
            &ruleset.all_ip_patterns(),
        );
        self.decisions.purge();
        warn_empty_negated_rules(&ruleset);
        self.ruleset.store(Arc::new(ruleset));
    }

    // 获取当前规则集快照
    pub fn ruleset(&self) -> Arc<Ruleset> {
        self.ruleset.load_full()
    }

    // 对请求做上游决策
    pub async fn decide(&self, host: &str, full_url: &str) -> DecisionResult {
        let ruleset = self.ruleset();
        self.decide_on(&ruleset, host, full_url).await
    }

    // 在给定规则集快照上做上游决策，调用方负责用同一快照解析代理键
    pub async fn decide_on(
        &self,
        ruleset: &Ruleset,
        host: &str,
        full_url: &str,
    ) -> DecisionResult {
        if let Some(result) = self.decisions.get_url(full_url).await {
            debug!(
                "URL cache hit for {}: proxy={}, rule={}",
                full_url, result.proxy, result.rule_name
            );
            return result;
        }

        if let Some(result) = self.decisions.get_host(host).await {
            debug!(
                "Host cache hit for {}: proxy={}, rule={}",
                host, result.proxy, result.rule_name
            );
            return result;
        }

        if let Some(result) = self.decisions.get_ip(host).await {
            debug!(
                "IP cache hit for {}: proxy={}, rule={}",
                host, result.proxy, result.rule_name
            );
            return result;
        }

        let result = self.evaluate_rules(ruleset, host, full_url).await;

        // 每个结果恰好进入一张缓存
        match result.match_type {
            MatchType::Url => {
                self.decisions
                    .set_url(full_url.to_string(), result.clone())
                    .await
            }
            MatchType::Ip => self.decisions.set_ip(host.to_string(), result.clone()).await,
            _ => {
                self.decisions
                    .set_host(host.to_string(), result.clone())
                    .await
            }
        }

        result
    }

    // 解析裸URL（缺失scheme时提升为http）并返回其上游描述符
    // 用于外部规则拉取，使拉取本身遵循规则集
    pub async fn proxy_for_url(&self, url_str: &str) -> Result<(String, DecisionResult), AppError> {
        let ruleset = self.ruleset();
        let parsed = parse_bare_url(url_str)?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let decision = self.decide_on(&ruleset, &host, parsed.as_str()).await;

        let descriptor = ruleset
            .proxy_descriptor(&decision.proxy)
            .map(str::to_string)
            .ok_or_else(|| AppError::UnknownProxyKey(decision.proxy.clone()))?;

        Ok((descriptor, decision))
    }

    // 顺序求值规则列表
    // 每条规则按 urls -> hosts -> ips 的类别次序测试，首个命中即停
    async fn evaluate_rules(
        &self,
        ruleset: &Ruleset,
        host: &str,
        full_url: &str,
    ) -> DecisionResult {
        let host = strip_port(host);

        for rule in &ruleset.rules {
            // 全空规则视为无操作，避免取反规则变成意外的全量命中
            if rule.is_empty() {
                continue;
            }

            let mut matched: Option<MatchType> = None;

            for pattern in &rule.urls {
                if self.matches_url_pattern(pattern, full_url) {
                    matched = Some(MatchType::Url);
                    break;
                }
            }

            if matched.is_none() {
                for pattern in &rule.hosts {
                    if self.matches_host_pattern(pattern, host) {
                        matched = Some(MatchType::Host);
                        break;
                    }
                }
            }

            if matched.is_none() && !rule.ips.is_empty() && self.matches_ip_rules(rule, host).await
            {
                matched = Some(MatchType::Ip);
            }

            // 取反：模式不匹配时规则命中
            let fires = matched.is_some() != rule.not;
            if fires {
                return DecisionResult {
                    proxy: rule.proxy.clone(),
                    rule_name: rule.display_name().to_string(),
                    // 纯取反命中没有正向类别，记作主机类别
                    match_type: matched.unwrap_or(MatchType::Host),
                };
            }
        }

        DecisionResult {
            proxy: ruleset.default_proxy.clone(),
            rule_name: rules::DEFAULT_NAME.to_string(),
            match_type: MatchType::Default,
        }
    }

    // URL模式按通配语义匹配完整URL
    fn matches_url_pattern(&self, pattern: &str, full_url: &str) -> bool {
        match self.patterns.glob(pattern) {
            Ok(matcher) => matcher.is_match(full_url),
            Err(_) => false,
        }
    }

    // 主机模式匹配去端口的主机名，与模式全等时直接短路
    fn matches_host_pattern(&self, pattern: &str, host: &str) -> bool {
        let host = strip_port(host);

        if pattern == host {
            return true;
        }

        match self.patterns.glob(pattern) {
            Ok(matcher) => matcher.is_match(host),
            Err(_) => false,
        }
    }

    // IP类别匹配：目标解析失败视为未命中，绝不作为硬错误
    async fn matches_ip_rules(&self, rule: &CompiledRule, host: &str) -> bool {
        let host = strip_port(host);

        // 目标先按字面IP解析，失败再走DNS
        let target_ips: Vec<IpAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => match self.patterns.resolve_host(host).await {
                Ok(ips) => {
                    debug!("Resolved target host {} to {:?}", host, ips);
                    ips.as_ref().clone()
                }
                Err(e) => {
                    debug!("Failed to resolve target host {}: {}", host, e);
                    return false;
                }
            },
        };

        for ip_rule in &rule.ips {
            match self.patterns.cidr(ip_rule) {
                Ok(net) => {
                    for target in &target_ips {
                        if net.contains(target) {
                            debug!(
                                "Match: target {} (IP: {}) fits CIDR rule {}",
                                host, target, ip_rule
                            );
                            return true;
                        }
                    }
                }
                Err(_) => {
                    // 非CIDR条目按域名解析后做IP相等比较
                    debug!("Rule '{}' is not a CIDR, attempting DNS resolve", ip_rule);
                    match self.patterns.resolve_host(ip_rule).await {
                        Ok(rule_ips) => {
                            for rule_ip in rule_ips.iter() {
                                if target_ips.contains(rule_ip) {
                                    debug!(
                                        "Match: target {} (IP: {}) matches rule domain {}",
                                        host, rule_ip, ip_rule
                                    );
                                    return true;
                                }
                            }
                        }
                        Err(e) => debug!("Failed to resolve domain rule '{}': {}", ip_rule, e),
                    }
                }
            }
        }

        false
    }
}

// 剥除主机名中的端口，IPv6字面量去掉方括号
pub fn strip_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }

    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

// 缺失scheme的裸URL提升为http后解析
fn parse_bare_url(url_str: &str) -> Result<Url, AppError> {
    match Url::parse(url_str) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("http://{}", url_str)).map_err(|e| {
                AppError::ExternalSource(format!("invalid url {}: {}", url_str, e))
            })
        }
        Err(e) => Err(AppError::ExternalSource(format!(
            "invalid url {}: {}",
            url_str, e
        ))),
    }
}

// 对取反且无任何模式的规则发出告警，这类规则会被求值跳过
fn warn_empty_negated_rules(ruleset: &Ruleset) {
    for rule in &ruleset.rules {
        if rule.is_empty() && rule.not {
            warn!(
                "Rule '{}' negates an empty pattern set and will be ignored",
                rule.display_name()
            );
        }
    }
}

use serde::{Deserialize, Serialize};

// 单条路由规则配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConfig {
    // 规则名称（可选）
    pub name: String,
    // 命中后使用的代理键
    pub proxy: String,
    // 内联IP/CIDR模式列表（多行文本）
    pub ips: String,
    // 内联主机模式列表（多行文本）
    pub hosts: String,
    // 内联URL模式列表（多行文本）
    pub urls: String,
    // 外部IP模式来源（URL或文件路径列表）
    pub external_ips: String,
    // 外部主机模式来源
    pub external_hosts: String,
    // 外部URL模式来源
    #[serde(rename = "externalURLs")]
    pub external_urls: String,
    // 外部规则文档，解析后并入本规则
    pub external_rule: String,
    // 取反：模式不匹配时规则命中
    pub not: bool,
}

// 外部规则文档的字段集合，是规则的子集
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleBaseConfig {
    pub name: String,
    pub ips: String,
    pub hosts: String,
    pub urls: String,
    pub external_ips: String,
    pub external_hosts: String,
    #[serde(rename = "externalURLs")]
    pub external_urls: String,
    pub not: bool,
}

impl RuleConfig {
    // 将外部规则文档的字段并入本规则
    // 文本字段按换行拼接，名称仅在本规则未命名时采用，取反标志做或运算
    pub fn merge_base(&mut self, external: &RuleBaseConfig) {
        if self.name.is_empty() && !external.name.is_empty() {
            self.name = external.name.clone();
        }
        if !self.not && external.not {
            self.not = external.not;
        }

        self.ips = join_fields(&self.ips, &external.ips);
        self.hosts = join_fields(&self.hosts, &external.hosts);
        self.urls = join_fields(&self.urls, &external.urls);

        self.external_ips = join_fields(&self.external_ips, &external.external_ips);
        self.external_hosts = join_fields(&self.external_hosts, &external.external_hosts);
        self.external_urls = join_fields(&self.external_urls, &external.external_urls);
    }
}

// 换行拼接两个文本字段并去除首尾空白
fn join_fields(main: &str, external: &str) -> String {
    format!("{}\n{}", main, external).trim().to_string()
}

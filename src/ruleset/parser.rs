use crate::r#const::rules;
use std::collections::HashSet;

/// 将多行文本规范化为模式列表
///
/// 处理步骤：按行拆分；仅当 `//` 或 `#` 之前的内容为空白时才视为注释行剔除，
/// 行中带内容的注释保持原样；逗号替换为空格后按空白拆分。
/// `expand_wildcard_domains` 开启时，`*.x` 形式的条目同时输出裸域名 `x`。
pub fn parse_string_list(input: &str, expand_wildcard_domains: bool) -> Vec<String> {
    if input.is_empty() {
        return Vec::new();
    }

    let mut cleaned_lines = Vec::new();

    for line in input.lines() {
        let mut line = line;

        // 只剥除行首注释，token之后的注释标记属于模式本身
        if let Some(idx) = line.find(rules::COMMENT_SLASHES) {
            if line[..idx].trim().is_empty() {
                line = &line[..idx];
            }
        }
        if let Some(idx) = line.find(rules::COMMENT_HASH) {
            if line[..idx].trim().is_empty() {
                line = &line[..idx];
            }
        }

        cleaned_lines.push(line.trim());
    }

    let normalized = cleaned_lines.join(" ").replace(',', " ");

    let mut result = Vec::new();
    for part in normalized.split_whitespace() {
        result.push(part.to_string());

        if expand_wildcard_domains {
            if let Some(base_domain) = part.strip_prefix(rules::WILDCARD_PREFIX) {
                if !base_domain.is_empty() {
                    result.push(base_domain.to_string());
                }
            }
        }
    }
    result
}

/// 去除重复条目，保持首次出现的顺序
pub fn dedup_patterns(patterns: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(patterns.len());
    patterns
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

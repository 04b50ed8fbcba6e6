use gateants::config::{profile, Config, RuleConfig};
use gateants::ruleset::{build_ruleset, parse_string_list, ExternalFetcher};
use std::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// 辅助函数：不含任何规则来源的配置骨架
fn config_with_rules(rules: Vec<RuleConfig>) -> Config {
    Config {
        rules,
        ..Config::default()
    }
}

#[test]
fn test_parse_simple_list() {
    let result = parse_string_list("a.com b.com\nc.com", false);
    assert_eq!(result, vec!["a.com", "b.com", "c.com"]);
}

#[test]
fn test_parse_commas_become_spaces() {
    let result = parse_string_list("a.com,b.com, c.com", false);
    assert_eq!(result, vec!["a.com", "b.com", "c.com"]);
}

#[test]
fn test_parse_comment_only_lines_dropped() {
    let input = "# full line comment\n  // another comment\na.com\n   # indented comment\nb.com";
    let result = parse_string_list(input, false);
    assert_eq!(result, vec!["a.com", "b.com"]);
}

#[test]
fn test_parse_inline_comment_preserved() {
    // token之后的注释标记不做切割，原文保留
    let result = parse_string_list("value # comment", false);
    assert_eq!(result, vec!["value", "#", "comment"]);
}

#[test]
fn test_parse_hash_in_pattern_preserved() {
    // URL片段与路径前缀不受注释处理影响
    let result = parse_string_list("http://example.com/page#frag", false);
    assert_eq!(result, vec!["http://example.com/page#frag"]);

    let result = parse_string_list("//host-prefix", false);
    assert!(result.is_empty(), "leading // is a comment line");
}

#[test]
fn test_parse_wildcard_expansion() {
    // *.x 形式同时产出裸域名
    let result = parse_string_list("*.example.com plain.com", true);
    assert_eq!(result, vec!["*.example.com", "example.com", "plain.com"]);

    // 不开启扩展时保持原样
    let result = parse_string_list("*.example.com", false);
    assert_eq!(result, vec!["*.example.com"]);
}

#[test]
fn test_parse_empty_input() {
    assert!(parse_string_list("", true).is_empty());
    assert!(parse_string_list("\n\n  \n", true).is_empty());
}

#[test]
fn test_merge_base_fields() {
    use gateants::config::RuleBaseConfig;

    let mut rule = RuleConfig {
        proxy: "direct".to_string(),
        hosts: "a.com".to_string(),
        ..RuleConfig::default()
    };

    let external = RuleBaseConfig {
        name: "from external".to_string(),
        hosts: "b.com".to_string(),
        ips: "10.0.0.0/8".to_string(),
        not: true,
        ..RuleBaseConfig::default()
    };

    rule.merge_base(&external);

    // 名称仅在本规则未命名时采用，not做或运算，文本字段换行拼接
    assert_eq!(rule.name, "from external");
    assert!(rule.not);
    assert_eq!(rule.hosts, "a.com\nb.com");
    assert_eq!(rule.ips, "10.0.0.0/8");

    // 已命名的规则保留自己的名称
    let mut named = RuleConfig {
        name: "mine".to_string(),
        ..RuleConfig::default()
    };
    named.merge_base(&external);
    assert_eq!(named.name, "mine");
}

#[tokio::test]
async fn test_build_ruleset_inline_patterns() {
    let config = config_with_rules(vec![RuleConfig {
        name: "lan".to_string(),
        proxy: "direct".to_string(),
        ips: "10.0.0.0/8, 192.168.0.0/16".to_string(),
        hosts: "*.internal.net localhost".to_string(),
        ..RuleConfig::default()
    }]);

    let dir = tempfile::tempdir().unwrap();
    let fetcher = ExternalFetcher::new(
        dir.path().to_path_buf(),
        dir.path().join("cache"),
        true,
    );

    let ruleset = build_ruleset(&config, &fetcher).await;

    assert_eq!(ruleset.rules.len(), 1);
    let rule = &ruleset.rules[0];
    assert_eq!(rule.ips, vec!["10.0.0.0/8", "192.168.0.0/16"]);
    // 通配符主机模式伴随裸域名
    assert_eq!(rule.hosts, vec!["*.internal.net", "internal.net", "localhost"]);
}

#[tokio::test]
async fn test_build_ruleset_local_file_source() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("hosts.txt"),
        "# blocklist\n*.tracker.example\nplain.example\n",
    )
    .unwrap();

    let config = config_with_rules(vec![RuleConfig {
        name: "listed".to_string(),
        proxy: "block".to_string(),
        external_hosts: "hosts.txt".to_string(),
        ..RuleConfig::default()
    }]);

    let fetcher = ExternalFetcher::new(
        dir.path().to_path_buf(),
        dir.path().join("cache"),
        false,
    );

    let ruleset = build_ruleset(&config, &fetcher).await;

    // 相对路径来源基于配置目录解析，主机列表做通配符展开
    assert_eq!(
        ruleset.rules[0].hosts,
        vec!["*.tracker.example", "tracker.example", "plain.example"]
    );
}

#[tokio::test]
async fn test_build_ruleset_missing_source_is_skipped() {
    let dir = tempfile::tempdir().unwrap();

    let config = config_with_rules(vec![RuleConfig {
        name: "broken".to_string(),
        proxy: "direct".to_string(),
        hosts: "kept.example".to_string(),
        external_hosts: "missing.txt".to_string(),
        ..RuleConfig::default()
    }]);

    let fetcher = ExternalFetcher::new(
        dir.path().to_path_buf(),
        dir.path().join("cache"),
        false,
    );

    let ruleset = build_ruleset(&config, &fetcher).await;

    // 单个来源失败不影响整体编译，内联模式保留
    assert_eq!(ruleset.rules[0].hosts, vec!["kept.example"]);
}

#[tokio::test]
async fn test_build_ruleset_external_rule_merge() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("extra.yaml"),
        "name: merged rule\nhosts: \"*.merged.example\"\nnot: true\n",
    )
    .unwrap();

    let config = config_with_rules(vec![RuleConfig {
        proxy: "s5".to_string(),
        hosts: "inline.example".to_string(),
        external_rule: "extra.yaml".to_string(),
        ..RuleConfig::default()
    }]);

    let fetcher = ExternalFetcher::new(
        dir.path().to_path_buf(),
        dir.path().join("cache"),
        false,
    );

    let ruleset = build_ruleset(&config, &fetcher).await;

    let rule = &ruleset.rules[0];
    assert_eq!(rule.name, "merged rule");
    assert!(rule.not);
    assert_eq!(
        rule.hosts,
        vec!["inline.example", "*.merged.example", "merged.example"]
    );
}

#[tokio::test]
async fn test_cache_only_mode_uses_disk_cache_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    fs::create_dir_all(&cache_dir).unwrap();

    // 预置缓存文件，URL指向不存在的服务
    let url = "http://127.0.0.1:1/never-fetched/hosts.txt";
    fs::write(
        cache_dir.join(profile::cache_file_name(url)),
        "cached.example\n",
    )
    .unwrap();

    let config = config_with_rules(vec![RuleConfig {
        name: "cached".to_string(),
        proxy: "direct".to_string(),
        external_hosts: url.to_string(),
        ..RuleConfig::default()
    }]);

    let fetcher = ExternalFetcher::new(dir.path().to_path_buf(), cache_dir, true);
    let ruleset = build_ruleset(&config, &fetcher).await;

    assert_eq!(ruleset.rules[0].hosts, vec!["cached.example"]);
}

#[tokio::test]
async fn test_cache_only_mode_skips_missing_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    fs::create_dir_all(&cache_dir).unwrap();

    let config = config_with_rules(vec![RuleConfig {
        name: "uncached".to_string(),
        proxy: "direct".to_string(),
        hosts: "kept.example".to_string(),
        external_hosts: "http://127.0.0.1:1/absent.txt".to_string(),
        ..RuleConfig::default()
    }]);

    let fetcher = ExternalFetcher::new(dir.path().to_path_buf(), cache_dir, true);
    let ruleset = build_ruleset(&config, &fetcher).await;

    // 缓存缺失的来源被跳过
    assert_eq!(ruleset.rules[0].hosts, vec!["kept.example"]);
}

#[tokio::test]
async fn test_http_fetch_writes_disk_cache() {
    // 一次性HTTP服务器，返回固定规则列表
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;
        let body = "fetched.example\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    });

    let url = format!("http://{}/lists/hosts.txt", addr);
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    fs::create_dir_all(&cache_dir).unwrap();

    let fetcher = ExternalFetcher::new(dir.path().to_path_buf(), cache_dir.clone(), false);
    let content = fetcher.fetch(&url).await.unwrap();
    assert_eq!(content, "fetched.example\n");

    // 成功的响应体已写入内容寻址缓存文件
    let cached = fs::read_to_string(cache_dir.join(profile::cache_file_name(&url))).unwrap();
    assert_eq!(cached, "fetched.example\n");
}

#[test]
fn test_cache_file_name_format() {
    let name = profile::cache_file_name("https://example.com/lists/hosts.txt");

    // <basename>_<hex(sha256[..8])>.txt
    assert!(name.starts_with("hosts.txt_"));
    assert!(name.ends_with(".txt"));
    let hash_part = name
        .trim_start_matches("hosts.txt_")
        .trim_end_matches(".txt");
    assert_eq!(hash_part.len(), 16);
    assert!(hash_part.chars().all(|c| c.is_ascii_hexdigit()));

    // 同一URL名称稳定，不同URL名称不同
    assert_eq!(name, profile::cache_file_name("https://example.com/lists/hosts.txt"));
    assert_ne!(name, profile::cache_file_name("https://example.com/lists/other.txt"));

    // 无法提取文件名时回退
    assert!(profile::cache_file_name("https://example.com/").starts_with("rules_"));
}

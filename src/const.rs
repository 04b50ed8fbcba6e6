// 应用常量定义

//
// 配置参数限制常量
//

// 应用关闭等待时间限制
pub mod shutdown_timeout {
    // 默认值
    pub const DEFAULT: u64 = 30;
    // 最小值
    pub const MIN: u64 = 1;
    // 最大值
    pub const MAX: u64 = 120;
}

// DNS解析缓存配置
pub mod dns_cache {
    // 缓存条目上限
    pub const SIZE: u64 = 1000;
    // 解析结果TTL（秒）
    pub const TTL_SECS: u64 = 300;
}

// 决策缓存配置
pub mod decision_cache {
    // 每个缓存的条目上限
    pub const SIZE: u64 = 1000;
    // IP决策缓存TTL（秒），与DNS缓存保持一致
    pub const IP_TTL_SECS: u64 = 300;
}

// 外部规则拉取配置
pub mod external_fetch {
    // 拉取超时（秒）
    pub const TIMEOUT_SECS: u64 = 30;
    // 最大重试次数
    pub const RETRY_ATTEMPTS: u32 = 2;
    // 重试延迟下限（秒）
    pub const RETRY_MIN_DELAY_SECS: u64 = 1;
    // 重试延迟上限（秒）
    pub const RETRY_MAX_DELAY_SECS: u64 = 10;
    // 磁盘缓存文件名中使用的哈希字节数
    pub const HASH_BYTES: usize = 8;
    // 磁盘缓存文件扩展名
    pub const CACHE_FILE_SUFFIX: &str = ".txt";
    // URL无法提取文件名时的回退名称
    pub const DEFAULT_BASENAME: &str = "rules";
}

//
// 上游描述符常量
//

// 保留的描述符取值与支持的协议
pub mod descriptors {
    // 直连
    pub const DIRECT: &str = "";
    // 拦截
    pub const BLOCK: &str = "#";
    // SOCKS5协议
    pub const SCHEME_SOCKS5: &str = "socks5";
    // SOCKS5协议（代理端解析域名）
    pub const SCHEME_SOCKS5H: &str = "socks5h";
    // HTTP代理
    pub const SCHEME_HTTP: &str = "http";
    // HTTPS代理
    pub const SCHEME_HTTPS: &str = "https";
    // SOCKS5默认端口
    pub const DEFAULT_SOCKS5_PORT: u16 = 1080;
}

// SOCKS5协议常量（RFC 1928 / RFC 1929）
pub mod socks5 {
    // 协议版本
    pub const VERSION: u8 = 0x05;
    // 无需认证
    pub const AUTH_NONE: u8 = 0x00;
    // 用户名/密码认证
    pub const AUTH_PASSWORD: u8 = 0x02;
    // 无可接受的认证方法
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    // 用户名/密码子协商版本
    pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
    // CONNECT命令
    pub const CMD_CONNECT: u8 = 0x01;
    // IPv4地址类型
    pub const ATYP_IPV4: u8 = 0x01;
    // 域名地址类型
    pub const ATYP_DOMAIN: u8 = 0x03;
    // IPv6地址类型
    pub const ATYP_IPV6: u8 = 0x04;
    // 成功应答
    pub const REPLY_SUCCEEDED: u8 = 0x00;
}

// HTTP代理常量
pub mod http_proxy {
    // CONNECT应答头部的最大长度
    pub const CONNECT_HEADER_MAX: usize = 8192;
    // 逐跳头部，转发前必须剥除
    pub const HOP_BY_HOP_HEADERS: [&str; 7] = [
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
}

//
// 配置文件与存储路径常量
//

// 配置目录定位
pub mod profile {
    // 应用标识，保持与既有安装的配置目录兼容
    pub const APP_ID: &str = "com.rndnm.goproxy";
    // 覆盖配置目录的环境变量
    pub const ENV_PROFILE_PLACE: &str = "PROFILE_PLACE";
    // 配置文件名
    pub const CONFIG_FILE: &str = "config.yaml";
    // 磁盘缓存目录名
    pub const CACHE_DIR: &str = "cache";
    // 目录权限
    pub const DIR_MODE: u32 = 0o700;
}

// 配置默认值
pub mod config_defaults {
    // 默认监听地址
    pub const LISTEN_ADDR: &str = ":8080";
    // 默认代理键
    pub const DEFAULT_PROXY: &str = "direct";
    // 默认日志文件
    pub const LOG_FILE: &str = "gateants.log";
    // 默认单个日志文件大小（MB）
    pub const MAX_LOG_SIZE_MB: u32 = 10;
    // 默认日志文件数量
    pub const MAX_LOG_FILES: u32 = 5;
}

//
// 规则处理常量
//

// 规则解析与命名
pub mod rules {
    // 未命名规则的展示名称
    pub const UNNAMED: &str = "unnamed rule";
    // 默认规则的展示名称
    pub const DEFAULT_NAME: &str = "default";
    // 通配符域名前缀
    pub const WILDCARD_PREFIX: &str = "*.";
    // 行首注释标记
    pub const COMMENT_SLASHES: &str = "//";
    // 行首注释标记
    pub const COMMENT_HASH: char = '#';
}

// 子系统名称
pub mod subsystem_names {
    // 代理服务器子系统
    pub const PROXY_SERVER: &str = "proxy_server";
    // 配置监督子系统
    pub const SUPERVISOR: &str = "supervisor";
}

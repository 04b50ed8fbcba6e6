use crate::error::AppError;
use crate::r#const::{descriptors, external_fetch};
use crate::config::profile;
use crate::router::Router;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use retry_policies::Jitter;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 外部规则来源读取器
///
/// 来源为 http(s) URL 时经HTTP拉取并写入磁盘缓存，拉取失败时静默回退到缓存；
/// 其他来源按文件路径处理，相对路径基于配置文件所在目录。
pub struct ExternalFetcher {
    // 配置文件所在目录，相对路径来源的解析基准
    base_dir: PathBuf,
    // 磁盘缓存目录
    cache_dir: PathBuf,
    // 仅用缓存模式：不发起任何HTTP请求
    cache_only: bool,
    // 拉取自身遵循当前规则集时使用的决策引擎
    router: Option<Arc<Router>>,
}

impl ExternalFetcher {
    // 创建新的来源读取器
    pub fn new(base_dir: PathBuf, cache_dir: PathBuf, cache_only: bool) -> Self {
        Self {
            base_dir,
            cache_dir,
            cache_only,
            router: None,
        }
    }

    // 设置决策引擎，使外部规则拉取遵循当前规则集
    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// 读取一个来源的文本内容
    pub async fn fetch(&self, source: &str) -> Result<String, AppError> {
        if source.starts_with("http://") || source.starts_with("https://") {
            self.fetch_url(source).await
        } else {
            self.fetch_local(source)
        }
    }

    // 经HTTP拉取来源，失败时回退到磁盘缓存
    async fn fetch_url(&self, url: &str) -> Result<String, AppError> {
        let cache_file = self.cache_dir.join(profile::cache_file_name(url));

        // 仅用缓存模式下不访问网络
        if self.cache_only {
            return self.read_cache(&cache_file).ok_or_else(|| {
                AppError::ExternalSource(format!("cached file not found for {}", url))
            });
        }

        // 来源URL本身也要经过规则集决策
        let proxy = match self.proxy_descriptor_for(url).await {
            Ok(proxy) => proxy,
            Err(e) => {
                if let Some(content) = self.read_cache(&cache_file) {
                    warn!(
                        "Failed to resolve proxy for {}: {}, using cached file",
                        url, e
                    );
                    return Ok(content);
                }
                return Err(e);
            }
        };

        match self.download(url, proxy.as_deref()).await {
            Ok(body) => {
                if let Err(e) = fs::write(&cache_file, &body) {
                    warn!("Failed to write cache file {:?}: {}", cache_file, e);
                }
                Ok(body)
            }
            Err(e) => {
                if let Some(content) = self.read_cache(&cache_file) {
                    warn!("Failed to download {}: {}, using cached file", url, e);
                    Ok(content)
                } else {
                    Err(e)
                }
            }
        }
    }

    // 按文件路径读取来源
    fn fetch_local(&self, source: &str) -> Result<String, AppError> {
        let path = Path::new(source);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };

        if !path.exists() {
            return Err(AppError::ExternalSource(format!(
                "local file not found: {:?}",
                path
            )));
        }

        fs::read_to_string(&path).map_err(AppError::Io)
    }

    // 读取磁盘缓存内容
    fn read_cache(&self, cache_file: &Path) -> Option<String> {
        match fs::read_to_string(cache_file) {
            Ok(content) => {
                debug!("Using cached rules from {:?}", cache_file);
                Some(content)
            }
            Err(_) => None,
        }
    }

    // 由当前规则集决定拉取来源时使用的上游描述符
    async fn proxy_descriptor_for(&self, url: &str) -> Result<Option<String>, AppError> {
        let router = match &self.router {
            Some(router) => router,
            None => return Ok(None),
        };

        let (descriptor, decision) = router.proxy_for_url(url).await?;

        if descriptor == descriptors::BLOCK {
            return Err(AppError::Blocked);
        }

        if descriptor.is_empty() {
            debug!(
                "Fetching {} directly (rule: '{}')",
                url, decision.rule_name
            );
            Ok(None)
        } else {
            debug!(
                "Fetching {} via proxy {} (rule: '{}')",
                url, decision.proxy, decision.rule_name
            );
            Ok(Some(descriptor))
        }
    }

    // 发起带重试的HTTP GET请求
    async fn download(&self, url: &str, proxy: Option<&str>) -> Result<String, AppError> {
        let client = build_http_client(proxy)?;

        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::ExternalSource(format!(
                "failed to download {}: status {}",
                url,
                response.status()
            )));
        }

        Ok(response.text().await?)
    }
}

// 创建带指数退避重试的HTTP客户端
fn build_http_client(proxy: Option<&str>) -> Result<ClientWithMiddleware, AppError> {
    let mut client_builder = reqwest::ClientBuilder::new()
        .timeout(Duration::from_secs(external_fetch::TIMEOUT_SECS));

    if let Some(proxy_url) = proxy {
        client_builder = client_builder.proxy(reqwest::Proxy::all(proxy_url).map_err(|e| {
            AppError::InvalidUpstream(proxy_url.to_string(), e.to_string())
        })?);
    }

    let client = client_builder.build().map_err(AppError::Http)?;

    // 指数退避的基数必须大于1，否则退避时间不会增长
    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(
            Duration::from_secs(external_fetch::RETRY_MIN_DELAY_SECS),
            Duration::from_secs(external_fetch::RETRY_MAX_DELAY_SECS),
        )
        .base(2)
        .jitter(Jitter::Bounded)
        .build_with_max_retries(external_fetch::RETRY_ATTEMPTS);

    Ok(ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

use std::io;
use thiserror::Error;

// Unified error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP middleware error: {0}")]
    HttpMiddleware(String),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("DNS resolution error: {0}")]
    Dns(String),

    #[error("Connection blocked by proxy configuration")]
    Blocked,

    #[error("Proxy key '{0}' not found in proxies map")]
    UnknownProxyKey(String),

    #[error("Invalid proxy URL '{0}': {1}")]
    InvalidUpstream(String, String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("External rule source error: {0}")]
    ExternalSource(String),

    #[error("Invalid shutdown timeout, must be between 1 and 120 seconds")]
    InvalidShutdownTimeout,
}

impl From<reqwest_middleware::Error> for AppError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => Self::Http(e),
            _ => Self::HttpMiddleware(err.to_string()),
        }
    }
}

// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    Load(#[from] io::Error),

    #[error("YAML parsing error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Failed to write default configuration: {0}")]
    WriteDefault(String),

    #[error("Invalid server listen address: {0}")]
    InvalidListenAddress(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid IP or CIDR: {0}")]
    InvalidCidr(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

use crate::error::AppError;
use crate::r#const::{descriptors, http_proxy, socks5};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use percent_encoding::percent_decode_str;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

// 上游认证凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAuth {
    pub username: String,
    pub password: String,
}

// 上游处置
//
// 由上游描述符解析而来：空串为直连，"#" 为拦截，其余按scheme区分
// SOCKS5与HTTP CONNECT两种隧道。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    // 直连目标
    Direct,
    // 拦截请求
    Block,
    // 经SOCKS5代理建立隧道
    Socks5 {
        addr: String,
        auth: Option<UpstreamAuth>,
    },
    // 经HTTP代理CONNECT建立隧道
    HttpConnect {
        addr: String,
        auth: Option<UpstreamAuth>,
    },
}

impl Upstream {
    // 解析上游描述符
    pub fn from_descriptor(descriptor: &str) -> Result<Self, AppError> {
        match descriptor {
            descriptors::DIRECT => Ok(Self::Direct),
            descriptors::BLOCK => Ok(Self::Block),
            _ => {
                let url = Url::parse(descriptor).map_err(|e| {
                    AppError::InvalidUpstream(descriptor.to_string(), e.to_string())
                })?;

                let host = url.host_str().ok_or_else(|| {
                    AppError::InvalidUpstream(descriptor.to_string(), "missing host".to_string())
                })?;
                let auth = parse_auth(&url);

                match url.scheme() {
                    descriptors::SCHEME_SOCKS5 | descriptors::SCHEME_SOCKS5H => {
                        let port = url.port().unwrap_or(descriptors::DEFAULT_SOCKS5_PORT);
                        Ok(Self::Socks5 {
                            addr: format!("{}:{}", host, port),
                            auth,
                        })
                    }
                    descriptors::SCHEME_HTTP | descriptors::SCHEME_HTTPS => {
                        let port = url.port_or_known_default().unwrap_or(80);
                        Ok(Self::HttpConnect {
                            addr: format!("{}:{}", host, port),
                            auth,
                        })
                    }
                    other => Err(AppError::UnsupportedScheme(other.to_string())),
                }
            }
        }
    }

    // 建立到目标 host:port 的字节流，绝不重试
    pub async fn connect(&self, target: &str) -> Result<TcpStream, AppError> {
        match self {
            Self::Direct => TcpStream::connect(target).await.map_err(|e| {
                AppError::Upstream(format!("failed to connect to {}: {}", target, e))
            }),
            Self::Block => Err(AppError::Blocked),
            Self::Socks5 { addr, auth } => socks5_connect(addr, auth.as_ref(), target).await,
            Self::HttpConnect { addr, auth } => http_connect(addr, auth.as_ref(), target).await,
        }
    }
}

// 从URL的userinfo解析认证凭据
fn parse_auth(url: &Url) -> Option<UpstreamAuth> {
    if url.username().is_empty() && url.password().is_none() {
        return None;
    }

    let username = percent_decode_str(url.username())
        .decode_utf8_lossy()
        .to_string();
    let password = percent_decode_str(url.password().unwrap_or_default())
        .decode_utf8_lossy()
        .to_string();

    Some(UpstreamAuth { username, password })
}

// 将 host:port 目标拆分为主机与端口，IPv6字面量去掉方括号
fn split_target(target: &str) -> Result<(&str, u16), AppError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| AppError::Upstream(format!("invalid target address: {}", target)))?;

    let port: u16 = port
        .parse()
        .map_err(|_| AppError::Upstream(format!("invalid target port in {}", target)))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok((host, port))
}

// 经SOCKS5代理建立到目标的隧道（RFC 1928）
async fn socks5_connect(
    proxy_addr: &str,
    auth: Option<&UpstreamAuth>,
    target: &str,
) -> Result<TcpStream, AppError> {
    let mut stream = TcpStream::connect(proxy_addr).await.map_err(|e| {
        AppError::Socks5(format!("failed to connect to {}: {}", proxy_addr, e))
    })?;

    // 方法协商
    let methods: &[u8] = if auth.is_some() {
        &[socks5::VERSION, 2, socks5::AUTH_NONE, socks5::AUTH_PASSWORD]
    } else {
        &[socks5::VERSION, 1, socks5::AUTH_NONE]
    };
    stream
        .write_all(methods)
        .await
        .map_err(|e| AppError::Socks5(format!("write methods failed: {}", e)))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| AppError::Socks5(format!("read method response failed: {}", e)))?;

    if response[0] != socks5::VERSION {
        return Err(AppError::Socks5(format!(
            "invalid version: {:#04x}",
            response[0]
        )));
    }

    match response[1] {
        socks5::AUTH_NONE => {}
        socks5::AUTH_PASSWORD => socks5_authenticate(&mut stream, auth).await?,
        socks5::AUTH_NO_ACCEPTABLE => {
            return Err(AppError::Socks5(
                "no acceptable authentication method".to_string(),
            ))
        }
        other => {
            return Err(AppError::Socks5(format!(
                "unsupported auth method: {:#04x}",
                other
            )))
        }
    }

    // CONNECT请求：VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let (host, port) = split_target(target)?;
    let mut request = Vec::with_capacity(7 + host.len());
    request.push(socks5::VERSION);
    request.push(socks5::CMD_CONNECT);
    request.push(0x00);

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(socks5::ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(socks5::ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(AppError::Socks5("target host too long (max 255)".to_string()));
            }
            request.push(socks5::ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| AppError::Socks5(format!("write connect request failed: {}", e)))?;

    // 应答：VER | REP | RSV | ATYP，其后为绑定地址
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| AppError::Socks5(format!("read reply header failed: {}", e)))?;

    if header[0] != socks5::VERSION {
        return Err(AppError::Socks5(format!(
            "invalid version in reply: {:#04x}",
            header[0]
        )));
    }
    if header[1] != socks5::REPLY_SUCCEEDED {
        return Err(AppError::Socks5(format!(
            "connect to {} failed with reply code {:#04x}",
            target, header[1]
        )));
    }

    // 读取并丢弃绑定地址
    let addr_len = match header[3] {
        socks5::ATYP_IPV4 => 4,
        socks5::ATYP_IPV6 => 16,
        socks5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| AppError::Socks5(format!("read domain length failed: {}", e)))?;
            len[0] as usize
        }
        other => {
            return Err(AppError::Socks5(format!(
                "address type not supported: {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| AppError::Socks5(format!("read bound address failed: {}", e)))?;

    debug!("SOCKS5 tunnel to {} established via {}", target, proxy_addr);
    Ok(stream)
}

// 用户名/密码子协商（RFC 1929）
async fn socks5_authenticate(
    stream: &mut TcpStream,
    auth: Option<&UpstreamAuth>,
) -> Result<(), AppError> {
    let auth = auth.ok_or_else(|| {
        AppError::Socks5("server requires authentication but no credentials configured".to_string())
    })?;

    if auth.username.len() > 255 {
        return Err(AppError::Socks5("username too long (max 255)".to_string()));
    }
    if auth.password.len() > 255 {
        return Err(AppError::Socks5("password too long (max 255)".to_string()));
    }

    // VER | ULEN | USERNAME | PLEN | PASSWORD
    let mut request = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
    request.push(socks5::AUTH_PASSWORD_VERSION);
    request.push(auth.username.len() as u8);
    request.extend_from_slice(auth.username.as_bytes());
    request.push(auth.password.len() as u8);
    request.extend_from_slice(auth.password.as_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| AppError::Socks5(format!("write auth request failed: {}", e)))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| AppError::Socks5(format!("read auth response failed: {}", e)))?;

    if response[0] != socks5::AUTH_PASSWORD_VERSION {
        return Err(AppError::Socks5(format!(
            "invalid auth version: {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(AppError::Socks5("authentication failed".to_string()));
    }

    Ok(())
}

// 经HTTP代理CONNECT建立到目标的隧道
async fn http_connect(
    proxy_addr: &str,
    auth: Option<&UpstreamAuth>,
    target: &str,
) -> Result<TcpStream, AppError> {
    let mut stream = TcpStream::connect(proxy_addr).await.map_err(|e| {
        AppError::Upstream(format!(
            "failed to connect to HTTP proxy {}: {}",
            proxy_addr, e
        ))
    })?;

    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = auth {
        let credentials = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| AppError::Upstream(format!("error sending CONNECT request: {}", e)))?;

    // 逐字节读取应答头，避免把隧道数据读进本地缓冲
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= http_proxy::CONNECT_HEADER_MAX {
            return Err(AppError::Upstream(
                "proxy CONNECT response header too large".to_string(),
            ));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| AppError::Upstream(format!("error reading proxy response: {}", e)))?;
        if n == 0 {
            return Err(AppError::Upstream(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        header.push(byte[0]);
    }

    // 状态行形如 HTTP/1.1 200 Connection established
    let header_text = String::from_utf8_lossy(&header);
    let status_line = header_text.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(AppError::Upstream(format!(
            "proxy CONNECT failed with status: {}",
            status_line.trim()
        )));
    }

    debug!(
        "HTTP CONNECT tunnel to {} established via {}",
        target, proxy_addr
    );
    Ok(stream)
}

use crate::r#const::{descriptors, http_proxy};
use crate::router::{strip_port, Router};
use crate::upstream::Upstream;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, error, info};

// 代理响应体类型
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

// 请求分发器
//
// 实现正向代理端点：普通HTTP请求改写为绝对形式后经上游字节流转发，
// CONNECT请求先建立上游隧道、应答200后接管客户端套接字做双向拷贝。
// 处理过程先快照规则集再做I/O，不跨I/O持有任何锁。
pub struct ProxyHandler {
    router: Arc<Router>,
}

impl ProxyHandler {
    // 创建请求分发器
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    // 处理一个入站代理请求
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        debug!("{} {}", req.method(), req.uri());

        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_http(req).await
        }
    }

    // CONNECT路径：隧道式转发，不做TLS解密
    async fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let target = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                error!("CONNECT request without authority form target: {}", req.uri());
                return text_response(StatusCode::BAD_REQUEST, "Bad CONNECT target");
            }
        };
        let host = req.uri().host().unwrap_or_default().to_string();

        let ruleset = self.router.ruleset();
        let decision = self.router.decide_on(&ruleset, &host, &target).await;

        let descriptor = match ruleset.proxy_descriptor(&decision.proxy) {
            Some(descriptor) => descriptor,
            None => {
                error!("Proxy key '{}' not found in proxies map", decision.proxy);
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Proxy configuration error",
                );
            }
        };

        if descriptor == descriptors::BLOCK {
            info!(
                "Blocking HTTPS CONNECT request to {} (rule: '{}', proxy: '{}')",
                target, decision.rule_name, decision.proxy
            );
            return text_response(
                StatusCode::FORBIDDEN,
                "Request blocked by proxy configuration",
            );
        }

        if descriptor == descriptors::DIRECT {
            info!(
                "Direct HTTPS CONNECT to {} (rule: '{}', proxy: '{}')",
                target, decision.rule_name, decision.proxy
            );
        } else {
            info!(
                "HTTPS CONNECT to {} via proxy {} (rule: '{}')",
                target, decision.proxy, decision.rule_name
            );
        }

        let upstream = match Upstream::from_descriptor(descriptor) {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("Invalid upstream for proxy key '{}': {}", decision.proxy, e);
                return text_response(StatusCode::BAD_GATEWAY, "Upstream configuration error");
            }
        };

        // 先拿到上游连接，失败时还能给客户端一个502
        let mut upstream_stream = match upstream.connect(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "Failed to reach {} via proxy '{}': {}",
                    target, decision.proxy, e
                );
                return text_response(StatusCode::BAD_GATEWAY, "Failed to reach target");
            }
        };

        // 应答200后客户端套接字升级为裸隧道
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream_stream).await {
                        Ok((up, down)) => debug!(
                            "Tunnel to {} closed ({} bytes up, {} bytes down)",
                            target, up, down
                        ),
                        Err(e) => debug!("Tunnel to {} closed with error: {}", target, e),
                    }
                }
                Err(e) => error!("Client connection upgrade failed: {}", e),
            }
        });

        empty_response(StatusCode::OK)
    }

    // 普通HTTP路径：头部清理后经上游字节流按origin-form转发
    async fn handle_http(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        // 目标改写为绝对形式
        let (full_url, authority, dial_target) = match absolute_target(&req) {
            Some(parts) => parts,
            None => {
                error!("Request without absolute target or Host header: {}", req.uri());
                return text_response(StatusCode::BAD_REQUEST, "Bad request target");
            }
        };
        let host = strip_port(&authority).to_string();

        let ruleset = self.router.ruleset();
        let decision = self.router.decide_on(&ruleset, &host, &full_url).await;

        let descriptor = match ruleset.proxy_descriptor(&decision.proxy) {
            Some(descriptor) => descriptor,
            None => {
                error!("Proxy key '{}' not found in proxies map", decision.proxy);
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Proxy configuration error",
                );
            }
        };

        if descriptor == descriptors::BLOCK {
            info!(
                "Blocking request request to {} (rule: '{}', proxy: '{}')",
                authority, decision.rule_name, decision.proxy
            );
            return text_response(
                StatusCode::FORBIDDEN,
                "Request blocked by proxy configuration",
            );
        }

        if descriptor == descriptors::DIRECT {
            info!(
                "Direct request to {} (rule: '{}', proxy: '{}')",
                authority, decision.rule_name, decision.proxy
            );
        } else {
            info!(
                "Request to {} via proxy {} (rule: '{}')",
                authority, decision.proxy, decision.rule_name
            );
        }

        let upstream = match Upstream::from_descriptor(descriptor) {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("Invalid upstream for proxy key '{}': {}", decision.proxy, e);
                return text_response(StatusCode::BAD_GATEWAY, "Upstream configuration error");
            }
        };

        let stream = match upstream.connect(&dial_target).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "Failed to reach {} via proxy '{}': {}",
                    dial_target, decision.proxy, e
                );
                return text_response(StatusCode::BAD_GATEWAY, "Failed to reach target");
            }
        };

        self.forward_request(req, stream, &authority).await
    }

    // 在已建立的上游字节流上发出请求并原样回传响应
    async fn forward_request(
        &self,
        req: Request<Incoming>,
        stream: tokio::net::TcpStream,
        authority: &str,
    ) -> Response<ProxyBody> {
        let io = TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Upstream handshake with {} failed: {}", authority, e);
                return text_response(StatusCode::BAD_GATEWAY, "Failed to reach target");
            }
        };

        // 连接驱动任务随响应体结束而退出
        let conn_authority = authority.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection to {} closed: {}", conn_authority, e);
            }
        });

        let (mut parts, body) = req.into_parts();

        // 源站侧使用origin-form目标
        let origin_form = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        parts.uri = match origin_form.parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!("Failed to rewrite request target {}: {}", origin_form, e);
                return text_response(StatusCode::BAD_REQUEST, "Bad request target");
            }
        };

        strip_hop_by_hop_headers(&mut parts.headers);
        if !parts.headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(authority) {
                parts.headers.insert(HOST, value);
            }
        }

        let outbound = Request::from_parts(parts, body);

        match sender.send_request(outbound).await {
            Ok(response) => response.map(|body| body.boxed()),
            Err(e) => {
                error!("Failed to forward request to {}: {}", authority, e);
                text_response(StatusCode::BAD_GATEWAY, "Failed to forward request")
            }
        }
    }
}

// 从请求推导 (绝对URL, authority, 拨号目标host:port)
// 绝对形式直接采用，origin-form用Host头补全并推断scheme
fn absolute_target(req: &Request<Incoming>) -> Option<(String, String, String)> {
    let uri = req.uri();

    let (scheme, authority) = match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => (scheme.to_string(), authority.to_string()),
        _ => {
            let host = req.headers().get(HOST)?.to_str().ok()?.to_string();
            ("http".to_string(), host)
        }
    };

    let full_url = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}://{}{}", scheme, authority, path)
    };

    let dial_target = if authority_has_port(&authority) {
        authority.clone()
    } else {
        let default_port = if scheme == "https" { 443 } else { 80 };
        format!("{}:{}", authority, default_port)
    };

    Some((full_url, authority, dial_target))
}

// authority是否已带端口
fn authority_has_port(authority: &str) -> bool {
    if let Some(rest) = authority.strip_prefix('[') {
        // IPv6字面量：端口在闭括号之后
        return rest.find(']').map(|i| rest[i + 1..].starts_with(':')).unwrap_or(false);
    }
    match authority.rsplit_once(':') {
        Some((h, port)) => !h.contains(':') && port.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

// 剥除逐跳头部
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in http_proxy::HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

// 带文本body的状态响应
fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

// 空body的状态响应
fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

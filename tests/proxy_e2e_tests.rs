use gateants::cache::MatchType;
use gateants::config::LogLevel;
use gateants::router::Router;
use gateants::ruleset::{CompiledRule, Ruleset};
use gateants::{ProxyHandler, ProxyServer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_graceful_shutdown::{IntoSubsystem, SubsystemBuilder, Toplevel};

// 辅助函数：构造测试规则集
fn make_ruleset(rules: Vec<CompiledRule>, proxies: Vec<(&str, String)>) -> Ruleset {
    let mut proxy_map = BTreeMap::new();
    proxy_map.insert("direct".to_string(), String::new());
    proxy_map.insert("block".to_string(), "#".to_string());
    for (key, descriptor) in proxies {
        proxy_map.insert(key.to_string(), descriptor);
    }

    Ruleset {
        default_proxy: "direct".to_string(),
        proxies: proxy_map,
        listen_addr: ":0".to_string(),
        log_level: LogLevel::Info,
        auto_reload_hours: 0,
        rules,
    }
}

fn host_rule(name: &str, proxy: &str, hosts: &[&str]) -> CompiledRule {
    CompiledRule {
        name: name.to_string(),
        proxy: proxy.to_string(),
        hosts: hosts.iter().map(|s| s.to_string()).collect(),
        ..CompiledRule::default()
    }
}

// 辅助函数：启动代理并返回其监听地址
async fn spawn_proxy(ruleset: Ruleset) -> SocketAddr {
    let router = Arc::new(Router::new(ruleset));
    let handler = Arc::new(ProxyHandler::new(router));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(ProxyServer::serve_connection(stream, handler.clone()));
        }
    });

    addr
}

// 辅助函数：启动一次性HTTP源站，返回地址与收到的请求头
async fn spawn_origin(body: &'static str) -> (SocketAddr, tokio::sync::oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (head_tx, head_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = socket.read(&mut byte).await.unwrap();
            if n == 0 {
                break;
            }
            head.push(byte[0]);
        }
        let _ = head_tx.send(String::from_utf8_lossy(&head).to_string());

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    });

    (addr, head_rx)
}

// 辅助函数：读取到连接关闭
async fn read_to_end(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

// 辅助函数：读取响应头
async fn read_header(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

#[tokio::test]
async fn test_plain_request_direct_to_origin() {
    let (origin_addr, origin_head) = spawn_origin("origin-ok").await;
    let proxy_addr = spawn_proxy(make_ruleset(vec![], vec![])).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic Zm9v\r\nConnection: close\r\n\r\n",
        addr = origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.ends_with("origin-ok"));

    // 源站收到origin-form目标，逐跳头已剥除
    let head = origin_head.await.unwrap().to_lowercase();
    assert!(head.starts_with("get / http/1.1"));
    assert!(!head.contains("proxy-connection"));
    assert!(!head.contains("proxy-authorization"));
    assert!(head.contains(&format!("host: {}", origin_addr)));
}

#[tokio::test]
async fn test_plain_request_blocked() {
    let proxy_addr = spawn_proxy(make_ruleset(
        vec![host_rule("bad", "block", &["blocked.example"])],
        vec![],
    ))
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "got: {}", response);
}

#[tokio::test]
async fn test_connect_blocked_no_outbound() {
    let proxy_addr = spawn_proxy(make_ruleset(
        vec![host_rule(
            "bad",
            "block",
            &["*.malicious.com", "malicious.com"],
        )],
        vec![],
    ))
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"CONNECT evil.malicious.com:443 HTTP/1.1\r\nHost: evil.malicious.com:443\r\n\r\n",
        )
        .await
        .unwrap();

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "got: {}", response);
}

#[tokio::test]
async fn test_connect_direct_tunnel() {
    // 回显源站
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        socket.write_all(b"pong").await.unwrap();
    });

    let proxy_addr = spawn_proxy(make_ruleset(vec![], vec![])).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n",
        addr = origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_header(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);

    // 隧道双向传输
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");
}

#[tokio::test]
async fn test_connect_via_socks5_upstream() {
    // 脚本化SOCKS5上游：握手成功后直接回显隧道数据
    let socks = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socks_addr = socks.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = socks.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        socket.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        socket.write_all(&[0x05, 0x00]).await.unwrap();

        // CONNECT目标是IPv4字面量
        let mut request = [0u8; 10];
        socket.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);

        socket
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut payload = [0u8; 5];
        socket.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");
        socket.write_all(b"world").await.unwrap();
    });

    let proxy_addr = spawn_proxy(make_ruleset(
        vec![host_rule("s5-net", "s5", &["127.0.0.1"])],
        vec![("s5", format!("socks5://{}", socks_addr))],
    ))
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT 127.0.0.1:9443 HTTP/1.1\r\nHost: 127.0.0.1:9443\r\n\r\n")
        .await
        .unwrap();

    let head = read_header(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);

    client.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"world");
}

#[tokio::test]
async fn test_unknown_proxy_key_returns_500() {
    let proxy_addr = spawn_proxy(make_ruleset(
        vec![host_rule("dangling", "ghost", &["x.example"])],
        vec![],
    ))
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET http://x.example/ HTTP/1.1\r\nHost: x.example\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 500"), "got: {}", response);
}

#[tokio::test]
async fn test_connect_upstream_dial_failure_returns_502() {
    // 上游SOCKS5不可达
    let proxy_addr = spawn_proxy(make_ruleset(
        vec![host_rule("s5-net", "s5", &["unreachable.example"])],
        vec![("s5", "socks5://127.0.0.1:1".to_string())],
    ))
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"CONNECT unreachable.example:443 HTTP/1.1\r\nHost: unreachable.example:443\r\n\r\n",
        )
        .await
        .unwrap();

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
}

#[tokio::test]
async fn test_decision_swap_changes_served_disposition() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = origin.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            });
        }
    });

    let host = origin_addr.ip().to_string();
    let router = Arc::new(Router::new(make_ruleset(
        vec![host_rule("x", "direct", &[&host])],
        vec![],
    )));
    let handler = Arc::new(ProxyHandler::new(router.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(ProxyServer::serve_connection(stream, handler.clone()));
        }
    });

    // 第一次请求直连成功
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n",
        addr = origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // 规则集切换为拦截，相同URL的下一次请求必须得到403
    router.replace_ruleset(make_ruleset(
        vec![host_rule("x", "block", &[&host])],
        vec![],
    ));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n",
        addr = origin_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "got: {}", response);
}

// 辅助函数：占用一个空闲端口后立即释放
async fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// 辅助函数：在限定时间内等待地址可连接
async fn wait_connectable(addr: SocketAddr) -> bool {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_listener_rebinds_on_addr_change() {
    let addr_a = free_port().await;
    let addr_b = free_port().await;

    let router = Arc::new(Router::new(make_ruleset(vec![], vec![])));
    let handler = Arc::new(ProxyHandler::new(router));
    let (addr_tx, addr_rx) = watch::channel(addr_a.to_string());

    let server = ProxyServer::new(handler, addr_rx);
    let toplevel = tokio::spawn(async move {
        let _ = Toplevel::new(|s| async move {
            s.start(SubsystemBuilder::new("proxy_server", move |s| {
                server.run(s)
            }));
        })
        .handle_shutdown_requests(Duration::from_millis(500))
        .await;
    });

    // 初始地址可服务
    assert!(wait_connectable(addr_a).await);

    // 下发新的监听地址
    addr_tx.send(addr_b.to_string()).unwrap();

    // 新地址开始服务，旧地址不再接受新连接
    assert!(wait_connectable(addr_b).await);
    assert!(TcpStream::connect(addr_a).await.is_err());

    toplevel.abort();
}

#[tokio::test]
async fn test_decision_match_types_via_router() {
    // URL命中与IP命中进入对应缓存类别
    let router = Router::new(make_ruleset(
        vec![
            CompiledRule {
                name: "by-url".to_string(),
                proxy: "direct".to_string(),
                urls: vec!["http://match.example/*".to_string()],
                ..CompiledRule::default()
            },
            CompiledRule {
                name: "by-ip".to_string(),
                proxy: "block".to_string(),
                ips: vec!["192.0.2.0/24".to_string()],
                ..CompiledRule::default()
            },
        ],
        vec![],
    ));

    let url_hit = router
        .decide("match.example", "http://match.example/path")
        .await;
    assert_eq!(url_hit.match_type, MatchType::Url);

    let ip_hit = router.decide("192.0.2.7", "http://192.0.2.7/").await;
    assert_eq!(ip_hit.match_type, MatchType::Ip);
}

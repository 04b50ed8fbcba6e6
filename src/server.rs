use crate::config::resolve_listen_addr;
use crate::error::AppError;
use crate::handler::ProxyHandler;
use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_graceful_shutdown::{IntoSubsystem, SubsystemHandle};
use tracing::{debug, error, info, warn};

// 代理服务器
//
// 在监听地址上接收入站连接，每个连接由独立任务服务。
// 监督者经watch通道下发当前监听地址，地址变化时重建监听器，
// 在途连接在各自任务上自然完成。
pub struct ProxyServer {
    // 请求分发器
    handler: Arc<ProxyHandler>,
    // 当前监听地址
    addr_rx: watch::Receiver<String>,
}

impl ProxyServer {
    // 创建代理服务器
    pub fn new(handler: Arc<ProxyHandler>, addr_rx: watch::Receiver<String>) -> Self {
        Self { handler, addr_rx }
    }

    // 服务单个入站连接，CONNECT经由升级机制接管套接字
    pub async fn serve_connection(stream: TcpStream, handler: Arc<ProxyHandler>) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!("Connection error: {}", e);
        }
    }
}

#[async_trait]
impl IntoSubsystem<AppError> for ProxyServer {
    async fn run(mut self, subsys: SubsystemHandle) -> Result<(), AppError> {
        let mut current_addr = self.addr_rx.borrow().clone();

        // 启动期绑定失败是致命错误
        let mut listener = TcpListener::bind(resolve_listen_addr(&current_addr)?).await?;
        info!("Proxy server listening on {}", current_addr);

        let mut addr_channel_open = true;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let handler = self.handler.clone();
                        tokio::spawn(Self::serve_connection(stream, handler));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                changed = self.addr_rx.changed(), if addr_channel_open => {
                    if changed.is_err() {
                        // 发送端关闭，不再有地址变更
                        addr_channel_open = false;
                        continue;
                    }

                    let new_addr = self.addr_rx.borrow_and_update().clone();
                    if new_addr == current_addr {
                        continue;
                    }

                    match rebind(&new_addr).await {
                        Ok(new_listener) => {
                            info!(
                                "Listen address changed from '{}' to '{}', restarting listener",
                                current_addr, new_addr
                            );
                            listener = new_listener;
                            current_addr = new_addr;
                        }
                        // 绑定失败保留旧监听器，等待下一次重载
                        Err(e) => error!(
                            "Failed to bind new listen address '{}': {}, keeping '{}'",
                            new_addr, e, current_addr
                        ),
                    }
                },
                _ = subsys.on_shutdown_requested() => {
                    info!("Proxy server received shutdown request");
                    break;
                }
            }
        }

        Ok(())
    }
}

// 解析并绑定新的监听地址
async fn rebind(addr: &str) -> Result<TcpListener, AppError> {
    let socket_addr = resolve_listen_addr(addr)?;
    Ok(TcpListener::bind(socket_addr).await?)
}

//! HTTP listener and graceful shutdown.
//!
//! Each accepted connection is served on its own task. On shutdown the
//! listener stops accepting and waits for in-flight connections to finish.

use crate::service::MockService;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// The mock responder's HTTP server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(listener)
    }

    /// Serve on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until a SIGINT or SIGTERM arrives.
    pub async fn serve(self, service: Arc<MockService>) -> std::io::Result<()> {
        self.serve_with_shutdown(service, shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight connections.
    pub async fn serve_with_shutdown<F>(
        self,
        service: Arc<MockService>,
        shutdown: F,
    ) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_port = self.local_addr.port();
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        info!(addr = %self.local_addr, "Mock responder listening");

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "Shutdown signal received, draining connections");
                    break;
                }

                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            continue;
                        }
                    };

                    let service = Arc::clone(&service);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let service = Arc::clone(&service);
                            async move {
                                Ok::<_, Infallible>(service.handle(req, local_port).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("Mock responder stopped");
        Ok(())
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}

//! Pull-based HTTP exporter for the metric table.
//!
//! Serves [`Metrics::render`] at a configurable path over HTTP/1. The
//! exporter runs on its own OS thread with a private current-thread tokio
//! runtime, so filesystem dispatch never waits on a scrape and a stalled
//! scraper never holds up a filesystem call.

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;

/// Content type of the Prometheus text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Default exporter port.
pub const DEFAULT_PORT: u16 = 9100;

/// Errors raised while starting the exporter.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// The listen socket could not be bound.
    #[error("Failed to bind metrics endpoint on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The exporter runtime or thread could not be created.
    #[error("Failed to start metrics exporter: {0}")]
    Runtime(#[source] io::Error),
}

/// Configuration for the metrics endpoint.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Bind address.
    pub bind_address: IpAddr,
    /// Port to bind to (0 = auto-assign).
    pub port: u16,
    /// Request path serving the metrics.
    pub path: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            path: "/metrics".to_string(),
        }
    }
}

impl ExporterConfig {
    /// Listen on `port` on all interfaces.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Sets the bind address.
    #[must_use]
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Sets the request path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Socket address to bind.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// A running metrics HTTP server inside an existing tokio runtime.
pub struct MetricsServer {
    /// The actual bound address.
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MetricsServer {
    /// Bind the listener and start serving on the current runtime.
    pub async fn start(
        metrics: Arc<Metrics>,
        config: &ExporterConfig,
    ) -> Result<Self, ExporterError> {
        let requested = config.socket_addr();
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| ExporterError::Bind {
                addr: requested,
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ExporterError::Bind {
                addr: requested,
                source,
            })?;

        info!(addr = %addr, path = %config.path, "Starting metrics exporter");

        let path: Arc<str> = Arc::from(config.path.as_str());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            tokio::select! {
                () = run_server(listener, metrics, path) => {
                    debug!("Metrics accept loop ended");
                }
                _ = shutdown_rx => {
                    debug!("Metrics exporter received shutdown signal");
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Base URL of this server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the server and wait for the accept loop to end.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        info!("Metrics exporter stopped");
    }

    fn stop_sync(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

/// Run the accept loop until the listener fails permanently.
async fn run_server(listener: TcpListener, metrics: Arc<Metrics>, path: Arc<str>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let metrics = Arc::clone(&metrics);
                let path = Arc::clone(&path);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let resp = respond(&req, &metrics, &path);
                        async move { Ok::<_, Infallible>(resp) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        warn!(peer = %peer_addr, error = %e, "Metrics connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept metrics connection");
            }
        }
    }
}

fn respond(req: &Request<Incoming>, metrics: &Metrics, path: &str) -> Response<Full<Bytes>> {
    if req.uri().path() != path {
        return plain(StatusCode::NOT_FOUND, "not found\n".to_string());
    }
    if req.method() != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n".to_string());
    }
    plain(StatusCode::OK, metrics.render())
}

fn plain(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
    resp
}

/// Handle to an exporter running on its own thread.
///
/// Dropping the handle shuts the exporter down.
#[derive(Debug)]
pub struct ExporterHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ExporterHandle {
    /// Address the exporter is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the exporter and join its thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Metrics exporter thread panicked");
        }
    }
}

impl Drop for ExporterHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Start the exporter on a dedicated thread.
///
/// Returns once the listener is bound. A bind failure is logged and
/// returned; the caller is expected to carry on without the exporter.
pub fn spawn_exporter(
    metrics: Arc<Metrics>,
    config: ExporterConfig,
) -> Result<ExporterHandle, ExporterError> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<SocketAddr, ExporterError>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let thread = thread::Builder::new()
        .name("iofs-metrics".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "Failed to create metrics exporter runtime");
                    let _ = ready_tx.send(Err(ExporterError::Runtime(e)));
                    return;
                }
            };

            runtime.block_on(async move {
                match MetricsServer::start(metrics, &config).await {
                    Ok(server) => {
                        let _ = ready_tx.send(Ok(server.addr));
                        let _ = shutdown_rx.await;
                        server.stop().await;
                    }
                    Err(e) => {
                        error!(error = %e, "Metrics exporter disabled");
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });
        })
        .map_err(ExporterError::Runtime)?;

    let ready = ready_rx.recv().unwrap_or_else(|_| {
        Err(ExporterError::Runtime(io::Error::other(
            "metrics exporter thread exited before binding",
        )))
    });

    match ready {
        Ok(addr) => Ok(ExporterHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        }),
        Err(e) => {
            let _ = thread.join();
            Err(e)
        }
    }
}

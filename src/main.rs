//! capgate - protocol-translation gateway in front of a capability-routed
//! compute backend.
//!
//! Listens for public-dialect requests (OpenAI-style chat, images,
//! embeddings; Cohere-style rerank; video jobs) and forwards each one to the
//! backend tagged with the capability it needs.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use capgate::config::GatewayConfig;
use capgate::error::GatewayError;
use capgate::gateway_service::{GatewayService, error_response};
use capgate::logging_layer::logging_layer;
use clap::Parser;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;
use tracing::{debug, error, info, warn};

/// Grace period for in-flight connections once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command line overrides. Everything else comes from the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address, `host:port` or `:port` (overrides PROXY_ADDR)
    #[arg(short, long)]
    listen: Option<String>,

    /// Base URL of the backend (overrides GATEWAY_URL)
    #[arg(long)]
    backend_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard flushes buffered log lines on exit, so it lives as long as main
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env();
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(backend_url) = cli.backend_url {
        config.backend_url = backend_url;
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration, refusing to start");
        return Err(e.into());
    }
    let addr = config.listen_socket_addr()?;

    let gateway = GatewayService::new(&config)?;
    for route in gateway.registry().iter() {
        info!(
            route = %route.kind,
            path = route.inbound_path,
            capability = %route.capability_name,
            timeout_seconds = route.timeout_seconds,
            round_trip_secs = route.round_trip.as_secs(),
            max_body_bytes = route.max_body_bytes,
            "Route registered"
        );
    }

    let service_stack = ServiceBuilder::new()
        .layer(logging_layer())
        .service(gateway);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let listener = TcpListener::bind(addr).await?;
    info!(
        listen = %addr,
        backend = config.backend_base_url(),
        "capgate listening"
    );

    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = configure_tcp_stream(&stream, &config) {
                            warn!(peer = %peer_addr, error = %e, "Failed to configure socket options");
                        }

                        let service = service_stack.clone();
                        let conn_shutdown = shutdown.clone();
                        let header_read_timeout = config.header_read_timeout;
                        connections.spawn(async move {
                            handle_connection(
                                stream,
                                peer_addr,
                                service,
                                conn_shutdown,
                                header_read_timeout,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    connections.close();
    info!(
        open_connections = connections.len(),
        "Waiting for open connections to close"
    );
    if tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), connections.wait())
        .await
        .is_err()
    {
        warn!(
            open_connections = connections.len(),
            "Connections still open after grace period"
        );
    }

    info!("capgate stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                shutdown.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
            }
        }
    });

    #[cfg(not(unix))]
    let _ = shutdown;
}

/// Serve one client connection until it closes or shutdown completes.
async fn handle_connection<S, B>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown: CancellationToken,
    header_read_timeout: Duration,
) where
    S: tower::Service<Request<Incoming>, Response = Response<B>, Error = GatewayError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move {
            let result: Result<_, std::convert::Infallible> = match svc.call(req).await {
                Ok(response) => Ok(response.map(|body| {
                    body.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                        .boxed()
                })),
                Err(e) => Ok(error_response(&e)),
            };
            result
        }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);
    let conn = builder.serve_connection(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            debug!(peer = %peer_addr, "Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            if tokio::time::timeout(SHUTDOWN_GRACE, conn).await.is_err() {
                warn!(peer = %peer_addr, "Connection did not close within grace period");
            }
        }
    }
}

/// Apply TCP_NODELAY and keepalive to an accepted socket.
fn configure_tcp_stream(stream: &TcpStream, config: &GatewayConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(config.tcp_keepalive);
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

use crate::engine::timing::{self, TimingEngine};
use crate::metrics::MetricsRegistry;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::TEXT_FORMAT;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wy_common::{ConfigError, ServeConfig};

/// Histogram `handler` label of the success route.
pub const FOUND_HANDLER: &str = "found";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("server failed: {0}")]
    Serve(#[from] hyper::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Found,
    NotFound,
    ServerError,
    Metrics,
}

impl Route {
    /// Everything not claimed by a fixed path lands on the success route.
    pub fn from_path(path: &str) -> Self {
        match path {
            "/404" => Route::NotFound,
            "/500" => Route::ServerError,
            "/metrics" => Route::Metrics,
            _ => Route::Found,
        }
    }
}

/// Request handling state shared by every connection.
pub struct App {
    engine: TimingEngine,
    metrics: MetricsRegistry,
}

impl App {
    pub fn new(engine: TimingEngine, metrics: MetricsRegistry) -> Self {
        Self { engine, metrics }
    }

    pub fn engine(&self) -> &TimingEngine {
        &self.engine
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let route = Route::from_path(req.uri().path());
        debug!(%method, path = req.uri().path(), ?route, "Request received");

        match route {
            Route::Found => {
                self.metrics
                    .instrument(Some(FOUND_HANDLER), &method, self.engine.found())
                    .await
            }
            Route::NotFound => {
                self.metrics
                    .instrument(None, &method, async { timing::not_found() })
                    .await
            }
            Route::ServerError => {
                self.metrics
                    .instrument(None, &method, async { timing::server_error() })
                    .await
            }
            Route::Metrics => {
                let mut response = Response::new(Body::from(self.metrics.render()));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                response
            }
        }
    }
}

/// A bound, not yet serving, target server.
pub struct TargetServer {
    listener: std::net::TcpListener,
    h2c: bool,
    app: Arc<App>,
}

impl TargetServer {
    pub fn bind(config: &ServeConfig) -> Result<Self, ServerError> {
        let addr = config.bind_addr()?;
        let metrics = MetricsRegistry::new(env!("CARGO_PKG_VERSION"))?;
        let app = App::new(TimingEngine::new(config.timing()), metrics);
        Self::bind_any(addr, config.h2c, app)
    }

    /// Like [`TargetServer::bind_app`], but an unspecified IPv6 address falls
    /// back to `0.0.0.0` on hosts without IPv6.
    pub fn bind_any(addr: SocketAddr, h2c: bool, app: App) -> Result<Self, ServerError> {
        let listener = match std::net::TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(e) if addr.is_ipv6() && addr.ip().is_unspecified() => {
                let fallback = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
                warn!(%addr, %fallback, error = %e, "IPv6 bind failed, using IPv4 only");
                std::net::TcpListener::bind(fallback)
                    .map_err(|source| ServerError::Bind { addr: fallback, source })?
            }
            Err(source) => return Err(ServerError::Bind { addr, source }),
        };
        Self::from_listener(listener, h2c, app)
    }

    pub fn bind_app(addr: SocketAddr, h2c: bool, app: App) -> Result<Self, ServerError> {
        let listener =
            std::net::TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        Self::from_listener(listener, h2c, app)
    }

    fn from_listener(listener: std::net::TcpListener, h2c: bool, app: App) -> Result<Self, ServerError> {
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            h2c,
            app: Arc::new(app),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn app(&self) -> Arc<App> {
        Arc::clone(&self.app)
    }

    /// Serves until `shutdown` is cancelled, then drains in-flight responses.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let local_addr = self.listener.local_addr()?;
        let app = self.app;

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let app = Arc::clone(&app);
            let peer = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let app = Arc::clone(&app);
                    async move {
                        debug!(%peer, "Serving request");
                        Ok::<_, Infallible>(app.handle(req).await)
                    }
                }))
            }
        });

        // Without http1_only, hyper also accepts the HTTP/2 connection preface.
        // `Upgrade: h2c` requests are served as plain HTTP/1.1.
        let server = Server::from_tcp(self.listener)?
            .http1_only(!self.h2c)
            .serve(make_svc);

        info!(addr = %local_addr, h2c = self.h2c, "Target server online");

        server
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Target server stopped");
        Ok(())
    }
}

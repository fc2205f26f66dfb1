//! Video-aware reverse proxy: sits between an HTTP client and a WebDAV
//! origin, translating Range requests, streaming bodies without
//! buffering them whole, and caching bytes in fixed-size segments to
//! accelerate repeat playback.

pub mod active;
pub mod cache;
pub mod config;
pub mod cors;
pub mod engine;
pub mod error;
pub mod origin;
pub mod pool;
pub mod proxy;
pub mod range;
pub mod router;
pub mod stats;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

pub use config::Config;
pub use error::ProxyError;

/// Everything a handler needs: the caches, the outbound client, and the
/// observability state. Owned explicitly and passed through `axum`'s
/// `State` extractor rather than reached for via ambient globals (spec §9
/// "Global mutable state").
pub struct AppState {
    pub config: Config,
    pub caches: cache::Caches,
    pub origin: origin::OriginClient,
    pub stats: stats::Stats,
    pub active: Arc<active::ActiveRequests>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Arc<Self>, ProxyError> {
        let pool = pool::ConnectionPool::new().map_err(|e| ProxyError::Internal(e.to_string()))?;
        let caches = cache::Caches::new(
            config.metadata_ttl,
            config.redirect_ttl,
            config.preload_ttl,
            config.segment_bytes,
            config.cache_cap_bytes,
        );
        Ok(Arc::new(Self {
            origin: origin::OriginClient::new(pool),
            caches,
            stats: stats::Stats::new(),
            active: Arc::new(active::ActiveRequests::new()),
            config,
        }))
    }

    /// The full origin URL for an inbound path (`http://TARGET_HOST` +
    /// `TARGET_PATH` + the inbound path-and-query).
    pub fn origin_url(&self, inbound_path_and_query: &str) -> String {
        format!("http://{}{}{}", self.config.target_host, self.config.target_path, inbound_path_and_query)
    }
}

pub fn app(state: Arc<AppState>) -> axum::Router {
    router::router(state)
}

pub struct RunningServer {
    pub local_addr: SocketAddr,
    join: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    /// Waits for the listener task to exit (normally via graceful
    /// shutdown) and stops the background sweeper alongside it.
    pub async fn wait(self) {
        let _ = self.join.await;
        self.sweeper.abort();
    }
}

/// Binds the listening socket, spins up the once-a-minute cache sweeper,
/// and starts serving. Returns once the socket is bound; the server runs
/// on a background task until `wait()`'s graceful shutdown fires.
pub async fn start(config: Config) -> Result<RunningServer, ProxyError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config)?;

    let sweep_state = state.clone();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweep_state.caches.sweep();
        }
    });

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Internal(format!("bind {addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    let router = app(state);
    info!(%local_addr, "video gateway listening");

    let join = tokio::spawn(async move {
        let _ = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await;
    });

    Ok(RunningServer { local_addr, join, sweeper })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sig = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

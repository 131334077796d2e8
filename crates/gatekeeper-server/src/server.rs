use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use gatekeeper_db_memory::InMemoryStorage;
use gatekeeper_db_postgres::{PostgresStorage, mask_password};
use gatekeeper_storage::{DynGatekeeperStorage, fetch_all_endpoints};
use tower_http::trace::TraceLayer;

use crate::cache::{CounterAggregator, SharedStore, TwoTierCache, create_shared_store};
use crate::config::{AppConfig, GatekeeperMode};
use crate::events::{ChangeBus, InvalidationListener};
use crate::gatekeeping::{GatekeepingService, UsageFlusher};
use crate::http::{middleware as gate_middleware, proxy, routes};
use crate::matcher::Matcher;
use crate::task::BackgroundTask;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GatekeepingService>,
    pub proxy: Option<Arc<proxy::ProxyClient>>,
}

/// Builds the router for `mode`.
///
/// `downstream` holds the in-process routes wrapped in `middleware` mode and is
/// ignored otherwise. The `/gatekeeper` status and flush endpoints and
/// `/metrics` are never gated.
pub fn build_app(
    state: AppState,
    mode: GatekeeperMode,
    body_limit: usize,
    downstream: Option<Router>,
) -> Router {
    let admin = Router::new()
        .route("/gatekeeper/status", get(routes::status))
        .route("/gatekeeper/flushCache", post(routes::flush_cache))
        .route("/metrics", get(routes::metrics_handler));

    let gate = middleware::from_fn_with_state(state.clone(), gate_middleware::gate);

    let app = match mode {
        GatekeeperMode::AuthMiddleware => admin
            .route("/gatekeeper/validate", post(routes::validate))
            .route("/gatekeeper/recordUsage", post(routes::record_usage))
            .with_state(state),
        GatekeeperMode::Middleware => {
            let gated = downstream.unwrap_or_default().layer(gate);
            gated.merge(admin.with_state(state))
        }
        GatekeeperMode::Proxy => {
            let gated = Router::new()
                .fallback(proxy::forward)
                .with_state(state.clone())
                .layer(gate);
            gated.merge(admin.with_state(state))
        }
    };

    app.layer(middleware::from_fn(gate_middleware::track_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let org = req
                        .headers()
                        .get(crate::http::ORG_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        organization = %org,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Assembles storage, caches, background tasks and the router.
pub struct ServerBuilder {
    config: AppConfig,
    storage: Option<DynGatekeeperStorage>,
    shared: Option<SharedStore>,
    bus: Option<ChangeBus>,
    downstream: Option<Router>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            storage: None,
            shared: None,
            bus: None,
            downstream: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Uses `storage` instead of the one described by the configuration.
    pub fn with_storage(mut self, storage: DynGatekeeperStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_shared_store(mut self, shared: SharedStore) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_bus(mut self, bus: ChangeBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// In-process routes gated in `middleware` mode.
    pub fn with_downstream(mut self, router: Router) -> Self {
        self.downstream = Some(router);
        self
    }

    pub async fn build(self) -> anyhow::Result<GatekeeperServer> {
        let cfg = self.config;
        let gk = &cfg.gatekeeper;

        let mut postgres: Option<PostgresStorage> = None;
        let storage: DynGatekeeperStorage = match (self.storage, &cfg.storage.postgres) {
            (Some(storage), _) => storage,
            (None, Some(pg)) => {
                let pool_config = pg.to_pool_config();
                tracing::info!(url = %mask_password(&pool_config.url), "connecting to PostgreSQL");
                let pg_storage = gatekeeper_db_postgres::connect(&pool_config).await?;
                postgres = Some(pg_storage.clone());
                Arc::new(pg_storage)
            }
            (None, None) => {
                tracing::warn!("no storage.postgres configured, using in-memory storage");
                Arc::new(InMemoryStorage::new())
            }
        };

        let shared = match self.shared {
            Some(shared) => shared,
            None => create_shared_store(&cfg.redis).await,
        };

        let bus = match self.bus {
            Some(bus) => bus,
            None => match shared.redis_pool() {
                Some(pool) if cfg.pubsub.enabled => ChangeBus::redis(
                    pool.clone(),
                    cfg.redis.url.clone(),
                    cfg.pubsub.namespace.clone(),
                ),
                _ => ChangeBus::local(),
            },
        };

        let matcher = Arc::new(Matcher::new());
        let endpoints = fetch_all_endpoints(storage.as_ref(), gk.endpoint_page_size).await?;
        matcher.load_endpoints(&endpoints);

        let cache = Arc::new(TwoTierCache::new(
            shared.clone(),
            cfg.cache.local_ttl(),
            cfg.cache.shared_ttl(),
        ));
        let aggregator = Arc::new(CounterAggregator::new(shared.clone(), gk.counter_batch_size));
        let service = Arc::new(GatekeepingService::new(
            Arc::clone(&matcher),
            Arc::clone(&storage),
            Arc::clone(&cache),
            Arc::clone(&aggregator),
            gk.flush_interval(),
        ));
        let flusher = Arc::new(UsageFlusher::new(
            Arc::clone(&cache),
            Arc::clone(&storage),
            gk.flush_interval(),
        ));

        let proxy = match (gk.mode, gk.proxy_target.as_deref()) {
            (GatekeeperMode::Proxy, Some(target)) => Some(Arc::new(proxy::ProxyClient::new(
                target,
                cfg.server.body_limit_bytes,
            )?)),
            _ => None,
        };

        let state = AppState {
            service: Arc::clone(&service),
            proxy,
        };
        let app = build_app(
            state.clone(),
            gk.mode,
            cfg.server.body_limit_bytes,
            self.downstream,
        );

        let listener = InvalidationListener::start(&bus, Arc::clone(&cache), Arc::clone(&matcher));
        let aggregator_task = Arc::clone(&aggregator).start(gk.counter_flush_interval());
        let flush_task = Arc::clone(&flusher).start();

        tracing::info!(
            mode = gk.mode.as_str(),
            routes = matcher.len(),
            shared = shared.mode(),
            bus = bus.mode(),
            "gatekeeper ready"
        );

        Ok(GatekeeperServer {
            addr: cfg.addr(),
            app,
            state,
            runtime: Runtime {
                listener,
                tasks: vec![aggregator_task, flush_task],
                aggregator,
                flusher,
                shared,
                postgres,
            },
        })
    }
}

/// Everything that must be stopped in order on shutdown.
struct Runtime {
    listener: InvalidationListener,
    tasks: Vec<BackgroundTask>,
    aggregator: Arc<CounterAggregator>,
    flusher: Arc<UsageFlusher>,
    shared: SharedStore,
    postgres: Option<PostgresStorage>,
}

impl Runtime {
    /// Stops listeners and timers, drains the last partial window, then
    /// releases connections.
    async fn shutdown(self) {
        self.listener.stop().await;
        for task in self.tasks {
            task.stop().await;
        }

        let pushed = self.aggregator.flush_all().await;
        let report = self.flusher.flush().await;
        tracing::info!(
            pushed,
            flushed = report.flushed,
            failed = report.failed,
            "final usage flush complete"
        );

        if let Some(pool) = self.shared.redis_pool() {
            pool.close();
        }
        if let Some(pg) = self.postgres {
            pg.close().await;
        }
    }
}

pub struct GatekeeperServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    runtime: Runtime,
}

impl GatekeeperServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.runtime.shutdown().await;
        Ok(())
    }

    /// Shuts down without serving; used when the router is driven directly.
    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

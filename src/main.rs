// src/main.rs
use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use proxy_traffic_core::{
    cache::{CacheStatistics, MemoryStore, ResponseCache},
    config,
    events::{EventSink, TracingEventSink},
    failover::{FailoverManager, FailoverStatistics},
    health::HealthChecker,
    load_balancer::{LoadBalancer, LoadBalancerStatistics},
    metrics::MetricsRegistry,
};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};

struct AdminState {
    registry: MetricsRegistry,
    failover: Arc<FailoverManager>,
    balancer: Arc<LoadBalancer>,
    cache: Arc<ResponseCache>,
    metrics_path: String,
    stats_path: String,
}

#[derive(Serialize)]
struct Statistics {
    failover: FailoverStatistics,
    load_balancer: LoadBalancerStatistics,
    cache: CacheStatistics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxy_traffic_core=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // Initialize metrics
    let registry = MetricsRegistry::new()?;
    let metrics = config.metrics.enabled.then(|| registry.collector());
    let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);

    // Build components
    let probe = HealthChecker::new(config.failover.history_size, metrics.clone())
        .context("Failed to build health check client")?;
    let failover = Arc::new(FailoverManager::new(
        config.failover.clone(),
        Arc::new(probe),
        events.clone(),
        metrics.clone(),
    ));
    let balancer = Arc::new(
        LoadBalancer::new(config.load_balancer.algorithm, events.clone(), metrics.clone())
            .with_health_view(failover.clone()),
    );
    let cache = Arc::new(ResponseCache::new(
        config.cache.clone(),
        Arc::new(MemoryStore::new()),
        events.clone(),
        metrics.clone(),
    ));

    for endpoint in &config.endpoints {
        failover
            .add_endpoint(endpoint.clone())
            .with_context(|| format!("Failed to register endpoint {}", endpoint.id))?;
        balancer
            .add_endpoint(endpoint.clone())
            .with_context(|| format!("Failed to register endpoint {}", endpoint.id))?;
    }
    for chain in &config.chains {
        failover
            .set_failover_chain(&chain.primary, chain.fallbacks.clone(), chain.strategy)
            .with_context(|| format!("Failed to configure failover chain for {}", chain.primary))?;
    }

    info!(
        endpoints = config.endpoints.len(),
        chains = config.chains.len(),
        algorithm = %balancer.algorithm(),
        "Traffic core initialized"
    );

    // Start background loops
    let monitors = failover.clone().start();
    let sweeper = cache.clone().spawn_sweeper();

    // Start admin server if enabled
    let (stop_admin, admin_stopped) = oneshot::channel::<()>();
    let admin = if config.metrics.enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        let state = Arc::new(AdminState {
            registry,
            failover: failover.clone(),
            balancer: balancer.clone(),
            cache: cache.clone(),
            metrics_path: config.metrics.path.clone(),
            stats_path: config.metrics.stats_path.clone(),
        });
        Some(start_admin_server(addr, state, admin_stopped)?)
    } else {
        None
    };

    shutdown_signal().await;

    failover.shutdown();
    cache.shutdown();
    let _ = stop_admin.send(());

    monitors.join().await;
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            error!("Cache sweeper ended abnormally: {}", e);
        }
    }
    if let Some(admin) = admin {
        if let Err(e) = admin.await {
            error!("Admin server task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn start_admin_server(
    addr: SocketAddr,
    state: Arc<AdminState>,
    stop: oneshot::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let make_service = hyper::service::make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                handle_admin(req, state.clone())
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind admin server on {}", addr))?
        .serve(make_service)
        .with_graceful_shutdown(async move {
            let _ = stop.await;
        });

    info!("Admin server listening on http://{}", addr);

    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Admin server error: {}", e);
        }
    }))
}

async fn handle_admin(req: Request<Body>, state: Arc<AdminState>) -> Result<Response<Body>, Infallible> {
    if *req.method() != Method::GET {
        return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed"));
    }

    let path = req.uri().path();
    let response = if path == state.metrics_path {
        match state.registry.gather() {
            Ok(body) => respond(StatusCode::OK, "text/plain; version=0.0.4", body),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "metrics unavailable")
            }
        }
    } else if path == state.stats_path {
        let stats = Statistics {
            failover: state.failover.get_statistics(),
            load_balancer: state.balancer.get_statistics().await,
            cache: state.cache.get_statistics(),
        };
        match serde_json::to_vec_pretty(&stats) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => {
                error!("Failed to encode statistics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "statistics unavailable")
            }
        }
    } else {
        respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")
    };

    Ok(response)
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}

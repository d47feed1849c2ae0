//! Storage Backend Sidecar
//!
//! Loads the backend configuration, registers and bonds every backend,
//! keeps capabilities fresh and serves health and metrics endpoints until
//! interrupted. Arrays are served by the in-memory simulated client.

use anyhow::Context;
use backoff::ExponentialBackoff;
use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_backend_plugins::array::SimulatedClientFactory;
use storage_backend_plugins::{BackendTable, ClientFactory, PluginLayerConfig, PluginRegistry};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Backend Sidecar - array plugin layer with HyperMetro dispatch
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend configuration file (YAML)
    #[arg(long, env = "BACKEND_CONFIG", default_value = "/etc/storage-backends/backends.yaml")]
    config: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Give up registering a backend after this many seconds of retries
    #[arg(long, env = "INIT_RETRY_SECS", default_value = "120")]
    init_retry_secs: u64,

    /// Validate every backend against its array and exit
    #[arg(long, env = "CHECK_ONLY")]
    check_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Storage Backend Sidecar");
    info!("  Version: {}", storage_backend_plugins::VERSION);
    info!("  Config: {}", args.config);

    let config = PluginLayerConfig::load(&args.config)
        .with_context(|| format!("loading backend configuration {}", args.config))?;
    info!(
        "Loaded {} backends (refresh every {}s)",
        config.backends.len(),
        config.refresh_interval_secs
    );

    let factory: Arc<dyn ClientFactory> = Arc::new(SimulatedClientFactory::from_config(&config));
    let registry = PluginRegistry::with_builtin_plugins(factory)?;
    info!("Storage plugins: {}", registry.plugin_names().join(", "));
    let table = BackendTable::new(registry);

    if args.check_only {
        for backend in &config.backends {
            table
                .validate(backend)
                .await
                .with_context(|| format!("validating backend {}", backend.name))?;
            info!("Backend {} is valid", backend.name);
        }
        return Ok(());
    }

    let events = tokio::spawn(log_events(Arc::clone(&table)));

    register_backends(&table, &config, Duration::from_secs(args.init_retry_secs)).await?;
    table.bond_topology().context("bonding backend topology")?;
    info!("{} of {} backends online", table.online_count(), table.len());

    let cancel = CancellationToken::new();
    let refresh = tokio::spawn(run_refresh_loop(
        Arc::clone(&table),
        config.refresh_interval(),
        cancel.clone(),
    ));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_table = Arc::clone(&table);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_table).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    cancel.cancel();
    if let Err(e) = refresh.await {
        warn!("Refresh loop ended abnormally: {}", e);
    }
    table.shutdown_all().await;
    events.abort();

    info!("Sidecar shutdown complete");
    Ok(())
}

/// Register every configured backend, retrying while its array is unreachable
async fn register_backends(
    table: &Arc<BackendTable>,
    config: &PluginLayerConfig,
    max_elapsed: Duration,
) -> anyhow::Result<()> {
    for backend in &config.backends {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(max_elapsed),
            ..Default::default()
        };
        let table = table.as_ref();
        backoff::future::retry(policy, move || async move {
            table.register(backend.clone()).await.map_err(|e| {
                if e.is_transient() {
                    warn!("Backend {} not ready, retrying: {}", backend.name, e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
        .with_context(|| format!("registering backend {}", backend.name))?;
    }
    Ok(())
}

async fn run_refresh_loop(table: Arc<BackendTable>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let statuses = table.refresh_capabilities().await;
                let online = statuses.iter().filter(|s| s.online).count();
                debug!("Refreshed {} backends, {} online", statuses.len(), online);
            }
        }
    }
}

async fn log_events(table: Arc<BackendTable>) {
    let mut events = table.subscribe();
    drop(table);
    loop {
        match events.recv().await {
            Ok(event) => info!("Backend event on {}: {:?}", event.backend(), event),
            Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, table: Arc<BackendTable>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let table = Arc::clone(&table);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let table = Arc::clone(&table);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            let (online, total) = (table.online_count(), table.len());
                            if total > 0 && online == 0 {
                                text_response(StatusCode::SERVICE_UNAVAILABLE, "no backend online")
                            } else {
                                text_response(StatusCode::OK, format!("{}/{} backends online", online, total))
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = text_response(StatusCode::OK, buffer);
                            if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

//! Resource Cache Server
//!
//! Serves a directory of static resources through the caching filter.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Resource Cache Server                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    HTTP/1    │───▶│   Caching    │───▶│  FileOrigin  │       │
//! │  │   listener   │    │    Filter    │    │   (disk)     │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │  ┌──────────────┐                                               │
//! │  │   Metrics    │  /metrics  /metrics.json  /cache/keys         │
//! │  │   listener   │  /cache/clear                                 │
//! │  └──────────────┘                                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use resource_cache::cache::FreshnessMode;
use resource_cache::{CacheConfig, CachingFilter, Error, FileOrigin, Outgoing, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Resource Cache - static resources served through a blocking HTTP cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to serve
    #[arg(long, env = "RESOURCE_ROOT", default_value = ".")]
    root: PathBuf,

    /// YAML configuration file
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the population timeout, in seconds
    #[arg(long, env = "POPULATION_TIMEOUT_SECONDS")]
    population_timeout: Option<u64>,

    /// Override the TTL, in seconds
    #[arg(long, env = "CACHE_TTL_SECONDS")]
    ttl: Option<u64>,

    /// Enforce the TTL instead of watching file modification times
    #[arg(long, env = "CACHE_TTL_POLICY")]
    ttl_policy: bool,

    /// Cache with a one-year horizon
    #[arg(long, env = "CACHE_ETERNAL")]
    eternal: bool,

    /// Server bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

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
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting Resource Cache");
    info!("  Root: {}", args.root.display());
    info!("  Cache: {}", config.name);
    info!("  Population timeout: {:?}", config.population_timeout());
    info!("  Freshness: {}", config.freshness_policy().name);
    info!("  Cache-Control: {}", config.cache_control);

    let origin = Arc::new(FileOrigin::new(&args.root).with_max_size(config.max_resource_size));
    let filter = Arc::new(CachingFilter::from_config(&config, origin));

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_filter = filter.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_filter).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::select! {
        result = run_server(&args.addr, filter) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    info!("Resource Cache shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)?,
        None => CacheConfig::default(),
    };

    if let Some(timeout) = args.population_timeout {
        config.population_timeout_secs = timeout;
    }
    if let Some(ttl) = args.ttl {
        config.ttl_secs = ttl;
    }
    if args.ttl_policy {
        config.freshness = FreshnessMode::Ttl;
    }
    if args.eternal {
        config.eternal = true;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
}

// =============================================================================
// Resource Server
// =============================================================================

async fn run_server(addr: &str, filter: Arc<CachingFilter>) -> Result<()> {
    let listener = bind(addr, "resource").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let filter = filter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let filter = filter.clone();
                async move { Ok::<_, Infallible>(serve(&filter, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection error: {}", e);
            }
        });
    }
}

async fn serve(filter: &CachingFilter, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if matches!(req.uri().path(), "/healthz" | "/livez" | "/readyz") {
        return text(StatusCode::OK, "ok");
    }

    let (parts, _body) = req.into_parts();
    let request = Request::from_parts(parts, ());
    let mut outgoing = Outgoing::new();

    match filter.handle(&request, &mut outgoing).await {
        Ok(disposition) => {
            debug!(
                method = %request.method(),
                uri = %request.uri(),
                status = outgoing.status().as_u16(),
                disposition = %disposition,
                "Request served"
            );
            outgoing.into_response()
        }
        Err(e) => {
            let status = e.status_code();
            error!(uri = %request.uri(), status = status.as_u16(), error = %e, "Request failed");
            text(status, status.canonical_reason().unwrap_or("error"))
        }
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Prometheus view of the cache metrics, refreshed on every scrape
struct Exporter {
    registry: Registry,
    counters: Vec<(&'static str, IntGauge)>,
    hit_ratio: Gauge,
    entries: IntGauge,
    bytes: IntGauge,
}

impl Exporter {
    fn new(filter: &CachingFilter) -> Result<Self> {
        let registry = Registry::new();
        let prom = |e: prometheus::Error| Error::Internal(format!("Metric registration failed: {}", e));

        let mut counters = Vec::new();
        for (name, _) in filter.metrics().snapshot().counters() {
            let gauge = IntGauge::new(
                format!("resource_cache_{}", name),
                format!("Cache {} since start", name.replace('_', " ")),
            )
            .map_err(prom)?;
            registry.register(Box::new(gauge.clone())).map_err(prom)?;
            counters.push((name, gauge));
        }

        let hit_ratio = Gauge::new("resource_cache_hit_ratio", "Hits over all lookups").map_err(prom)?;
        let entries = IntGauge::new("resource_cache_entries", "Entries currently cached").map_err(prom)?;
        let bytes = IntGauge::new("resource_cache_bytes", "Bytes held by cached entries").map_err(prom)?;
        registry.register(Box::new(hit_ratio.clone())).map_err(prom)?;
        registry.register(Box::new(entries.clone())).map_err(prom)?;
        registry.register(Box::new(bytes.clone())).map_err(prom)?;

        Ok(Self {
            registry,
            counters,
            hit_ratio,
            entries,
            bytes,
        })
    }

    fn render(&self, filter: &CachingFilter) -> Result<Vec<u8>> {
        let snapshot = filter.metrics().snapshot();
        for ((_, gauge), (_, value)) in self.counters.iter().zip(snapshot.counters()) {
            gauge.set(value as i64);
        }
        self.hit_ratio.set(snapshot.hit_ratio);
        self.entries.set(filter.cache().len() as i64);
        self.bytes.set(filter.cache().size() as i64);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Metric encoding failed: {}", e)))?;
        Ok(buffer)
    }
}

async fn run_metrics_server(addr: &str, filter: Arc<CachingFilter>) -> Result<()> {
    let exporter = Arc::new(Exporter::new(&filter)?);
    let listener = bind(addr, "metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let filter = filter.clone();
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = admin(&filter, &exporter, &req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

fn admin(filter: &CachingFilter, exporter: &Exporter, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match exporter.render(filter) {
            Ok(buffer) => {
                let mut response = Response::new(Full::new(Bytes::from(buffer)));
                if let Ok(value) = TextEncoder::new().format_type().parse() {
                    response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::GET, "/metrics.json") => json(&filter.metrics().snapshot()),
        (&Method::GET, "/cache/keys") => {
            let keys: Vec<String> = filter.cache().keys().iter().map(|k| k.to_string()).collect();
            json(&keys)
        }
        (&Method::POST, "/cache/clear") => {
            let dropped = filter.cache().len();
            filter.cache().clear();
            info!(entries = dropped, "Cache cleared");
            text(StatusCode::OK, &format!("cleared {}", dropped))
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", what, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", what, e)))?;

    info!("{} server listening on {}", what, addr);
    Ok(listener)
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

//! Device Set Operator
//!
//! Watches StorageCluster objects, expands their device sets into volume
//! claims and manages one storage daemon per replica.
//!
//! ```text
//! deviceset-operator run                          # watch the cluster
//! deviceset-operator run --standalone -f sc.yaml  # one in-memory pass
//! deviceset-operator crd                          # print the CRD
//! ```

use clap::{Args as ClapArgs, Parser, Subcommand};
use kube::CustomResourceExt;
use prometheus::Registry;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deviceset_operator::controlplane::operator;
use deviceset_operator::{
    AdminConfig, BackendFactory, Error, InMemoryCluster, OperatorConfig, OperatorContext,
    OperatorMetrics, Orchestrator, Result, StorageCluster,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Device Set Operator - claims and storage daemons for storage-class device sets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile StorageClusters
    Run(RunArgs),
    /// Print the StorageCluster CustomResourceDefinition as YAML
    Crd,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Only watch StorageClusters in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Storage cluster admin endpoint
    #[arg(long, env = "ADMIN_ENDPOINT", default_value = "http://storage-mgr:8003")]
    admin_endpoint: String,

    /// Bearer token for the admin endpoint
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Default storage daemon image
    #[arg(long, env = "DAEMON_IMAGE")]
    daemon_image: Option<String>,

    /// Timeout for every remote call, in seconds
    #[arg(long, env = "CALL_TIMEOUT", default_value = "30")]
    call_timeout_secs: u64,

    /// Device sets expanded concurrently
    #[arg(long, env = "EXPAND_PARALLELISM", default_value = "4")]
    expand_parallelism: usize,

    /// Purge daemons even when they could not be confirmed down
    #[arg(long, env = "FORCE_PURGE")]
    force_purge: bool,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Run a single pass against an in-memory cluster (no Kubernetes)
    #[arg(long, env = "STANDALONE", requires = "cluster_file")]
    standalone: bool,

    /// StorageCluster manifest for standalone mode
    #[arg(short = 'f', long)]
    cluster_file: Option<PathBuf>,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        let defaults = OperatorConfig::default();
        OperatorConfig {
            daemon_image: self
                .daemon_image
                .clone()
                .unwrap_or(defaults.daemon_image),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            expand_parallelism: self.expand_parallelism,
            force_purge: self.force_purge,
            ..defaults
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    match args.command {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&StorageCluster::crd())?);
            Ok(())
        }
        Command::Run(run) if run.standalone => run_standalone(run).await,
        Command::Run(run) => run_operator(run).await,
    }
}

async fn run_operator(args: RunArgs) -> Result<()> {
    let config = args.operator_config();
    config.validate()?;

    info!("Starting Device Set Operator");
    info!("  Version: {}", deviceset_operator::VERSION);
    info!("  Admin endpoint: {}", args.admin_endpoint);
    info!("  Call timeout: {:?}", config.call_timeout);
    info!("  Force purge: {}", config.force_purge);

    let registry = Registry::new();
    let metrics = OperatorMetrics::register(&registry)?;
    let ready = Arc::new(AtomicBool::new(false));

    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = kube::Client::try_default().await?;
    let backends = BackendFactory::kubernetes(
        client.clone(),
        AdminConfig {
            endpoint: args.admin_endpoint.clone(),
            token: args.admin_token.clone(),
            request_timeout: config.call_timeout,
        },
    )?;
    let orchestrator = Orchestrator::new(config, backends, metrics);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping at the next step boundary");
            signal_cancel.cancel();
        }
    });

    let ctx = Arc::new(OperatorContext {
        client,
        orchestrator,
        cancel,
    });
    ready.store(true, Ordering::SeqCst);

    operator::run(ctx, args.namespace.as_deref()).await?;

    info!("Operator shutdown complete");
    Ok(())
}

/// One pass against an in-memory cluster, printing the report as JSON
async fn run_standalone(args: RunArgs) -> Result<()> {
    let config = args.operator_config();
    config.validate()?;

    let path = args
        .cluster_file
        .as_ref()
        .ok_or_else(|| Error::Configuration("--cluster-file is required".into()))?;
    let manifest = tokio::fs::read_to_string(path).await?;
    let cluster: StorageCluster = serde_yaml::from_str(&manifest)?;
    let namespace = cluster
        .metadata
        .namespace
        .clone()
        .or_else(|| args.namespace.clone())
        .unwrap_or_else(|| "default".to_string());

    // Every storage class the manifest refers to exists in memory
    let classes: BTreeSet<String> = cluster
        .spec
        .storage
        .storage_class_device_sets
        .iter()
        .flat_map(|d| d.volume_claim_templates.iter())
        .filter_map(|t| t.storage_class().map(str::to_string))
        .collect();
    let memory = InMemoryCluster::with_storage_classes(classes);

    info!("Standalone pass for {} in {}", path.display(), namespace);
    let orchestrator = Orchestrator::new(
        config,
        BackendFactory::in_memory(memory),
        OperatorMetrics::default(),
    );
    let report = orchestrator
        .reconcile(&namespace, &cluster.spec, &CancellationToken::new())
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => args.log_level.to_lowercase(),
        _ => "info".to_string(),
    };

    let filter = EnvFilter::try_new(format!("{},hyper=warn,kube=info", level))
        .map_err(|e| Error::Configuration(format!("Invalid log filter: {}", e)))?;

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

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if ready => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, registry: Registry) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    if req.uri().path() != "/metrics" {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, std::convert::Infallible>(response);
                    }

                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&registry.gather(), &mut buffer) {
                        Ok(()) => {
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            *response.body_mut() = Body::from(buffer);
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        }
                    }
                    Ok(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use divvy::config::{BackendKind, DivvyConfig};
use divvy::metrics::{Instrumenter, MetricsExporter, PrometheusInstrumenter};
use divvy::ratelimit::{CreditBackend, MemoryBackend, RedisBackend, RuleDocument};
use divvy::server::{DivvyService, Server};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Quota-based admission control server.
#[derive(Debug, Parser)]
#[command(name = "divvy", version, about)]
struct Args {
    /// Rule document (YAML, JSON or INI)
    rules: PathBuf,

    /// Settings file, overlaid by DIVVY_* environment variables
    #[arg(long, env = "DIVVY_SETTINGS")]
    settings: Option<PathBuf>,

    /// Address to serve the protocol on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Port to serve the protocol on
    #[arg(short, long)]
    port: Option<u16>,

    /// Counter store
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Redis connection URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print the loaded rules and exit
    #[arg(long)]
    dump_config: bool,
}

impl Args {
    /// Apply command line overrides on top of the loaded settings.
    fn apply(&self, config: &mut DivvyConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(port) = self.port {
            config.server.listen_addr.set_port(port);
        }
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(url) = &self.redis_url {
            config.backend.redis_url = url.clone();
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = Some(port);
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let document = RuleDocument::from_file(&args.rules)?;
    let store = document.into_store()?;

    if args.dump_config {
        print!("{}", RuleDocument::from_store(&store).to_yaml()?);
        return Ok(());
    }

    info!("Starting Divvy");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = DivvyConfig::load(args.settings.as_deref())?;
    args.apply(&mut config);
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.backend.kind,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backend: Arc<dyn CreditBackend> = match config.backend.kind {
        BackendKind::Redis => Arc::new(RedisBackend::connect(config.backend.redis()).await?),
        BackendKind::Memory => {
            let memory = Arc::new(MemoryBackend::new());
            let interval = Duration::from_secs(config.backend.purge_interval_secs.max(1));
            tokio::spawn(purge_loop(memory.clone(), interval, shutdown_rx.clone()));
            memory
        }
    };
    backend.initialize().await?;
    info!("Credit backend initialized");

    let prometheus = Arc::new(PrometheusInstrumenter::new());
    let instrumenter: Arc<dyn Instrumenter> = prometheus.clone();

    let exporter = config.metrics.addr().map(|addr| {
        let exporter = MetricsExporter::new(addr, config.metrics.path.clone(), prometheus);
        let stopped = wait_for(shutdown_rx.clone());
        tokio::spawn(async move {
            if let Err(e) = exporter.serve_with_shutdown(stopped).await {
                error!(error = %e, "Metrics exporter failed");
            }
        })
    });

    let service = DivvyService::new(Arc::new(store), backend, instrumenter);
    let server = Server::bind(config.server.listen_addr, service).await?;

    server.serve_with_shutdown(shutdown_signal()).await?;
    shutdown_tx.send_replace(true);

    if let Some(exporter) = exporter {
        let _ = exporter.await;
    }

    info!("Divvy stopped");
    Ok(())
}

/// Periodically drop expired in-memory buckets.
async fn purge_loop(backend: Arc<MemoryBackend>, every: Duration, shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    let stopped = wait_for(shutdown);
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                let purged = backend.purge_expired();
                debug!(purged, remaining = backend.bucket_count(), "Bucket purge");
            }
        }
    }
}

/// Resolve once the shutdown flag flips.
async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

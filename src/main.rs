use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use azure_metrics_exporter::azure::{AzureApi, AzureClient};
use azure_metrics_exporter::collector::resolver::Resolver;
use azure_metrics_exporter::collector::AzureCollector;
use azure_metrics_exporter::config::Config;
use azure_metrics_exporter::export::{HealthMetrics, MetricsServer};
use azure_metrics_exporter::resource::QueryWindow;

/// Prometheus exporter for Azure Monitor metrics.
#[derive(Parser)]
#[command(name = "azure-metrics-exporter", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long = "config.file", default_value = "azure.yml")]
    config_file: PathBuf,

    /// Address to listen on; overrides `listen_address` from the config.
    #[arg(long = "web.listen-address")]
    listen_address: Option<String>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the metric definitions of every configured resource and exit.
    #[arg(long = "list.definitions")]
    list_definitions: bool,

    /// Print the metric namespaces of every configured resource and exit.
    #[arg(long = "list.namespaces")]
    list_namespaces: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

#[derive(Clone, Copy)]
enum ListMode {
    Definitions,
    Namespaces,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("azure-metrics-exporter {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let mut cfg = load_config(&cli.config_file)?;
    if let Some(addr) = &cli.listen_address {
        cfg.listen_address = addr.clone();
    }

    let list_mode = match (cli.list_definitions, cli.list_namespaces) {
        (true, _) => Some(ListMode::Definitions),
        (false, true) => Some(ListMode::Namespaces),
        (false, false) => None,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match list_mode {
            Some(mode) => list(cfg, mode).await,
            None => run(cfg).await,
        }
    })
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

/// Build the client, acquire a token and load the API version table.
async fn connect(cfg: &Config, health: Option<Arc<HealthMetrics>>) -> Result<AzureClient> {
    let mut client = AzureClient::new(cfg).context("creating Azure client")?;

    if let Some(health) = health {
        client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health.observe_request(endpoint, status, duration);
        }));
    }

    client
        .refresh_token()
        .await
        .context("acquiring initial access token")?;

    let versions = client
        .load_api_versions()
        .await
        .context("loading API versions")?;
    tracing::info!(resource_types = versions, "loaded API version table");

    Ok(client)
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting azure-metrics-exporter",
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
    let client = Arc::new(connect(&cfg, Some(Arc::clone(&health))).await?);

    let addr = cfg.bind_address();
    let batch_health = Arc::clone(&health);
    let collector = AzureCollector::new(client, Arc::new(cfg)).with_batch_callback(Box::new(
        move |kind, status| {
            batch_health
                .batch_requests_total
                .with_label_values(&[kind.as_str(), status])
                .inc();
        },
    ));

    let server = MetricsServer::new(&addr, Arc::new(collector), health);
    server.start().await?;

    let _ = shutdown_rx.await;

    server.stop().await?;

    tracing::info!("azure-metrics-exporter stopped");

    Ok(())
}

/// One-shot listing of what Azure offers for each configured resource.
async fn list(cfg: Config, mode: ListMode) -> Result<()> {
    let client = connect(&cfg, None).await?;
    let window = QueryWindow::ending_at(Utc::now(), cfg.query_window);

    let mut resolver = Resolver::new(&client, &cfg, window);
    let mut descriptors = resolver.targets();
    descriptors.extend(resolver.tagged().await?);
    descriptors.extend(resolver.resource_groups().await?);

    for descriptor in &descriptors {
        let id = &descriptor.resource_id;
        let (title, names) = match mode {
            ListMode::Definitions => ("Available Metrics", client.metric_definitions(id).await?),
            ListMode::Namespaces => ("Available Namespaces", client.metric_namespaces(id).await?),
        };

        println!("Resource: {id}");
        println!("{title}:");
        for name in names {
            println!("- {name}");
        }
        println!();
    }

    Ok(())
}

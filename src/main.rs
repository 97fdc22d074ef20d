//! quorumd -- bootstrap controller for a consensus cluster node.
//!
//! Decides how the node enters its cluster, starts the consensus store,
//! then serves status until a signal arrives.  SIGTERM exits 0; SIGINT,
//! SIGHUP and SIGQUIT exit 1.  Any bootstrap failure exits 1.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use quorumd::cluster::bootstrap::prepare_join_cluster;
use quorumd::cluster::membership::HttpConnector;
use quorumd::config::{Config, LoggingConfig, ServerConfig};
use quorumd::errors::BootstrapError;
use quorumd::node::{NodeRuntime, Termination};
use quorumd::store::etcd::EtcdProcessStore;
use quorumd::AppState;

/// Command-line arguments.  Flags override the configuration file.
#[derive(Parser, Debug)]
#[command(
    name = "quorumd",
    version,
    about = "Bootstrap controller for a consensus cluster node"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Member name.
    #[arg(long)]
    name: Option<String>,

    /// Data directory of the consensus store.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Client URLs of a running cluster to join.
    #[arg(long)]
    join: Option<String>,

    /// URLs to listen on for client traffic.
    #[arg(long)]
    client_urls: Option<String>,

    /// URLs to listen on for peer traffic.
    #[arg(long)]
    peer_urls: Option<String>,

    /// Client URLs to advertise to the cluster.
    #[arg(long)]
    advertise_client_urls: Option<String>,

    /// Peer URLs to advertise to the cluster.
    #[arg(long)]
    advertise_peer_urls: Option<String>,

    /// Trusted CA certificate (PEM).
    #[arg(long)]
    cacert: Option<PathBuf>,

    /// Node certificate (PEM).
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Node private key (PEM, PKCS#8).
    #[arg(long)]
    key: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => quorumd::config::load_config(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Config::default(),
        };

        let node = &mut config.node;
        if let Some(name) = self.name {
            node.name = name;
        }
        if let Some(data_dir) = self.data_dir {
            node.data_dir = data_dir;
        }
        if let Some(join) = self.join {
            node.join = join;
        }
        if let Some(urls) = self.client_urls {
            node.client_urls = urls;
        }
        if let Some(urls) = self.peer_urls {
            node.peer_urls = urls;
        }
        if let Some(urls) = self.advertise_client_urls {
            node.advertise_client_urls = urls;
        }
        if let Some(urls) = self.advertise_peer_urls {
            node.advertise_peer_urls = urls;
        }

        let security = &mut config.security;
        if self.cacert.is_some() {
            security.cacert_path = self.cacert;
        }
        if self.cert.is_some() {
            security.cert_path = self.cert;
        }
        if self.key.is_some() {
            security.key_path = self.key;
        }

        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.adjust();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Cli::parse().load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("quorumd: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<BootstrapError>() {
                Some(err) => error!(kind = ?err.kind(), "Bootstrap failed: {:#}", e),
                None => error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: Config) -> anyhow::Result<ExitCode> {
    if config.observability.metrics {
        quorumd::metrics::init_metrics()?;
        quorumd::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(wait_for_termination(cancel.clone()));

    info!(
        "Bootstrapping member {} (data dir {})",
        config.node.name,
        config.node.data_dir.display()
    );
    let connector = Arc::new(HttpConnector::from_config(&config));
    let plan = prepare_join_cluster(&config, connector.as_ref(), &cancel).await?;

    let store = Arc::new(EtcdProcessStore::from_config(&config));
    let runtime = NodeRuntime::new(config.clone(), store, connector);
    let node = runtime.start(&cancel, plan).await?;

    let server = if config.server.enabled {
        match bind_status(&config.server).await {
            Ok(listener) => {
                let state = Arc::new(AppState {
                    status: node.status(),
                });
                Some(tokio::spawn(serve_status(listener, state, cancel.clone())))
            }
            Err(e) => {
                node.shutdown().await?;
                return Err(e);
            }
        }
    } else {
        None
    };

    let termination = signals.await.context("signal watcher panicked")??;

    if let Some(server) = server {
        if let Err(e) = server.await.context("status server panicked")? {
            error!("Status server failed: {:#}", e);
        }
    }
    node.shutdown().await?;
    info!("quorumd stopped ({:?})", termination);

    Ok(termination.exit_code())
}

async fn bind_status(server: &ServerConfig) -> anyhow::Result<tokio::net::TcpListener> {
    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind status server on {addr}"))?;
    info!("Status server listening on {}", addr);
    Ok(listener)
}

async fn serve_status(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, quorumd::server::app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

/// Wait for a termination signal, cancel `cancel`, and report which one.
async fn wait_for_termination(cancel: CancellationToken) -> anyhow::Result<Termination> {
    let cause = termination_signal().await?;
    info!("Received {:?}, shutting down", cause);
    cancel.cancel();
    Ok(cause)
}

#[cfg(unix)]
async fn termination_signal() -> anyhow::Result<Termination> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut quit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

    let cause = tokio::select! {
        _ = terminate.recv() => Termination::Terminate,
        _ = interrupt.recv() => Termination::Interrupt,
        _ = hangup.recv() => Termination::Hangup,
        _ = quit.recv() => Termination::Quit,
    };
    Ok(cause)
}

#[cfg(not(unix))]
async fn termination_signal() -> anyhow::Result<Termination> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    Ok(Termination::Interrupt)
}

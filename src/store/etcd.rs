//! etcd process consensus store.
//!
//! Runs `etcd` as a supervised child process configured from the
//! bootstrap plan, and talks to it through its HTTP/JSON gateway:
//! `GET /health` for readiness and `POST /v3/maintenance/status` for the
//! member id.
//!
//! Stopping kills the process.  etcd recovers from its WAL on the next
//! start, so there is no separate clean-shutdown path.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::{ConsensusStore, StoreConfig, StoreFuture, StoreHandle};
use crate::cluster::membership::HttpMembershipClient;
use crate::config::{split_urls, Config};

/// Launches etcd child processes.
#[derive(Debug, Clone)]
pub struct EtcdProcessStore {
    binary: String,
    extra_args: Vec<String>,
    poll_interval: Duration,
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl EtcdProcessStore {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.store.binary.clone(),
            extra_args: config.store.extra_args.clone(),
            poll_interval: Duration::from_millis(config.store.ready_poll_interval_ms),
            dial_timeout: config.cluster.dial_timeout(),
            request_timeout: config.cluster.request_timeout(),
        }
    }
}

/// Command-line flags for `config`.
pub fn command_args(config: &StoreConfig) -> Vec<String> {
    let mut args = vec![
        "--name".to_string(),
        config.name.clone(),
        "--data-dir".to_string(),
        config.data_dir.display().to_string(),
        "--listen-client-urls".to_string(),
        config.listen_client_urls.clone(),
        "--advertise-client-urls".to_string(),
        config.advertise_client_urls.clone(),
        "--listen-peer-urls".to_string(),
        config.listen_peer_urls.clone(),
        "--initial-advertise-peer-urls".to_string(),
        config.advertise_peer_urls.clone(),
        "--initial-cluster".to_string(),
        config.initial_cluster.clone(),
        "--initial-cluster-state".to_string(),
        config.initial_cluster_state.as_str().to_string(),
    ];

    let security = &config.security;
    if let Some(ca) = &security.cacert_path {
        let ca = ca.display().to_string();
        args.extend([
            "--trusted-ca-file".to_string(),
            ca.clone(),
            "--peer-trusted-ca-file".to_string(),
            ca,
        ]);
    }
    if let (Some(cert), Some(key)) = (&security.cert_path, &security.key_path) {
        let cert = cert.display().to_string();
        let key = key.display().to_string();
        args.extend([
            "--cert-file".to_string(),
            cert.clone(),
            "--key-file".to_string(),
            key.clone(),
            "--peer-cert-file".to_string(),
            cert,
            "--peer-key-file".to_string(),
            key,
        ]);
    }
    args
}

impl ConsensusStore for EtcdProcessStore {
    fn start(&self, config: StoreConfig) -> StoreFuture<'_, Box<dyn StoreHandle>> {
        Box::pin(async move {
            let endpoints = split_urls(&config.advertise_client_urls);
            let tls = config.security.to_tls_config()?;
            let client = HttpMembershipClient::new(
                &endpoints,
                tls.as_ref(),
                self.dial_timeout,
                self.request_timeout,
            )
            .context("invalid store client endpoint")?;

            let mut args = command_args(&config);
            args.extend(self.extra_args.iter().cloned());
            debug!("Spawning {} {}", self.binary, args.join(" "));

            let child = Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to spawn {}", self.binary))?;
            info!(
                "Started {} (pid {:?}) as {} with initial-cluster-state={}",
                self.binary,
                child.id(),
                config.name,
                config.initial_cluster_state
            );

            let handle: Box<dyn StoreHandle> = Box::new(EtcdProcess {
                child: Mutex::new(child),
                client,
                endpoints,
                poll_interval: self.poll_interval,
            });
            Ok(handle)
        })
    }
}

/// A running etcd child process.
struct EtcdProcess {
    child: Mutex<Child>,
    client: HttpMembershipClient,
    endpoints: Vec<String>,
    poll_interval: Duration,
}

impl StoreHandle for EtcdProcess {
    fn wait_ready(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            loop {
                if let Some(status) = self.child.lock().await.try_wait()? {
                    anyhow::bail!("store process exited before becoming ready: {status}");
                }
                match self.client.health().await {
                    Ok(true) => return Ok(()),
                    Ok(false) => debug!("Store reports unhealthy, waiting"),
                    Err(e) => debug!("Store not reachable yet: {}", e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    fn member_id(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.client
                .status()
                .await
                .context("failed to read member id from store status")
        })
    }

    fn client_endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    fn stop(self: Box<Self>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let this = *self;
        Box::pin(async move {
            let mut child = this.child.into_inner();
            if let Some(status) = child.try_wait()? {
                warn!("Store process had already exited: {}", status);
                return Ok(());
            }
            child.kill().await.context("failed to kill store process")?;
            info!("Store process stopped");
            Ok(())
        })
    }
}

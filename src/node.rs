//! Node runtime.
//!
//! Applies a [`BootstrapPlan`]: starts the consensus store, waits for it to
//! become ready, opens a local membership client, and checks that the peer
//! URLs the cluster recorded for this node match the configured advertise
//! URLs.  The result is a [`RunningNode`] owned by the caller until
//! shutdown.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::cluster::bootstrap::{unless_cancelled, BootstrapPlan, ClusterState, NodeRole};
use crate::cluster::membership::{Member, MembershipClient, MembershipConnector};
use crate::config::{Config, ReconcilePolicy};
use crate::errors::BootstrapError;
use crate::metrics::{PEER_URL_MISMATCH_TOTAL, STORE_READY_SECONDS};
use crate::store::backend::{ConsensusStore, StoreConfig, StoreHandle};

/// What was done about a peer URL mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Logged only.
    Reported,
    /// The node uses the recorded URLs as its effective advertise URLs.
    Adopted,
    /// The configured URLs were written to the cluster.
    RemoteUpdated,
    /// Writing the configured URLs to the cluster failed.
    RemoteUpdateFailed { reason: String },
}

/// Outcome of comparing configured and recorded peer URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The cluster records exactly the configured URLs.
    Matched,
    /// The cluster records different URLs.
    Mismatch {
        configured: String,
        recorded: String,
        action: ReconcileAction,
    },
    /// The member list has no entry for this node's id.
    MemberNotFound,
}

impl Reconciliation {
    pub fn is_matched(&self) -> bool {
        matches!(self, Reconciliation::Matched)
    }
}

/// Why the process is terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM: the orchestrator asked us to stop.
    Terminate,
    /// SIGINT.
    Interrupt,
    /// SIGHUP.
    Hangup,
    /// SIGQUIT.
    Quit,
}

impl Termination {
    /// Only SIGTERM counts as a clean stop.
    pub fn is_graceful(self) -> bool {
        self == Termination::Terminate
    }

    pub fn exit_code(self) -> ExitCode {
        if self.is_graceful() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// Read-only summary of a running node, served on `/status`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NodeStatus {
    /// Member name.
    pub name: String,
    /// Member id in hex, as the store prints it.
    pub member_id: String,
    /// Bootstrap path taken at startup.
    pub role: NodeRole,
    /// Initial cluster state the store was started with.
    pub cluster_state: ClusterState,
    /// Advertised client URLs.
    pub advertise_client_urls: String,
    /// Effective advertised peer URLs.
    pub advertise_peer_urls: String,
    /// Whether the cluster records the configured peer URLs.
    pub peer_urls_reconciled: bool,
}

/// A started, ready consensus store plus what bootstrap learned about it.
pub struct RunningNode {
    name: String,
    member_id: u64,
    role: NodeRole,
    cluster_state: ClusterState,
    advertise_client_urls: String,
    advertise_peer_urls: String,
    reconciliation: Reconciliation,
    client: Arc<dyn MembershipClient>,
    store: Box<dyn StoreHandle>,
}

impl std::fmt::Debug for RunningNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningNode")
            .field("name", &self.name)
            .field("member_id", &format_args!("{:x}", self.member_id))
            .field("role", &self.role)
            .field("cluster_state", &self.cluster_state)
            .field("reconciliation", &self.reconciliation)
            .finish_non_exhaustive()
    }
}

impl RunningNode {
    pub fn member_id(&self) -> u64 {
        self.member_id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn cluster_state(&self) -> ClusterState {
        self.cluster_state
    }

    pub fn reconciliation(&self) -> &Reconciliation {
        &self.reconciliation
    }

    /// Peer URLs this node advertises after reconciliation.
    pub fn advertise_peer_urls(&self) -> &str {
        &self.advertise_peer_urls
    }

    /// Membership client connected to the local store.
    pub fn client(&self) -> Arc<dyn MembershipClient> {
        self.client.clone()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.name.clone(),
            member_id: format!("{:x}", self.member_id),
            role: self.role,
            cluster_state: self.cluster_state,
            advertise_client_urls: self.advertise_client_urls.clone(),
            advertise_peer_urls: self.advertise_peer_urls.clone(),
            peer_urls_reconciled: self.reconciliation.is_matched(),
        }
    }

    /// Stop the consensus store.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("Shutting down member {} ({:x})", self.name, self.member_id);
        self.store.stop().await
    }
}

/// Starts the consensus store for a bootstrap plan.
pub struct NodeRuntime {
    config: Config,
    store: Arc<dyn ConsensusStore>,
    connector: Arc<dyn MembershipConnector>,
}

impl NodeRuntime {
    pub fn new(
        config: Config,
        store: Arc<dyn ConsensusStore>,
        connector: Arc<dyn MembershipConnector>,
    ) -> Self {
        Self {
            config,
            store,
            connector,
        }
    }

    /// Start the store and bring it to the ready state.
    ///
    /// Cancellation before readiness aborts startup with
    /// [`BootstrapError::StartupCanceled`].  On any failure after launch
    /// the store is stopped again before the error is returned.
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        plan: BootstrapPlan,
    ) -> Result<RunningNode, BootstrapError> {
        let store_config = StoreConfig::from_plan(&self.config, &plan);
        info!(
            "Starting consensus store: initial-cluster-state={} initial-cluster={}",
            store_config.initial_cluster_state, store_config.initial_cluster
        );

        let store = self
            .store
            .start(store_config)
            .await
            .map_err(|source| BootstrapError::StoreStart { source })?;

        let brought_up = self.bring_up(cancel, store.as_ref()).await;
        match brought_up {
            Ok((member_id, client, reconciliation)) => {
                let advertise_peer_urls = match &reconciliation {
                    Reconciliation::Mismatch {
                        recorded,
                        action: ReconcileAction::Adopted,
                        ..
                    } => recorded.clone(),
                    _ => self.configured_peer_urls(),
                };
                info!(
                    "Member {} ({:x}) is running as {}",
                    self.config.node.name, member_id, plan.role
                );
                Ok(RunningNode {
                    name: self.config.node.name.clone(),
                    member_id,
                    role: plan.role,
                    cluster_state: plan.initial_cluster_state,
                    advertise_client_urls: self.config.node.advertise_client_urls.clone(),
                    advertise_peer_urls,
                    reconciliation,
                    client,
                    store,
                })
            }
            Err(e) => {
                if let Err(stop_err) = store.stop().await {
                    warn!("Failed to stop consensus store after startup error: {:#}", stop_err);
                }
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        cancel: &CancellationToken,
        store: &dyn StoreHandle,
    ) -> Result<(u64, Arc<dyn MembershipClient>, Reconciliation), BootstrapError> {
        let started = Instant::now();
        unless_cancelled(
            cancel,
            "waiting for the consensus store to become ready",
            store.wait_ready(),
        )
        .await?
        .map_err(|source| BootstrapError::StoreStart { source })?;
        histogram!(STORE_READY_SECONDS).record(started.elapsed().as_secs_f64());
        info!("Consensus store ready after {:?}", started.elapsed());

        let client = self
            .connector
            .connect(&store.client_endpoints())
            .map_err(|e| match e {
                BootstrapError::InvalidJoinTarget { endpoint, reason } => BootstrapError::Config(
                    format!("invalid advertise client url {endpoint:?}: {reason}"),
                ),
                other => other,
            })?;

        let member_id = unless_cancelled(cancel, "reading the store member id", store.member_id())
            .await?
            .map_err(|source| BootstrapError::StoreStart { source })?;

        let members = unless_cancelled(cancel, "listing cluster members", client.list_members())
            .await?
            .map_err(|source| BootstrapError::RemoteQuery {
                operation: "list members after start",
                source,
            })?;

        let reconciliation = self.reconcile(member_id, &members, client.as_ref()).await;
        Ok((member_id, client, reconciliation))
    }

    fn configured_peer_urls(&self) -> String {
        self.config.node.advertise_peer_url_list().join(",")
    }

    async fn reconcile(
        &self,
        member_id: u64,
        members: &[Member],
        client: &dyn MembershipClient,
    ) -> Reconciliation {
        let Some(own) = members.iter().find(|m| m.id == member_id) else {
            warn!("Member list has no entry for this node ({:x})", member_id);
            return Reconciliation::MemberNotFound;
        };

        let configured = self.configured_peer_urls();
        let recorded = own.peer_urls.join(",");
        if configured == recorded {
            return Reconciliation::Matched;
        }
        counter!(PEER_URL_MISMATCH_TOTAL).increment(1);

        let action = match self.config.cluster.reconcile {
            ReconcilePolicy::Report => {
                info!(
                    "Advertise peer urls {} differ from the cluster's record {}",
                    configured, recorded
                );
                ReconcileAction::Reported
            }
            ReconcilePolicy::Adopt => {
                info!(
                    "Update advertise peer urls from {} to {}",
                    configured, recorded
                );
                ReconcileAction::Adopted
            }
            ReconcilePolicy::UpdateRemote => {
                let urls = self.config.node.advertise_peer_url_list();
                match client.update_member(member_id, urls).await {
                    Ok(()) => {
                        info!(
                            "Updated the cluster's peer urls for {:x} from {} to {}",
                            member_id, recorded, configured
                        );
                        ReconcileAction::RemoteUpdated
                    }
                    Err(e) => {
                        warn!("Failed to update peer urls for {:x}: {}", member_id, e);
                        ReconcileAction::RemoteUpdateFailed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        Reconciliation::Mismatch {
            configured,
            recorded,
            action,
        }
    }
}

//! Bootstrap decision engine.
//!
//! Decides, once per process start, whether this node founds a new
//! cluster, restarts into the cluster its data directory belongs to, or
//! joins a running cluster as a new member.  The outcome is a
//! [`BootstrapPlan`] that is handed unchanged to the consensus store.
//!
//! The join path performs exactly one membership mutation (`add_member`)
//! and never retries it: a lost response after the cluster recorded the
//! member would otherwise produce a second entry for the same node.

use std::fmt;
use std::future::Future;

use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::local_state::{self, LocalDataState};
use super::membership::{parse_endpoint, Member, MembershipConnector};
use crate::config::{Config, NodeConfig};
use crate::errors::BootstrapError;
use crate::metrics::BOOTSTRAP_DECISIONS_TOTAL;

/// Initial cluster state handed to the consensus store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Bootstrap a brand-new cluster.
    New,
    /// Join (or rejoin) a cluster that already exists.
    Existing,
}

impl ClusterState {
    /// Value of the store's `initial-cluster-state` setting.
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which bootstrap path this node took.  Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Founded a new single-member cluster.
    Founder,
    /// Restarted on existing local data.
    Restarted,
    /// Joined a running cluster as a new member.
    Joined,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Founder => "founder",
            NodeRole::Restarted => "restarted",
            NodeRole::Joined => "joined",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `name=peerURL` entry of the initial cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialPeer {
    pub name: String,
    pub peer_url: String,
}

impl fmt::Display for InitialPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.peer_url)
    }
}

/// Output of the decision engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan {
    pub initial_cluster_state: ClusterState,
    /// Empty unless this node just joined a running cluster.
    pub initial_cluster: Vec<InitialPeer>,
    pub role: NodeRole,
}

impl BootstrapPlan {
    fn founder() -> Self {
        Self {
            initial_cluster_state: ClusterState::New,
            initial_cluster: Vec::new(),
            role: NodeRole::Founder,
        }
    }

    fn restarted() -> Self {
        Self {
            initial_cluster_state: ClusterState::Existing,
            initial_cluster: Vec::new(),
            role: NodeRole::Restarted,
        }
    }

    fn joined(initial_cluster: Vec<InitialPeer>) -> Self {
        Self {
            initial_cluster_state: ClusterState::Existing,
            initial_cluster,
            role: NodeRole::Joined,
        }
    }

    /// The member list in the store's `name=url,name=url` form.
    pub fn initial_cluster_string(&self) -> String {
        self.initial_cluster
            .iter()
            .map(InitialPeer::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Race `fut` against the cancellation token.
pub(crate) async fn unless_cancelled<F: Future>(
    cancel: &CancellationToken,
    phase: &'static str,
    fut: F,
) -> Result<F::Output, BootstrapError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BootstrapError::StartupCanceled { phase }),
        out = fut => Ok(out),
    }
}

/// Inspect the data directory and decide the bootstrap plan.
pub async fn prepare_join_cluster(
    config: &Config,
    connector: &dyn MembershipConnector,
    cancel: &CancellationToken,
) -> Result<BootstrapPlan, BootstrapError> {
    let local = local_state::inspect(&config.node.data_dir)?;
    let plan = decide(&config.node, local, connector, cancel).await?;
    counter!(
        BOOTSTRAP_DECISIONS_TOTAL,
        "state" => plan.initial_cluster_state.as_str(),
        "role" => plan.role.as_str()
    )
    .increment(1);
    Ok(plan)
}

/// Compute the bootstrap plan.
///
/// `connector` is only used on the join path; the founder and restart
/// paths make no remote calls at all.
pub async fn decide(
    node: &NodeConfig,
    local: LocalDataState,
    connector: &dyn MembershipConnector,
    cancel: &CancellationToken,
) -> Result<BootstrapPlan, BootstrapError> {
    if node.join.trim().is_empty() {
        info!("No join target configured, founding a new cluster as {}", node.name);
        return Ok(BootstrapPlan::founder());
    }

    if node.join.trim() == node.advertise_client_urls.trim() {
        return Err(BootstrapError::SelfJoin {
            join: node.join.clone(),
        });
    }

    if local.is_populated() {
        info!(
            "Found existing data under {}, rejoining the previous cluster",
            local_state::member_dir(&node.data_dir).display()
        );
        return Ok(BootstrapPlan::restarted());
    }

    // A join was requested; it must name at least one usable endpoint.
    let endpoints = node.join_endpoints();
    if endpoints.is_empty() {
        return Err(BootstrapError::InvalidJoinTarget {
            endpoint: node.join.clone(),
            reason: "no endpoints in join target".to_string(),
        });
    }
    for endpoint in &endpoints {
        parse_endpoint(endpoint).map_err(|e| BootstrapError::InvalidJoinTarget {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
    }

    let peer_urls = node.advertise_peer_url_list();
    if peer_urls.is_empty() {
        return Err(BootstrapError::Config(
            "node.advertise_peer_urls is empty; a joining node must advertise a peer url".to_string(),
        ));
    }

    info!("Joining existing cluster via {}", endpoints.join(","));
    let client = connector.connect(&endpoints)?;

    let members = unless_cancelled(cancel, "listing cluster members", client.list_members())
        .await?
        .map_err(|source| BootstrapError::RemoteQuery {
            operation: "list members",
            source,
        })?;

    if let Some(existing) = members.iter().find(|m| m.name == node.name) {
        return Err(BootstrapError::DuplicateOrMissingData {
            name: node.name.clone(),
            member_id: existing.id,
        });
    }

    let add = unless_cancelled(cancel, "adding this node to the cluster", client.add_member(peer_urls));
    let added = match add.await {
        Ok(result) => result.map_err(|source| BootstrapError::RemoteMutation {
            operation: "add member",
            source,
        })?,
        Err(e) => {
            warn!("Cancelled during member add; the cluster may hold an entry for this node");
            return Err(e);
        }
    };
    info!(
        "Added {} to the cluster as member {:x}",
        node.name, added.id
    );

    let members = unless_cancelled(cancel, "listing cluster members", client.list_members())
        .await?
        .map_err(|source| BootstrapError::RemoteQuery {
            operation: "list members after add",
            source,
        })?;

    if !members.iter().any(|m| m.id == added.id) {
        warn!(
            "Member {:x} is missing from the post-add member list",
            added.id
        );
    }

    let initial_cluster = initial_cluster(&members, added.id, &node.name);
    let plan = BootstrapPlan::joined(initial_cluster);
    info!("Initial cluster: {}", plan.initial_cluster_string());
    Ok(plan)
}

/// Expand members into `name=peerURL` entries, naming the freshly added
/// member after this node since the cluster does not know its name yet.
fn initial_cluster(members: &[Member], added_id: u64, own_name: &str) -> Vec<InitialPeer> {
    members
        .iter()
        .flat_map(|m| {
            let name = if m.id == added_id {
                own_name
            } else {
                m.name.as_str()
            };
            m.peer_urls.iter().map(move |url| InitialPeer {
                name: name.to_string(),
                peer_url: url.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{member, Fault, FakeCluster, FakeConnector};
    use crate::errors::ErrorKind;
    use crate::cluster::membership::MembershipClient;

    fn node(name: &str, join: &str, peer: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            advertise_client_urls: "http://10.0.0.9:2379".to_string(),
            advertise_peer_urls: peer.to_string(),
            join: join.to_string(),
            ..NodeConfig::default()
        }
    }

    fn seeded() -> FakeConnector {
        FakeConnector::new(FakeCluster::new(vec![member(1, "a", &["u1"])]))
    }

    #[tokio::test]
    async fn test_empty_join_founds_new_cluster() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        for local in [LocalDataState::Empty, LocalDataState::Populated] {
            let plan = decide(&node("b", "", "u2"), local, &connector, &cancel)
                .await
                .unwrap();
            assert_eq!(plan.initial_cluster_state, ClusterState::New);
            assert!(plan.initial_cluster.is_empty());
            assert_eq!(plan.role, NodeRole::Founder);
        }
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_self_join_is_config_error() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        let cfg = node("b", "http://10.0.0.9:2379", "u2");
        for local in [LocalDataState::Empty, LocalDataState::Populated] {
            let err = decide(&cfg, local, &connector, &cancel).await.unwrap_err();
            assert!(matches!(err, BootstrapError::SelfJoin { .. }));
            assert_eq!(err.kind(), ErrorKind::Config);
        }
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_join_target_is_config_error() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        let cfg = node("b", "http://10.0.0.1:2379,ftp://10.0.0.2:2379", "u2");
        let err = decide(&cfg, LocalDataState::Empty, &connector, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidJoinTarget { .. }));
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_blank_join_list_is_not_a_founder() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        for join in [" , ", ",", ",,"] {
            let err = decide(&node("b", join, "u2"), LocalDataState::Empty, &connector, &cancel)
                .await
                .unwrap_err();
            assert!(
                matches!(err, BootstrapError::InvalidJoinTarget { .. }),
                "join {join:?} gave {err:?}"
            );
            assert!(err.is_config_error());
        }
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_data_ignores_unparsable_join() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        for join in ["http://[10.0.0.1:2379", "ftp://10.0.0.1:2379", " , "] {
            let plan = decide(
                &node("b", join, "u2"),
                LocalDataState::Populated,
                &connector,
                &cancel,
            )
            .await
            .unwrap();
            assert_eq!(plan.initial_cluster_state, ClusterState::Existing);
            assert!(plan.initial_cluster.is_empty());
            assert_eq!(plan.role, NodeRole::Restarted);
        }
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_join_accepts_host_port_endpoints() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        let plan = decide(
            &node("b", "10.0.0.1:2379", "u2"),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(plan.role, NodeRole::Joined);
        assert_eq!(plan.initial_cluster_string(), "a=u1,b=u2");
    }

    #[tokio::test]
    async fn test_join_without_peer_urls_is_config_error() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        let err = decide(
            &node("b", "http://10.0.0.1:2379", " , "),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_data_rejoins_without_remote_calls() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        let plan = decide(
            &node("b", "http://10.0.0.1:2379", "u2"),
            LocalDataState::Populated,
            &connector,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(plan.initial_cluster_state, ClusterState::Existing);
        assert!(plan.initial_cluster.is_empty());
        assert_eq!(plan.role, NodeRole::Restarted);
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_join_builds_member_list() {
        let connector = seeded();
        let cancel = CancellationToken::new();
        let plan = decide(
            &node("b", "http://10.0.0.1:2379", "u2"),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(plan.initial_cluster_state, ClusterState::Existing);
        assert_eq!(plan.role, NodeRole::Joined);
        assert_eq!(plan.initial_cluster_string(), "a=u1,b=u2");
        assert_eq!(connector.connects(), 1);
        assert_eq!(
            connector.connected_endpoints(),
            vec![vec!["http://10.0.0.1:2379".to_string()]]
        );
        assert_eq!(connector.cluster.list_calls(), 2);
        assert_eq!(connector.cluster.add_calls(), 1);
    }

    #[tokio::test]
    async fn test_join_emits_one_entry_per_peer_url() {
        let cluster = FakeCluster::new(vec![
            member(1, "a", &["http://a1:2380", "http://a2:2380"]),
            member(3, "c", &["http://c1:2380"]),
        ]);
        let connector = FakeConnector::new(cluster);
        let cancel = CancellationToken::new();
        let plan = decide(
            &node("b", "http://a1:2379,http://c1:2379", "http://b1:2380,http://b2:2380"),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(
            plan.initial_cluster_string(),
            "a=http://a1:2380,a=http://a2:2380,c=http://c1:2380,b=http://b1:2380,b=http://b2:2380"
        );
        let added = connector.cluster.members().pop().unwrap();
        assert_eq!(added.id, 4);
        assert_eq!(added.peer_urls, vec!["http://b1:2380", "http://b2:2380"]);
    }

    #[tokio::test]
    async fn test_duplicate_name_refuses_to_add() {
        let cluster = FakeCluster::new(vec![member(1, "a", &["u1"]), member(7, "b", &["u2"])]);
        let connector = FakeConnector::new(cluster);
        let cancel = CancellationToken::new();
        let err = decide(
            &node("b", "http://10.0.0.1:2379", "u2"),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap_err();

        match err {
            BootstrapError::DuplicateOrMissingData { name, member_id } => {
                assert_eq!(name, "b");
                assert_eq!(member_id, 7);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(connector.cluster.add_calls(), 0);
        assert_eq!(connector.cluster.members().len(), 2);
    }

    #[tokio::test]
    async fn test_list_timeout_is_remote_query_error() {
        let connector = seeded();
        connector.cluster.set_list_fault(Fault::Timeout);
        let cancel = CancellationToken::new();
        let err = decide(
            &node("b", "http://10.0.0.1:2379", "u2"),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap_err();

        match &err {
            BootstrapError::RemoteQuery { operation, source } => {
                assert_eq!(*operation, "list members");
                assert!(source.is_timeout());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(connector.cluster.add_calls(), 0);
    }

    #[tokio::test]
    async fn test_add_failure_is_remote_mutation_error_and_not_retried() {
        let connector = seeded();
        connector.cluster.set_add_fault(Fault::ServerError);
        let cancel = CancellationToken::new();
        let err = decide(
            &node("b", "http://10.0.0.1:2379", "u2"),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteMutation);
        assert_eq!(connector.cluster.add_calls(), 1);
        assert_eq!(connector.cluster.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_listing() {
        let connector = seeded();
        connector.cluster.set_list_fault(Fault::Hang);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = decide(
            &node("b", "http://10.0.0.1:2379", "u2"),
            LocalDataState::Empty,
            &connector,
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StartupCanceled);
        assert_eq!(connector.cluster.add_calls(), 0);
    }

    #[tokio::test]
    async fn test_list_members_is_stable_without_mutation() {
        let connector = seeded();
        let first = connector.cluster.list_members().await.unwrap();
        let second = connector.cluster.list_members().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_prepare_reads_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let member_dir = local_state::member_dir(dir.path());
        std::fs::create_dir_all(member_dir.join("snap")).unwrap();

        let mut config = Config::default();
        config.node = node("b", "http://10.0.0.1:2379", "u2");
        config.node.data_dir = dir.path().to_path_buf();

        let connector = seeded();
        let plan = prepare_join_cluster(&config, &connector, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.role, NodeRole::Restarted);
        assert_eq!(connector.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_prepare_with_empty_data_dir_joins() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.node = node("b", "http://10.0.0.1:2379", "u2");
        config.node.data_dir = dir.path().to_path_buf();

        let connector = seeded();
        let plan = prepare_join_cluster(&config, &connector, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.role, NodeRole::Joined);
        assert_eq!(plan.initial_cluster_string(), "a=u1,b=u2");
    }

    #[test]
    fn test_initial_cluster_uses_recorded_names() {
        let members = vec![
            member(1, "a", &["u1"]),
            member(2, "", &["u2"]),
            member(5, "", &["u5"]),
        ];
        let peers = initial_cluster(&members, 2, "b");
        let rendered: Vec<String> = peers.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["a=u1", "b=u2", "=u5"]);
    }
}

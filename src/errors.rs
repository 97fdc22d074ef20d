//! Bootstrap error taxonomy.
//!
//! Every failure on the way from cold start to a running node is a
//! [`BootstrapError`].  Variants carry the phase or remote operation that
//! failed so an operator can diagnose the problem from a single log line.
//! None of them are retried; `main` logs the error and exits non-zero.

use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::membership::MembershipError;
use crate::security::SecurityError;

/// Coarse classification used by callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operator configuration is wrong (self-join, bad join target, TLS).
    Config,
    /// A read-only call to the join target failed.
    RemoteQuery,
    /// The membership mutation failed.
    RemoteMutation,
    /// The cluster already knows a member with this node's name.
    DuplicateOrMissingData,
    /// Bootstrap was cancelled before the node became ready.
    StartupCanceled,
    /// The local data directory could not be inspected.
    LocalState,
    /// The consensus store could not be started.
    StoreStart,
}

/// Errors produced while deciding and applying a bootstrap plan.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The join target is this node's own client URL.
    #[error("join self is forbidden: join target {join} is this node's advertise client url")]
    SelfJoin { join: String },

    /// One of the join endpoints is not a usable URL.
    #[error("invalid join target endpoint {endpoint:?}: {reason}")]
    InvalidJoinTarget { endpoint: String, reason: String },

    /// Any other invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport security material could not be loaded.
    #[error("failed to build transport security configuration")]
    Security(#[from] SecurityError),

    /// A read-only membership call against a remote cluster failed.
    #[error("{operation} failed")]
    RemoteQuery {
        operation: &'static str,
        #[source]
        source: MembershipError,
    },

    /// The membership mutation against the remote cluster failed.
    #[error("{operation} failed; the remote cluster may or may not have recorded the member")]
    RemoteMutation {
        operation: &'static str,
        #[source]
        source: MembershipError,
    },

    /// The remote cluster already has a member carrying this node's name
    /// while no local data exists.
    #[error(
        "missing data or join a duplicated member: cluster already has member {name:?} (id {member_id:x}); \
         remove the stale member or restore the data directory"
    )]
    DuplicateOrMissingData { name: String, member_id: u64 },

    /// The governing cancellation token fired before bootstrap finished.
    #[error("canceled while {phase}")]
    StartupCanceled { phase: &'static str },

    /// The data directory exists but could not be read.
    #[error("failed to inspect local data directory {}", path.display())]
    LocalState {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The consensus store failed to launch or exited before it was ready.
    #[error("failed to start consensus store")]
    StoreStart {
        #[source]
        source: anyhow::Error,
    },
}

impl BootstrapError {
    /// Return the coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::SelfJoin { .. }
            | BootstrapError::InvalidJoinTarget { .. }
            | BootstrapError::Config(_)
            | BootstrapError::Security(_) => ErrorKind::Config,
            BootstrapError::RemoteQuery { .. } => ErrorKind::RemoteQuery,
            BootstrapError::RemoteMutation { .. } => ErrorKind::RemoteMutation,
            BootstrapError::DuplicateOrMissingData { .. } => ErrorKind::DuplicateOrMissingData,
            BootstrapError::StartupCanceled { .. } => ErrorKind::StartupCanceled,
            BootstrapError::LocalState { .. } => ErrorKind::LocalState,
            BootstrapError::StoreStart { .. } => ErrorKind::StoreStart,
        }
    }

    /// Whether this error was caused by operator configuration.
    pub fn is_config_error(&self) -> bool {
        self.kind() == ErrorKind::Config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_kind_classification() {
        let err = BootstrapError::SelfJoin {
            join: "http://127.0.0.1:2379".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.is_config_error());

        let err = BootstrapError::StartupCanceled {
            phase: "waiting for store",
        };
        assert_eq!(err.kind(), ErrorKind::StartupCanceled);
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_alternate_format_includes_remote_cause() {
        let err = BootstrapError::RemoteQuery {
            operation: "list members",
            source: MembershipError::Timeout {
                endpoint: "http://10.0.0.1:2379".to_string(),
                after: Duration::from_secs(3),
                connecting: true,
            },
        };
        let rendered = format!("{:#}", anyhow::Error::from(err));
        assert!(rendered.starts_with("list members failed: "));
        assert!(rendered.contains("http://10.0.0.1:2379"));
        assert!(rendered.contains("timed out"));
    }

    #[test]
    fn test_kind_survives_anyhow_conversion() {
        let err = anyhow::Error::from(BootstrapError::StartupCanceled {
            phase: "listing cluster members",
        });
        let inner = err.downcast_ref::<BootstrapError>().unwrap();
        assert_eq!(inner.kind(), ErrorKind::StartupCanceled);
        assert_eq!(format!("{err:#}"), "canceled while listing cluster members");
    }

    #[test]
    fn test_duplicate_message_names_member() {
        let err = BootstrapError::DuplicateOrMissingData {
            name: "pd1".to_string(),
            member_id: 0xabc,
        };
        let msg = err.to_string();
        assert!(msg.contains("\"pd1\""));
        assert!(msg.contains("abc"));
    }
}

//! Local persisted state inspection.
//!
//! The consensus store keeps its write-ahead log and snapshots under
//! `<data_dir>/member`.  A non-empty directory there means this node has
//! been a member before and must rejoin with its existing identity.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::BootstrapError;

/// Subdirectory of the data directory that holds store state.
pub const MEMBER_DIR: &str = "member";

/// Whether the store's data directory already holds state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDataState {
    /// No store state; the node has never run here or its data was removed.
    Empty,
    /// The store has persisted state from a previous run.
    Populated,
}

impl LocalDataState {
    pub fn is_populated(self) -> bool {
        self == LocalDataState::Populated
    }
}

/// Path of the store state directory under `data_dir`.
pub fn member_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(MEMBER_DIR)
}

/// Inspect `<data_dir>/member`.
///
/// A missing directory is [`LocalDataState::Empty`].  Any other I/O error
/// is returned instead of being read as "empty", since that would send a
/// node that is already a member through the join path a second time.
pub fn inspect(data_dir: &Path) -> Result<LocalDataState, BootstrapError> {
    let dir = member_dir(data_dir);
    let mut entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist", dir.display());
            return Ok(LocalDataState::Empty);
        }
        Err(source) => return Err(BootstrapError::LocalState { path: dir, source }),
    };

    match entries.next() {
        None => Ok(LocalDataState::Empty),
        Some(Ok(_)) => Ok(LocalDataState::Populated),
        Some(Err(source)) => Err(BootstrapError::LocalState { path: dir, source }),
    }
}

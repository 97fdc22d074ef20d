//! In-memory membership fakes for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::membership::{
    Member, MembershipClient, MembershipConnector, MembershipError, MembershipFuture,
};
use crate::errors::BootstrapError;

/// How a fake call should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Answer normally.
    None,
    /// Fail with a connect timeout.
    Timeout,
    /// Fail with a server error.
    ServerError,
    /// Never answer.
    Hang,
}

#[derive(Debug)]
struct State {
    members: Vec<Member>,
    next_id: u64,
    list_fault: Fault,
    add_fault: Fault,
    list_calls: usize,
    add_calls: usize,
    updates: Vec<(u64, Vec<String>)>,
}

/// A cluster whose membership lives in memory.
#[derive(Debug)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub(crate) fn new(members: Vec<Member>) -> Arc<Self> {
        let next_id = members.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        Arc::new(Self {
            state: Mutex::new(State {
                members,
                next_id,
                list_fault: Fault::None,
                add_fault: Fault::None,
                list_calls: 0,
                add_calls: 0,
                updates: Vec::new(),
            }),
        })
    }

    pub(crate) fn set_list_fault(&self, fault: Fault) {
        self.state.lock().unwrap().list_fault = fault;
    }

    pub(crate) fn set_add_fault(&self, fault: Fault) {
        self.state.lock().unwrap().add_fault = fault;
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub(crate) fn add_calls(&self) -> usize {
        self.state.lock().unwrap().add_calls
    }

    pub(crate) fn updates(&self) -> Vec<(u64, Vec<String>)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub(crate) fn members(&self) -> Vec<Member> {
        self.state.lock().unwrap().members.clone()
    }
}

pub(crate) fn member(id: u64, name: &str, peer_urls: &[&str]) -> Member {
    Member {
        id,
        name: name.to_string(),
        peer_urls: peer_urls.iter().map(|s| s.to_string()).collect(),
        client_urls: Vec::new(),
    }
}

fn fault_error(fault: Fault) -> Option<MembershipError> {
    match fault {
        Fault::None | Fault::Hang => None,
        Fault::Timeout => Some(MembershipError::Timeout {
            endpoint: "http://fake:2379".to_string(),
            after: Duration::from_secs(3),
            connecting: true,
        }),
        Fault::ServerError => Some(MembershipError::Status {
            endpoint: "http://fake:2379".to_string(),
            status: 500,
            body: "etcdserver: unhealthy cluster".to_string(),
        }),
    }
}

impl MembershipClient for FakeCluster {
    fn list_members(&self) -> MembershipFuture<'_, Vec<Member>> {
        Box::pin(async move {
            let fault = {
                let mut state = self.state.lock().unwrap();
                state.list_calls += 1;
                state.list_fault
            };
            if fault == Fault::Hang {
                std::future::pending::<()>().await;
            }
            if let Some(err) = fault_error(fault) {
                return Err(err);
            }
            Ok(self.members())
        })
    }

    fn add_member(&self, peer_urls: Vec<String>) -> MembershipFuture<'_, Member> {
        Box::pin(async move {
            let fault = {
                let mut state = self.state.lock().unwrap();
                state.add_calls += 1;
                state.add_fault
            };
            if fault == Fault::Hang {
                std::future::pending::<()>().await;
            }
            if let Some(err) = fault_error(fault) {
                return Err(err);
            }
            let mut state = self.state.lock().unwrap();
            let added = Member {
                id: state.next_id,
                name: String::new(),
                peer_urls,
                client_urls: Vec::new(),
            };
            state.next_id += 1;
            state.members.push(added.clone());
            Ok(added)
        })
    }

    fn update_member(&self, id: u64, peer_urls: Vec<String>) -> MembershipFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.updates.push((id, peer_urls.clone()));
            if let Some(m) = state.members.iter_mut().find(|m| m.id == id) {
                m.peer_urls = peer_urls;
            }
            Ok(())
        })
    }
}

/// Connector handing out a shared [`FakeCluster`] and counting connects.
pub(crate) struct FakeConnector {
    pub(crate) cluster: Arc<FakeCluster>,
    connects: AtomicUsize,
    endpoints: Mutex<Vec<Vec<String>>>,
}

impl FakeConnector {
    pub(crate) fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            connects: AtomicUsize::new(0),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn connected_endpoints(&self) -> Vec<Vec<String>> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Total remote calls observed, connects included.
    pub(crate) fn remote_calls(&self) -> usize {
        self.connects() + self.cluster.list_calls() + self.cluster.add_calls()
    }
}

impl MembershipConnector for FakeConnector {
    fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn MembershipClient>, BootstrapError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoints.to_vec());
        let client: Arc<dyn MembershipClient> = self.cluster.clone();
        Ok(client)
    }
}

//! Remote membership client.
//!
//! Talks to the consensus store's HTTP/JSON gateway to list and mutate
//! cluster membership.  Every call is bounded by a dial timeout and a
//! request timeout; failures surface as [`MembershipError`] and are never
//! retried here.  Read calls try each endpoint in order.  The mutating
//! call only moves on to the next endpoint when the connection could not
//! be established, because any later failure may mean the cluster already
//! applied the change.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, SecurityConfig};
use crate::errors::BootstrapError;
use crate::metrics::{MEMBERSHIP_REQUESTS_TOTAL, MEMBERSHIP_REQUEST_DURATION_SECONDS};
use crate::security::TlsConfig;

const MEMBER_LIST_PATH: &str = "/v3/cluster/member/list";
const MEMBER_ADD_PATH: &str = "/v3/cluster/member/add";
const MEMBER_UPDATE_PATH: &str = "/v3/cluster/member/update";
const STATUS_PATH: &str = "/v3/maintenance/status";
const HEALTH_PATH: &str = "/health";

/// A member of the consensus cluster as the cluster records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    /// Numeric member id assigned by the cluster.
    pub id: u64,
    /// Human-readable name; empty until the member has started once.
    pub name: String,
    /// Peer URLs the cluster uses to reach the member.
    pub peer_urls: Vec<String>,
    /// Client URLs the member serves on.
    pub client_urls: Vec<String>,
}

/// Errors from a membership RPC.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// An endpoint string is not an http(s) URL.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build membership http client")]
    Client(#[source] reqwest::Error),

    /// No endpoint was given.
    #[error("no membership endpoints configured")]
    NoEndpoints,

    /// The TCP/TLS connection could not be established.
    #[error("could not connect to {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The call did not complete in time.
    #[error("request to {endpoint} timed out after {after:?}")]
    Timeout {
        endpoint: String,
        after: Duration,
        /// Whether the timeout hit while still connecting.
        connecting: bool,
    },

    /// Any other transport failure after the request was sent.
    #[error("request to {endpoint} failed")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint answered with a non-success status.
    #[error("{endpoint} answered {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The response body could not be decoded.
    #[error("malformed response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

impl MembershipError {
    /// Whether the request certainly never reached the remote side.
    pub fn is_unsent(&self) -> bool {
        match self {
            MembershipError::Connect { .. } => true,
            MembershipError::Timeout { connecting, .. } => *connecting,
            MembershipError::InvalidEndpoint { .. }
            | MembershipError::Client(_)
            | MembershipError::NoEndpoints => true,
            _ => false,
        }
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MembershipError::Timeout { .. })
    }
}

/// Boxed future returned by [`MembershipClient`] methods.
pub type MembershipFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, MembershipError>> + Send + 'a>>;

/// Membership API of a running cluster.
pub trait MembershipClient: Send + Sync {
    /// Fetch the current member list, in the order the cluster returns it.
    fn list_members(&self) -> MembershipFuture<'_, Vec<Member>>;

    /// Add a member with the given peer URLs, returning the new entry.
    fn add_member(&self, peer_urls: Vec<String>) -> MembershipFuture<'_, Member>;

    /// Replace the peer URLs of member `id`.
    fn update_member(&self, id: u64, peer_urls: Vec<String>) -> MembershipFuture<'_, ()>;
}

/// Opens membership clients against a set of endpoints.
///
/// Bootstrap asks for a client only once it actually needs the remote
/// cluster, so paths that must not touch the network never build one.
pub trait MembershipConnector: Send + Sync {
    fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn MembershipClient>, BootstrapError>;
}

/// Parse and check a single endpoint URL.
///
/// A bare `host:port` is taken as plain http, as etcd clients do.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, MembershipError> {
    let invalid = |reason: String| MembershipError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let url = if endpoint.contains("://") {
        Url::parse(endpoint)
    } else {
        Url::parse(&format!("http://{endpoint}"))
    }
    .map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

// -- Gateway wire types -------------------------------------------------------

/// Accept 64-bit ids encoded either as JSON numbers or strings.
fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(rename = "ID", default, deserialize_with = "de_u64")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

impl From<WireMember> for Member {
    fn from(m: WireMember) -> Self {
        Member {
            id: m.id,
            name: m.name,
            peer_urls: m.peer_urls,
            client_urls: m.client_urls,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Deserialize)]
struct MemberAddResponse {
    member: Option<WireMember>,
}

#[derive(Debug, Serialize)]
struct MemberAddRequest {
    #[serde(rename = "peerURLs")]
    peer_urls: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MemberUpdateRequest {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "peerURLs")]
    peer_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "de_u64")]
    member_id: u64,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    header: Option<ResponseHeader>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    health: String,
}

#[derive(Debug, Serialize)]
struct Empty {}

// -- HTTP client --------------------------------------------------------------

/// Membership client over the store's HTTP/JSON gateway.
pub struct HttpMembershipClient {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl HttpMembershipClient {
    /// Build a client for `endpoints`.  No network traffic happens here.
    pub fn new(
        endpoints: &[String],
        tls: Option<&TlsConfig>,
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, MembershipError> {
        if endpoints.is_empty() {
            return Err(MembershipError::NoEndpoints);
        }
        let endpoints = endpoints
            .iter()
            .map(|e| parse_endpoint(e))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(request_timeout);
        if let Some(tls) = tls {
            builder = tls.apply(builder);
        }
        let client = builder.build().map_err(MembershipError::Client)?;

        Ok(Self {
            client,
            endpoints,
            dial_timeout,
            request_timeout,
        })
    }

    /// Endpoints this client talks to, in failover order.
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Member id of whichever endpoint answers the status call.
    pub async fn status(&self) -> Result<u64, MembershipError> {
        let resp: StatusResponse = self.read("status", STATUS_PATH, &Empty {}).await?;
        match resp.header {
            Some(h) if h.member_id != 0 => Ok(h.member_id),
            _ => Err(MembershipError::Decode {
                endpoint: self.endpoints[0].to_string(),
                reason: "status response carries no member id".to_string(),
            }),
        }
    }

    /// Probe the first endpoint's health check.
    pub async fn health(&self) -> Result<bool, MembershipError> {
        let endpoint = &self.endpoints[0];
        let url = join_path(endpoint, HEALTH_PATH)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(endpoint, e))?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let body: HealthResponse = self.decode(endpoint, resp).await?;
        Ok(body.health == "true")
    }

    fn classify(&self, endpoint: &Url, err: reqwest::Error) -> MembershipError {
        let endpoint_str = endpoint.to_string();
        if err.is_timeout() {
            let connecting = err.is_connect();
            MembershipError::Timeout {
                endpoint: endpoint_str,
                after: if connecting {
                    self.dial_timeout
                } else {
                    self.request_timeout
                },
                connecting,
            }
        } else if err.is_connect() {
            MembershipError::Connect {
                endpoint: endpoint_str,
                source: err,
            }
        } else {
            MembershipError::Transport {
                endpoint: endpoint_str,
                source: err,
            }
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        endpoint: &Url,
        resp: reqwest::Response,
    ) -> Result<T, MembershipError> {
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.classify(endpoint, e))?;
        if !status.is_success() {
            return Err(MembershipError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| MembershipError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &Url,
        path: &str,
        body: &Req,
    ) -> Result<Resp, MembershipError> {
        let url = join_path(endpoint, path)?;
        debug!("POST {}", url);
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(endpoint, e))?;
        self.decode(endpoint, resp).await
    }

    /// Read-only call: first endpoint that answers wins.
    async fn read<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &Req,
    ) -> Result<Resp, MembershipError> {
        let mut last = MembershipError::NoEndpoints;
        for endpoint in &self.endpoints {
            let started = Instant::now();
            let result = self.post(endpoint, path, body).await;
            record(operation, &result, started);
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!("{} against {} failed: {}", operation, endpoint, e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Mutating call: only fail over when the request was never sent.
    async fn write<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &Req,
    ) -> Result<Resp, MembershipError> {
        let mut last = MembershipError::NoEndpoints;
        for endpoint in &self.endpoints {
            let started = Instant::now();
            let result = self.post(endpoint, path, body).await;
            record(operation, &result, started);
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_unsent() => {
                    warn!(
                        "{} could not reach {}: {}; trying next endpoint",
                        operation, endpoint, e
                    );
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

impl MembershipClient for HttpMembershipClient {
    fn list_members(&self) -> MembershipFuture<'_, Vec<Member>> {
        Box::pin(async move {
            let resp: MemberListResponse =
                self.read("list_members", MEMBER_LIST_PATH, &Empty {}).await?;
            Ok(resp.members.into_iter().map(Member::from).collect())
        })
    }

    fn add_member(&self, peer_urls: Vec<String>) -> MembershipFuture<'_, Member> {
        Box::pin(async move {
            let req = MemberAddRequest { peer_urls };
            let resp: MemberAddResponse = self.write("add_member", MEMBER_ADD_PATH, &req).await?;
            match resp.member {
                Some(m) if m.id != 0 => Ok(m.into()),
                _ => Err(MembershipError::Decode {
                    endpoint: self.endpoints[0].to_string(),
                    reason: "member add response carries no member id".to_string(),
                }),
            }
        })
    }

    fn update_member(&self, id: u64, peer_urls: Vec<String>) -> MembershipFuture<'_, ()> {
        Box::pin(async move {
            let req = MemberUpdateRequest {
                id: id.to_string(),
                peer_urls,
            };
            let _: serde_json::Value = self
                .write("update_member", MEMBER_UPDATE_PATH, &req)
                .await?;
            Ok(())
        })
    }
}

fn join_path(endpoint: &Url, path: &str) -> Result<Url, MembershipError> {
    endpoint
        .join(path)
        .map_err(|e| MembershipError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
}

fn record<T>(operation: &'static str, result: &Result<T, MembershipError>, started: Instant) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) if e.is_timeout() => "timeout",
        Err(_) => "error",
    };
    counter!(MEMBERSHIP_REQUESTS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
    histogram!(MEMBERSHIP_REQUEST_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

// -- Connector ----------------------------------------------------------------

/// Connector that builds [`HttpMembershipClient`]s with the node's
/// transport security and timeouts.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    security: SecurityConfig,
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(security: SecurityConfig, dial_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            security,
            dial_timeout,
            request_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.security.clone(),
            config.cluster.dial_timeout(),
            config.cluster.request_timeout(),
        )
    }
}

impl MembershipConnector for HttpConnector {
    fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn MembershipClient>, BootstrapError> {
        let tls = self.security.to_tls_config()?;
        if let Some(tls) = &tls {
            debug!("Membership client uses TLS (client identity: {})", tls.has_identity());
        }
        let client = HttpMembershipClient::new(
            endpoints,
            tls.as_ref(),
            self.dial_timeout,
            self.request_timeout,
        )
        .map_err(|e| match e {
            MembershipError::InvalidEndpoint { endpoint, reason } => {
                BootstrapError::InvalidJoinTarget { endpoint, reason }
            }
            other => BootstrapError::RemoteQuery {
                operation: "open membership client",
                source: other,
            },
        })?;
        let client: Arc<dyn MembershipClient> = Arc::new(client);
        Ok(client)
    }
}

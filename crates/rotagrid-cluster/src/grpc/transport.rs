//! Outbound side of the gRPC transport.
//!
//! One lazily connected channel per peer. A channel that fails with
//! `unavailable` is dropped so the next call reconnects.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use rotagrid_state::{MemberId, Payload, Snapshot};

use super::proto::rebalance_service_client::RebalanceServiceClient;
use super::proto::{CommandRequest, PingRequest, SnapshotRequest};
use super::server::RebalanceServer;
use super::{current_handler, HandlerSlot};
use crate::command::Command;
use crate::transport::{CommandHandler, Transport, TransportError, TransportResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Transport that reaches a static set of peers over gRPC.
pub struct GrpcTransport<P> {
    local: MemberId,
    cluster: String,
    peers: BTreeMap<MemberId, String>,
    clients: Mutex<HashMap<MemberId, RebalanceServiceClient<Channel>>>,
    handler: HandlerSlot<P>,
}

impl<P: Payload> GrpcTransport<P> {
    /// `peers` maps member ids to `host:port`; an entry for `local` is
    /// ignored.
    pub fn new(
        local: MemberId,
        cluster: impl Into<String>,
        peers: impl IntoIterator<Item = (MemberId, String)>,
    ) -> Self {
        let peers: BTreeMap<_, _> = peers.into_iter().filter(|(m, _)| *m != local).collect();
        Self {
            local,
            cluster: cluster.into(),
            peers,
            clients: Mutex::new(HashMap::new()),
            handler: Arc::new(RwLock::new(None)),
        }
    }

    /// Server half sharing this transport's handler registration.
    pub fn server(&self) -> RebalanceServer<P> {
        RebalanceServer::new(self.local.clone(), self.cluster.clone(), Arc::clone(&self.handler))
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Configured peers, excluding the local member.
    pub fn peers(&self) -> impl Iterator<Item = &MemberId> {
        self.peers.keys()
    }

    pub fn is_joined(&self) -> bool {
        current_handler(&self.handler).is_some()
    }

    /// Ping `member`; returns whether it has joined the cluster.
    pub async fn ping(&self, member: &MemberId, timeout: Duration) -> TransportResult<bool> {
        let mut client = self.client(member)?;
        let request = PingRequest {
            cluster: self.cluster.clone(),
            from: self.local.to_string(),
        };
        let response = self
            .call(member, timeout, client.ping(request))
            .await?
            .into_inner();
        if response.member != member.as_str() {
            return Err(TransportError::Rejected {
                member: member.clone(),
                kind: "ping".to_string(),
                reason: format!("answered as {}", response.member),
            });
        }
        Ok(response.ready)
    }

    fn client(&self, member: &MemberId) -> TransportResult<RebalanceServiceClient<Channel>> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(member) {
            return Ok(client.clone());
        }

        let addr = self.peers.get(member).ok_or_else(|| TransportError::Unreachable {
            member: member.clone(),
            reason: "unknown peer".to_string(),
        })?;
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| TransportError::Unreachable {
                member: member.clone(),
                reason: format!("invalid endpoint {addr}: {e}"),
            })?
            .connect_timeout(CONNECT_TIMEOUT);

        debug!(%member, %addr, "opening channel to peer");
        let client = RebalanceServiceClient::new(endpoint.connect_lazy());
        clients.insert(member.clone(), client.clone());
        Ok(client)
    }

    fn forget(&self, member: &MemberId) {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(member);
    }

    async fn call<T>(
        &self,
        member: &MemberId,
        timeout: Duration,
        rpc: impl std::future::Future<Output = Result<tonic::Response<T>, Status>>,
    ) -> TransportResult<tonic::Response<T>> {
        match tokio::time::timeout(timeout, rpc).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(status)) => Err(self.status_error(member, status)),
            Err(_) => Err(TransportError::TimedOut {
                member: member.clone(),
                timeout,
            }),
        }
    }

    fn status_error(&self, member: &MemberId, status: Status) -> TransportError {
        match status.code() {
            Code::Unavailable | Code::Unknown => {
                self.forget(member);
                TransportError::Unreachable {
                    member: member.clone(),
                    reason: status.message().to_string(),
                }
            }
            _ => TransportError::Rejected {
                member: member.clone(),
                kind: "rpc".to_string(),
                reason: status.to_string(),
            },
        }
    }

    async fn fetch_snapshot(
        &self,
        member: &MemberId,
        timeout: Duration,
    ) -> TransportResult<Snapshot<P>> {
        let mut client = self.client(member)?;
        let request = SnapshotRequest {
            cluster: self.cluster.clone(),
            from: self.local.to_string(),
        };
        let response = self
            .call(member, timeout, client.fetch_snapshot(request))
            .await?
            .into_inner();
        if !response.error.is_empty() {
            return Err(TransportError::Rejected {
                member: member.clone(),
                kind: "snapshot_request".to_string(),
                reason: response.error,
            });
        }
        Snapshot::decode(&response.data).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

#[async_trait]
impl<P: Payload> Transport<P> for GrpcTransport<P> {
    fn local_member(&self) -> &MemberId {
        &self.local
    }

    async fn join(&self, cluster: &str, handler: Arc<dyn CommandHandler<P>>)
        -> TransportResult<()> {
        if cluster != self.cluster {
            return Err(TransportError::ClusterMismatch {
                expected: self.cluster.clone(),
                actual: cluster.to_string(),
            });
        }
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Err(TransportError::AlreadyJoined(cluster.to_string()));
        }
        *slot = Some(handler);
        info!(cluster, member = %self.local, peers = self.peers.len(), "joined cluster");
        Ok(())
    }

    async fn leave(&self) -> TransportResult<()> {
        let previous = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match previous {
            Some(_) => {
                info!(cluster = %self.cluster, member = %self.local, "left cluster");
                Ok(())
            }
            None => Err(TransportError::NotJoined),
        }
    }

    async fn send_to(
        &self,
        member: &MemberId,
        command: Command<P>,
        timeout: Duration,
    ) -> TransportResult<()> {
        let kind = command.kind();

        if *member == self.local {
            let handler = current_handler(&self.handler).ok_or(TransportError::NotJoined)?;
            return match tokio::time::timeout(timeout, handler.handle(self.local.clone(), command))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::Rejected {
                    member: member.clone(),
                    kind: kind.to_string(),
                    reason: format!("{e:#}"),
                }),
                Err(_) => Err(TransportError::TimedOut {
                    member: member.clone(),
                    timeout,
                }),
            };
        }

        let mut client = self.client(member)?;
        let request = CommandRequest {
            cluster: self.cluster.clone(),
            from: self.local.to_string(),
            data: command.encode()?,
        };
        let response = self
            .call(member, timeout, client.deliver(request))
            .await?
            .into_inner();
        if response.error.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                member: member.clone(),
                kind: kind.to_string(),
                reason: response.error,
            })
        }
    }

    /// Ask peers in member order; the lowest live member coordinates
    /// under `HeartbeatMembership`, so the first answer comes from it.
    /// Peers that are down, not joined or not yet replicated are skipped;
    /// any other failure aborts the request.
    async fn request_snapshot(&self, timeout: Duration) -> TransportResult<Option<Snapshot<P>>> {
        for member in self.peers.keys() {
            match self.fetch_snapshot(member, timeout).await {
                Ok(snapshot) => {
                    debug!(from = %member, payloads = snapshot.payloads.len(), "snapshot fetched");
                    return Ok(Some(snapshot));
                }
                Err(e @ TransportError::Unreachable { .. }) => {
                    debug!(%member, error = %e, "no snapshot from peer, trying next");
                }
                Err(e) => {
                    warn!(%member, error = %e, "snapshot request failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }
}

//! Inbound side of the gRPC transport.

use tonic::{Request, Response, Status};
use tracing::debug;

use rotagrid_state::{MemberId, Payload};

use super::proto::rebalance_service_server::{RebalanceService, RebalanceServiceServer};
use super::proto::{
    CommandRequest, CommandResponse, PingRequest, PingResponse, SnapshotRequest,
    SnapshotResponse,
};
use super::{current_handler, HandlerSlot};
use crate::command::Command;

/// gRPC implementation of the rebalance service.
///
/// Obtained from `GrpcTransport::server`; commands are answered with
/// `unavailable` until the transport has joined.
pub struct RebalanceServer<P> {
    local: MemberId,
    cluster: String,
    handler: HandlerSlot<P>,
}

impl<P: Payload> RebalanceServer<P> {
    pub(super) fn new(local: MemberId, cluster: String, handler: HandlerSlot<P>) -> Self {
        Self {
            local,
            cluster,
            handler,
        }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> RebalanceServiceServer<Self> {
        RebalanceServiceServer::new(self)
    }

    fn check_cluster(&self, cluster: &str) -> Result<(), Status> {
        if cluster == self.cluster {
            Ok(())
        } else {
            Err(Status::failed_precondition(format!(
                "cluster mismatch: this is {}, caller is in {cluster}",
                self.cluster
            )))
        }
    }
}

#[tonic::async_trait]
impl<P: Payload> RebalanceService for RebalanceServer<P> {
    async fn deliver(
        &self,
        request: Request<CommandRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let req = request.into_inner();
        self.check_cluster(&req.cluster)?;

        let handler = current_handler(&self.handler)
            .ok_or_else(|| Status::unavailable(format!("{} has not joined", self.local)))?;
        let command = Command::<P>::decode(&req.data)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        debug!(from = %req.from, kind = command.kind(), "handling delivered command");
        let error = match handler.handle(MemberId::new(req.from), command).await {
            Ok(()) => String::new(),
            Err(e) => format!("{e:#}"),
        };
        Ok(Response::new(CommandResponse { error }))
    }

    async fn fetch_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let req = request.into_inner();
        self.check_cluster(&req.cluster)?;

        let handler = current_handler(&self.handler)
            .ok_or_else(|| Status::unavailable(format!("{} has not joined", self.local)))?;

        debug!(from = %req.from, "serving snapshot");
        let response = match handler.snapshot().await {
            Ok(None) => {
                return Err(Status::unavailable(format!(
                    "{} has not replicated the shared state yet",
                    self.local
                )));
            }
            Ok(Some(snapshot)) => SnapshotResponse {
                data: snapshot
                    .encode()
                    .map_err(|e| Status::internal(e.to_string()))?,
                error: String::new(),
            },
            Err(e) => SnapshotResponse {
                data: Vec::new(),
                error: format!("{e:#}"),
            },
        };
        Ok(Response::new(response))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let req = request.into_inner();
        self.check_cluster(&req.cluster)?;
        Ok(Response::new(PingResponse {
            member: self.local.to_string(),
            ready: current_handler(&self.handler).is_some(),
        }))
    }
}

//! gRPC transport and heartbeat membership for multi-process clusters.
//!
//! Every `rotad serve` process runs one `RebalanceServer` and one
//! `GrpcTransport` over a static peer list. Commands travel as JSON
//! bytes inside the protobuf envelope.

use std::sync::{Arc, RwLock};

use rotagrid_state::Payload;

use crate::transport::CommandHandler;

mod heartbeat;
mod server;
mod transport;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("rotagrid.cluster");
}

pub use heartbeat::{HeartbeatMembership, Suspicion};
pub use server::RebalanceServer;
pub use transport::GrpcTransport;

/// Handler registered by `join`, shared between transport and server.
type HandlerSlot<P> = Arc<RwLock<Option<Arc<dyn CommandHandler<P>>>>>;

fn current_handler<P: Payload>(slot: &HandlerSlot<P>) -> Option<Arc<dyn CommandHandler<P>>> {
    slot.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

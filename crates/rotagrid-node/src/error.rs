//! Node error types.

use thiserror::Error;

use rotagrid_cluster::TransportError;
use rotagrid_state::{BarrierError, MemberId, StateError};

/// Errors surfaced to the embedding application.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("quorum insufficient: view has {view_size} members, quorum is {quorum}")]
    QuorumInsufficient { view_size: usize, quorum: usize },

    #[error("join-time snapshot transfer failed: {0}")]
    Snapshot(#[source] TransportError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("node is already connected")]
    AlreadyConnected,

    #[error("node is not connected")]
    NotConnected,
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Why a rebalance run did not complete.
///
/// Never returned to the embedding application; the worker logs it and
/// waits for the next trigger.
#[derive(Debug, Error)]
pub enum RebalanceError {
    #[error("not the leader")]
    NotLeader,

    #[error("cannot operate: view has {view_size} members, quorum is {quorum}")]
    NotOperable { view_size: usize, quorum: usize },

    #[error("stop broadcast failed: {0}")]
    Stop(#[source] TransportError),

    #[error("stop barrier failed: {0}")]
    Barrier(#[from] BarrierError),

    #[error("start of item on {member} failed: {error}")]
    Start {
        member: MemberId,
        #[source]
        error: TransportError,
    },

    #[error("state error: {0}")]
    State(#[from] StateError),
}

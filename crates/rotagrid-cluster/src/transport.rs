//! Transport — reliable point-to-point delivery between members.
//!
//! Calls are synchronous from the caller's point of view: `send_to`
//! resolves once the remote handler has processed the command, failed,
//! or the caller-supplied timeout elapsed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use rotagrid_state::{MemberId, Payload, Snapshot, View};

use crate::command::Command;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while talking to other members.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("member {member} is unreachable: {reason}")]
    Unreachable { member: MemberId, reason: String },

    #[error("call to {member} timed out after {timeout:?}")]
    TimedOut { member: MemberId, timeout: Duration },

    #[error("member {member} rejected {kind}: {reason}")]
    Rejected {
        member: MemberId,
        kind: String,
        reason: String,
    },

    #[error("cluster name mismatch: expected {expected}, got {actual}")]
    ClusterMismatch { expected: String, actual: String },

    #[error("already joined cluster {0}")]
    AlreadyJoined(String),

    #[error("not joined to a cluster")]
    NotJoined,

    #[error("codec error: {0}")]
    Codec(String),
}

/// Receiving side of the protocol, implemented by the node.
#[async_trait]
pub trait CommandHandler<P: Payload>: Send + Sync {
    /// Process one inbound command sent by `from`.
    async fn handle(&self, from: MemberId, command: Command<P>) -> anyhow::Result<()>;

    /// Serve the local shared state to a joining member.
    ///
    /// `None` while this member has not replicated the state itself; the
    /// joiner then asks someone else.
    async fn snapshot(&self) -> anyhow::Result<Option<Snapshot<P>>>;
}

/// Sending side of the protocol.
#[async_trait]
pub trait Transport<P: Payload>: Send + Sync {
    /// The member this transport sends as.
    fn local_member(&self) -> &MemberId;

    /// Join `cluster`, routing inbound commands to `handler`.
    async fn join(&self, cluster: &str, handler: Arc<dyn CommandHandler<P>>)
        -> TransportResult<()>;

    async fn leave(&self) -> TransportResult<()>;

    /// Unicast `command` to `member` and wait for it to be handled.
    async fn send_to(
        &self,
        member: &MemberId,
        command: Command<P>,
        timeout: Duration,
    ) -> TransportResult<()>;

    /// Deliver `command` to every member of `view`.
    ///
    /// Every member is attempted even after a failure; the first error
    /// is returned.
    async fn send_to_all(
        &self,
        view: &View,
        command: Command<P>,
        timeout: Duration,
    ) -> TransportResult<()> {
        let mut first_error = None;
        for member in view.members() {
            if let Err(e) = self.send_to(member, command.clone(), timeout).await {
                warn!(%member, kind = command.kind(), error = %e, "broadcast delivery failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fetch the shared state from another member, coordinator first.
    ///
    /// Returns `None` only when no other member is joined and ready
    /// (first node). A member that was reached but failed, timed out or
    /// refused makes the whole request fail.
    async fn request_snapshot(&self, timeout: Duration) -> TransportResult<Option<Snapshot<P>>>;
}

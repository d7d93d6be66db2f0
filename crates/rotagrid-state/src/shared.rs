//! SharedState — actor owning the canonical payload list.
//!
//! All reads and writes of the list go through one mailbox, so a
//! snapshot is always taken between two whole mutations. The
//! confirmation table is owned by the `ConfirmationBarrier`; the actor
//! only reads it for snapshots and replaces it when a snapshot is
//! applied.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::barrier::ConfirmationBarrier;
use crate::error::{StateError, StateResult};
use crate::snapshot::Snapshot;

const MAILBOX_CAPACITY: usize = 64;

enum Request<P> {
    Payloads(oneshot::Sender<Vec<P>>),
    Replace {
        payloads: Vec<P>,
        reply: oneshot::Sender<()>,
    },
    SeedIfEmpty {
        payloads: Vec<P>,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<Snapshot<P>>),
    Apply {
        snapshot: Snapshot<P>,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a node's shared assignment state.
///
/// Cheap to clone; the actor stops when the last handle is dropped.
#[derive(Clone)]
pub struct SharedState<P> {
    tx: mpsc::Sender<Request<P>>,
    barrier: ConfirmationBarrier,
}

impl<P: Clone + Send + 'static> SharedState<P> {
    /// Spawn the state actor on the current tokio runtime.
    pub fn spawn(payloads: Vec<P>) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let barrier = ConfirmationBarrier::new();
        tokio::spawn(run(rx, payloads, barrier.clone()));
        Self { tx, barrier }
    }

    /// The confirmation barrier whose table is part of this state.
    pub fn barrier(&self) -> &ConfirmationBarrier {
        &self.barrier
    }

    /// Current canonical list, in iteration order.
    pub async fn payloads(&self) -> StateResult<Vec<P>> {
        self.call(Request::Payloads).await
    }

    /// Replace the canonical list.
    pub async fn replace(&self, payloads: Vec<P>) -> StateResult<()> {
        self.call(|reply| Request::Replace { payloads, reply }).await
    }

    /// Install `payloads` only if the canonical list is empty. Returns
    /// whether the list was seeded.
    pub async fn seed_if_empty(&self, payloads: Vec<P>) -> StateResult<bool> {
        self.call(|reply| Request::SeedIfEmpty { payloads, reply })
            .await
    }

    /// Consistent copy of (list, confirmation table).
    pub async fn snapshot(&self) -> StateResult<Snapshot<P>> {
        self.call(Request::Snapshot).await
    }

    /// Replace list and confirmation table wholesale.
    pub async fn apply(&self, snapshot: Snapshot<P>) -> StateResult<()> {
        self.call(|reply| Request::Apply { snapshot, reply }).await
    }

    async fn call<R>(
        &self,
        request: impl FnOnce(oneshot::Sender<R>) -> Request<P>,
    ) -> StateResult<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| StateError::Closed)?;
        reply_rx.await.map_err(|_| StateError::Closed)
    }
}

async fn run<P: Clone>(
    mut rx: mpsc::Receiver<Request<P>>,
    mut payloads: Vec<P>,
    barrier: ConfirmationBarrier,
) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::Payloads(reply) => {
                let _ = reply.send(payloads.clone());
            }
            Request::Replace {
                payloads: next,
                reply,
            } => {
                info!(from = payloads.len(), to = next.len(), "canonical payload list replaced");
                payloads = next;
                let _ = reply.send(());
            }
            Request::SeedIfEmpty {
                payloads: seed,
                reply,
            } => {
                let seeded = payloads.is_empty() && !seed.is_empty();
                if seeded {
                    info!(count = seed.len(), "canonical payload list seeded");
                    payloads = seed;
                }
                let _ = reply.send(seeded);
            }
            Request::Snapshot(reply) => {
                let _ = reply.send(Snapshot::new(payloads.clone(), barrier.table()));
            }
            Request::Apply { snapshot, reply } => {
                info!(
                    payloads = snapshot.payloads.len(),
                    epoch = snapshot.confirmations.epoch(),
                    "applying replicated snapshot"
                );
                payloads = snapshot.payloads;
                barrier.restore(snapshot.confirmations);
                let _ = reply.send(());
            }
        }
    }
    debug!("shared state actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ConfirmationTable;
    use crate::types::MemberId;

    #[tokio::test]
    async fn replace_and_read_back() {
        let state = SharedState::spawn(vec![1, 2, 3]);
        assert_eq!(state.payloads().await.unwrap(), vec![1, 2, 3]);

        state.replace(vec![4, 5]).await.unwrap();
        assert_eq!(state.payloads().await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn seed_only_fills_empty_list() {
        let state = SharedState::spawn(Vec::new());
        assert!(state.seed_if_empty(vec![1, 2]).await.unwrap());
        assert!(!state.seed_if_empty(vec![9]).await.unwrap());
        assert_eq!(state.payloads().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn snapshot_includes_confirmation_table() {
        let state = SharedState::spawn(vec!["x"]);
        let epoch = state.barrier().reset(&[MemberId::from("a"), MemberId::from("b")]);
        state.barrier().confirm(epoch, &"b".into());

        let snapshot = state.snapshot().await.unwrap();
        assert_eq!(snapshot.payloads, vec!["x"]);
        assert_eq!(snapshot.confirmations.get(&"a".into()), Some(false));
        assert_eq!(snapshot.confirmations.get(&"b".into()), Some(true));
    }

    #[tokio::test]
    async fn apply_replaces_everything() {
        let leader = SharedState::spawn(vec![1, 2, 3, 4, 5]);
        leader.barrier().reset(&[MemberId::from("a")]);

        let joiner = SharedState::spawn(vec![1, 2, 3]);
        joiner.apply(leader.snapshot().await.unwrap()).await.unwrap();

        assert_eq!(joiner.payloads().await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(joiner.barrier().table(), leader.barrier().table());
    }

    #[tokio::test]
    async fn handles_share_one_actor() {
        let state = SharedState::spawn(Vec::<u8>::new());
        let other = state.clone();
        other.replace(vec![7]).await.unwrap();
        assert_eq!(state.payloads().await.unwrap(), vec![7]);
        assert_eq!(state.snapshot().await.unwrap().confirmations, ConfirmationTable::default());
    }
}

//! Confirmation barrier — waits until every member has stopped.
//!
//! The table lives inside a `tokio::sync::watch` channel. Waiters check
//! the current value before sleeping, so a confirmation that lands
//! between `reset` and `wait_all` is never missed, and the epoch check
//! lets a newer run supersede an older waiter.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::table::ConfirmationTable;
use crate::types::MemberId;

/// Why a barrier wait ended without every confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    #[error("timed out waiting for stop confirmations (epoch {epoch}, pending {pending:?})")]
    TimedOut { epoch: u64, pending: Vec<MemberId> },

    #[error("barrier epoch {epoch} superseded by epoch {current}")]
    Superseded { epoch: u64, current: u64 },

    #[error("confirmation barrier closed")]
    Closed,
}

/// Shared handle to the confirmation table of the current run.
#[derive(Clone)]
pub struct ConfirmationBarrier {
    table: Arc<watch::Sender<ConfirmationTable>>,
}

impl ConfirmationBarrier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConfirmationTable::default());
        Self { table: Arc::new(tx) }
    }

    /// Begin a run expecting one confirmation per member. Returns the
    /// run epoch that confirmations must carry.
    pub fn reset(&self, expected: &[MemberId]) -> u64 {
        let mut epoch = 0;
        self.table.send_modify(|table| epoch = table.reset(expected));
        debug!(epoch, expected = expected.len(), "confirmation barrier reset");
        epoch
    }

    /// Record that `member` stopped everything for run `epoch`.
    ///
    /// Returns `false` for stale, unknown or repeated confirmations.
    pub fn confirm(&self, epoch: u64, member: &MemberId) -> bool {
        self.table.send_if_modified(|table| table.confirm(epoch, member))
    }

    /// Wait until every expected member of run `epoch` has confirmed.
    pub async fn wait_all(&self, epoch: u64, timeout: Duration) -> Result<(), BarrierError> {
        let mut rx = self.table.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|table| table.epoch() != epoch || table.is_complete()),
        )
        .await;

        match waited {
            Ok(Ok(table)) if table.epoch() == epoch => Ok(()),
            Ok(Ok(table)) => Err(BarrierError::Superseded {
                epoch,
                current: table.epoch(),
            }),
            Ok(Err(_)) => Err(BarrierError::Closed),
            Err(_) => {
                let pending = self.table.borrow().pending();
                warn!(epoch, ?pending, "stop confirmations timed out");
                Err(BarrierError::TimedOut { epoch, pending })
            }
        }
    }

    /// Discard the entries of run `epoch` once it has completed.
    pub fn clear(&self, epoch: u64) {
        self.table.send_if_modified(|table| {
            if table.epoch() == epoch && !table.is_empty() {
                table.clear();
                true
            } else {
                false
            }
        });
    }

    /// Consistent copy of the current table.
    pub fn table(&self) -> ConfirmationTable {
        self.table.borrow().clone()
    }

    /// Replace the table with one received from another node.
    pub fn restore(&self, incoming: ConfirmationTable) {
        self.table.send_modify(|table| {
            let floor = table.epoch();
            *table = incoming;
            table.raise_epoch(floor);
        });
    }
}

impl Default for ConfirmationBarrier {
    fn default() -> Self {
        Self::new()
    }
}

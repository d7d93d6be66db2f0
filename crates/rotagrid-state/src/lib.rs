//! rotagrid-state — shared assignment state for rotagrid.
//!
//! Holds the data every node keeps about the cluster-wide work
//! distribution: the canonical payload list and the per-run
//! confirmation table, plus the domain types they are built from.
//!
//! # Architecture
//!
//! ```text
//! SharedState (actor, one mailbox)
//!   ├── canonical payload list  (written only through the mailbox)
//!   └── ConfirmationBarrier     (watch channel over ConfirmationTable)
//!         ├── reset(members)  → new run epoch
//!         ├── confirm(epoch, member)
//!         └── wait_all(epoch, timeout)
//! ```
//!
//! `Snapshot` is the unit of replication: a joining node receives one
//! wholesale before it handles any protocol command.

pub mod barrier;
pub mod error;
pub mod shared;
pub mod snapshot;
pub mod table;
pub mod types;

pub use barrier::{BarrierError, ConfirmationBarrier};
pub use error::{StateError, StateResult};
pub use shared::SharedState;
pub use snapshot::Snapshot;
pub use table::ConfirmationTable;
pub use types::*;

//! Snapshot — the unit of shared-state replication.
//!
//! A joining node receives one snapshot before it processes any
//! protocol command. On the wire a snapshot is plain JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::table::ConfirmationTable;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Immutable copy of (canonical payload list, confirmation table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<P> {
    pub payloads: Vec<P>,
    pub confirmations: ConfirmationTable,
}

impl<P> Snapshot<P> {
    pub fn new(payloads: Vec<P>, confirmations: ConfirmationTable) -> Self {
        Self {
            payloads,
            confirmations,
        }
    }
}

impl<P: Serialize + DeserializeOwned> Snapshot<P> {
    pub fn encode(&self) -> StateResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(map_err!(Serialize))
    }

    pub fn decode(bytes: &[u8]) -> StateResult<Self> {
        serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
    }
}

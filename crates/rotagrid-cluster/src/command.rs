//! Logical protocol commands exchanged between nodes.
//!
//! The byte format belongs to the transport; every transport in this
//! crate frames a JSON-encoded `Command` inside its own envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rotagrid_state::{MemberId, Snapshot};

use crate::transport::{TransportError, TransportResult};

/// A protocol message addressed to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command<P> {
    /// Stop every locally running item, then confirm run `epoch`.
    StopAll { epoch: u64 },
    /// Start one item on the receiving node.
    StartItem { payload: P },
    /// `member` stopped everything for run `epoch`.
    Confirm { epoch: u64, member: MemberId },
    /// Refreshed canonical state pushed after `set_payloads`.
    Snapshot { snapshot: Snapshot<P> },
}

impl<P> Command<P> {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::StopAll { .. } => "stop_all",
            Command::StartItem { .. } => "start_item",
            Command::Confirm { .. } => "confirm",
            Command::Snapshot { .. } => "snapshot",
        }
    }
}

impl<P: Serialize + DeserializeOwned> Command<P> {
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TransportError::Codec(format!("encode command: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TransportError::Codec(format!("decode command: {e}")))
    }
}

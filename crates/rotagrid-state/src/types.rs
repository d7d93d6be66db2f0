//! Domain types shared by every rotagrid crate.
//!
//! `MemberId` and `View` describe who is in the cluster; `Payload` is
//! the contract a caller's work item implements so the protocol can
//! start, stop and ship it between nodes.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Member ─────────────────────────────────────────────────────────

/// Opaque, totally ordered identifier of a cluster participant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ── View ───────────────────────────────────────────────────────────

/// Ordered, deduplicated member list valid at one point in time.
///
/// Each view supersedes the previous one; `id` increases with every
/// membership change reported by the provider. The first member is the
/// view's coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    id: u64,
    members: Vec<MemberId>,
}

impl View {
    /// Build a view, dropping duplicate members (first occurrence wins).
    pub fn new(id: u64, members: impl IntoIterator<Item = MemberId>) -> Self {
        let mut deduped: Vec<MemberId> = Vec::new();
        for member in members {
            if !deduped.contains(&member) {
                deduped.push(member);
            }
        }
        Self {
            id,
            members: deduped,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    /// The oldest member of the view, if any.
    pub fn coordinator(&self) -> Option<&MemberId> {
        self.members.first()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|", self.id)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{member}")?;
        }
        f.write_str("]")
    }
}

// ── Payload ────────────────────────────────────────────────────────

/// A unit of work distributed across the cluster.
///
/// The protocol calls `start`/`stop` synchronously on the node the item
/// is assigned to. Errors are logged and otherwise ignored: what a
/// failed start means is up to the implementor.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Id: Clone + Eq + fmt::Debug + fmt::Display + Send + Sync;

    fn id(&self) -> Self::Id;

    fn start(&self) -> anyhow::Result<()>;

    fn stop(&self) -> anyhow::Result<()>;
}

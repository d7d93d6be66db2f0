//! Operability gate — may this partition run items at all?

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use rotagrid_cluster::Leadership;
use rotagrid_state::View;

use crate::error::NodeError;

pub struct OperabilityGate {
    leadership: Arc<dyn Leadership>,
    /// Last observed answer, for transition logging.
    operable: AtomicBool,
}

impl OperabilityGate {
    pub fn new(leadership: Arc<dyn Leadership>) -> Self {
        Self {
            leadership,
            operable: AtomicBool::new(false),
        }
    }

    pub fn quorum(&self) -> usize {
        self.leadership.quorum_size()
    }

    /// `|view| >= quorum`.
    pub fn can_operate(&self, view: &View) -> bool {
        view.len() >= self.quorum()
    }

    /// Like `can_operate`, but rejects with `QuorumInsufficient`.
    pub fn check(&self, view: &View) -> Result<(), NodeError> {
        if self.can_operate(view) {
            Ok(())
        } else {
            Err(NodeError::QuorumInsufficient {
                view_size: view.len(),
                quorum: self.quorum(),
            })
        }
    }

    /// Evaluate `view` and log a transition when the answer changed.
    pub fn observe(&self, view: &View) -> bool {
        let now = self.can_operate(view);
        let before = self.operable.swap(now, Ordering::AcqRel);
        match (before, now) {
            (false, true) => info!(%view, quorum = self.quorum(), "quorum reached, node can operate"),
            (true, false) => warn!(%view, quorum = self.quorum(), "quorum lost, node cannot operate"),
            _ => {}
        }
        now
    }

    /// Answer of the most recent `observe`.
    pub fn last_observed(&self) -> bool {
        self.operable.load(Ordering::Acquire)
    }
}

//! Rebalance coordinator — the leader-only stop → confirm → start run.
//!
//! ```text
//! leader                      every member (incl. leader)
//!   │ reset barrier (epoch N)
//!   │ StopAll{N} ───────────────▶ stop running set
//!   │ ◀──────────────────────── Confirm{N, member}
//!   │ wait_all(N)
//!   │ plan (round-robin by default)
//!   │ StartItem(p1) ───────────▶ m1
//!   │ StartItem(p2) ───────────▶ m2 ...
//! ```
//!
//! Runs are serialized through one worker task fed by a `watch`
//! channel, so triggers that arrive during a run collapse into a single
//! follow-up run over the newest view.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rotagrid_cluster::{Command, Leadership, Transport};
use rotagrid_state::{MemberId, Payload, SharedState, View};

use crate::config::NodeConfig;
use crate::error::RebalanceError;
use crate::gate::OperabilityGate;
use crate::plan::{AssignmentStrategy, RoundRobinStrategy};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub epoch: u64,
    pub view_id: u64,
    /// (target, item id) in start order.
    pub assignments: Vec<(MemberId, String)>,
}

pub struct RebalanceCoordinator<P: Payload> {
    state: SharedState<P>,
    transport: Arc<dyn Transport<P>>,
    leadership: Arc<dyn Leadership>,
    gate: Arc<OperabilityGate>,
    strategy: Arc<dyn AssignmentStrategy<P>>,
    config: NodeConfig,
}

impl<P: Payload> RebalanceCoordinator<P> {
    pub fn new(
        state: SharedState<P>,
        transport: Arc<dyn Transport<P>>,
        leadership: Arc<dyn Leadership>,
        gate: Arc<OperabilityGate>,
        config: NodeConfig,
    ) -> Self {
        Self {
            state,
            transport,
            leadership,
            gate,
            strategy: Arc::new(RoundRobinStrategy),
            config,
        }
    }

    /// Replace the default round-robin placement.
    pub fn with_strategy(mut self, strategy: Arc<dyn AssignmentStrategy<P>>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run one rebalance over `view`.
    ///
    /// Stops already applied are not rolled back when a later step
    /// fails; the next trigger starts from scratch.
    pub async fn rebalance(&self, view: &View) -> Result<RebalanceReport, RebalanceError> {
        if !self.leadership.is_leader() {
            return Err(RebalanceError::NotLeader);
        }
        if !self.gate.can_operate(view) {
            return Err(RebalanceError::NotOperable {
                view_size: view.len(),
                quorum: self.gate.quorum(),
            });
        }

        let payloads = self.state.payloads().await?;
        let barrier = self.state.barrier();
        let epoch = barrier.reset(view.members());
        info!(epoch, %view, payloads = payloads.len(), "rebalance started");

        self.transport
            .send_to_all(view, Command::StopAll { epoch }, self.config.call_timeout)
            .await
            .map_err(RebalanceError::Stop)?;
        barrier.wait_all(epoch, self.config.confirm_timeout).await?;
        barrier.clear(epoch);
        debug!(epoch, "all members confirmed stop");

        let plan = self.strategy.plan(&payloads, view);
        let mut assignments = Vec::with_capacity(plan.len());
        for (member, payload) in plan {
            let id = payload.id().to_string();
            self.transport
                .send_to(&member, Command::StartItem { payload }, self.config.call_timeout)
                .await
                .map_err(|error| RebalanceError::Start {
                    member: member.clone(),
                    error,
                })?;
            debug!(epoch, %member, %id, "item assigned");
            assignments.push((member, id));
        }

        info!(epoch, view_id = view.id(), started = assignments.len(), "rebalance completed");
        Ok(RebalanceReport {
            epoch,
            view_id: view.id(),
            assignments,
        })
    }

    /// Spawn the worker that executes triggered runs one at a time.
    pub fn spawn_worker(
        self: Arc<Self>,
        trigger: &RebalanceTrigger,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut pending = trigger.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = pending.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = pending.borrow_and_update().clone();
                        let Some(view) = next else {
                            continue;
                        };
                        tokio::select! {
                            result = self.rebalance(&view) => log_outcome(&view, result),
                            _ = shutdown.changed() => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("rebalance worker stopped");
        })
    }
}

fn log_outcome(view: &View, result: Result<RebalanceReport, RebalanceError>) {
    match result {
        Ok(_) => {}
        Err(e @ (RebalanceError::NotLeader | RebalanceError::NotOperable { .. })) => {
            debug!(%view, reason = %e, "rebalance skipped");
        }
        Err(e) => warn!(%view, error = %e, "rebalance aborted"),
    }
}

/// Coalescing trigger for the rebalance worker. Only the newest
/// pending view is kept.
#[derive(Clone)]
pub struct RebalanceTrigger {
    tx: Arc<watch::Sender<Option<View>>>,
}

impl RebalanceTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn fire(&self, view: View) {
        debug!(%view, "rebalance triggered");
        self.tx.send_replace(Some(view));
    }

    fn subscribe(&self) -> watch::Receiver<Option<View>> {
        let mut rx = self.tx.subscribe();
        rx.mark_unchanged();
        rx
    }
}

impl Default for RebalanceTrigger {
    fn default() -> Self {
        Self::new()
    }
}

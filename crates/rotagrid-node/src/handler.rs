//! Local lifecycle handler — executes stop/start commands against the
//! items running on this node.
//!
//! The running set is only ever mutated here. Stops happen while the
//! set is locked, so a start that races a stop always sees the set
//! either before or after the whole stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rotagrid_cluster::{Command, Transport, TransportResult};
use rotagrid_state::{ConfirmationBarrier, MemberId, Payload};

use crate::listener::Listeners;

/// Decides whether a start may proceed; evaluated under the running-set
/// lock.
pub type Admission = Box<dyn Fn() -> bool + Send + Sync>;

pub struct LifecycleHandler<P: Payload> {
    local: MemberId,
    running: Mutex<Vec<P>>,
    admission: Option<Admission>,
    barrier: ConfirmationBarrier,
    listeners: Listeners<P>,
    transport: Arc<dyn Transport<P>>,
    call_timeout: Duration,
}

impl<P: Payload> LifecycleHandler<P> {
    pub fn new(
        transport: Arc<dyn Transport<P>>,
        barrier: ConfirmationBarrier,
        listeners: Listeners<P>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            local: transport.local_member().clone(),
            running: Mutex::new(Vec::new()),
            admission: None,
            barrier,
            listeners,
            transport,
            call_timeout,
        }
    }

    /// Refuse starts while `admit` returns false.
    pub fn with_admission(mut self, admit: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.admission = Some(Box::new(admit));
        self
    }

    /// Stop everything, then confirm run `epoch` to `from`.
    ///
    /// A confirmation is sent even when nothing was running.
    pub async fn on_stop_all(&self, from: &MemberId, epoch: u64) -> TransportResult<()> {
        let stopped = self.stop_running().await;
        info!(member = %self.local, %from, epoch, stopped = stopped.len(), "stopped all local items");
        if !stopped.is_empty() {
            self.listeners.stopped(&stopped);
        }

        if *from == self.local {
            self.on_confirm(epoch, &self.local);
            return Ok(());
        }
        let confirm = Command::Confirm {
            epoch,
            member: self.local.clone(),
        };
        self.transport.send_to(from, confirm, self.call_timeout).await
    }

    /// Start `payload` locally unless it is already running here.
    ///
    /// Returns `false` when admission refused the start.
    pub async fn on_start(&self, payload: P) -> bool {
        {
            let mut running = self.running.lock().await;
            if running.iter().any(|p| p.id() == payload.id()) {
                debug!(member = %self.local, id = %payload.id(), "item already running, start ignored");
                return true;
            }
            if self.admission.as_ref().is_some_and(|admit| !admit()) {
                warn!(member = %self.local, id = %payload.id(), "start refused, node cannot operate");
                return false;
            }
            if let Err(e) = payload.start() {
                warn!(member = %self.local, id = %payload.id(), error = %e, "item start failed");
            }
            running.push(payload.clone());
        }
        info!(member = %self.local, id = %payload.id(), "item started");
        self.listeners.started(&payload);
        true
    }

    pub fn on_confirm(&self, epoch: u64, member: &MemberId) {
        if self.barrier.confirm(epoch, member) {
            debug!(%member, epoch, "stop confirmed");
        } else {
            debug!(%member, epoch, "stale or duplicate confirmation ignored");
        }
    }

    /// Proactive stop without confirmation. Returns the stopped items.
    pub async fn stop_local(&self) -> Vec<P> {
        let stopped = self.stop_running().await;
        if !stopped.is_empty() {
            info!(member = %self.local, stopped = stopped.len(), "stopped local items proactively");
            self.listeners.stopped(&stopped);
        }
        stopped
    }

    /// Items this node currently believes it runs.
    pub async fn running(&self) -> Vec<P> {
        self.running.lock().await.clone()
    }

    async fn stop_running(&self) -> Vec<P> {
        let mut running = self.running.lock().await;
        for payload in running.iter() {
            if let Err(e) = payload.stop() {
                warn!(member = %self.local, id = %payload.id(), error = %e, "item stop failed");
            }
        }
        std::mem::take(&mut *running)
    }
}

//! Heartbeat membership over a static peer list.
//!
//! Every `interval` the local member pings each configured peer. A peer
//! enters the view once it answers as joined and leaves it after
//! `suspect_after` consecutive failed pings. Views are ordered by
//! member id, so every member that sees the same live set agrees on
//! the coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rotagrid_state::{MemberId, Payload, View};

use super::transport::GrpcTransport;
use crate::membership::Membership;
use crate::transport::Transport;

/// Failure-detector bookkeeping, independent of the network.
#[derive(Debug, Clone)]
pub struct Suspicion {
    suspect_after: u32,
    /// Consecutive misses per member that has answered at least once.
    misses: BTreeMap<MemberId, u32>,
}

impl Suspicion {
    pub fn new(suspect_after: u32) -> Self {
        Self {
            suspect_after: suspect_after.max(1),
            misses: BTreeMap::new(),
        }
    }

    /// Record one ping result for `member`.
    pub fn record(&mut self, member: &MemberId, answered: bool) {
        if answered {
            self.misses.insert(member.clone(), 0);
        } else if let Some(misses) = self.misses.get_mut(member) {
            *misses += 1;
            if *misses >= self.suspect_after {
                debug!(%member, misses = *misses, "peer suspected");
                self.misses.remove(member);
            }
        }
    }

    /// Members currently considered alive, in id order.
    pub fn alive(&self) -> impl Iterator<Item = &MemberId> {
        self.misses.keys()
    }
}

/// `Membership` fed by periodic gRPC pings.
pub struct HeartbeatMembership {
    view: Arc<watch::Sender<View>>,
    pinger: JoinHandle<()>,
}

impl HeartbeatMembership {
    pub fn spawn<P: Payload>(
        transport: Arc<GrpcTransport<P>>,
        interval: Duration,
        suspect_after: u32,
    ) -> Self {
        let (tx, _rx) = watch::channel(View::default());
        let view = Arc::new(tx);

        let pinger = tokio::spawn({
            let view = Arc::clone(&view);
            async move {
                let mut suspicion = Suspicion::new(suspect_after);
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    ping_once(&transport, &mut suspicion, interval).await;
                    publish(&view, &transport, &suspicion);
                }
            }
        });

        Self { view, pinger }
    }
}

impl Membership for HeartbeatMembership {
    fn current_view(&self) -> View {
        self.view.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<View> {
        self.view.subscribe()
    }
}

impl Drop for HeartbeatMembership {
    fn drop(&mut self) {
        self.pinger.abort();
    }
}

/// Ping every configured peer once.
async fn ping_once<P: Payload>(
    transport: &GrpcTransport<P>,
    suspicion: &mut Suspicion,
    timeout: Duration,
) {
    for peer in transport.peers() {
        let answered = match transport.ping(peer, timeout).await {
            Ok(ready) => ready,
            Err(e) => {
                debug!(%peer, error = %e, "ping failed");
                false
            }
        };
        suspicion.record(peer, answered);
    }
}

fn publish<P: Payload>(
    view: &watch::Sender<View>,
    transport: &GrpcTransport<P>,
    suspicion: &Suspicion,
) {
    let mut members: Vec<MemberId> = suspicion.alive().cloned().collect();
    if transport.is_joined() {
        members.push(transport.local_member().clone());
    }
    members.sort();

    view.send_if_modified(|current| {
        if current.members() == members.as_slice() {
            return false;
        }
        let next = View::new(current.id() + 1, members);
        info!(view = %next, "membership changed");
        *current = next;
        true
    });
}

//! Node façade — wires state, handler, gate and coordinator to the
//! cluster collaborators and exposes the public API.
//!
//! # Join sequence
//!
//! ```text
//! connect(cluster, initial)
//!   ├── transport.join(cluster, dispatcher)   commands queue behind `ready`
//!   ├── transport.request_snapshot()          failure → leave, error
//!   ├── state.apply(snapshot)
//!   ├── state.seed_if_empty(initial)
//!   ├── ready = true                          dispatcher starts serving
//!   └── spawn rebalance worker + event loop
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rotagrid_cluster::{Command, CommandHandler, Leadership, Membership, Role, Transport};
use rotagrid_state::{MemberId, Payload, SharedState, Snapshot, View};

use crate::config::NodeConfig;
use crate::coordinator::{RebalanceCoordinator, RebalanceTrigger};
use crate::plan::AssignmentStrategy;
use crate::error::{NodeError, NodeResult};
use crate::gate::OperabilityGate;
use crate::handler::LifecycleHandler;
use crate::listener::Listeners;

/// Point-in-time view of a node, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub member: MemberId,
    pub cluster: Option<String>,
    pub view_id: u64,
    pub view: Vec<MemberId>,
    pub role: Role,
    pub quorum: usize,
    pub voters: Vec<MemberId>,
    pub operable: bool,
    pub payloads: usize,
    pub running: Vec<String>,
}

struct Session {
    cluster: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// One participant of a rebalancing cluster.
pub struct Node<P: Payload> {
    local: MemberId,
    config: NodeConfig,
    transport: Arc<dyn Transport<P>>,
    membership: Arc<dyn Membership>,
    leadership: Arc<dyn Leadership>,
    state: SharedState<P>,
    listeners: Listeners<P>,
    handler: Arc<LifecycleHandler<P>>,
    gate: Arc<OperabilityGate>,
    coordinator: Arc<RebalanceCoordinator<P>>,
    trigger: RebalanceTrigger,
    reactor: Arc<EventLoop<P>>,
    ready: Arc<watch::Sender<bool>>,
    session: Mutex<Option<Session>>,
}

impl<P: Payload> Node<P> {
    /// Build a disconnected node. Must be called inside a tokio runtime.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport<P>>,
        membership: Arc<dyn Membership>,
        leadership: Arc<dyn Leadership>,
    ) -> Self {
        let local = transport.local_member().clone();
        let state = SharedState::spawn(Vec::new());
        let listeners = Listeners::default();
        let gate = Arc::new(OperabilityGate::new(Arc::clone(&leadership)));
        let handler = Arc::new(
            LifecycleHandler::new(
                Arc::clone(&transport),
                state.barrier().clone(),
                listeners.clone(),
                config.call_timeout,
            )
            .with_admission({
                let gate = Arc::clone(&gate);
                let membership = Arc::clone(&membership);
                move || gate.can_operate(&membership.current_view())
            }),
        );
        let coordinator = Arc::new(RebalanceCoordinator::new(
            state.clone(),
            Arc::clone(&transport),
            Arc::clone(&leadership),
            Arc::clone(&gate),
            config.clone(),
        ));
        let trigger = RebalanceTrigger::new();
        let reactor = Arc::new(EventLoop {
            local: local.clone(),
            membership: Arc::clone(&membership),
            leadership: Arc::clone(&leadership),
            gate: Arc::clone(&gate),
            handler: Arc::clone(&handler),
            trigger: trigger.clone(),
        });
        let (ready, _rx) = watch::channel(false);

        Self {
            local,
            config,
            transport,
            membership,
            leadership,
            state,
            listeners,
            handler,
            gate,
            coordinator,
            trigger,
            reactor,
            ready: Arc::new(ready),
            session: Mutex::new(None),
        }
    }

    /// Place payloads with `strategy` instead of round-robin when this
    /// node leads a run.
    pub fn with_strategy(mut self, strategy: Arc<dyn AssignmentStrategy<P>>) -> Self {
        self.coordinator = Arc::new(
            RebalanceCoordinator::new(
                self.state.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.leadership),
                Arc::clone(&self.gate),
                self.config.clone(),
            )
            .with_strategy(strategy),
        );
        self
    }

    fn dispatcher(&self) -> Arc<Dispatcher<P>> {
        Arc::new(Dispatcher {
            handler: Arc::clone(&self.handler),
            state: self.state.clone(),
            membership: Arc::clone(&self.membership),
            leadership: Arc::clone(&self.leadership),
            trigger: self.trigger.clone(),
            ready: self.ready.subscribe(),
        })
    }

    pub fn member(&self) -> &MemberId {
        &self.local
    }

    pub fn add_start_listener(&self, listener: impl Fn(&P) + Send + Sync + 'static) {
        self.listeners.add_start(Arc::new(listener));
    }

    pub fn add_stop_listener(&self, listener: impl Fn(&[P]) + Send + Sync + 'static) {
        self.listeners.add_stop(Arc::new(listener));
    }

    /// Join `cluster`, replicate the shared state and start reacting to
    /// view and role changes. `initial` seeds the canonical list only
    /// when the cluster has none yet.
    pub async fn connect(&self, cluster: &str, initial: Vec<P>) -> NodeResult<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(NodeError::AlreadyConnected);
        }

        self.transport.join(cluster, self.dispatcher()).await?;

        let snapshot = match self.transport.request_snapshot(self.config.snapshot_timeout).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(member = %self.local, cluster, error = %e, "join-time snapshot failed, leaving");
                if let Err(leave) = self.transport.leave().await {
                    warn!(member = %self.local, error = %leave, "leave after failed join failed");
                }
                return Err(NodeError::Snapshot(e));
            }
        };
        if let Some(snapshot) = snapshot {
            self.state.apply(snapshot).await?;
        }
        if self.state.seed_if_empty(initial).await? {
            debug!(member = %self.local, "first member, canonical list seeded");
        }
        self.ready.send_replace(true);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker =
            Arc::clone(&self.coordinator).spawn_worker(&self.trigger, shutdown_rx.clone());
        let events = tokio::spawn(Arc::clone(&self.reactor).run(shutdown_rx));

        info!(member = %self.local, cluster, "node connected");
        *session = Some(Session {
            cluster: cluster.to_string(),
            shutdown,
            tasks: vec![worker, events],
        });
        Ok(())
    }

    /// Replace the canonical list cluster-wide and rebalance.
    ///
    /// Rejected when the current view holds no quorum.
    pub async fn set_payloads(&self, payloads: Vec<P>) -> NodeResult<()> {
        if self.session.lock().await.is_none() {
            return Err(NodeError::NotConnected);
        }
        let view = self.membership.current_view();
        if let Err(e) = self.gate.check(&view) {
            warn!(member = %self.local, %view, "set_payloads rejected: {e}");
            return Err(e);
        }

        info!(member = %self.local, count = payloads.len(), "replacing canonical payload list");
        self.state.replace(payloads).await?;

        let others = View::new(
            view.id(),
            view.members().iter().filter(|m| **m != self.local).cloned(),
        );
        let refresh = Command::Snapshot {
            snapshot: self.state.snapshot().await?,
        };
        if let Err(e) = self
            .transport
            .send_to_all(&others, refresh, self.config.call_timeout)
            .await
        {
            warn!(member = %self.local, error = %e, "state refresh did not reach every member");
        }

        if self.leadership.is_leader() {
            self.trigger.fire(view);
        }
        Ok(())
    }

    /// Stop local items, leave the cluster and stop background tasks.
    pub async fn close(&self) -> NodeResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Err(NodeError::NotConnected);
        };
        self.ready.send_replace(false);
        session.shutdown.send_replace(true);
        for task in &session.tasks {
            task.abort();
        }

        self.handler.stop_local().await;
        self.transport.leave().await?;
        info!(member = %self.local, cluster = %session.cluster, "node closed");
        Ok(())
    }

    /// Current voting set of the leadership component.
    pub fn voters(&self) -> Vec<MemberId> {
        self.leadership.voters()
    }

    /// Add `member` to the voting set and re-evaluate the current view
    /// against the new quorum. Apply the same change on every member.
    pub async fn add_voter(&self, member: MemberId) -> bool {
        let changed = self.leadership.add_voter(member);
        if changed {
            self.quorum_changed().await;
        }
        changed
    }

    /// Remove `member` from the voting set; see `add_voter`.
    pub async fn remove_voter(&self, member: &MemberId) -> bool {
        let changed = self.leadership.remove_voter(member);
        if changed {
            self.quorum_changed().await;
        }
        changed
    }

    async fn quorum_changed(&self) {
        info!(member = %self.local, quorum = self.gate.quorum(), "voting set changed");
        if self.session.lock().await.is_some() {
            self.reactor.evaluate(self.membership.current_view()).await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Items currently running on this node.
    pub async fn running(&self) -> Vec<P> {
        self.handler.running().await
    }

    /// This node's copy of the canonical list.
    pub async fn payloads(&self) -> NodeResult<Vec<P>> {
        Ok(self.state.payloads().await?)
    }

    pub async fn status(&self) -> NodeResult<NodeStatus> {
        let cluster = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.cluster.clone());
        let view = self.membership.current_view();
        let role = if self.leadership.is_leader() {
            Role::Leader
        } else {
            Role::Follower
        };
        Ok(NodeStatus {
            member: self.local.clone(),
            cluster,
            view_id: view.id(),
            view: view.members().to_vec(),
            role,
            quorum: self.gate.quorum(),
            voters: self.voters(),
            operable: self.gate.can_operate(&view),
            payloads: self.state.payloads().await?.len(),
            running: self
                .running()
                .await
                .iter()
                .map(|p| p.id().to_string())
                .collect(),
        })
    }
}

// ── Inbound commands ───────────────────────────────────────────────

struct Dispatcher<P: Payload> {
    handler: Arc<LifecycleHandler<P>>,
    state: SharedState<P>,
    membership: Arc<dyn Membership>,
    leadership: Arc<dyn Leadership>,
    trigger: RebalanceTrigger,
    ready: watch::Receiver<bool>,
}

#[async_trait]
impl<P: Payload> CommandHandler<P> for Dispatcher<P> {
    async fn handle(&self, from: MemberId, command: Command<P>) -> anyhow::Result<()> {
        // Nothing is processed before the join-time snapshot is applied.
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| anyhow::anyhow!("node closed"))?;

        match command {
            Command::StopAll { epoch } => self.handler.on_stop_all(&from, epoch).await?,
            Command::StartItem { payload } => {
                if !self.handler.on_start(payload).await {
                    anyhow::bail!("cannot operate in current view, start refused");
                }
            }
            Command::Confirm { epoch, member } => self.handler.on_confirm(epoch, &member),
            Command::Snapshot { snapshot } => {
                debug!(%from, payloads = snapshot.payloads.len(), "canonical list refreshed");
                self.state.replace(snapshot.payloads).await?;
                if self.leadership.is_leader() {
                    self.trigger.fire(self.membership.current_view());
                }
            }
        }
        Ok(())
    }

    async fn snapshot(&self) -> anyhow::Result<Option<Snapshot<P>>> {
        // A member still joining holds no replicated state to hand out.
        if !*self.ready.borrow() {
            return Ok(None);
        }
        Ok(Some(self.state.snapshot().await?))
    }
}

// ── View / role reactions ──────────────────────────────────────────

struct EventLoop<P: Payload> {
    local: MemberId,
    membership: Arc<dyn Membership>,
    leadership: Arc<dyn Leadership>,
    gate: Arc<OperabilityGate>,
    handler: Arc<LifecycleHandler<P>>,
    trigger: RebalanceTrigger,
}

impl<P: Payload> EventLoop<P> {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut views = self.membership.subscribe();
        let mut roles = self.leadership.subscribe_role();

        let initial = views.borrow_and_update().clone();
        roles.mark_unchanged();
        self.evaluate(initial).await;

        loop {
            tokio::select! {
                Ok(()) = views.changed() => {
                    let view = views.borrow_and_update().clone();
                    debug!(member = %self.local, %view, "view changed");
                    self.evaluate(view).await;
                }
                Ok(()) = roles.changed() => {
                    let role = *roles.borrow_and_update();
                    debug!(member = %self.local, ?role, "role changed");
                    if role == Role::Leader {
                        self.evaluate(self.membership.current_view()).await;
                    }
                }
                _ = shutdown.changed() => break,
                else => break,
            }
        }
        debug!(member = %self.local, "event loop stopped");
    }

    async fn evaluate(&self, view: View) {
        if !self.gate.observe(&view) {
            self.handler.stop_local().await;
        } else if self.leadership.is_leader() {
            self.trigger.fire(view);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rotagrid_cluster::{
        CoordinatorLeadership, LocalCluster, LocalTransport, TransportError, TransportResult,
    };
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item(u32);

    impl Payload for Item {
        type Id = u32;

        fn id(&self) -> u32 {
            self.0
        }

        fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn node(cluster: &LocalCluster<Item>, name: &str, voters: &[&str]) -> Node<Item> {
        node_with(cluster, name, voters, cluster.transport(name))
    }

    fn node_with(
        cluster: &LocalCluster<Item>,
        name: &str,
        voters: &[&str],
        transport: Arc<dyn Transport<Item>>,
    ) -> Node<Item> {
        let membership = cluster.membership(name);
        let leadership = CoordinatorLeadership::spawn(
            name.into(),
            membership.clone(),
            voters.iter().map(|v| MemberId::from(*v)),
        );
        Node::new(
            NodeConfig::default().with_confirm_timeout(Duration::from_secs(2)),
            transport,
            membership,
            Arc::new(leadership),
        )
    }

    async fn wait_running(node: &Node<Item>, count: usize) {
        for _ in 0..200 {
            if node.running().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never ran {count} items");
    }

    /// Local transport whose join-time snapshot transfer always times out.
    struct SlowSnapshots(Arc<LocalTransport<Item>>);

    #[async_trait]
    impl Transport<Item> for SlowSnapshots {
        fn local_member(&self) -> &MemberId {
            self.0.local_member()
        }

        async fn join(
            &self,
            cluster: &str,
            handler: Arc<dyn CommandHandler<Item>>,
        ) -> TransportResult<()> {
            self.0.join(cluster, handler).await
        }

        async fn leave(&self) -> TransportResult<()> {
            self.0.leave().await
        }

        async fn send_to(
            &self,
            member: &MemberId,
            command: Command<Item>,
            timeout: Duration,
        ) -> TransportResult<()> {
            self.0.send_to(member, command, timeout).await
        }

        async fn request_snapshot(
            &self,
            timeout: Duration,
        ) -> TransportResult<Option<Snapshot<Item>>> {
            Err(TransportError::TimedOut {
                member: "a".into(),
                timeout,
            })
        }
    }

    #[tokio::test]
    async fn first_member_seeds_and_runs_everything() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a"]);
        a.connect("t", vec![Item(1), Item(2)]).await.unwrap();

        for _ in 0..200 {
            if a.running().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.payloads().await.unwrap(), vec![Item(1), Item(2)]);
        assert_eq!(a.running().await, vec![Item(1), Item(2)]);

        let status = a.status().await.unwrap();
        assert_eq!(status.role, Role::Leader);
        assert!(status.operable);
        assert_eq!(status.running, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a"]);
        a.connect("t", Vec::new()).await.unwrap();
        assert!(matches!(
            a.connect("t", Vec::new()).await,
            Err(NodeError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn wrong_cluster_name_fails_connect() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a"]);
        assert!(matches!(
            a.connect("other", Vec::new()).await,
            Err(NodeError::Transport(_))
        ));
        assert!(!a.is_connected().await);
    }

    #[tokio::test]
    async fn set_payloads_requires_connection() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a"]);
        assert!(matches!(
            a.set_payloads(vec![Item(1)]).await,
            Err(NodeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn close_stops_items_and_leaves() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a"]);
        a.connect("t", vec![Item(1)]).await.unwrap();
        for _ in 0..200 {
            if !a.running().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        a.close().await.unwrap();
        assert!(a.running().await.is_empty());
        assert!(cluster.members().is_empty());
        assert!(matches!(a.close().await, Err(NodeError::NotConnected)));
    }

    #[tokio::test]
    async fn failed_snapshot_transfer_leaves_the_cluster() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a", "b"]);
        a.connect("t", vec![Item(1)]).await.unwrap();

        let b = node_with(
            &cluster,
            "b",
            &["a", "b"],
            Arc::new(SlowSnapshots(cluster.transport("b"))),
        );
        let result = b.connect("t", vec![Item(9)]).await;

        assert!(matches!(
            result,
            Err(NodeError::Snapshot(TransportError::TimedOut { .. }))
        ));
        assert!(!b.is_connected().await);
        assert_eq!(cluster.members(), vec![MemberId::from("a")]);
        assert!(b.payloads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_withheld_until_connected() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a"]);
        let dispatcher = a.dispatcher();
        assert!(dispatcher.snapshot().await.unwrap().is_none());

        a.connect("t", vec![Item(1), Item(2)]).await.unwrap();
        let snapshot = dispatcher.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.payloads, vec![Item(1), Item(2)]);
    }

    #[tokio::test]
    async fn growing_the_voting_set_can_cost_quorum() {
        let cluster = LocalCluster::new("t");
        let a = node(&cluster, "a", &["a"]);
        a.connect("t", vec![Item(1)]).await.unwrap();
        wait_running(&a, 1).await;

        assert!(a.add_voter("b".into()).await);
        assert!(a.add_voter("c".into()).await);
        assert!(!a.add_voter("c".into()).await);
        assert!(a.running().await.is_empty());

        let status = a.status().await.unwrap();
        assert_eq!(status.quorum, 2);
        assert_eq!(status.voters.len(), 3);
        assert!(!status.operable);
        assert_eq!(status.role, Role::Follower);
        assert!(matches!(
            a.set_payloads(vec![Item(2)]).await,
            Err(NodeError::QuorumInsufficient { view_size: 1, quorum: 2 })
        ));

        assert!(a.remove_voter(&"b".into()).await);
        assert!(a.remove_voter(&"c".into()).await);
        wait_running(&a, 1).await;
        assert_eq!(a.status().await.unwrap().quorum, 1);
    }
}

//! In-process cluster used by `rotad simulate` and the test suites.
//!
//! Every member gets its own view channel and command handler slot.
//! Views are join-ordered, so the earliest member that is still
//! connected coordinates. `disconnect` partitions a member off into a
//! singleton view until `reconnect` puts it back at the end of the main
//! partition.
//!
//! Commands and snapshots go through a JSON round trip on every
//! delivery so payloads are exercised the same way a network transport
//! would exercise them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use rotagrid_state::{MemberId, Payload, Snapshot, View};

use crate::command::Command;
use crate::membership::Membership;
use crate::transport::{CommandHandler, Transport, TransportError, TransportResult};

/// One command delivered through a `LocalCluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub from: MemberId,
    pub to: MemberId,
    pub kind: &'static str,
    /// Id of the started item, for `start_item` deliveries.
    pub payload: Option<String>,
}

struct Slot<P> {
    view: Arc<watch::Sender<View>>,
    handler: Option<Arc<dyn CommandHandler<P>>>,
    isolated: bool,
}

struct ClusterState<P> {
    next_view_id: u64,
    /// Connected, joined members in join order.
    main: Vec<MemberId>,
    slots: BTreeMap<MemberId, Slot<P>>,
    deliveries: Vec<Delivery>,
}

struct Inner<P> {
    name: String,
    state: Mutex<ClusterState<P>>,
}

/// Shared in-memory cluster. Cloning yields another handle to the same
/// cluster.
pub struct LocalCluster<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for LocalCluster<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Payload> LocalCluster<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(ClusterState {
                    next_view_id: 0,
                    main: Vec::new(),
                    slots: BTreeMap::new(),
                    deliveries: Vec::new(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Membership handle for `member`. The view is empty until the
    /// member's transport joins.
    pub fn membership(&self, member: impl Into<MemberId>) -> Arc<LocalMembership> {
        let member = member.into();
        let mut state = self.lock();
        let view = Arc::clone(&state.slot(&member).view);
        Arc::new(LocalMembership { view })
    }

    /// Transport handle that sends as `member`.
    pub fn transport(&self, member: impl Into<MemberId>) -> Arc<LocalTransport<P>> {
        let member = member.into();
        self.lock().slot(&member);
        Arc::new(LocalTransport {
            cluster: self.clone(),
            local: member,
        })
    }

    /// Partition `member` away from the main group.
    pub fn disconnect(&self, member: &MemberId) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.main.iter().position(|m| m == member) else {
            return false;
        };
        state.main.remove(pos);
        if let Some(slot) = state.slots.get_mut(member) {
            slot.isolated = true;
        }
        info!(cluster = %self.inner.name, %member, "member disconnected");

        let id = state.bump_view_id();
        if let Some(slot) = state.slots.get(member) {
            slot.view.send_replace(View::new(id, [member.clone()]));
        }
        state.publish_main();
        true
    }

    /// Heal a partition created by `disconnect`.
    pub fn reconnect(&self, member: &MemberId) -> bool {
        let mut state = self.lock();
        let joined = match state.slots.get_mut(member) {
            Some(slot) if slot.isolated => {
                slot.isolated = false;
                slot.handler.is_some()
            }
            _ => return false,
        };
        info!(cluster = %self.inner.name, %member, "member reconnected");
        if joined {
            state.main.push(member.clone());
            state.publish_main();
        }
        true
    }

    /// Members of the main partition in join order.
    pub fn members(&self) -> Vec<MemberId> {
        self.lock().main.clone()
    }

    /// The view most recently installed at `member`.
    pub fn view_of(&self, member: &MemberId) -> Option<View> {
        self.lock()
            .slots
            .get(member)
            .map(|slot| slot.view.borrow().clone())
    }

    /// Every command delivered so far, in delivery order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().deliveries.clone()
    }

    pub fn clear_deliveries(&self) {
        self.lock().deliveries.clear();
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState<P>> {
        // A poisoned lock only means a test panicked mid-update; the
        // bookkeeping itself is still usable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn join(&self, member: &MemberId, cluster: &str, handler: Arc<dyn CommandHandler<P>>)
        -> TransportResult<()> {
        if cluster != self.inner.name {
            return Err(TransportError::ClusterMismatch {
                expected: self.inner.name.clone(),
                actual: cluster.to_string(),
            });
        }

        let mut state = self.lock();
        let slot = state.slot(member);
        if slot.handler.is_some() {
            return Err(TransportError::AlreadyJoined(cluster.to_string()));
        }
        slot.handler = Some(handler);
        let isolated = slot.isolated;

        info!(cluster, %member, "member joined");
        if isolated {
            let id = state.bump_view_id();
            if let Some(slot) = state.slots.get(member) {
                slot.view.send_replace(View::new(id, [member.clone()]));
            }
        } else {
            state.main.push(member.clone());
            state.publish_main();
        }
        Ok(())
    }

    fn leave(&self, member: &MemberId) -> TransportResult<()> {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(member) else {
            return Err(TransportError::NotJoined);
        };
        if slot.handler.take().is_none() {
            return Err(TransportError::NotJoined);
        }
        slot.view.send_replace(View::default());

        info!(cluster = %self.inner.name, %member, "member left");
        if let Some(pos) = state.main.iter().position(|m| m == member) {
            state.main.remove(pos);
            state.publish_main();
        }
        Ok(())
    }

    /// Resolve the handler of `to` as seen from `from`.
    fn route(&self, from: &MemberId, to: &MemberId) -> TransportResult<Arc<dyn CommandHandler<P>>> {
        let state = self.lock();
        let unreachable = |reason: &str| TransportError::Unreachable {
            member: to.clone(),
            reason: reason.to_string(),
        };

        let sender_joined = state
            .slots
            .get(from)
            .is_some_and(|slot| slot.handler.is_some());
        if !sender_joined {
            return Err(TransportError::NotJoined);
        }

        let handler = state
            .slots
            .get(to)
            .and_then(|slot| slot.handler.clone())
            .ok_or_else(|| unreachable("not a member"))?;

        if from != to && !(state.main.contains(from) && state.main.contains(to)) {
            return Err(unreachable("partitioned"));
        }
        Ok(handler)
    }

    fn record(&self, delivery: Delivery) {
        self.lock().deliveries.push(delivery);
    }
}

impl<P> ClusterState<P> {
    fn slot(&mut self, member: &MemberId) -> &mut Slot<P> {
        self.slots.entry(member.clone()).or_insert_with(|| {
            let (tx, _rx) = watch::channel(View::default());
            Slot {
                view: Arc::new(tx),
                handler: None,
                isolated: false,
            }
        })
    }

    fn bump_view_id(&mut self) -> u64 {
        self.next_view_id += 1;
        self.next_view_id
    }

    /// Install a fresh view at every member of the main partition.
    fn publish_main(&mut self) {
        let view = View::new(self.bump_view_id(), self.main.iter().cloned());
        debug!(%view, "installing view");
        for member in &self.main {
            if let Some(slot) = self.slots.get(member) {
                slot.view.send_replace(view.clone());
            }
        }
    }
}

// ── Membership ─────────────────────────────────────────────────────

/// View source for one member of a `LocalCluster`.
pub struct LocalMembership {
    view: Arc<watch::Sender<View>>,
}

impl Membership for LocalMembership {
    fn current_view(&self) -> View {
        self.view.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<View> {
        self.view.subscribe()
    }
}

// ── Transport ──────────────────────────────────────────────────────

/// Transport for one member of a `LocalCluster`.
pub struct LocalTransport<P> {
    cluster: LocalCluster<P>,
    local: MemberId,
}

#[async_trait]
impl<P: Payload> Transport<P> for LocalTransport<P> {
    fn local_member(&self) -> &MemberId {
        &self.local
    }

    async fn join(&self, cluster: &str, handler: Arc<dyn CommandHandler<P>>)
        -> TransportResult<()> {
        self.cluster.join(&self.local, cluster, handler)
    }

    async fn leave(&self) -> TransportResult<()> {
        self.cluster.leave(&self.local)
    }

    async fn send_to(
        &self,
        member: &MemberId,
        command: Command<P>,
        timeout: Duration,
    ) -> TransportResult<()> {
        let handler = self.cluster.route(&self.local, member)?;
        let command: Command<P> = Command::decode(&command.encode()?)?;
        let kind = command.kind();

        self.cluster.record(Delivery {
            from: self.local.clone(),
            to: member.clone(),
            kind,
            payload: match &command {
                Command::StartItem { payload } => Some(payload.id().to_string()),
                _ => None,
            },
        });

        match tokio::time::timeout(timeout, handler.handle(self.local.clone(), command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Rejected {
                member: member.clone(),
                kind: kind.to_string(),
                reason: format!("{e:#}"),
            }),
            Err(_) => Err(TransportError::TimedOut {
                member: member.clone(),
                timeout,
            }),
        }
    }

    async fn request_snapshot(&self, timeout: Duration) -> TransportResult<Option<Snapshot<P>>> {
        let view = self
            .cluster
            .view_of(&self.local)
            .ok_or(TransportError::NotJoined)?;

        for member in view.members().iter().filter(|m| **m != self.local) {
            let Ok(handler) = self.cluster.route(&self.local, member) else {
                continue;
            };
            let snapshot = match tokio::time::timeout(timeout, handler.snapshot()).await {
                Ok(Ok(Some(snapshot))) => snapshot,
                Ok(Ok(None)) => {
                    debug!(local = %self.local, %member, "member not ready to serve a snapshot");
                    continue;
                }
                Ok(Err(e)) => {
                    return Err(TransportError::Rejected {
                        member: member.clone(),
                        kind: "snapshot_request".to_string(),
                        reason: format!("{e:#}"),
                    });
                }
                Err(_) => {
                    return Err(TransportError::TimedOut {
                        member: member.clone(),
                        timeout,
                    });
                }
            };

            let bytes = snapshot
                .encode()
                .map_err(|e| TransportError::Codec(e.to_string()))?;
            let snapshot =
                Snapshot::decode(&bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
            debug!(local = %self.local, from = %member, payloads = snapshot.payloads.len(), "snapshot fetched");
            return Ok(Some(snapshot));
        }

        debug!(local = %self.local, "no snapshot source in view");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rotagrid_state::ConfirmationTable;
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

    #[derive(Default)]
    struct Counting {
        handled: AtomicUsize,
        fail: bool,
        not_ready: bool,
    }

    #[async_trait]
    impl CommandHandler<Item> for Counting {
        async fn handle(&self, _from: MemberId, _command: Command<Item>) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("refused");
            }
            Ok(())
        }

        async fn snapshot(&self) -> anyhow::Result<Option<Snapshot<Item>>> {
            if self.fail {
                anyhow::bail!("refused");
            }
            if self.not_ready {
                return Ok(None);
            }
            Ok(Some(Snapshot::new(vec![Item(1), Item(2)], ConfirmationTable::default())))
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn names(view: &View) -> Vec<&str> {
        view.members().iter().map(MemberId::as_str).collect()
    }

    async fn join(cluster: &LocalCluster<Item>, name: &str) -> (Arc<LocalTransport<Item>>, Arc<Counting>) {
        let transport = cluster.transport(name);
        let handler = Arc::new(Counting::default());
        transport.join(cluster.name(), handler.clone()).await.unwrap();
        (transport, handler)
    }

    #[tokio::test]
    async fn views_are_join_ordered() {
        let cluster = LocalCluster::<Item>::new("demo");
        let membership = cluster.membership("b");
        assert!(membership.current_view().is_empty());

        join(&cluster, "a").await;
        join(&cluster, "b").await;
        join(&cluster, "c").await;

        let view = membership.current_view();
        assert_eq!(names(&view), vec!["a", "b", "c"]);
        assert_eq!(cluster.view_of(&"a".into()), Some(view));
    }

    #[tokio::test]
    async fn join_rejects_wrong_cluster_and_double_join() {
        let cluster = LocalCluster::<Item>::new("demo");
        let transport = cluster.transport("a");
        let handler = Arc::new(Counting::default());

        let wrong = transport.join("other", handler.clone()).await;
        assert!(matches!(wrong, Err(TransportError::ClusterMismatch { .. })));

        transport.join("demo", handler.clone()).await.unwrap();
        let again = transport.join("demo", handler).await;
        assert!(matches!(again, Err(TransportError::AlreadyJoined(_))));
    }

    #[tokio::test]
    async fn send_records_delivery_and_invokes_handler() {
        let cluster = LocalCluster::<Item>::new("demo");
        let (a, _) = join(&cluster, "a").await;
        let (_, b_handler) = join(&cluster, "b").await;

        a.send_to(&"b".into(), Command::StartItem { payload: Item(3) }, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(b_handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(
            cluster.deliveries(),
            vec![Delivery {
                from: "a".into(),
                to: "b".into(),
                kind: "start_item",
                payload: Some("3".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn disconnect_partitions_and_reconnect_heals() {
        let cluster = LocalCluster::<Item>::new("demo");
        let (a, _) = join(&cluster, "a").await;
        join(&cluster, "b").await;
        join(&cluster, "c").await;

        assert!(cluster.disconnect(&"a".into()));
        assert_eq!(names(&cluster.view_of(&"b".into()).unwrap()), vec!["b", "c"]);
        assert_eq!(names(&cluster.view_of(&"a".into()).unwrap()), vec!["a"]);

        let result = a.send_to(&"b".into(), Command::StopAll { epoch: 1 }, TIMEOUT).await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
        a.send_to(&"a".into(), Command::StopAll { epoch: 1 }, TIMEOUT)
            .await
            .unwrap();

        assert!(cluster.reconnect(&"a".into()));
        assert_eq!(names(&cluster.view_of(&"a".into()).unwrap()), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn send_to_all_reports_first_failure_after_trying_everyone() {
        let cluster = LocalCluster::<Item>::new("demo");
        let (a, _) = join(&cluster, "a").await;
        let failing = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        cluster.transport("b").join("demo", failing.clone()).await.unwrap();
        let (_, c_handler) = join(&cluster, "c").await;

        let view = cluster.view_of(&"a".into()).unwrap();
        let result = a.send_to_all(&view, Command::StopAll { epoch: 1 }, TIMEOUT).await;

        assert!(matches!(result, Err(TransportError::Rejected { .. })));
        assert_eq!(failing.handled.load(Ordering::SeqCst), 1);
        assert_eq!(c_handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_comes_from_another_member() {
        let cluster = LocalCluster::<Item>::new("demo");
        let (a, _) = join(&cluster, "a").await;
        assert!(a.request_snapshot(TIMEOUT).await.unwrap().is_none());

        let (b, _) = join(&cluster, "b").await;
        let snapshot = b.request_snapshot(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(snapshot.payloads, vec![Item(1), Item(2)]);
    }

    #[tokio::test]
    async fn snapshot_skips_members_that_are_not_ready() {
        let cluster = LocalCluster::<Item>::new("demo");
        let pending = Arc::new(Counting {
            not_ready: true,
            ..Counting::default()
        });
        cluster.transport("a").join("demo", pending).await.unwrap();
        let (c, _) = join(&cluster, "c").await;
        assert!(c.request_snapshot(TIMEOUT).await.unwrap().is_none());

        join(&cluster, "b").await;
        let (d, _) = join(&cluster, "d").await;
        let snapshot = d.request_snapshot(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(snapshot.payloads, vec![Item(1), Item(2)]);
    }

    #[tokio::test]
    async fn failing_snapshot_source_fails_the_request() {
        let cluster = LocalCluster::<Item>::new("demo");
        let failing = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        cluster.transport("a").join("demo", failing).await.unwrap();
        join(&cluster, "b").await;
        let (c, _) = join(&cluster, "c").await;

        let result = c.request_snapshot(TIMEOUT).await;
        assert!(matches!(result, Err(TransportError::Rejected { .. })));
    }

    #[tokio::test]
    async fn leave_removes_member_from_views() {
        let cluster = LocalCluster::<Item>::new("demo");
        let (a, _) = join(&cluster, "a").await;
        join(&cluster, "b").await;

        a.leave().await.unwrap();
        assert_eq!(cluster.members(), vec![MemberId::from("b")]);
        assert!(cluster.view_of(&"a".into()).unwrap().is_empty());
        assert!(matches!(a.leave().await, Err(TransportError::NotJoined)));
    }
}

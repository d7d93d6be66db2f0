//! End-to-end rebalance scenarios over an in-memory cluster.
//!
//! Every node runs the real protocol stack (state actor, dispatcher,
//! coordinator worker, event loop) and talks through `LocalCluster`,
//! so partitions and joins are exercised the same way a networked
//! cluster would see them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rotagrid_cluster::{CoordinatorLeadership, LocalCluster, Role};
use rotagrid_node::{Node, NodeConfig, NodeError};
use rotagrid_state::{MemberId, Payload};

const CLUSTER: &str = "scenarios";
const VOTERS: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job(u32);

impl Payload for Job {
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

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Started(String, u32),
    Stopped(String, Vec<u32>),
}

struct Harness {
    cluster: LocalCluster<Job>,
    nodes: BTreeMap<String, Node<Job>>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            cluster: LocalCluster::new(CLUSTER),
            nodes: BTreeMap::new(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn start(&mut self, name: &str, initial: &[u32]) {
        let membership = self.cluster.membership(name);
        let leadership =
            CoordinatorLeadership::spawn(name.into(), membership.clone(), VOTERS.map(MemberId::from));
        let node = Node::new(
            NodeConfig::default()
                .with_call_timeout(Duration::from_secs(2))
                .with_confirm_timeout(Duration::from_secs(2)),
            self.cluster.transport(name),
            membership,
            Arc::new(leadership),
        );

        let events = Arc::clone(&self.events);
        let tag = name.to_string();
        node.add_start_listener(move |job: &Job| {
            events.lock().unwrap().push(Event::Started(tag.clone(), job.0));
        });
        let events = Arc::clone(&self.events);
        let tag = name.to_string();
        node.add_stop_listener(move |jobs: &[Job]| {
            let ids = jobs.iter().map(|j| j.0).collect();
            events.lock().unwrap().push(Event::Stopped(tag.clone(), ids));
        });

        node.connect(CLUSTER, initial.iter().copied().map(Job).collect())
            .await
            .unwrap();
        self.nodes.insert(name.to_string(), node);
    }

    fn node(&self, name: &str) -> &Node<Job> {
        &self.nodes[name]
    }

    async fn assignment(&self) -> BTreeMap<String, Vec<u32>> {
        let mut out = BTreeMap::new();
        for (name, node) in &self.nodes {
            let ids = node.running().await.iter().map(|j| j.0).collect();
            out.insert(name.clone(), ids);
        }
        out
    }

    /// Poll until the running sets match `expected`.
    async fn wait_for(&self, expected: &[(&str, &[u32])]) {
        let expected: BTreeMap<String, Vec<u32>> = expected
            .iter()
            .map(|(name, ids)| (name.to_string(), ids.to_vec()))
            .collect();
        let mut last = BTreeMap::new();
        for _ in 0..500 {
            last = self.assignment().await;
            if last == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("assignment never reached {expected:?}, last seen {last:?}");
    }

    /// Wait for `expected`, let trailing runs drain, and check again.
    async fn settle(&self, expected: &[(&str, &[u32])]) {
        self.wait_for(expected).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.wait_for(expected).await;
    }

    async fn wait_for_starts(&self, count: usize) -> Vec<(String, String)> {
        for _ in 0..500 {
            let starts = self.starts();
            if starts.len() >= count {
                return starts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fewer than {count} starts delivered: {:?}", self.starts());
    }

    fn starts(&self) -> Vec<(String, String)> {
        self.cluster
            .deliveries()
            .into_iter()
            .filter(|d| d.kind == "start_item")
            .map(|d| (d.to.to_string(), d.payload.unwrap_or_default()))
            .collect()
    }

    fn reset_observations(&self) {
        self.cluster.clear_deliveries();
        self.events.lock().unwrap().clear();
    }

    /// Apply a voting-set change on every node.
    async fn add_voter(&self, voter: &str) {
        for node in self.nodes.values() {
            node.add_voter(voter.into()).await;
        }
    }

    async fn remove_voter(&self, voter: &str) {
        for node in self.nodes.values() {
            node.remove_voter(&voter.into()).await;
        }
    }

    async fn three_nodes(&mut self, payloads: &[u32]) {
        self.start("a", payloads).await;
        self.start("b", payloads).await;
        self.start("c", payloads).await;
    }
}

fn start(to: &str, id: u32) -> (String, String) {
    (to.to_string(), id.to_string())
}

#[tokio::test]
async fn three_members_get_one_item_each() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;
    assert_eq!(h.node("a").status().await.unwrap().role, Role::Leader);

    h.reset_observations();
    h.node("a").set_payloads(vec![Job(1), Job(2), Job(3)]).await.unwrap();
    let starts = h.wait_for_starts(3).await;

    let deliveries = h.cluster.deliveries();
    let stop_targets: Vec<_> = deliveries
        .iter()
        .filter(|d| d.kind == "stop_all")
        .map(|d| d.to.as_str())
        .collect();
    assert_eq!(stop_targets, vec!["a", "b", "c"]);
    assert_eq!(starts, vec![start("a", 1), start("b", 2), start("c", 3)]);

    // Confirmations from followers all land before the first start.
    let first_start = deliveries.iter().position(|d| d.kind == "start_item").unwrap();
    let confirms: Vec<_> = deliveries
        .iter()
        .enumerate()
        .filter(|(_, d)| d.kind == "confirm")
        .map(|(i, d)| (i, d.from.as_str()))
        .collect();
    assert_eq!(confirms.len(), 2);
    assert!(confirms.iter().all(|(i, _)| *i < first_start));
}

#[tokio::test]
async fn shrinking_view_wraps_round_robin() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;

    h.reset_observations();
    assert!(h.cluster.disconnect(&MemberId::from("c")));

    h.settle(&[("a", &[1, 3]), ("b", &[2]), ("c", &[])]).await;
    let starts = h.starts();
    assert_eq!(
        &starts[starts.len() - 3..],
        &[start("a", 1), start("b", 2), start("a", 3)]
    );
}

#[tokio::test]
async fn quorum_loss_stops_everything_and_rejects_updates() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;

    h.cluster.disconnect(&MemberId::from("b"));
    h.cluster.disconnect(&MemberId::from("c"));
    h.settle(&[("a", &[]), ("b", &[]), ("c", &[])]).await;

    let rejected = h.node("a").set_payloads(vec![Job(9)]).await;
    assert!(matches!(
        rejected,
        Err(NodeError::QuorumInsufficient { view_size: 1, quorum: 2 })
    ));
    assert_eq!(h.node("a").payloads().await.unwrap(), vec![Job(1), Job(2), Job(3)]);

    // Regaining quorum lets the leader rebalance again.
    h.cluster.reconnect(&MemberId::from("b"));
    h.settle(&[("a", &[1, 3]), ("b", &[2]), ("c", &[])]).await;
    h.node("a").set_payloads(vec![Job(9)]).await.unwrap();
    h.settle(&[("a", &[9]), ("b", &[]), ("c", &[])]).await;
}

#[tokio::test]
async fn growing_the_voting_set_stops_a_two_member_view() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;

    h.cluster.disconnect(&MemberId::from("c"));
    h.settle(&[("a", &[1, 3]), ("b", &[2]), ("c", &[])]).await;

    h.add_voter("d").await;
    h.add_voter("e").await;
    h.settle(&[("a", &[]), ("b", &[]), ("c", &[])]).await;
    let status = h.node("a").status().await.unwrap();
    assert_eq!(status.quorum, 3);
    assert_ne!(status.role, Role::Leader);
    assert!(matches!(
        h.node("a").set_payloads(vec![Job(9)]).await,
        Err(NodeError::QuorumInsufficient { view_size: 2, quorum: 3 })
    ));

    h.remove_voter("d").await;
    h.remove_voter("e").await;
    h.settle(&[("a", &[1, 3]), ("b", &[2]), ("c", &[])]).await;
    assert_eq!(h.node("a").status().await.unwrap().role, Role::Leader);
}

#[tokio::test]
async fn minority_member_stops_without_a_command() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;

    h.reset_observations();
    h.cluster.disconnect(&MemberId::from("c"));
    h.wait_for(&[("a", &[1, 3]), ("b", &[2]), ("c", &[])]).await;

    let to_c = h
        .cluster
        .deliveries()
        .into_iter()
        .filter(|d| d.to.as_str() == "c")
        .count();
    assert_eq!(to_c, 0);
    assert!(h
        .events
        .lock()
        .unwrap()
        .contains(&Event::Stopped("c".into(), vec![3])));
}

#[tokio::test]
async fn joiner_receives_committed_list() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;

    h.node("a")
        .set_payloads((1..=5).map(Job).collect())
        .await
        .unwrap();
    h.settle(&[("a", &[1, 4]), ("b", &[2, 5]), ("c", &[3])]).await;

    h.start("d", &[1, 2, 3]).await;
    assert_eq!(
        h.node("d").payloads().await.unwrap(),
        (1..=5).map(Job).collect::<Vec<_>>()
    );
    h.settle(&[("a", &[1, 5]), ("b", &[2]), ("c", &[3]), ("d", &[4])]).await;
}

#[tokio::test]
async fn follower_update_reaches_leader() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;

    h.node("b").set_payloads(vec![Job(7), Job(8)]).await.unwrap();
    h.settle(&[("a", &[7]), ("b", &[8]), ("c", &[])]).await;
    for name in ["a", "b", "c"] {
        assert_eq!(h.node(name).payloads().await.unwrap(), vec![Job(7), Job(8)]);
    }
}

#[tokio::test]
async fn stop_on_idle_members_still_confirms() {
    let mut h = Harness::new();
    h.three_nodes(&[]).await;
    h.settle(&[("a", &[]), ("b", &[]), ("c", &[])]).await;

    h.reset_observations();
    h.node("a").set_payloads(Vec::new()).await.unwrap();
    for _ in 0..500 {
        let confirms = h
            .cluster
            .deliveries()
            .iter()
            .filter(|d| d.kind == "confirm")
            .count();
        if confirms == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let deliveries = h.cluster.deliveries();
    let confirmers: Vec<_> = deliveries
        .iter()
        .filter(|d| d.kind == "confirm")
        .map(|d| (d.from.as_str(), d.to.as_str()))
        .collect();
    assert_eq!(confirmers, vec![("b", "a"), ("c", "a")]);
    assert!(deliveries.iter().all(|d| d.kind != "start_item"));
    assert!(h.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn old_items_stop_everywhere_before_new_ones_start() {
    let mut h = Harness::new();
    h.three_nodes(&[1, 2, 3]).await;
    h.settle(&[("a", &[1]), ("b", &[2]), ("c", &[3])]).await;

    h.reset_observations();
    h.node("a")
        .set_payloads(vec![Job(4), Job(5), Job(6)])
        .await
        .unwrap();
    h.settle(&[("a", &[4]), ("b", &[5]), ("c", &[6])]).await;

    let events = h.events.lock().unwrap().clone();
    let last_stop = events
        .iter()
        .rposition(|e| matches!(e, Event::Stopped(..)))
        .unwrap();
    let first_start = events
        .iter()
        .position(|e| matches!(e, Event::Started(..)))
        .unwrap();
    assert!(last_stop < first_start, "events out of order: {events:?}");

    let stopped: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Stopped(node, ids) => Some((node.as_str(), ids.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(stopped, vec![("a", vec![1]), ("b", vec![2]), ("c", vec![3])]);
}

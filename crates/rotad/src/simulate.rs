//! Simulate mode — several nodes in one process over a `LocalCluster`.
//!
//! In this mode, the daemon:
//! 1. Builds `count` nodes named `node-1..node-N` on one in-process cluster
//! 2. Connects them in order, seeding the canonical list from the first
//! 3. Serves the admin API, which can also inject partitions
//! 4. On shutdown, closes every node

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use rotagrid_cluster::{CoordinatorLeadership, LocalCluster};
use rotagrid_node::{Node, NodeConfig};
use rotagrid_state::MemberId;

use crate::api::{build_router, ApiState};
use crate::job::Job;

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub cluster: String,
    pub nodes: usize,
    pub voters: usize,
    pub jobs: Vec<u32>,
    pub api_port: u16,
    pub config: NodeConfig,
}

fn node_name(i: usize) -> String {
    format!("node-{i}")
}

/// Build `count` disconnected nodes on `cluster`. The first `voters`
/// nodes form the initial voting set.
pub fn build_nodes(
    cluster: &LocalCluster<Job>,
    count: usize,
    voters: usize,
    config: &NodeConfig,
) -> Vec<Arc<Node<Job>>> {
    let voting: Vec<MemberId> = (1..=voters).map(|i| node_name(i).into()).collect();
    (1..=count)
        .map(|i| {
            let name = node_name(i);
            let membership = cluster.membership(name.as_str());
            let leadership = CoordinatorLeadership::spawn(
                name.as_str().into(),
                membership.clone(),
                voting.iter().cloned(),
            );
            Arc::new(Node::new(
                config.clone(),
                cluster.transport(name.as_str()),
                membership,
                Arc::new(leadership),
            ))
        })
        .collect()
}

/// Connect `nodes` one after another; every node offers `jobs` as its
/// initial list, only the first one's takes effect.
pub async fn connect_all(
    cluster: &LocalCluster<Job>,
    nodes: &[Arc<Node<Job>>],
    jobs: &[u32],
) -> anyhow::Result<()> {
    for node in nodes {
        node.connect(cluster.name(), Job::from_ids(jobs.iter().copied()))
            .await?;
    }
    Ok(())
}

pub async fn run_simulate(options: SimulateOptions) -> anyhow::Result<()> {
    info!(
        cluster = %options.cluster,
        nodes = options.nodes,
        voters = options.voters,
        "rotad starting in simulate mode"
    );

    let cluster = LocalCluster::new(options.cluster.clone());
    let nodes = build_nodes(&cluster, options.nodes, options.voters, &options.config);
    connect_all(&cluster, &nodes, &options.jobs).await?;
    info!(members = ?cluster.members(), "all nodes connected");

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState::new(nodes.clone(), Some(cluster)));
    let addr = SocketAddr::from(([127, 0, 0, 1], options.api_port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await?;

    // ── Shutdown ───────────────────────────────────────────────

    for node in &nodes {
        if let Err(e) = node.close().await {
            warn!(member = %node.member(), error = %e, "close failed");
        }
    }
    info!("rotad stopped");
    Ok(())
}

//! Serve mode — one node of a multi-process cluster over gRPC.
//!
//! In this mode, the daemon:
//! 1. Starts the rebalance gRPC service on `node.listen`
//! 2. Pings the configured peers to build views
//! 3. Connects the node, seeding `payloads.jobs` if it is first
//! 4. Serves the admin API when `node.api_port` is set
//! 5. On shutdown, closes the node and stops the gRPC server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use rotagrid_cluster::CoordinatorLeadership;
use rotagrid_cluster::grpc::{GrpcTransport, HeartbeatMembership};
use rotagrid_node::Node;
use rotagrid_state::MemberId;

use crate::api::{build_router, ApiState};
use crate::config::RotadConfig;
use crate::job::Job;

pub async fn run_serve(config: RotadConfig) -> anyhow::Result<()> {
    let local = MemberId::from(config.node.name.as_str());
    info!(member = %local, cluster = %config.cluster.name, "rotad starting in serve mode");

    let transport = Arc::new(GrpcTransport::<Job>::new(
        local.clone(),
        config.cluster.name.clone(),
        config
            .cluster
            .peers
            .iter()
            .map(|p| (MemberId::from(p.name.as_str()), p.addr.clone())),
    ));

    // ── gRPC server ────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let grpc_addr: SocketAddr = config.node.listen.parse()?;
    let grpc = tokio::spawn({
        let service = transport.server().into_service();
        let mut shutdown = shutdown_rx;
        async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_shutdown(grpc_addr, async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
        }
    });
    info!(addr = %grpc_addr, "gRPC server starting");

    // ── Node ───────────────────────────────────────────────────

    let membership = Arc::new(HeartbeatMembership::spawn(
        Arc::clone(&transport),
        config.heartbeat_interval(),
        config.suspect_after(),
    ));
    let leadership = CoordinatorLeadership::spawn(local.clone(), membership.clone(), config.voters());
    let node = Arc::new(Node::new(
        config.node_config(),
        transport,
        membership,
        Arc::new(leadership),
    ));
    node.connect(&config.cluster.name, Job::from_ids(config.payloads.jobs.iter().copied()))
        .await?;

    // ── Admin API ──────────────────────────────────────────────

    match config.node.api_port {
        Some(port) => {
            let router = build_router(ApiState::new(vec![Arc::clone(&node)], None));
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            info!(%addr, "API server starting");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(crate::shutdown_signal())
                .await?;
        }
        None => crate::shutdown_signal().await,
    }

    // ── Shutdown ───────────────────────────────────────────────

    if let Err(e) = node.close().await {
        warn!(member = %local, error = %e, "close failed");
    }
    shutdown_tx.send_replace(true);
    match grpc.await {
        Ok(Err(e)) => warn!(error = %e, "gRPC server error"),
        Err(e) => warn!(error = %e, "gRPC server task failed"),
        Ok(Ok(())) => {}
    }
    info!("rotad stopped");
    Ok(())
}

//! rotad — the rotagrid daemon.
//!
//! Hosts rebalancing nodes running demo `Job` payloads and exposes them
//! through an admin REST API. Two modes:
//!
//! - `simulate`: N nodes in one process over a `LocalCluster`, with
//!   partition injection through the API.
//! - `serve` (feature `grpc`): one node of a multi-process cluster.

pub mod api;
pub mod config;
pub mod job;
#[cfg(feature = "grpc")]
pub mod serve;
pub mod simulate;

pub use api::{build_router, ApiState};
pub use config::RotadConfig;
pub use job::Job;

use tracing::{info, warn};

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

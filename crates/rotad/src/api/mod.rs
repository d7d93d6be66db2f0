//! Admin REST API for `rotad`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/nodes` | Status of every local node |
//! | GET | `/api/v1/nodes/{id}` | Status of one node |
//! | POST | `/api/v1/nodes/{id}/disconnect` | Partition a simulated node away |
//! | POST | `/api/v1/nodes/{id}/reconnect` | Heal a simulated partition |
//! | GET | `/api/v1/payloads` | Canonical job list |
//! | PUT | `/api/v1/payloads` | Replace the canonical job list |
//! | GET | `/api/v1/voters` | Voting set and quorum |
//! | PUT | `/api/v1/voters/{id}` | Add a voter on every local node |
//! | DELETE | `/api/v1/voters/{id}` | Remove a voter on every local node |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};

use rotagrid_cluster::{LocalCluster, Role};
use rotagrid_node::Node;

use crate::job::Job;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub nodes: Arc<Vec<Arc<Node<Job>>>>,
    /// Present only in simulate mode, where partitions can be injected.
    pub cluster: Option<LocalCluster<Job>>,
}

impl ApiState {
    pub fn new(nodes: Vec<Arc<Node<Job>>>, cluster: Option<LocalCluster<Job>>) -> Self {
        Self {
            nodes: Arc::new(nodes),
            cluster,
        }
    }

    fn node(&self, id: &str) -> Option<Arc<Node<Job>>> {
        self.nodes
            .iter()
            .find(|n| n.member().as_str() == id)
            .cloned()
    }

    /// Node that should take a list update: the local leader if there is
    /// one, otherwise the first connected node.
    async fn target(&self) -> Option<Arc<Node<Job>>> {
        let mut fallback = None;
        for node in self.nodes.iter() {
            if !node.is_connected().await {
                continue;
            }
            if let Ok(status) = node.status().await {
                if status.role == Role::Leader {
                    return Some(Arc::clone(node));
                }
            }
            if fallback.is_none() {
                fallback = Some(Arc::clone(node));
            }
        }
        fallback
    }
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}/disconnect", post(handlers::disconnect_node))
        .route("/nodes/{id}/reconnect", post(handlers::reconnect_node))
        .route(
            "/payloads",
            get(handlers::get_payloads).put(handlers::set_payloads),
        )
        .route("/voters", get(handlers::list_voters))
        .route(
            "/voters/{id}",
            put(handlers::add_voter).delete(handlers::remove_voter),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

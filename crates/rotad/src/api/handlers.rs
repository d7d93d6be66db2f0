//! REST API handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use rotagrid_cluster::majority;
use rotagrid_node::NodeError;
use rotagrid_state::MemberId;

use crate::api::ApiState;
use crate::job::Job;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn node_error_status(error: &NodeError) -> StatusCode {
    match error {
        NodeError::QuorumInsufficient { .. } => StatusCode::CONFLICT,
        NodeError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    let mut statuses = Vec::with_capacity(state.nodes.len());
    for node in state.nodes.iter() {
        match node.status().await {
            Ok(status) => statuses.push(status),
            Err(e) => {
                return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                    .into_response();
            }
        }
    }
    ApiResponse::ok(statuses).into_response()
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(node) = state.node(&id) else {
        return error_response("node not found", StatusCode::NOT_FOUND).into_response();
    };
    match node.status().await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct PartitionResponse {
    pub member: String,
    pub changed: bool,
}

/// POST /api/v1/nodes/{id}/disconnect
pub async fn disconnect_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    partition(&state, &id, true).into_response()
}

/// POST /api/v1/nodes/{id}/reconnect
pub async fn reconnect_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    partition(&state, &id, false).into_response()
}

fn partition(state: &ApiState, id: &str, disconnect: bool) -> axum::response::Response {
    let Some(cluster) = &state.cluster else {
        return error_response(
            "partitions can only be injected in simulate mode",
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    };
    if state.node(id).is_none() {
        return error_response("node not found", StatusCode::NOT_FOUND).into_response();
    }

    let member = MemberId::from(id);
    let changed = if disconnect {
        cluster.disconnect(&member)
    } else {
        cluster.reconnect(&member)
    };
    info!(%member, disconnect, changed, "partition request");
    ApiResponse::ok(PartitionResponse {
        member: id.to_string(),
        changed,
    })
    .into_response()
}

// ── Payloads ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SetPayloadsRequest {
    pub jobs: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct SetPayloadsResponse {
    pub node: String,
    pub jobs: usize,
}

/// GET /api/v1/payloads
pub async fn get_payloads(State(state): State<ApiState>) -> impl IntoResponse {
    let Some(node) = state.target().await else {
        return error_response("no connected node", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    };
    match node.payloads().await {
        Ok(jobs) => ApiResponse::<Vec<Job>>::ok(jobs).into_response(),
        Err(e) => error_response(&e.to_string(), node_error_status(&e)).into_response(),
    }
}

/// PUT /api/v1/payloads
pub async fn set_payloads(
    State(state): State<ApiState>,
    Json(req): Json<SetPayloadsRequest>,
) -> impl IntoResponse {
    let Some(node) = state.target().await else {
        return error_response("no connected node", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    };
    let count = req.jobs.len();
    match node.set_payloads(Job::from_ids(req.jobs)).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(SetPayloadsResponse {
                node: node.member().to_string(),
                jobs: count,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e.to_string(), node_error_status(&e)).into_response(),
    }
}

// ── Voters ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct VotersResponse {
    pub voters: Vec<MemberId>,
    pub quorum: usize,
}

#[derive(Debug, Serialize)]
pub struct VoterChangeResponse {
    pub member: String,
    /// Number of local nodes whose voting set changed.
    pub changed: usize,
}

/// GET /api/v1/voters
pub async fn list_voters(State(state): State<ApiState>) -> impl IntoResponse {
    let Some(node) = state.nodes.first() else {
        return error_response("no local node", StatusCode::SERVICE_UNAVAILABLE).into_response();
    };
    let voters = node.voters();
    let quorum = majority(voters.len());
    ApiResponse::ok(VotersResponse { voters, quorum }).into_response()
}

/// PUT /api/v1/voters/{id}
pub async fn add_voter(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let member = MemberId::from(id.as_str());
    let mut changed = 0;
    for node in state.nodes.iter() {
        if node.add_voter(member.clone()).await {
            changed += 1;
        }
    }
    info!(%member, changed, "voter added");
    ApiResponse::ok(VoterChangeResponse { member: id, changed }).into_response()
}

/// DELETE /api/v1/voters/{id}
pub async fn remove_voter(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let member = MemberId::from(id.as_str());
    let mut changed = 0;
    for node in state.nodes.iter() {
        if node.remove_voter(&member).await {
            changed += 1;
        }
    }
    info!(%member, changed, "voter removed");
    ApiResponse::ok(VoterChangeResponse { member: id, changed }).into_response()
}

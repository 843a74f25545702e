//! HTTP diagnostics API
//!
//! Read access to the bucket database, node load and pass results, plus
//! report submission and manual pass triggering

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bucket_core::{BucketId, NodeIndex, ReplicaSet};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bucketdb::BucketReport;
use crate::maintenance::MaintenancePriorityAndType;
use crate::node_state::{NodeEntry, NodeState};
use crate::Distributor;

/// Default page size for bucket listings
const DEFAULT_LIST_LIMIT: usize = 1000;

/// HTTP API service
pub struct HttpApi {
    distributor: Arc<Distributor>,
}

impl HttpApi {
    pub fn new(distributor: Arc<Distributor>) -> Self {
        Self { distributor }
    }

    pub fn router(self) -> Router {
        Router::new()
            // buckets
            .route("/api/v1/buckets", get(list_buckets))
            .route("/api/v1/buckets/:bucket_id", get(get_bucket))
            .route("/api/v1/reports", post(post_report))
            // nodes
            .route("/api/v1/nodes", get(list_nodes))
            .route("/api/v1/nodes/:node/state", post(set_node_state))
            .route("/api/v1/stats", get(get_stats))
            // maintenance
            .route("/api/v1/maintenance/trigger", post(trigger_pass))
            .route("/api/v1/maintenance/last_pass", get(get_last_pass))
            .route("/api/v1/maintenance/pending", get(list_pending))
            .route("/api/v1/executor", get(get_executor))
            .with_state(self.distributor)
    }

    /// Bind and serve until the listener fails
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("HTTP API listening on {}", addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
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

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

#[derive(Serialize)]
struct BucketView {
    bucket: String,
    raw: u64,
    used_bits: u8,
    replicas: ReplicaSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: Option<MaintenancePriorityAndType>,
}

impl BucketView {
    fn new(bucket: BucketId, replicas: ReplicaSet) -> Self {
        Self {
            bucket: bucket.to_string(),
            raw: bucket.raw(),
            used_bits: bucket.used_bits(),
            replicas,
            decision: None,
        }
    }
}

#[derive(Serialize)]
struct ExecutorView {
    lanes: usize,
    execute_count: u64,
    drain_count: u64,
    lane_counts: Vec<u64>,
}

// ==================== Request types ====================

#[derive(Deserialize)]
struct ListBucketsQuery {
    /// Bucket id (decimal raw or 0x hex); whole key-space if absent
    prefix: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SetNodeStateRequest {
    state: NodeState,
}

// ==================== Handlers ====================

async fn get_bucket(
    State(distributor): State<Arc<Distributor>>,
    Path(bucket_id): Path<String>,
) -> impl IntoResponse {
    let bucket: BucketId = match bucket_id.parse() {
        Ok(bucket) => bucket,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, ApiResponse::<BucketView>::err(e.to_string()))
        }
    };
    let db = distributor.database();
    let Some(replicas) = db.get(&bucket) else {
        return (
            StatusCode::NOT_FOUND,
            ApiResponse::<BucketView>::err(format!("{} not found", bucket)),
        );
    };

    // what a pass would decide right now
    let sibling = bucket.sibling().and_then(|s| db.get(&s));
    let stats = distributor.scheduler().stats();
    let decision = distributor.scheduler().generator().prioritize_replicas(
        &bucket,
        Some(&replicas),
        sibling.as_ref(),
        &stats,
    );

    let mut view = BucketView::new(bucket, replicas);
    view.decision = Some(decision);
    (StatusCode::OK, ApiResponse::ok(view))
}

async fn list_buckets(
    State(distributor): State<Arc<Distributor>>,
    Query(query): Query<ListBucketsQuery>,
) -> impl IntoResponse {
    let prefix = match query.prefix.as_deref().map(str::parse::<BucketId>) {
        None => BucketId::root(),
        Some(Ok(prefix)) => prefix,
        Some(Err(e)) => {
            return (
                StatusCode::BAD_REQUEST,
                ApiResponse::<Vec<BucketView>>::err(e.to_string()),
            )
        }
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let db = distributor.database();
    let buckets: Vec<_> = db
        .range_iterate(prefix)
        .filter_map(|bucket| db.get(&bucket).map(|replicas| BucketView::new(bucket, replicas)))
        .take(limit)
        .collect();
    (StatusCode::OK, ApiResponse::ok(buckets))
}

async fn post_report(
    State(distributor): State<Arc<Distributor>>,
    Json(report): Json<BucketReport>,
) -> impl IntoResponse {
    match distributor.database().update(&report) {
        Ok(outcome) => (StatusCode::OK, ApiResponse::ok(outcome)),
        Err(e) => (StatusCode::BAD_REQUEST, ApiResponse::err(e.to_string())),
    }
}

async fn list_nodes(State(distributor): State<Arc<Distributor>>) -> impl IntoResponse {
    let nodes: BTreeMap<NodeIndex, NodeEntry> = distributor.node_states().snapshot();
    ApiResponse::ok(nodes)
}

async fn set_node_state(
    State(distributor): State<Arc<Distributor>>,
    Path(node): Path<NodeIndex>,
    Json(req): Json<SetNodeStateRequest>,
) -> impl IntoResponse {
    let removed = distributor.set_node_state(node, req.state);
    info!(node, state = %req.state, "Node state set via HTTP API");
    ApiResponse::ok(removed)
}

async fn get_stats(State(distributor): State<Arc<Distributor>>) -> impl IntoResponse {
    ApiResponse::ok(distributor.scheduler().stats())
}

async fn trigger_pass(State(distributor): State<Arc<Distributor>>) -> impl IntoResponse {
    distributor.scheduler().trigger();
    ApiResponse::ok(())
}

async fn get_last_pass(State(distributor): State<Arc<Distributor>>) -> impl IntoResponse {
    ApiResponse::ok(distributor.scheduler().last_pass())
}

async fn list_pending(State(distributor): State<Arc<Distributor>>) -> impl IntoResponse {
    ApiResponse::ok(distributor.scheduler().pending())
}

async fn get_executor(State(distributor): State<Arc<Distributor>>) -> impl IntoResponse {
    let executor = distributor.executor();
    ApiResponse::ok(ExecutorView {
        lanes: sequenced::SequencedExecutor::lane_count(executor.as_ref()),
        execute_count: executor.execute_count(),
        drain_count: executor.drain_count(),
        lane_counts: executor.lane_counts(),
    })
}

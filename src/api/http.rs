//! HTTP API Server
//!
//! Read-only REST API exposing replication metrics and per-peer state.

use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::replication::{
    MetricsSnapshot, RemoteReplicaStatus, ReplicaRegistry, ReplicaState, ReplicationMetrics,
};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Peers being replicated from
    pub registry: Arc<ReplicaRegistry>,
    /// Replication metrics
    pub metrics: Arc<ReplicationMetrics>,
    /// Process start time
    pub started_at: DateTime<Utc>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        node_id: String,
        registry: Arc<ReplicaRegistry>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        let state = Arc::new(AppState {
            node_id,
            registry,
            metrics,
            started_at: Utc::now(),
        });

        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/metrics", get(handle_metrics))
            .route("/replicas", get(handle_replicas))
            .route("/replicas/:partition", get(handle_partition_replicas))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub live_replica_threads: usize,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_seconds: i64,
    pub peers: usize,
    pub in_sync: usize,
    pub catching_up: usize,
    pub error: usize,
    pub total_lag_in_bytes: u64,
    pub replication_errors: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        live_replica_threads: state.metrics.live_threads(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let peers: Vec<_> = state.registry.snapshot().iter().map(|p| p.status()).collect();
    let count = |s: ReplicaState| peers.iter().filter(|p| p.state == s).count();

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        peers: peers.len(),
        in_sync: count(ReplicaState::InSync),
        catching_up: count(ReplicaState::CatchingUp),
        error: count(ReplicaState::Error),
        total_lag_in_bytes: peers.iter().map(|p| p.lag_in_bytes).sum(),
        replication_errors: state.metrics.replication_errors(),
    })
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn handle_replicas(State(state): State<Arc<AppState>>) -> Json<Vec<RemoteReplicaStatus>> {
    Json(state.registry.snapshot().iter().map(|p| p.status()).collect())
}

async fn handle_partition_replicas(
    State(state): State<Arc<AppState>>,
    Path(partition): Path<u64>,
) -> std::result::Result<Json<Vec<RemoteReplicaStatus>>, (StatusCode, Json<ErrorResponse>)> {
    let peers: Vec<_> = state
        .registry
        .snapshot()
        .iter()
        .filter(|p| p.partition().0 == partition)
        .map(|p| p.status())
        .collect();

    if peers.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no peers replicated for partition {}", partition),
            }),
        ));
    }
    Ok(Json(peers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::testing::{node, remote_info};
    use crate::replication::Token;

    fn state() -> Arc<AppState> {
        let registry = Arc::new(ReplicaRegistry::new());
        let local = node("a", "dc1");
        let b = remote_info(1, &local, &node("b", "dc1"));
        let c = remote_info(2, &local, &node("c", "dc2"));
        b.set_token(Token::new(100)).unwrap();
        b.update_lag(250);
        c.record_failure();
        registry.insert(b);
        registry.insert(c);

        Arc::new(AppState {
            node_id: "node-a".into(),
            registry,
            metrics: Arc::new(ReplicationMetrics::new("test")),
            started_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_status_counts_states() {
        let Json(status) = handle_status(State(state())).await;
        assert_eq!(status.peers, 2);
        assert_eq!(status.catching_up, 1);
        assert_eq!(status.error, 1);
        assert_eq!(status.total_lag_in_bytes, 150);
    }

    #[tokio::test]
    async fn test_partition_filter() {
        let Json(peers) = handle_partition_replicas(State(state()), Path(1)).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].token, 100);

        let (code, _) = handle_partition_replicas(State(state()), Path(7)).await.unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_replicas_serialize() {
        let Json(peers) = handle_replicas(State(state())).await;
        let json = serde_json::to_value(&peers).unwrap();
        assert_eq!(json[1]["state"], "ERROR");
        assert_eq!(json[0]["locality"], "intra_colo");
    }
}

//! HTTP endpoint: Prometheus scrape target plus a JSON view of peers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use pingwatch_core::PeerId;
use pingwatch_services::{GaugeRegistry, LastSeenError, PeerLastSeen};

use crate::membership::{PeerOrigin, PeerTable};

#[derive(Clone)]
pub struct StatusState {
    pub self_id: PeerId,
    pub gauges: Arc<GaugeRegistry>,
    pub last_seen: PeerLastSeen<PeerId>,
    pub peers: PeerTable,
}

// ── /metrics ──────────────────────────────────────────────────────────────────

async fn handle_metrics(State(state): State<StatusState>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.gauges.render().map_err(|e| {
        tracing::error!(error = %e, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub node_id: String,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Serialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub addr: Option<String>,
    pub bootstrap: bool,
    /// Seconds since the last successful probe. None if never probed
    /// successfully or already expired.
    pub last_seen_secs: Option<u64>,
}

async fn handle_peers(
    State(state): State<StatusState>,
) -> Result<Json<PeersResponse>, StatusCode> {
    let offline = |e: LastSeenError| {
        tracing::warn!(error = %e, "peer registry unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    };

    let mut peers: Vec<PeerInfo> = state
        .peers
        .entries()
        .into_iter()
        .map(|(id, entry)| -> Result<PeerInfo, LastSeenError> {
            Ok(PeerInfo {
                node_id: id.to_string(),
                addr: Some(entry.addr.to_string()),
                bootstrap: entry.origin == PeerOrigin::Bootstrap,
                last_seen_secs: state.last_seen.last_seen(&id)?.map(|t| t.elapsed().as_secs()),
            })
        })
        .collect::<Result<_, _>>()
        .map_err(offline)?;

    // Peers already dropped from the table but not yet expired.
    for (id, seen) in state.last_seen.snapshot().map_err(offline)? {
        if state.peers.addr_of(&id).is_none() {
            peers.push(PeerInfo {
                node_id: id.to_string(),
                addr: None,
                bootstrap: false,
                last_seen_secs: Some(seen.elapsed().as_secs()),
            });
        }
    }
    peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    Ok(Json(PeersResponse {
        node_id: state.self_id.to_string(),
        peers,
    }))
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/peers", get(handle_peers))
        .with_state(state)
}

pub async fn serve(state: StatusState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

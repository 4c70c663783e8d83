//! Liveness and readiness probes.
//!
//! `/healthz` answers 200 once the process is up. `/readyz` answers 200 only
//! after the first successful broker connection.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Flags served by the probe endpoints
#[derive(Debug, Default)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthState {
    /// Mark the process as alive
    pub fn set_live(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    /// Mark the controller ready to serve (first broker connection made)
    pub fn set_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("Controller is ready");
        }
    }

    /// Current liveness
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Current readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

fn probe(ok: bool) -> (StatusCode, &'static str) {
    if ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn healthz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    probe(state.is_live())
}

async fn readyz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    probe(state.is_ready())
}

/// Router exposing `/healthz` and `/readyz`
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the probes until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    state: Arc<HealthState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health endpoints listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status_of(state: Arc<HealthState>, path: &str) -> StatusCode {
        router(state)
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_probes_follow_state() {
        let state = Arc::new(HealthState::default());
        assert_eq!(status_of(state.clone(), "/healthz").await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of(state.clone(), "/readyz").await, StatusCode::SERVICE_UNAVAILABLE);

        state.set_live();
        assert_eq!(status_of(state.clone(), "/healthz").await, StatusCode::OK);
        assert_eq!(status_of(state.clone(), "/readyz").await, StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        assert_eq!(status_of(state.clone(), "/readyz").await, StatusCode::OK);
    }
}

use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::AppResult;
use crate::handlers::{AppState, component_health, health_summary};

pub fn create_health_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_summary))
        .route("/health/components/{name}", get(component_health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the health routes on `addr` until `shutdown` fires.
pub async fn serve_health(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "health server listening");

    axum::serve(listener, create_health_routes(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("health server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::StatusRegistry;
    use axum::{body::Body, http::Request, http::StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, JsonValue) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_summary_reports_degraded_with_200() {
        let registry = StatusRegistry::new("m-1", 1);
        registry.record_success("heartbeat").await;
        registry.record_failure("commands", "poll timed out").await;

        let (status, body) =
            get_json(create_health_routes(AppState { registry }), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 200);
        assert_eq!(body["data"]["status"], "degraded");
        assert_eq!(body["data"]["machineId"], "m-1");
        assert_eq!(body["data"]["components"]["commands"]["lastError"], "poll timed out");
        assert_eq!(body["data"]["components"]["heartbeat"]["state"], "healthy");
    }

    #[tokio::test]
    async fn test_component_route() {
        let registry = StatusRegistry::new("m-1", 3);
        registry.set_detail("telemetry", "dropped", 2u64).await;
        let router = create_health_routes(AppState { registry });

        let (status, body) = get_json(router.clone(), "/health/components/telemetry").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["details"]["dropped"], 2);

        let (status, body) = get_json(router, "/health/components/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_health(
            "127.0.0.1:0".parse().unwrap(),
            AppState {
                registry: StatusRegistry::new("m-1", 3),
            },
            shutdown.clone(),
        ));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}

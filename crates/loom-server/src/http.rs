use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::AppState;

/// Binds a localhost-only listener and serves the read-only dashboard
/// router until ctrl-c or the listener errors out.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "dashboard listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/health", get(health))
        .route("/event", get(events))
        .route("/session", get(session))
        .route("/session/stats", get(session_stats))
        .route("/features", get(features))
        .route("/workers", get(workers))
        .route("/protocols", get(protocols))
        .route("/violations", get(violations))
        .route("/audit", get(audit_log))
        .route("/proposals", get(proposals))
        .route("/sync/instances", get(sync_instances))
        .route("/sync/vector", get(sync_vector))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"healthy": true, "version": env!("CARGO_PKG_VERSION")}))
}

async fn session(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.controller.session_status().await {
        Some(session) => Ok(Json(json!(session))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn session_stats(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    state
        .controller
        .session_stats()
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

async fn features(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.controller.session_status().await {
        Some(session) => Ok(Json(json!(session.features))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn workers(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.workers.snapshot().await))
}

async fn protocols(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.registry.list().await))
}

async fn violations(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.registry.violations().await))
}

async fn audit_log(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.registry.audit_log().await))
}

async fn proposals(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.proposals.list().await))
}

async fn sync_instances(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.sync.known_instances().await))
}

async fn sync_vector(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.controller.sync.version_vector().await))
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.controller.event_bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| {
        item.ok().map(|event| Ok(Event::default().event(event.event_type.clone()).json_data(event).unwrap_or_default()))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use loom_orchestrator::SessionController;
    use tower::ServiceExt;

    use super::*;

    async fn test_app() -> (Router, Arc<SessionController>) {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(SessionController::new(dir.path()));
        let state = AppState::new(controller.clone());
        (app_router(state), controller)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _controller) = test_app().await;
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn session_is_404_before_init() {
        let (app, _controller) = test_app().await;
        let req = Request::builder().uri("/session").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_is_ok_after_init() {
        let (app, controller) = test_app().await;
        controller.session_init("build the thing", Vec::new()).await.unwrap();
        let req = Request::builder().uri("/session").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protocols_and_proposals_start_empty() {
        let (app, _controller) = test_app().await;
        let req = Request::builder().uri("/protocols").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let req = Request::builder().uri("/proposals").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

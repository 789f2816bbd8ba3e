//! HTTP and WebSocket surface of the agent

use crate::agent::AgentContext;
use crate::hub::{Observer, ObserverError, ObserverId};
use crate::scheduler::TriggerRejection;
use crate::{AgentError, Result};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use idlegpu_core::StatusEvent;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Create the Axum router with all routes
pub fn create_router(context: AgentContext) -> Router {
    let enable_cors = context.config.http.enable_cors;

    let mut router = Router::new()
        .route("/health", get(health_check))
        // Indexing status and manual trigger
        .route("/v1/embeddings/status", get(embeddings_status))
        .route("/v1/embeddings/index", post(trigger_indexing))
        // Foreground activity
        .route("/v1/activity", post(record_activity))
        .route("/v1/sessions/:session_id/title", post(update_session_title))
        .route("/v1/scheduler", get(scheduler_status))
        // Live status push
        .route("/ws", get(websocket_handler))
        .with_state(context);

    router = router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    if enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// Serve HTTP requests on `listener` until `shutdown` resolves
pub async fn serve<F>(context: AgentContext, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Starting HTTP server on {}", addr);

    let app = create_router(context);
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!("HTTP server error: {}", e);
        return Err(AgentError::Service(format!("HTTP server failed: {}", e)));
    }

    info!("HTTP server on {} stopped", addr);
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health_check(State(context): State<AgentContext>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": idlegpu_core::VERSION,
        "monitor_running": context.monitor.is_running(),
        "scheduler_running": context.scheduler.is_running(),
    }))
}

async fn embeddings_status(State(context): State<AgentContext>) -> impl IntoResponse {
    let snapshot = context.monitor.snapshot();
    Json(json!({
        "is_indexing": context.scheduler.is_indexing(),
        "gpu_utilization": snapshot.utilization,
        "gpu_available": snapshot.available,
    }))
}

async fn trigger_indexing(State(context): State<AgentContext>) -> Response {
    match context.scheduler.trigger().await {
        Ok(status) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": "Indexing started",
                "status": status,
            })),
        )
            .into_response(),
        Err(rejection) => {
            let status = match rejection {
                TriggerRejection::AlreadyRunning => StatusCode::CONFLICT,
                TriggerRejection::AcceleratorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                TriggerRejection::StartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            debug!("Manual indexing trigger rejected: {}", rejection);
            error_response(status, rejection.to_string())
        }
    }
}

async fn record_activity(State(context): State<AgentContext>) -> impl IntoResponse {
    let phase = context.scheduler.record_activity();
    Json(json!({ "status": "ok", "phase": phase }))
}

#[derive(Debug, Deserialize)]
struct TitleUpdate {
    title: String,
}

async fn update_session_title(
    State(context): State<AgentContext>,
    Path(session_id): Path<String>,
    Json(update): Json<TitleUpdate>,
) -> Response {
    let title = update.title.trim();
    if title.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Title must not be empty");
    }

    let report = context
        .hub
        .publish(&StatusEvent::title_changed(session_id.as_str(), title))
        .await;

    Json(json!({
        "session_id": session_id,
        "title": title,
        "delivered": report.delivered,
    }))
    .into_response()
}

async fn scheduler_status(State(context): State<AgentContext>) -> impl IntoResponse {
    Json(json!({
        "scheduler": context.scheduler.get_status(),
        "workload": context.slots.current(),
        "gpu": context.monitor.snapshot(),
        "observers": context.hub.len(),
    }))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(context): State<AgentContext>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

/// One websocket client registered with the hub
struct WsObserver {
    id: ObserverId,
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl Observer for WsObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    async fn send(&self, message: &str) -> std::result::Result<(), ObserverError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|e| ObserverError::Send(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

async fn handle_socket(socket: WebSocket, context: AgentContext) {
    let (sink, mut stream) = socket.split();
    let observer = Arc::new(WsObserver {
        id: Uuid::new_v4(),
        sink: tokio::sync::Mutex::new(sink),
    });

    if !context.hub.register(observer.clone()).await {
        return;
    }

    let ping = match serde_json::to_string(&StatusEvent::ping()) {
        Ok(ping) => ping,
        Err(e) => {
            error!("Failed to serialize ping: {}", e);
            context.hub.unregister(observer.id);
            return;
        }
    };

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(_)) => {
                if observer.send(&ping).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Websocket {} receive error: {}", observer.id, e);
                break;
            }
        }
    }

    context.hub.unregister(observer.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentBuilder;
    use crate::config::AgentConfig;
    use crate::indexing::InMemoryDocumentStore;
    use crate::mock::{MockIndexer, MockLoader, RecordingObserver};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use idlegpu_core::{AcceleratorBackend, Document};
    use idlegpu_monitor::mock::MockProbe;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn context_with(
        utilization: Option<f64>,
        indexer: MockIndexer,
    ) -> (crate::Agent, AgentContext) {
        let mut config = AgentConfig::default();
        let store = InMemoryDocumentStore::new();
        store.insert(Document::new("notes.md", "markdown"));

        let mut builder = AgentBuilder::new()
            .with_loader(Arc::new(MockLoader::new()))
            .with_document_store(Arc::new(store))
            .with_indexer(Arc::new(indexer));

        match utilization {
            Some(utilization) => {
                builder = builder.with_probe(Arc::new(MockProbe::with_utilization(utilization)))
            }
            None => config.core.monitor.backend = AcceleratorBackend::None,
        }

        let agent = builder.with_config(config).build().await.unwrap();
        if utilization.is_some() {
            agent.context().monitor.poll_once().await;
        }
        let context = agent.context();
        (agent, context)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn post(uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method("POST").uri(uri);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_agent, context) = context_with(Some(0.0), MockIndexer::completing()).await;
        let (status, body) = send(create_router(context), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_embeddings_status() {
        let (_agent, context) = context_with(Some(42.0), MockIndexer::completing()).await;
        let (status, body) = send(create_router(context), get("/v1/embeddings/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_indexing"], false);
        assert_eq!(body["gpu_utilization"], 42.0);
        assert_eq!(body["gpu_available"], true);
    }

    #[tokio::test]
    async fn test_embeddings_status_without_accelerator() {
        let (_agent, context) = context_with(None, MockIndexer::completing()).await;
        let (status, body) = send(create_router(context), get("/v1/embeddings/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gpu_available"], false);
        assert_eq!(body["gpu_utilization"], 0.0);
    }

    #[tokio::test]
    async fn test_trigger_indexing_conflict() {
        let (_agent, context) = context_with(Some(0.0), MockIndexer::until_cancelled()).await;
        let router = create_router(context.clone());

        let (status, body) = send(router.clone(), post("/v1/embeddings/index", None)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message"], "Indexing started");
        assert_eq!(body["status"]["is_indexing"], true);

        let (status, body) = send(router.clone(), post("/v1/embeddings/index", None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Indexing already in progress");

        let (_, body) = send(router, post("/v1/activity", None)).await;
        assert_eq!(body["phase"], "cancel_requested");
        context.scheduler.wait_for_job().await;
        assert!(!context.scheduler.is_indexing());
    }

    #[tokio::test]
    async fn test_trigger_indexing_without_accelerator() {
        let (_agent, context) = context_with(None, MockIndexer::completing()).await;
        let (status, body) = send(create_router(context), post("/v1/embeddings/index", None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "GPU unavailable");
    }

    #[tokio::test]
    async fn test_activity_while_idle() {
        let (_agent, context) = context_with(Some(0.0), MockIndexer::completing()).await;
        let (status, body) = send(create_router(context), post("/v1/activity", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "idle");
    }

    #[tokio::test]
    async fn test_session_title_is_broadcast() {
        let (_agent, context) = context_with(Some(0.0), MockIndexer::completing()).await;
        let observer = Arc::new(RecordingObserver::new());
        context.hub.register(observer.clone()).await;

        let request = post("/v1/sessions/s-42/title", Some(json!({"title": "  Trip planning "})));
        let (status, body) = send(create_router(context), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 1);

        let last = observer.messages().pop().unwrap();
        assert_eq!(last["type"], "session_title_update");
        assert_eq!(last["session_id"], "s-42");
        assert_eq!(last["title"], "Trip planning");
    }

    #[tokio::test]
    async fn test_empty_session_title_rejected() {
        let (_agent, context) = context_with(Some(0.0), MockIndexer::completing()).await;
        let request = post("/v1/sessions/s-42/title", Some(json!({"title": "   "})));
        let (status, body) = send(create_router(context), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_scheduler_status() {
        let (_agent, context) = context_with(Some(3.0), MockIndexer::completing()).await;
        let (status, body) = send(create_router(context), get("/v1/scheduler")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduler"]["phase"], "idle");
        assert_eq!(body["workload"]["loaded"], false);
        assert_eq!(body["gpu"]["utilization"], 3.0);
        assert_eq!(body["observers"], 0);
    }
}

//! HTTP surface of the sync service: JSON reads, topic updates and change events.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use legendtrack_core::{Snapshot, TopicUpdate};
use legendtrack_sync::{SyncEvent, SyncRuntime};
use legendtrack_workbook::{apply_update, load_snapshot};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "legendtrack-web";

#[derive(Clone)]
pub struct AppState {
    pub runtime: SyncRuntime,
}

impl AppState {
    pub fn new(runtime: SyncRuntime) -> Self {
        Self { runtime }
    }
}

/// Routes are mounted at the root and again under `/api`.
pub fn app(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/topics", get(topics_handler))
        .route("/topics/{id}", post(update_topic_handler))
        .route("/projects", get(projects_handler))
        .route("/summary", get(summary_handler))
        .route("/events", get(events_handler))
        .with_state(Arc::new(state));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .layer(CorsLayer::permissive())
}

pub async fn serve(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let port = state.runtime.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "LegendTrack API listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn topics_handler(State(state): State<Arc<AppState>>) -> Response {
    match read_snapshot(&state).await {
        Ok(snapshot) => Json(snapshot.topics).into_response(),
        Err(err) => server_error(err),
    }
}

async fn projects_handler(State(state): State<Arc<AppState>>) -> Response {
    match read_snapshot(&state).await {
        Ok(snapshot) => Json(snapshot.projects).into_response(),
        Err(err) => server_error(err),
    }
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match read_snapshot(&state).await {
        Ok(snapshot) => Json(snapshot.summary()).into_response(),
        Err(err) => server_error(err),
    }
}

async fn update_topic_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    payload: Result<Json<TopicUpdate>, JsonRejection>,
) -> Response {
    let update = match payload {
        Ok(Json(update)) => update,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let path = state.runtime.config.tracker_path.clone();
    let topic_id = id.clone();
    let applied = tokio::task::spawn_blocking(move || apply_update(&path, &topic_id, &update)).await;
    match applied {
        Ok(Ok(_)) => {
            state.runtime.coordinator.request();
            Json(json!({ "ok": true })).into_response()
        }
        Ok(Err(err)) => {
            warn!(topic_id = %id, error = %err, "topic update rejected");
            bad_request(err.to_string())
        }
        Err(err) => server_error(err.into()),
    }
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // A lagged receiver still learns that something changed.
    let stream = BroadcastStream::new(state.runtime.notifier().subscribe()).map(|received| {
        let event = received.unwrap_or(SyncEvent::TopicsUpdated);
        Ok(Event::default()
            .event(event.name())
            .data(json!({ "event": event.name() }).to_string()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn read_snapshot(state: &AppState) -> anyhow::Result<Snapshot> {
    let path = state.runtime.config.tracker_path.clone();
    Ok(tokio::task::spawn_blocking(move || load_snapshot(&path)).await??)
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": format!("{err:#}") })),
    )
        .into_response()
}

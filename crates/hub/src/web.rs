use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::FeedError;
use crate::feedlog::FeedLogEntry;
use crate::pond::PondRegistry;
use crate::state::SharedState;
use crate::timefmt::format_time_12h;

#[derive(Clone)]
pub struct AppState {
    pub ponds: Arc<PondRegistry>,
    pub system: SharedState,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/ponds/{id}/feeding", get(get_feeding))
        .route("/api/ponds/{id}/schedule", put(put_schedule))
        .route("/api/ponds/{id}/schedule/times", post(post_time))
        .route("/api/ponds/{id}/schedule/times/{time}", delete(delete_time))
        .route("/api/ponds/{id}/mode", put(put_mode))
        .route("/api/ponds/{id}/config", put(put_config))
        .route("/api/ponds/{id}/feed", post(post_feed))
        .route("/api/ponds/{id}/logs", get(get_logs))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

impl IntoResponse for FeedError {
    fn into_response(self) -> Response {
        let status = match &self {
            FeedError::UnknownPond(_) => StatusCode::NOT_FOUND,
            FeedError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FeedError::Persistence { .. } | FeedError::Read { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, FeedError>;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ScheduleEntry {
    time: String,
    display: String,
}

fn display_schedule(times: &[String]) -> Vec<ScheduleEntry> {
    times
        .iter()
        .map(|t| ScheduleEntry {
            time: t.clone(),
            display: format_time_12h(t),
        })
        .collect()
}

#[derive(Serialize)]
struct FeedingView {
    pond_id: String,
    name: String,
    schedule: Vec<ScheduleEntry>,
    manual_mode: bool,
    feed_kg: f64,
    feeder_diameter: u32,
}

#[derive(Serialize)]
struct ScheduleView {
    /// False when the request left the schedule unchanged.
    changed: bool,
    schedule: Vec<ScheduleEntry>,
}

#[derive(Deserialize)]
struct ScheduleBody {
    times: Vec<String>,
}

#[derive(Deserialize)]
struct TimeBody {
    time: String,
}

#[derive(Deserialize, Serialize)]
struct ModeBody {
    manual: bool,
}

#[derive(Deserialize, Serialize)]
struct ConfigBody {
    kg: f64,
    diameter_mm: u32,
}

#[derive(Deserialize)]
struct LogsQuery {
    date: Option<String>,
}

#[derive(Serialize)]
struct LogsView {
    date: String,
    entries: Vec<FeedLogEntry>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.system.read().await;
    Json(st.to_status(app.ponds.ids()))
}

async fn get_feeding(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<FeedingView> {
    let pond = app.ponds.get(&id)?;
    let state = pond.state();
    Ok(Json(FeedingView {
        pond_id: id,
        name: pond.name().to_string(),
        schedule: display_schedule(&state.schedule),
        manual_mode: state.manual_mode,
        feed_kg: state.feed_kg,
        feeder_diameter: state.feeder_diameter,
    }))
}

async fn put_schedule(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<ScheduleView> {
    let written = app.ponds.get(&id)?.set_schedule(&body.times).await?;
    Ok(Json(ScheduleView {
        changed: true,
        schedule: display_schedule(&written),
    }))
}

async fn post_time(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TimeBody>,
) -> ApiResult<ScheduleView> {
    let pond = app.ponds.get(&id)?;
    let view = match pond.add_time(&body.time).await? {
        Some(updated) => ScheduleView {
            changed: true,
            schedule: display_schedule(&updated),
        },
        None => ScheduleView {
            changed: false,
            schedule: display_schedule(&pond.state().schedule),
        },
    };
    Ok(Json(view))
}

async fn delete_time(
    State(app): State<AppState>,
    Path((id, time)): Path<(String, String)>,
) -> ApiResult<ScheduleView> {
    let pond = app.ponds.get(&id)?;
    let view = match pond.remove_time(&time).await? {
        Some(updated) => ScheduleView {
            changed: true,
            schedule: display_schedule(&updated),
        },
        None => ScheduleView {
            changed: false,
            schedule: display_schedule(&pond.state().schedule),
        },
    };
    Ok(Json(view))
}

async fn put_mode(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ModeBody>,
) -> ApiResult<ModeBody> {
    app.ponds.get(&id)?.set_mode(body.manual).await?;
    Ok(Json(body))
}

async fn put_config(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ConfigBody>,
) -> ApiResult<ConfigBody> {
    app.ponds
        .get(&id)?
        .set_config(body.kg, body.diameter_mm)
        .await?;
    Ok(Json(body))
}

async fn post_feed(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<FeedLogEntry> {
    let entry = app.ponds.get(&id)?.feed_now().await?;
    Ok(Json(entry))
}

async fn get_logs(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<LogsView> {
    let (date, entries) = app.ponds.get(&id)?.logs(q.date.as_deref()).await?;
    Ok(Json(LogsView { date, entries }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::RecordingFeeder;
    use crate::notify::RecordingNotifier;
    use crate::pond::{PondServices, PondSession};
    use crate::state::SystemState;
    use crate::store::{MemoryStore, RealtimeStore};
    use crate::timefmt::ManualClock;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use time::macros::datetime;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    async fn app_with(store: Arc<MemoryStore>) -> Router {
        let services = PondServices {
            store,
            notifier: Arc::new(RecordingNotifier::default()),
            feeder: Arc::new(RecordingFeeder::default()),
            clock: Arc::new(ManualClock::at(datetime!(2026-10-14 09:00:00 UTC))),
            respect_manual_mode: true,
            poll_interval: Duration::from_secs(3600),
        };
        let mut registry = PondRegistry::new();
        registry.insert(PondSession::open(&services, "pond-a", "Pond A").await);
        router(AppState {
            ponds: Arc::new(registry),
            system: Arc::new(RwLock::new(SystemState::new())),
        })
    }

    async fn app() -> Router {
        app_with(Arc::new(MemoryStore::new())).await
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn status_lists_ponds() {
        let (status, body) = send(app().await, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ponds"], json!(["pond-a"]));
        assert_eq!(body["mqtt_connected"], false);
    }

    #[tokio::test]
    async fn feeding_includes_display_times() {
        let store = Arc::new(MemoryStore::new());
        store.set("pond-a/feeding_schedule", json!(["13:30"])).await.unwrap();
        let (status, body) = send(app_with(store).await, "GET", "/api/ponds/pond-a/feeding", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schedule"][0]["time"], "13:30");
        assert_eq!(body["schedule"][0]["display"], "1:30 PM");
        assert_eq!(body["feeder_diameter"], 30);
    }

    #[tokio::test]
    async fn unknown_pond_is_404() {
        let (status, body) = send(app().await, "GET", "/api/ponds/nope/feeding", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn put_schedule_normalizes() {
        let (status, body) = send(
            app().await,
            "PUT",
            "/api/ponds/pond-a/schedule",
            Some(json!({ "times": ["9:00", "08:00", "09:00"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schedule"][0]["time"], "08:00");
        assert_eq!(body["schedule"][1]["time"], "09:00");
        assert_eq!(body["schedule"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bad_schedule_is_422() {
        let (status, _) = send(
            app().await,
            "PUT",
            "/api/ponds/pond-a/schedule",
            Some(json!({ "times": ["noon"] })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn add_time_reports_change() {
        let (status, body) = send(
            app().await,
            "POST",
            "/api/ponds/pond-a/schedule/times",
            Some(json!({ "time": "7:45" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        assert_eq!(body["schedule"][0]["time"], "07:45");
    }

    #[tokio::test]
    async fn delete_absent_time_is_unchanged() {
        let (status, body) = send(
            app().await,
            "DELETE",
            "/api/ponds/pond-a/schedule/times/08:00",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], false);
    }

    #[tokio::test]
    async fn config_validation_is_422() {
        let (status, _) = send(
            app().await,
            "PUT",
            "/api/ponds/pond-a/config",
            Some(json!({ "kg": 1.0, "diameter_mm": 25 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn write_failure_is_503() {
        let store = Arc::new(MemoryStore::new());
        let app = app_with(store.clone()).await;
        store.fail_writes(true);
        let (status, _) = send(app, "PUT", "/api/ponds/pond-a/mode", Some(json!({ "manual": true }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn manual_feed_then_logs() {
        let store = Arc::new(MemoryStore::new());
        let (status, entry) = send(app_with(store.clone()).await, "POST", "/api/ponds/pond-a/feed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry["method"], "manual");
        assert_eq!(entry["time"], "09:00");

        let (status, logs) = send(app_with(store).await, "GET", "/api/ponds/pond-a/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs["date"], "2026-10-14");
        assert_eq!(logs["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn logs_bad_date_is_422() {
        let (status, _) = send(app().await, "GET", "/api/ponds/pond-a/logs?date=yesterday", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}

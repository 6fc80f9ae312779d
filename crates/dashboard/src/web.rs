use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::backend::Backend;
use crate::error::TrackerError;
use crate::state::{Dashboard, PlantView, ScheduleResponse, StatusResponse};

type Shared<B> = Arc<Dashboard<B>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    fn unknown_plant(plant_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: format!("plant {plant_id} is not tracked"),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        let status = if e.is_internal() {
            StatusCode::CONFLICT
        } else {
            StatusCode::BAD_GATEWAY
        };
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Malformed bodies and wrong content types keep axum's status code but use
/// the same JSON descriptor as every other failure.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            kind: "bad_request",
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "kind": self.kind, "error": self.message })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<B: Backend>(dashboard: Shared<B>) -> Router {
    Router::new()
        .route("/api/status", get(api_status::<B>))
        .route("/api/plants/{id}", get(api_plant::<B>))
        .route("/api/plants/{id}/refresh", post(api_refresh::<B>))
        .route("/api/plants/{id}/pump", put(api_pump::<B>))
        .route("/api/schedule", get(api_schedule::<B>))
        .route("/api/schedule/refresh", post(api_schedule_refresh::<B>))
        .route("/api/soil", get(api_soil::<B>).post(api_store_soil::<B>))
        .with_state(dashboard)
}

async fn api_status<B: Backend>(State(d): State<Shared<B>>) -> Json<StatusResponse> {
    Json(d.to_status().await)
}

async fn api_plant<B: Backend>(
    State(d): State<Shared<B>>,
    Path(id): Path<String>,
) -> Result<Json<PlantView>, ApiError> {
    d.plant(&id)
        .map(Json)
        .ok_or_else(|| ApiError::unknown_plant(&id))
}

async fn api_refresh<B: Backend>(
    State(d): State<Shared<B>>,
    Path(id): Path<String>,
) -> Result<Json<PlantView>, ApiError> {
    let result = d
        .refresh_plant(&id)
        .await
        .ok_or_else(|| ApiError::unknown_plant(&id))?;
    Ok(Json(result?))
}

async fn api_pump<B: Backend>(
    State(d): State<Shared<B>>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<PlantView>, ApiError> {
    let Json(body) = body?;
    let on = body
        .get("state")
        .and_then(Value::as_bool)
        .ok_or_else(|| ApiError::bad_request("Invalid state value."))?;
    let result = d
        .command_pump(&id, on)
        .await
        .ok_or_else(|| ApiError::unknown_plant(&id))?;
    Ok(Json(result?))
}

async fn api_schedule<B: Backend>(State(d): State<Shared<B>>) -> Json<ScheduleResponse> {
    Json(d.to_schedule_now().await)
}

async fn api_schedule_refresh<B: Backend>(
    State(d): State<Shared<B>>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    d.refresh_schedules().await?;
    Ok(Json(d.to_schedule_now().await))
}

async fn api_soil<B: Backend>(State(d): State<Shared<B>>) -> Result<Json<Value>, ApiError> {
    Ok(Json(d.soil_reading().await?))
}

async fn api_store_soil<B: Backend>(
    State(d): State<Shared<B>>,
    record: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(record) = record?;
    if !record.is_object() {
        return Err(ApiError::bad_request("soil record must be a JSON object"));
    }
    Ok(Json(d.store_soil_reading(&record).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until ctrl-c.
pub async fn serve<B: Backend>(dashboard: Shared<B>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("dashboard api listening on http://{addr}");

    axum::serve(listener, router(dashboard))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PlantForecastMsg, StatusReading};
    use crate::config::PlantEntry;
    use crate::schedule::ScheduleThresholds;
    use crate::state::DashboardSettings;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StubBackend {
        down: AtomicBool,
    }

    impl Backend for StubBackend {
        async fn fetch_status(&self, _plant_id: &str) -> Result<StatusReading, TrackerError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TrackerError::Network("connection refused".into()));
            }
            Ok(StatusReading {
                pump_on: false,
                water_level_percent: 15.0,
            })
        }

        async fn command_pump(&self, _plant_id: &str, on: bool) -> Result<Option<bool>, TrackerError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TrackerError::Network("connection refused".into()));
            }
            Ok(Some(on))
        }

        async fn fetch_forecast(&self) -> Result<Vec<PlantForecastMsg>, TrackerError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TrackerError::Server {
                    status: 503,
                    body: String::new(),
                });
            }
            Ok(serde_json::from_value(json!([{
                "plantId": "onion-303",
                "plantName": "Onion",
                "color": "#d97706",
                "soilDeficit": 0.25,
                "schedule": [
                    {"day": "Sun", "date": "20/10", "rain_mm": 0.0, "etc_mm": 3.0, "needed_mm": 5.5},
                    {"day": "Mon", "date": "21/10", "rain_mm": 6.0, "etc_mm": 2.4, "needed_mm": 0.0}
                ]
            }]))
            .unwrap())
        }
    }

    fn dashboard() -> (Arc<StubBackend>, Shared<StubBackend>) {
        let backend = Arc::new(StubBackend::default());
        let d = Dashboard::start(
            Arc::clone(&backend),
            &[PlantEntry {
                plant_id: "onion-303".into(),
                name: "Onion".into(),
            }],
            DashboardSettings {
                request_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_secs(3600),
                thresholds: ScheduleThresholds {
                    heavy_threshold_mm: 5.0,
                },
            },
        );
        (backend, Arc::new(d))
    }

    async fn send(d: &Shared<StubBackend>, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router(Arc::clone(d)).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn refresh_then_read_plant() {
        let (_, d) = dashboard();
        let (status, body) = send(&d, json_req("POST", "/api/plants/onion-303/refresh", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plant_id"], "onion-303");
        assert_eq!(body["water_level_percent"], 15.0);
        assert_eq!(body["band"], "critical");
        assert_eq!(body["alert"], true);

        let (status, body) = send(&d, get_req("/api/plants/onion-303")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Onion");
    }

    #[tokio::test]
    async fn unknown_plant_is_404() {
        let (_, d) = dashboard();
        let (status, body) = send(&d, get_req("/api/plants/cactus-999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = send(&d, json_req("PUT", "/api/plants/cactus-999/pump", json!({"state": true}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pump_command_round_trip() {
        let (_, d) = dashboard();
        let (status, body) = send(&d, json_req("PUT", "/api/plants/onion-303/pump", json!({"state": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pump_on"], true);
        assert_eq!(body["is_mutating"], false);
    }

    #[tokio::test]
    async fn pump_rejects_non_bool_state() {
        let (_, d) = dashboard();
        let (status, body) = send(&d, json_req("PUT", "/api/plants/onion-303/pump", json!({"state": "on"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid state value.");
    }

    #[tokio::test]
    async fn backend_failure_is_bad_gateway_with_descriptor() {
        let (backend, d) = dashboard();
        backend.down.store(true, Ordering::SeqCst);

        let (status, body) = send(&d, json_req("PUT", "/api/plants/onion-303/pump", json!({"state": true}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "network");

        let (_, plant) = send(&d, get_req("/api/plants/onion-303")).await;
        assert_eq!(plant["pump_on"], false);
        assert_eq!(plant["last_error"]["kind"], "network");
    }

    #[tokio::test]
    async fn schedule_refresh_and_read() {
        let (_, d) = dashboard();
        let (status, body) = send(&d, get_req("/api/schedule")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["fetched_at"].is_null());
        assert_eq!(body["plants"].as_array().unwrap().len(), 0);

        let (status, body) = send(&d, json_req("POST", "/api/schedule/refresh", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let plant = &body["plants"][0];
        assert_eq!(plant["plant_id"], "onion-303");
        assert_eq!(plant["total_weekly_water"], "3.0");
        assert_eq!(plant["soil_deficit_percent"], "25");
        assert_eq!(plant["days"][0]["band"], "normal");
        assert_eq!(plant["days"][1]["band"], "none");
        assert!(body["fetched_at"].is_string());
    }

    #[tokio::test]
    async fn schedule_refresh_failure_is_bad_gateway() {
        let (backend, d) = dashboard();
        backend.down.store(true, Ordering::SeqCst);
        let (status, body) = send(&d, json_req("POST", "/api/schedule/refresh", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "server");
    }

    #[tokio::test]
    async fn status_lists_plants_and_events() {
        let (_, d) = dashboard();
        send(&d, json_req("PUT", "/api/plants/onion-303/pump", json!({"state": true}))).await;

        let (status, body) = send(&d, get_req("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["uptime_secs"].is_u64());
        assert_eq!(body["plants"][0]["plant_id"], "onion-303");
        assert!(body["events"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["kind"] == "pump"));
    }

    #[tokio::test]
    async fn soil_record_unsupported_by_backend_is_bad_gateway() {
        let (_, d) = dashboard();
        let (status, body) = send(&d, get_req("/api/soil")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "server");

        let (status, _) = send(&d, json_req("POST", "/api/soil", json!([1, 2]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_pump_body_gets_descriptor() {
        let (_, d) = dashboard();
        let req = Request::builder()
            .method("PUT")
            .uri("/api/plants/onion-303/pump")
            .header("content-type", "application/json")
            .body(Body::from("{state: tru"))
            .unwrap();
        let (status, body) = send(&d, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn missing_content_type_gets_descriptor() {
        let (_, d) = dashboard();
        let req = Request::builder()
            .method("POST")
            .uri("/api/soil")
            .body(Body::from(r#"{"soil_moisture": 40}"#))
            .unwrap();
        let (status, body) = send(&d, req).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["kind"], "bad_request");
    }

    #[test]
    fn internal_errors_map_to_conflict() {
        let e = ApiError::from(TrackerError::Detached);
        assert_eq!(e.status, StatusCode::CONFLICT);
        assert_eq!(e.kind, "detached");
    }
}

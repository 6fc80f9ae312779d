mod sim;

use anyhow::{Context, Result};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sim::{Garden, Recommendation, WateringLog};

#[derive(Clone)]
struct AppState {
    garden: Arc<RwLock<Garden>>,
    soil: Arc<RwLock<Map<String, Value>>>,
    watering: Arc<RwLock<WateringLog>>,
    /// Fraction of requests answered with an injected 500.
    #[cfg_attr(not(feature = "faults"), allow(dead_code))]
    fail_rate: f64,
}

impl AppState {
    fn new(fail_rate: f64) -> Self {
        let soil = json!({
            "temperature": 23.5,
            "humidity": 61,
            "soil_moisture": 47
        });
        Self {
            garden: Arc::new(RwLock::new(Garden::seeded())),
            soil: Arc::new(RwLock::new(match soil {
                Value::Object(map) => map,
                _ => Map::new(),
            })),
            watering: Arc::new(RwLock::new(WateringLog::default())),
            fail_rate,
        }
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn pump_word(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Served under both `/api/v1` and `/api`.
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/plants/{id}/status", get(plant_status))
        .route("/plants/{id}/pump", axum::routing::put(plant_pump))
        .route("/weekly-forecast", get(weekly_forecast))
        .route("/soil", get(soil_record).post(update_soil_record))
        .route("/soil/water-level", get(soil_water_level))
        .route("/soil/pump", get(soil_pump).post(set_soil_pump))
        .route("/irrigate", get(irrigate))
        .route("/irrigate/feedback", axum::routing::post(irrigate_feedback))
        .route("/history", get(watering_history))
}

fn app(state: AppState) -> Router {
    let router = Router::new()
        .nest("/api/v1", api_routes())
        .nest("/api", api_routes());

    #[cfg(feature = "faults")]
    let router = router.layer(axum::middleware::from_fn_with_state(
        state.clone(),
        faults::inject,
    ));

    router.with_state(state)
}

async fn plant_status(State(s): State<AppState>, Path(id): Path<String>) -> Response {
    let garden = s.garden.read().await;
    let Some(plant) = garden.plant(&id) else {
        return error(StatusCode::NOT_FOUND, format!("Plant ID {id} not found."));
    };
    debug!("status requested: {plant}");
    Json(json!({
        "plantId": plant.plant_id,
        "waterLevel": plant.water_level,
        "isPumpOn": plant.pump_on,
        "lastUpdated": OffsetDateTime::now_utc().format(&Rfc3339).ok(),
    }))
    .into_response()
}

async fn plant_pump(
    State(s): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut garden = s.garden.write().await;
    if garden.plant(&id).is_none() {
        return error(StatusCode::NOT_FOUND, format!("Plant ID {id} not found."));
    }
    let Some(on) = body.get("state").and_then(Value::as_bool) else {
        return error(
            StatusCode::BAD_REQUEST,
            "Invalid state value. Must be true or false.",
        );
    };

    garden.set_pump(&id, on);
    info!(plant = %id, on, "pump command received");
    Json(json!({
        "success": true,
        "plantId": id,
        "message": format!("Pump set to {}.", pump_word(on)),
    }))
    .into_response()
}

async fn weekly_forecast() -> Json<Vec<sim::PlantForecast>> {
    Json(sim::weekly_forecast(OffsetDateTime::now_utc().date()))
}

async fn soil_record(State(s): State<AppState>) -> Json<Map<String, Value>> {
    Json(s.soil.read().await.clone())
}

async fn update_soil_record(State(s): State<AppState>, Json(update): Json<Value>) -> Response {
    let Value::Object(update) = update else {
        return error(StatusCode::BAD_REQUEST, "Soil record must be a JSON object.");
    };
    let mut soil = s.soil.write().await;
    soil.extend(update);
    info!(fields = soil.len(), "soil record updated");
    Json(json!({ "message": "Data updated", "new_data": *soil })).into_response()
}

async fn soil_water_level(State(s): State<AppState>) -> Json<f64> {
    Json(s.garden.read().await.sensor().water_level)
}

async fn soil_pump(State(s): State<AppState>) -> Json<Value> {
    Json(json!({ "on": s.garden.read().await.sensor().pump_on }))
}

async fn set_soil_pump(State(s): State<AppState>, Json(body): Json<Value>) -> Response {
    let Some(on) = body.get("on").and_then(Value::as_bool) else {
        return error(StatusCode::BAD_REQUEST, "Invalid value for 'on'. Must be true or false.");
    };
    s.garden.write().await.sensor_mut().pump_on = on;
    info!(on, "soil pump command received");
    Json(json!({ "on": on, "status": pump_word(on) })).into_response()
}

#[derive(Deserialize)]
struct IrrigateQuery {
    #[serde(default)]
    moisture: f64,
}

async fn irrigate(
    State(s): State<AppState>,
    query: Result<Query<IrrigateQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(q)) = query else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "water": false,
                "amount_ml": 0,
                "error": "moisture must be a number",
            })),
        )
            .into_response();
    };
    let advice: Recommendation = s
        .watering
        .read()
        .await
        .recommend(q.moisture, OffsetDateTime::now_utc());
    match advice.reason {
        Some(reason) => info!(moisture = q.moisture, reason, "watering withheld"),
        None if advice.water => info!(
            moisture = q.moisture,
            amount_ml = advice.amount_ml,
            "recommending watering"
        ),
        None => debug!(moisture = q.moisture, "no watering needed"),
    }
    Json(advice).into_response()
}

#[derive(Deserialize)]
struct WateringFeedback {
    #[serde(default)]
    requested_ml: f64,
    #[serde(default)]
    delivered_ml: f64,
    #[serde(default)]
    moisture: f64,
}

async fn irrigate_feedback(
    State(s): State<AppState>,
    Json(fb): Json<WateringFeedback>,
) -> Json<Value> {
    let mut log = s.watering.write().await;
    log.record(OffsetDateTime::now_utc(), fb.delivered_ml, fb.moisture);
    info!(
        requested_ml = fb.requested_ml,
        delivered_ml = fb.delivered_ml,
        moisture = fb.moisture,
        recorded = log.recorded(),
        "watering feedback"
    );
    Json(json!({ "status": "success" }))
}

async fn watering_history(State(s): State<AppState>) -> Response {
    Json(&*s.watering.read().await).into_response()
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[cfg(feature = "faults")]
mod faults {
    use super::*;
    use axum::extract::Request;
    use axum::middleware::Next;
    use tracing::warn;

    pub async fn inject(State(s): State<AppState>, req: Request, next: Next) -> Response {
        if s.fail_rate > 0.0 && fastrand::f64() < s.fail_rate {
            warn!(path = %req.uri().path(), "injecting fault");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "injected fault");
        }
        next.run(req).await
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let port: u16 = env::var("MOCK_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);
    let tick_ms: u64 = env::var("MOCK_TICK_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(2000);
    let fail_rate: f64 = env::var("MOCK_FAIL_RATE")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(|r: f64| r.clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let state = AppState::new(fail_rate);

    // ── Simulation ──────────────────────────────────────────────────
    let garden = Arc::clone(&state.garden);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
        loop {
            ticker.tick().await;
            garden.write().await.tick();
        }
    });

    // ── HTTP ────────────────────────────────────────────────────────
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind mock port {port}"))?;
    info!(tick_ms, fail_rate, "mock backend listening on http://{addr}");

    axum::serve(listener, app(state))
        .await
        .context("mock server error")
}

// ===========================================================================
// Tests
// ===========================================================================

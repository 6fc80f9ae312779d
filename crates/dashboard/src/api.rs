//! Backend wire types and the normalization boundary.
//!
//! The observed backends disagree on field names (`waterLevel` vs `level` vs
//! `value`, `isPumpOn` vs `on` vs `status`). Everything is resolved to one
//! canonical shape here, before it reaches a tracker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::TrackerError;

const WATER_LEVEL_KEYS: &[&str] = &["waterLevel", "level", "value"];
const PUMP_KEYS: &[&str] = &["isPumpOn", "on", "status", "state"];

// ---------------------------------------------------------------------------
// Canonical readings
// ---------------------------------------------------------------------------

/// One plant's status after alias resolution. `water_level_percent` is
/// already clamped to [0, 100].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReading {
    pub pump_on: bool,
    pub water_level_percent: f64,
}

/// A pushed update from the live stream; either half may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PartialStatus {
    pub pump_on: Option<bool>,
    pub water_level_percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// `PUT /plants/{id}/pump`
#[derive(Debug, Serialize)]
pub(crate) struct PumpCommandBody {
    pub(crate) state: bool,
}

/// `POST /soil/pump`
#[derive(Debug, Serialize)]
pub(crate) struct SoilPumpBody {
    pub(crate) on: bool,
}

// ---------------------------------------------------------------------------
// Weekly forecast
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantForecastMsg {
    pub plant_id: String,
    #[serde(default)]
    pub plant_name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub soil_deficit: f64,
    #[serde(default)]
    pub schedule: Vec<DailyForecastMsg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DailyForecastMsg {
    pub day: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub rain_mm: f64,
    pub etc_mm: f64,
    /// The backend's own figure. Not used for classification.
    #[serde(default)]
    pub needed_mm: Option<f64>,
}

pub fn parse_forecast(body: &[u8]) -> Result<Vec<PlantForecastMsg>, TrackerError> {
    Ok(serde_json::from_slice(body)?)
}

// ---------------------------------------------------------------------------
// Status normalization
// ---------------------------------------------------------------------------

/// Parse a `GET /plants/{id}/status` body.
pub fn parse_status(body: &[u8]) -> Result<StatusReading, TrackerError> {
    let v: Value = serde_json::from_slice(body)?;
    Ok(StatusReading {
        pump_on: pump_from_value(&v)?,
        water_level_percent: water_level_from_value(&v)?,
    })
}

/// Accepts a bare number, a numeric string, or an object carrying one of
/// `waterLevel`, `level`, `value`.
pub fn water_level_from_value(v: &Value) -> Result<f64, TrackerError> {
    let raw = match v {
        Value::Object(map) => WATER_LEVEL_KEYS
            .iter()
            .find_map(|k| map.get(*k))
            .ok_or_else(|| {
                TrackerError::Decode("no water level field (waterLevel|level|value)".into())
            })?,
        other => other,
    };

    let level = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| TrackerError::Decode(format!("water level is not a number: {raw}")))?;

    if !level.is_finite() {
        return Err(TrackerError::Decode(format!(
            "water level is not finite: {level}"
        )));
    }
    Ok(clamp_percent(level))
}

/// Accepts a bare bool, an `on`/`off` word, or an object carrying one of
/// `isPumpOn`, `on`, `status`, `state`.
pub fn pump_from_value(v: &Value) -> Result<bool, TrackerError> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => parse_pump_word(s),
        Value::Object(map) => {
            let field = PUMP_KEYS.iter().find_map(|k| map.get(*k)).ok_or_else(|| {
                TrackerError::Decode("no pump field (isPumpOn|on|status|state)".into())
            })?;
            match field {
                Value::Bool(b) => Ok(*b),
                Value::String(s) => parse_pump_word(s),
                other => Err(TrackerError::Decode(format!(
                    "pump state is not a bool: {other}"
                ))),
            }
        }
        other => Err(TrackerError::Decode(format!(
            "expected bool or object for pump state, got {other}"
        ))),
    }
}

/// Parse an "ON"/"OFF" word into a bool (case-insensitive, trims whitespace).
pub fn parse_pump_word(s: &str) -> Result<bool, TrackerError> {
    match s.trim().to_ascii_uppercase().as_str() {
        "ON" | "TRUE" => Ok(true),
        "OFF" | "FALSE" => Ok(false),
        other => Err(TrackerError::Decode(format!("unknown pump state '{other}'"))),
    }
}

/// Extract an echoed pump state from a successful command response.
///
/// A 2xx already means the command was accepted, so bodies without a pump
/// field (the reference backend answers `{success, plantId, message}`) or
/// bodies that are not JSON yield `None` instead of an error.
pub fn pump_echo(body: &[u8]) -> Option<bool> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let v: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            debug!("pump command response is not json: {e}");
            return None;
        }
    };
    match &v {
        Value::Bool(_) | Value::String(_) => pump_from_value(&v).ok(),
        Value::Object(map) if PUMP_KEYS.iter().any(|k| map.contains_key(*k)) => {
            pump_from_value(&v).ok()
        }
        _ => None,
    }
}

/// Lenient parse for live-stream payloads. Fails only when the payload
/// carries neither a water level nor a pump state.
pub fn partial_status(v: &Value) -> Result<PartialStatus, TrackerError> {
    let update = PartialStatus {
        pump_on: pump_from_value(v).ok(),
        water_level_percent: water_level_from_value(v).ok(),
    };
    if update.pump_on.is_none() && update.water_level_percent.is_none() {
        return Err(TrackerError::Decode(format!(
            "stream payload has no status fields: {v}"
        )));
    }
    Ok(update)
}

pub fn clamp_percent(level: f64) -> f64 {
    let clamped = level.clamp(0.0, 100.0);
    if clamped != level {
        debug!(level, clamped, "water level outside [0, 100], clamped");
    }
    clamped
}

/// Pull a readable message out of an error body (`{"error": "..."}` from the
/// reference backend), falling back to the trimmed text.
pub(crate) fn error_message(body: &[u8]) -> String {
    const MAX_LEN: usize = 200;

    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        if let Some(Value::String(msg)) = map.get("error") {
            return msg.clone();
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

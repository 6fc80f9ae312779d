//! In-memory garden simulation, weekly forecast generation, and the
//! moisture-driven watering recommender.
//!
//! Water levels drift every tick: a running pump fills the tank, an idle one
//! lets it drain. The forecast uses fixed weather factors so the dashboard
//! sees the same shape of week every time.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use time::{Date, Duration, OffsetDateTime};

pub const DAYS_OF_WEEK: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Tunisian Arabic month names, January first.
const MONTHS: [&str; 12] = [
    "جانفي", "فيفري", "مارس", "أفريل", "ماي", "جوان", "جويلية", "أوت", "سبتمبر", "أكتوبر", "نوفمبر",
    "ديسمبر",
];

const WEATHER_FACTORS: [f64; 7] = [1.0, 1.1, 0.8, 1.2, 1.05, 0.9, 1.15];

const FILL_PER_TICK: f64 = 0.5;
const DRAIN_PER_TICK: f64 = 0.25;

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Round up to the next half millimetre.
pub fn ceil_half(x: f64) -> f64 {
    (x / 0.5).ceil() * 0.5
}

// ---------------------------------------------------------------------------
// Plants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlantSim {
    pub plant_id: &'static str,
    pub water_level: f64,
    pub pump_on: bool,
}

impl PlantSim {
    fn tick(&mut self) {
        let next = if self.pump_on {
            (self.water_level + FILL_PER_TICK).min(100.0)
        } else {
            (self.water_level - DRAIN_PER_TICK).max(0.0)
        };
        self.water_level = round1(next);
    }
}

impl fmt::Display for PlantSim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pump = if self.pump_on { "ON" } else { "OFF" };
        write!(f, "{}: water={}% pump={pump}", self.plant_id, self.water_level)
    }
}

pub struct Garden {
    plants: Vec<PlantSim>,
}

impl Garden {
    pub fn seeded() -> Self {
        Self {
            plants: vec![
                PlantSim {
                    plant_id: "tomato-101",
                    water_level: 75.0,
                    pump_on: false,
                },
                PlantSim {
                    plant_id: "mint-202",
                    water_level: 45.0,
                    pump_on: true,
                },
                PlantSim {
                    plant_id: "onion-303",
                    water_level: 15.0,
                    pump_on: false,
                },
            ],
        }
    }

    pub fn plant(&self, plant_id: &str) -> Option<&PlantSim> {
        self.plants.iter().find(|p| p.plant_id == plant_id)
    }

    /// Returns `false` when the plant does not exist.
    pub fn set_pump(&mut self, plant_id: &str, on: bool) -> bool {
        match self.plants.iter_mut().find(|p| p.plant_id == plant_id) {
            Some(p) => {
                p.pump_on = on;
                true
            }
            None => false,
        }
    }

    /// The plant the single-sensor soil routes report on.
    pub fn sensor(&self) -> &PlantSim {
        &self.plants[0]
    }

    pub fn sensor_mut(&mut self) -> &mut PlantSim {
        &mut self.plants[0]
    }

    pub fn tick(&mut self) {
        for p in &mut self.plants {
            p.tick();
        }
    }
}

// ---------------------------------------------------------------------------
// Weekly forecast
// ---------------------------------------------------------------------------

struct CropProfile {
    plant_id: &'static str,
    plant_name: &'static str,
    soil_deficit: f64,
    color: &'static str,
    /// Base daily crop water requirement (mm).
    base_etc: f64,
}

const CROPS: [CropProfile; 3] = [
    CropProfile {
        plant_id: "tomato-101",
        plant_name: "طماطم - هيرلوم",
        soil_deficit: 0.35,
        color: "#dc2626",
        base_etc: 4.0,
    },
    CropProfile {
        plant_id: "mint-202",
        plant_name: "نعناع - فلفلي",
        soil_deficit: 0.10,
        color: "#16a34a",
        base_etc: 2.5,
    },
    CropProfile {
        plant_id: "onion-303",
        plant_name: "بصل - أصفر",
        soil_deficit: 0.25,
        color: "#d97706",
        base_etc: 3.0,
    },
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantForecast {
    pub plant_id: &'static str,
    pub plant_name: &'static str,
    pub soil_deficit: f64,
    pub color: &'static str,
    #[serde(rename = "baseETc")]
    pub base_etc: f64,
    pub schedule: Vec<ForecastDay>,
}

#[derive(Debug, Serialize)]
pub struct ForecastDay {
    pub day: &'static str,
    pub date: String,
    pub rain_mm: f64,
    pub etc_mm: f64,
    pub needed_mm: f64,
}

/// Mocked rain: a wet day 3 and a drizzle on day 6.
fn rain_on(day_offset: usize) -> f64 {
    match day_offset {
        2 => 6.0,
        5 => 1.5,
        _ => 0.0,
    }
}

fn forecast_for(crop: &CropProfile, today: Date) -> PlantForecast {
    let schedule = WEATHER_FACTORS
        .iter()
        .enumerate()
        .filter_map(|(i, factor)| {
            let date = today.checked_add(Duration::days(i as i64))?;
            let rain_mm = rain_on(i);
            let etc_mm = round1(crop.base_etc * factor);
            // The backend's own estimate adds a soil-deficit buffer.
            let needed = (etc_mm + crop.soil_deficit * 10.0 - rain_mm).max(0.0);
            Some(ForecastDay {
                day: DAYS_OF_WEEK[usize::from(date.weekday().number_days_from_sunday())],
                date: format!("{} {}", date.day(), MONTHS[usize::from(u8::from(date.month())) - 1]),
                rain_mm: round1(rain_mm),
                etc_mm,
                needed_mm: round1(ceil_half(needed)),
            })
        })
        .collect();

    PlantForecast {
        plant_id: crop.plant_id,
        plant_name: crop.plant_name,
        soil_deficit: crop.soil_deficit,
        color: crop.color,
        base_etc: crop.base_etc,
        schedule,
    }
}

/// Seven days starting at `today`, for every simulated crop.
pub fn weekly_forecast(today: Date) -> Vec<PlantForecast> {
    CROPS.iter().map(|c| forecast_for(c, today)).collect()
}

// ---------------------------------------------------------------------------
// Watering recommendations
// ---------------------------------------------------------------------------

/// Soil moisture (%) at or above which no water is recommended.
pub const MOISTURE_THRESHOLD: f64 = 30.0;
pub const MIN_WATER_ML: f64 = 50.0;
pub const MAX_WATER_ML: f64 = 500.0;
pub const WATERING_COOLDOWN: Duration = Duration::hours(6);
pub const HISTORY_LIMIT: usize = 100;

/// Millilitres to give at `moisture` percent: nothing at or above the
/// threshold, otherwise linear in the deficit within [50, 500].
pub fn calculate_water_amount(moisture: f64) -> f64 {
    if moisture.is_nan() || moisture >= MOISTURE_THRESHOLD {
        return 0.0;
    }
    let deficit = MOISTURE_THRESHOLD - moisture;
    let amount = MIN_WATER_ML + deficit / 100.0 * (MAX_WATER_ML - MIN_WATER_ML);
    amount.clamp(MIN_WATER_ML, MAX_WATER_ML)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub water: bool,
    pub amount_ml: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub amount_ml: f64,
    pub moisture_before: f64,
}

/// Recent waterings, newest last, capped at [`HISTORY_LIMIT`]. Kept in
/// memory only. Callers pass `now` so the cooldown is testable.
#[derive(Debug, Default, Serialize)]
pub struct WateringLog {
    #[serde(with = "time::serde::rfc3339::option")]
    last_watering: Option<OffsetDateTime>,
    history: VecDeque<WateringRecord>,
}

impl WateringLog {
    pub fn in_cooldown(&self, now: OffsetDateTime) -> bool {
        self.last_watering
            .is_some_and(|last| now - last < WATERING_COOLDOWN)
    }

    pub fn recommend(&self, moisture: f64, now: OffsetDateTime) -> Recommendation {
        if self.in_cooldown(now) {
            return Recommendation {
                water: false,
                amount_ml: 0.0,
                reason: Some("cooldown"),
            };
        }
        let amount_ml = calculate_water_amount(moisture);
        Recommendation {
            water: amount_ml > 0.0,
            amount_ml,
            reason: None,
        }
    }

    pub fn record(&mut self, now: OffsetDateTime, amount_ml: f64, moisture_before: f64) {
        self.last_watering = Some(now);
        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(WateringRecord {
            timestamp: now,
            amount_ml,
            moisture_before,
        });
    }

    pub fn recorded(&self) -> usize {
        self.history.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

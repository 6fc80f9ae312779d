//! Weekly irrigation schedule: per-day recommendations and weekly totals.
//!
//! Everything here is pure. Forecast messages are fetched elsewhere and fed
//! in; "today" is always supplied by the caller.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::api::{DailyForecastMsg, PlantForecastMsg};

/// Weekday tags in the order the display clock indexes them (0 = Sunday).
pub const DAYS_OF_WEEK: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Disagreement with the backend's own `needed_mm` worth a debug line.
const NEEDED_MISMATCH_MM: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleThresholds {
    /// Needed water strictly above this is `Heavy`.
    pub heavy_threshold_mm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationBand {
    None,
    Normal,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DayClassification {
    /// Full precision; round only when rendering.
    pub needed_mm: f64,
    pub band: RecommendationBand,
}

/// `max(etc - rain, 0)`. Never negative zero, and NaN counts as nothing needed.
pub fn needed_water_mm(etc_mm: f64, rain_mm: f64) -> f64 {
    let needed = etc_mm - rain_mm;
    if needed > 0.0 {
        needed
    } else {
        0.0
    }
}

pub fn classify_day(etc_mm: f64, rain_mm: f64, thresholds: &ScheduleThresholds) -> DayClassification {
    let needed_mm = needed_water_mm(etc_mm, rain_mm);
    let band = if needed_mm > thresholds.heavy_threshold_mm {
        RecommendationBand::Heavy
    } else if needed_mm == 0.0 {
        RecommendationBand::None
    } else {
        RecommendationBand::Normal
    };
    DayClassification { needed_mm, band }
}

/// Position of a weekday tag in [`DAYS_OF_WEEK`]. Case-insensitive.
pub fn weekday_index(day: &str) -> Option<u8> {
    let day = day.trim();
    DAYS_OF_WEEK
        .iter()
        .position(|d| d.eq_ignore_ascii_case(day))
        .map(|i| i as u8)
}

/// Unknown tags are never today.
pub fn is_today(day: &str, today_index: u8) -> bool {
    weekday_index(day) == Some(today_index)
}

/// Index of `now`'s weekday in [`DAYS_OF_WEEK`].
pub fn today_index(now: OffsetDateTime) -> u8 {
    now.weekday().number_days_from_sunday()
}

/// One decimal, for display only.
pub fn format_mm(mm: f64) -> String {
    format!("{mm:.1}")
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyForecast {
    pub day: String,
    pub date: String,
    pub rain_mm: f64,
    pub etc_mm: f64,
}

impl DailyForecast {
    /// Negative or non-finite amounts are clamped to zero. The backend's own
    /// `needed_mm` is not used.
    pub fn from_msg(plant_id: &str, msg: &DailyForecastMsg) -> Self {
        let rain_mm = non_negative(plant_id, &msg.day, "rain_mm", msg.rain_mm);
        let etc_mm = non_negative(plant_id, &msg.day, "etc_mm", msg.etc_mm);

        if let Some(reported) = msg.needed_mm {
            let derived = needed_water_mm(etc_mm, rain_mm);
            if (reported - derived).abs() > NEEDED_MISMATCH_MM {
                debug!(
                    plant = %plant_id,
                    day = %msg.day,
                    reported,
                    derived,
                    "backend needed_mm differs from etc - rain"
                );
            }
        }

        Self {
            day: msg.day.clone(),
            date: msg.date.clone(),
            rain_mm,
            etc_mm,
        }
    }
}

fn non_negative(plant_id: &str, day: &str, field: &str, value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        return value;
    }
    warn!(plant = %plant_id, day = %day, field, value, "clamping forecast value to 0");
    0.0
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledDay {
    #[serde(flatten)]
    pub forecast: DailyForecast,
    pub needed_mm: f64,
    pub band: RecommendationBand,
}

impl ScheduledDay {
    pub fn new(forecast: DailyForecast, thresholds: &ScheduleThresholds) -> Self {
        let c = classify_day(forecast.etc_mm, forecast.rain_mm, thresholds);
        Self {
            forecast,
            needed_mm: c.needed_mm,
            band: c.band,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeekSummary {
    pub total_weekly_water_mm: f64,
}

/// Sum of `needed_mm`. Any number of days, including none.
pub fn summarize_week(days: &[ScheduledDay]) -> WeekSummary {
    WeekSummary {
        total_weekly_water_mm: days.iter().map(|d| d.needed_mm).sum(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantSchedule {
    pub plant_id: String,
    pub plant_name: String,
    pub color: Option<String>,
    /// Fraction in [0, 1].
    pub soil_deficit: f64,
    pub days: Vec<ScheduledDay>,
    pub summary: WeekSummary,
}

impl PlantSchedule {
    pub fn soil_deficit_percent(&self) -> f64 {
        self.soil_deficit * 100.0
    }
}

pub fn build_schedule(msg: &PlantForecastMsg, thresholds: &ScheduleThresholds) -> PlantSchedule {
    let days: Vec<ScheduledDay> = msg
        .schedule
        .iter()
        .map(|d| ScheduledDay::new(DailyForecast::from_msg(&msg.plant_id, d), thresholds))
        .collect();
    if days.len() != DAYS_OF_WEEK.len() {
        debug!(plant = %msg.plant_id, days = days.len(), "forecast is not a full week");
    }

    let soil_deficit = if msg.soil_deficit.is_finite() {
        msg.soil_deficit.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if soil_deficit != msg.soil_deficit {
        warn!(plant = %msg.plant_id, value = msg.soil_deficit, "clamping soil deficit into [0, 1]");
    }

    let summary = summarize_week(&days);
    PlantSchedule {
        plant_id: msg.plant_id.clone(),
        plant_name: msg.plant_name.clone(),
        color: msg.color.clone(),
        soil_deficit,
        days,
        summary,
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Schedules from the latest forecast fetch. Rebuilt wholesale on every fetch.
#[derive(Debug, Clone, Default)]
pub struct ScheduleBook {
    schedules: Vec<PlantSchedule>,
    fetched_at: Option<OffsetDateTime>,
}

impl ScheduleBook {
    pub fn build(
        msgs: &[PlantForecastMsg],
        thresholds: &ScheduleThresholds,
        fetched_at: OffsetDateTime,
    ) -> Self {
        let mut schedules: Vec<PlantSchedule> = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if schedules.iter().any(|s| s.plant_id == msg.plant_id) {
                warn!(plant = %msg.plant_id, "duplicate plant in forecast, keeping the first");
                continue;
            }
            schedules.push(build_schedule(msg, thresholds));
        }
        Self {
            schedules,
            fetched_at: Some(fetched_at),
        }
    }

    pub fn schedules(&self) -> &[PlantSchedule] {
        &self.schedules
    }

    pub fn fetched_at(&self) -> Option<OffsetDateTime> {
        self.fetched_at
    }

    /// Display-ready rendering with one-decimal labels and today's column flagged.
    pub fn view(&self, today_index: u8) -> Vec<PlantScheduleView> {
        self.schedules
            .iter()
            .map(|s| PlantScheduleView::new(s, today_index))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Presentation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DayView {
    pub day: String,
    pub date: String,
    pub rain: String,
    pub etc: String,
    pub needed: String,
    pub band: RecommendationBand,
    pub is_today: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlantScheduleView {
    pub plant_id: String,
    pub plant_name: String,
    pub color: Option<String>,
    pub soil_deficit_percent: String,
    pub total_weekly_water: String,
    pub days: Vec<DayView>,
}

impl PlantScheduleView {
    fn new(s: &PlantSchedule, today_index: u8) -> Self {
        Self {
            plant_id: s.plant_id.clone(),
            plant_name: s.plant_name.clone(),
            color: s.color.clone(),
            soil_deficit_percent: format!("{:.0}", s.soil_deficit_percent()),
            total_weekly_water: format_mm(s.summary.total_weekly_water_mm),
            days: s
                .days
                .iter()
                .map(|d| DayView {
                    day: d.forecast.day.clone(),
                    date: d.forecast.date.clone(),
                    rain: format_mm(d.forecast.rain_mm),
                    etc: format_mm(d.forecast.etc_mm),
                    needed: format_mm(d.needed_mm),
                    band: d.band,
                    is_today: is_today(&d.forecast.day, today_index),
                })
                .collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

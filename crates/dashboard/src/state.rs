use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{with_deadline, Backend};
use crate::config::PlantEntry;
use crate::error::TrackerError;
use crate::poller::{self, Subscription};
use crate::schedule::{today_index, PlantScheduleView, ScheduleBook, ScheduleThresholds, DAYS_OF_WEEK};
use crate::tracker::{PlantStatus, PlantTracker, WaterBand};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct Dashboard<B: Backend> {
    started_at: Instant,
    backend: Arc<B>,
    request_timeout: Duration,
    thresholds: ScheduleThresholds,
    plants: Vec<TrackedPlant<B>>,
    schedules: RwLock<ScheduleBook>,
    events: EventLog,
}

struct TrackedPlant<B: Backend> {
    name: String,
    subscription: Subscription<B>,
    watcher: JoinHandle<()>,
}

pub struct DashboardSettings {
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub thresholds: ScheduleThresholds,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Pump,
    Refresh,
    Forecast,
    Error,
    System,
}

/// Bounded, shared event ring buffer.
#[derive(Clone, Default)]
pub struct EventLog {
    inner: Arc<RwLock<VecDeque<SystemEvent>>>,
}

impl EventLog {
    pub async fn push(&self, kind: EventKind, detail: String) {
        let mut events = self.inner.write().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }

    /// Newest first.
    pub async fn recent(&self) -> Vec<SystemEvent> {
        self.inner.read().await.iter().rev().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// JSON responses (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PlantView {
    pub name: String,
    #[serde(flatten)]
    pub status: PlantStatus,
    pub band: Option<WaterBand>,
    pub alert: bool,
    pub load_failed: bool,
}

impl PlantView {
    fn new(name: &str, status: PlantStatus) -> Self {
        Self {
            name: name.to_string(),
            band: status.band(),
            alert: status.is_alert(),
            load_failed: status.load_failed(),
            status,
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub plants: Vec<PlantView>,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct ScheduleResponse {
    #[serde(with = "time::serde::rfc3339::option")]
    pub fetched_at: Option<OffsetDateTime>,
    pub today: &'static str,
    pub plants: Vec<PlantScheduleView>,
}

// ---------------------------------------------------------------------------
// Construction & lifecycle
// ---------------------------------------------------------------------------

impl<B: Backend> Dashboard<B> {
    /// Create a tracker per configured plant and start polling each one.
    /// Must be called from within a tokio runtime.
    pub fn start(backend: Arc<B>, plants: &[PlantEntry], settings: DashboardSettings) -> Self {
        let events = EventLog::default();

        let plants = plants
            .iter()
            .map(|p| {
                let tracker = Arc::new(PlantTracker::new(
                    p.plant_id.clone(),
                    Arc::clone(&backend),
                    settings.request_timeout,
                ));
                let watcher = spawn_watcher(&tracker, events.clone());
                TrackedPlant {
                    name: p.name.clone(),
                    subscription: poller::subscribe(tracker, settings.poll_interval),
                    watcher,
                }
            })
            .collect::<Vec<_>>();

        info!(plants = plants.len(), "dashboard started");

        Self {
            started_at: Instant::now(),
            backend,
            request_timeout: settings.request_timeout,
            thresholds: settings.thresholds,
            plants,
            schedules: RwLock::new(ScheduleBook::default()),
            events,
        }
    }

    /// Stop every poll loop and detach every tracker.
    pub async fn shutdown(&self) {
        for p in &self.plants {
            p.subscription.cancel();
            p.watcher.abort();
        }
        self.events
            .push(EventKind::System, "dashboard shutting down".into())
            .await;
        info!("dashboard stopped");
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn trackers(&self) -> Vec<Arc<PlantTracker<B>>> {
        self.plants
            .iter()
            .map(|p| Arc::clone(p.subscription.tracker()))
            .collect()
    }

    fn find(&self, plant_id: &str) -> Option<&TrackedPlant<B>> {
        self.plants
            .iter()
            .find(|p| p.subscription.tracker().plant_id() == plant_id)
    }
}

// ---------------------------------------------------------------------------
// Plant operations
// ---------------------------------------------------------------------------

impl<B: Backend> Dashboard<B> {
    /// `None` when the plant is not tracked.
    pub fn plant(&self, plant_id: &str) -> Option<PlantView> {
        self.find(plant_id)
            .map(|p| PlantView::new(&p.name, p.subscription.tracker().status()))
    }

    pub async fn refresh_plant(&self, plant_id: &str) -> Option<Result<PlantView, TrackerError>> {
        let p = self.find(plant_id)?;
        let result = p.subscription.tracker().refresh_status().await;
        if result.is_ok() {
            self.events
                .push(EventKind::Refresh, format!("{plant_id} refreshed on request"))
                .await;
        }
        Some(result.map(|s| PlantView::new(&p.name, s)))
    }

    pub async fn command_pump(
        &self,
        plant_id: &str,
        on: bool,
    ) -> Option<Result<PlantView, TrackerError>> {
        let p = self.find(plant_id)?;
        let result = p.subscription.tracker().set_pump(on).await;

        let state_str = if on { "ON" } else { "OFF" };
        match &result {
            Ok(_) => {
                self.events
                    .push(EventKind::Pump, format!("{plant_id} pump set {state_str}"))
                    .await
            }
            Err(e) if e.is_internal() => {}
            Err(e) => {
                self.events
                    .push(
                        EventKind::Error,
                        format!("{plant_id} pump {state_str} failed: {e}"),
                    )
                    .await
            }
        }
        Some(result.map(|s| PlantView::new(&p.name, s)))
    }

    /// Build the JSON-serialisable status snapshot.
    pub async fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            plants: self
                .plants
                .iter()
                .map(|p| PlantView::new(&p.name, p.subscription.tracker().status()))
                .collect(),
            events: self.events.recent().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule operations
// ---------------------------------------------------------------------------

impl<B: Backend> Dashboard<B> {
    /// Fetch the forecast and replace the schedule cache. On failure the
    /// previous cache stays in place. Returns the number of plants scheduled.
    pub async fn refresh_schedules(&self) -> Result<usize, TrackerError> {
        let fetched = with_deadline(self.request_timeout, self.backend.fetch_forecast()).await;
        match fetched {
            Ok(msgs) => {
                let book = ScheduleBook::build(&msgs, &self.thresholds, OffsetDateTime::now_utc());
                let count = book.schedules().len();
                *self.schedules.write().await = book;

                info!(plants = count, "weekly forecast loaded");
                self.events
                    .push(EventKind::Forecast, format!("forecast loaded for {count} plants"))
                    .await;
                Ok(count)
            }
            Err(e) => {
                warn!(kind = e.kind(), "weekly forecast fetch failed: {e}");
                self.events
                    .push(EventKind::Error, format!("forecast fetch failed: {e}"))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn to_schedule(&self, today: u8) -> ScheduleResponse {
        let book = self.schedules.read().await;
        ScheduleResponse {
            fetched_at: book.fetched_at(),
            today: DAYS_OF_WEEK.get(usize::from(today)).copied().unwrap_or("?"),
            plants: book.view(today),
        }
    }

    /// Pass-through of the backend's generic soil record.
    pub async fn soil_reading(&self) -> Result<Value, TrackerError> {
        with_deadline(self.request_timeout, self.backend.soil_reading()).await
    }

    pub async fn store_soil_reading(&self, record: &Value) -> Result<Value, TrackerError> {
        let stored = with_deadline(self.request_timeout, self.backend.store_soil_reading(record)).await;
        match &stored {
            Ok(_) => self.events.push(EventKind::System, "soil record stored".into()).await,
            Err(e) => {
                self.events
                    .push(EventKind::Error, format!("storing soil record failed: {e}"))
                    .await
            }
        }
        stored
    }

    /// Schedule view for the current UTC weekday.
    pub async fn to_schedule_now(&self) -> ScheduleResponse {
        self.to_schedule(today_index(OffsetDateTime::now_utc())).await
    }
}

// ---------------------------------------------------------------------------
// Status transitions -> events
// ---------------------------------------------------------------------------

fn spawn_watcher<B: Backend>(tracker: &Arc<PlantTracker<B>>, events: EventLog) -> JoinHandle<()> {
    let mut rx = tracker.watch();
    let plant_id = tracker.plant_id().to_string();
    tokio::spawn(async move {
        let mut prev = rx.borrow_and_update().clone();
        while rx.changed().await.is_ok() {
            let next = rx.borrow_and_update().clone();
            for (kind, detail) in status_events(&plant_id, &prev, &next) {
                events.push(kind, detail).await;
            }
            prev = next;
        }
    })
}

/// Events worth recording for a status change. Command outcomes are recorded
/// by `command_pump` itself.
fn status_events(plant_id: &str, prev: &PlantStatus, next: &PlantStatus) -> Vec<(EventKind, String)> {
    let mut out = Vec::new();
    let command_landed = prev.is_mutating && !next.is_mutating;

    match (&prev.last_error, &next.last_error) {
        (before, Some(e)) if before.as_ref() != Some(e) && !command_landed => {
            out.push((EventKind::Error, format!("{plant_id}: {e}")));
        }
        (Some(_), None) if !command_landed => {
            out.push((EventKind::System, format!("{plant_id}: backend reachable again")));
        }
        _ => {}
    }

    if next.is_alert() && !prev.is_alert() {
        if let Some(level) = next.water_level_percent {
            out.push((
                EventKind::Error,
                format!("{plant_id}: water level critical ({level:.1}%)"),
            ));
        }
    }

    if prev.pump_on != next.pump_on && !prev.is_mutating && !next.is_mutating {
        let state_str = if next.pump_on { "ON" } else { "OFF" };
        out.push((EventKind::Pump, format!("{plant_id} pump reported {state_str}")));
    }

    out
}

// ===========================================================================
// Tests
// ===========================================================================

//! Per-plant pump/water status tracker.
//!
//! A tracker owns one plant's [`PlantStatus`]. Reads come from polling
//! (`refresh_status`) or the live feed (`apply_update`); writes come from
//! `set_pump`, which updates optimistically and rolls back on failure.
//!
//! ## Command supersession
//!
//! Every pump command takes the next per-plant sequence number. Only the
//! response to the latest issued number is applied:
//!
//! ```text
//! set_pump(true)  #1   pump=true   rollback_to=false   mutating
//! set_pump(false) #2   pump=false  rollback_to=true    mutating
//! #2 ok                pump=false                      idle
//! #1 err               stale, dropped                  (pump stays false)
//! ```
//!
//! A failed latest command restores the value held just before *it* was
//! issued, never an older one.
//!
//! Refreshes are numbered too: a reading that lands after a newer one has
//! been applied is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{PartialStatus, StatusReading};
use crate::backend::{with_deadline, Backend};
use crate::error::TrackerError;

/// Water level strictly above this is `Normal`.
const NORMAL_ABOVE_PERCENT: f64 = 50.0;
/// Water level strictly above this (and not Normal) is `Low`.
const LOW_ABOVE_PERCENT: f64 = 20.0;

// ---------------------------------------------------------------------------
// Status + severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaterBand {
    Normal,
    Low,
    Critical,
}

impl WaterBand {
    /// Critical levels raise a persistent alert downstream.
    pub fn is_alert(self) -> bool {
        self == Self::Critical
    }
}

/// `> 50` normal, `> 20` low, everything else critical. Boundary values fall
/// into the more severe band: 50 is low, 20 is critical.
pub fn classify_water_level(level: f64) -> WaterBand {
    if level > NORMAL_ABOVE_PERCENT {
        WaterBand::Normal
    } else if level > LOW_ABOVE_PERCENT {
        WaterBand::Low
    } else {
        WaterBand::Critical
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantStatus {
    pub plant_id: String,
    pub pump_on: bool,
    /// `None` until the first successful fetch.
    pub water_level_percent: Option<f64>,
    pub last_error: Option<TrackerError>,
    pub is_mutating: bool,
    /// The latest refresh failed. Command failures leave this alone.
    pub refresh_failed: bool,
}

impl PlantStatus {
    pub fn new(plant_id: impl Into<String>) -> Self {
        Self {
            plant_id: plant_id.into(),
            pump_on: false,
            water_level_percent: None,
            last_error: None,
            is_mutating: false,
            refresh_failed: false,
        }
    }

    pub fn band(&self) -> Option<WaterBand> {
        self.water_level_percent.map(classify_water_level)
    }

    pub fn is_alert(&self) -> bool {
        self.band().is_some_and(WaterBand::is_alert)
    }

    /// Nothing has ever loaded and the last fetch failed: the blocking
    /// "failed to load" state. A failed pump command alone never causes it.
    pub fn load_failed(&self) -> bool {
        self.water_level_percent.is_none() && self.refresh_failed
    }
}

// ---------------------------------------------------------------------------
// Ledger: the synchronous state machine behind a tracker
// ---------------------------------------------------------------------------

/// Handed out when a refresh starts, checked when it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RefreshTicket {
    seq: u64,
    /// `issued_seq` at the time the refresh started.
    command_epoch: u64,
}

#[derive(Debug)]
struct Ledger {
    status: PlantStatus,
    /// Sequence number of the latest issued command (0 = none yet).
    issued_seq: u64,
    /// Pump value immediately before the latest command.
    rollback_to: bool,
    /// Sequence number of the latest started refresh.
    refresh_issued: u64,
    /// Sequence number of the newest refresh whose result was applied.
    refresh_applied: u64,
    detached: bool,
}

impl Ledger {
    fn new(plant_id: String) -> Self {
        Self {
            status: PlantStatus::new(plant_id),
            issued_seq: 0,
            rollback_to: false,
            refresh_issued: 0,
            refresh_applied: 0,
            detached: false,
        }
    }

    fn ensure_attached(&self) -> Result<(), TrackerError> {
        if self.detached {
            Err(TrackerError::Detached)
        } else {
            Ok(())
        }
    }

    /// Apply the optimistic value and hand out the command's sequence number.
    fn begin_command(&mut self, desired_on: bool) -> Result<u64, TrackerError> {
        self.ensure_attached()?;
        self.issued_seq += 1;
        self.rollback_to = self.status.pump_on;
        self.status.pump_on = desired_on;
        self.status.is_mutating = true;
        Ok(self.issued_seq)
    }

    fn finish_command(
        &mut self,
        seq: u64,
        result: Result<Option<bool>, TrackerError>,
    ) -> Result<(), TrackerError> {
        self.ensure_attached()?;
        if seq != self.issued_seq {
            return Err(TrackerError::StaleCommand {
                seq,
                latest: self.issued_seq,
            });
        }

        self.status.is_mutating = false;
        match result {
            Ok(echo) => {
                if let Some(server_on) = echo {
                    self.status.pump_on = server_on;
                }
                self.status.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.status.pump_on = self.rollback_to;
                self.status.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn begin_refresh(&mut self) -> Result<RefreshTicket, TrackerError> {
        self.ensure_attached()?;
        self.refresh_issued += 1;
        Ok(RefreshTicket {
            seq: self.refresh_issued,
            command_epoch: self.issued_seq,
        })
    }

    /// A refresh that lands after a newer one has already been applied is
    /// dropped without touching the status; the caller sees the newer state.
    fn finish_refresh(
        &mut self,
        ticket: RefreshTicket,
        result: Result<StatusReading, TrackerError>,
    ) -> Result<(), TrackerError> {
        self.ensure_attached()?;
        if ticket.seq < self.refresh_applied {
            return Ok(());
        }
        self.refresh_applied = ticket.seq;

        match result {
            Ok(reading) => {
                self.status.water_level_percent = Some(reading.water_level_percent);
                // A command issued since the refresh started (or still in
                // flight) owns pump_on; the reading predates it.
                if !self.status.is_mutating && ticket.command_epoch == self.issued_seq {
                    self.status.pump_on = reading.pump_on;
                }
                self.status.last_error = None;
                self.status.refresh_failed = false;
                Ok(())
            }
            Err(e) => {
                self.status.last_error = Some(e.clone());
                self.status.refresh_failed = true;
                Err(e)
            }
        }
    }

    fn apply_update(&mut self, update: PartialStatus) -> Result<(), TrackerError> {
        self.ensure_attached()?;
        if let Some(level) = update.water_level_percent {
            self.status.water_level_percent = Some(level);
            self.status.refresh_failed = false;
        }
        if let Some(on) = update.pump_on {
            if !self.status.is_mutating {
                self.status.pump_on = on;
            }
        }
        self.status.last_error = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct PlantTracker<B> {
    plant_id: String,
    backend: Arc<B>,
    request_timeout: Duration,
    ledger: Mutex<Ledger>,
    tx: watch::Sender<PlantStatus>,
}

impl<B: Backend> PlantTracker<B> {
    pub fn new(plant_id: impl Into<String>, backend: Arc<B>, request_timeout: Duration) -> Self {
        let plant_id = plant_id.into();
        let ledger = Ledger::new(plant_id.clone());
        let (tx, _rx) = watch::channel(ledger.status.clone());
        Self {
            plant_id,
            backend,
            request_timeout,
            ledger: Mutex::new(ledger),
            tx,
        }
    }

    pub fn plant_id(&self) -> &str {
        &self.plant_id
    }

    /// Current status snapshot.
    pub fn status(&self) -> PlantStatus {
        self.ledger().status.clone()
    }

    /// Observe status changes. Identical refreshes do not notify.
    pub fn watch(&self) -> watch::Receiver<PlantStatus> {
        self.tx.subscribe()
    }

    pub fn is_detached(&self) -> bool {
        self.ledger().detached
    }

    /// Stop applying anything. In-flight requests still complete but their
    /// results are dropped.
    pub fn detach(&self) {
        let mut ledger = self.ledger();
        if !ledger.detached {
            ledger.detached = true;
            debug!(plant = %self.plant_id, "tracker detached");
        }
    }

    /// Fetch the current status. On failure the last known values stay in
    /// place and only `last_error` changes.
    pub async fn refresh_status(&self) -> Result<PlantStatus, TrackerError> {
        let ticket = self.ledger().begin_refresh()?;

        let result = with_deadline(
            self.request_timeout,
            self.backend.fetch_status(&self.plant_id),
        )
        .await;

        let (outcome, status) = {
            let mut ledger = self.ledger();
            let outcome = ledger.finish_refresh(ticket, result);
            if !matches!(outcome, Err(TrackerError::Detached)) {
                self.publish(&ledger.status);
            }
            (outcome, ledger.status.clone())
        };

        match outcome {
            Ok(()) => Ok(status),
            Err(e) => {
                if e.is_internal() {
                    debug!(plant = %self.plant_id, "refresh dropped: {e}");
                } else if status.load_failed() {
                    warn!(plant = %self.plant_id, kind = e.kind(), "failed to load status: {e}");
                } else {
                    warn!(plant = %self.plant_id, kind = e.kind(), "refresh failed, keeping last known status: {e}");
                }
                Err(e)
            }
        }
    }

    /// Command the pump with an optimistic local update.
    pub async fn set_pump(&self, desired_on: bool) -> Result<PlantStatus, TrackerError> {
        let seq = {
            let mut ledger = self.ledger();
            let seq = ledger.begin_command(desired_on)?;
            self.publish(&ledger.status);
            seq
        };
        info!(plant = %self.plant_id, seq, desired_on, "pump command issued");

        let result = with_deadline(
            self.request_timeout,
            self.backend.command_pump(&self.plant_id, desired_on),
        )
        .await;

        let (outcome, status) = {
            let mut ledger = self.ledger();
            let outcome = ledger.finish_command(seq, result);
            if outcome.as_ref().map_or_else(|e| !e.is_internal(), |_| true) {
                self.publish(&ledger.status);
            }
            (outcome, ledger.status.clone())
        };

        match outcome {
            Ok(()) => {
                info!(plant = %self.plant_id, seq, pump_on = status.pump_on, "pump command confirmed");
                Ok(status)
            }
            Err(e) if e.is_internal() => {
                debug!(plant = %self.plant_id, seq, "pump response dropped: {e}");
                Err(e)
            }
            Err(e) => {
                warn!(
                    plant = %self.plant_id,
                    seq,
                    kind = e.kind(),
                    rolled_back_to = status.pump_on,
                    "pump command failed: {e}"
                );
                Err(e)
            }
        }
    }

    /// Apply a pushed update from the live feed.
    pub fn apply_update(&self, update: PartialStatus) {
        let mut ledger = self.ledger();
        if ledger.apply_update(update).is_ok() {
            self.publish(&ledger.status);
        }
    }

    fn publish(&self, status: &PlantStatus) {
        self.tx.send_if_modified(|current| {
            if current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // No code path panics while holding the lock; recover regardless.
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

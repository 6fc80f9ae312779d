//! Poll loop: one spawned task per subscribed plant.
//!
//! Refreshes immediately, then on every tick. Missed ticks are delayed rather
//! than bursted, so a slow or failed poll is never retried early.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::backend::Backend;
use crate::tracker::PlantTracker;

/// Handle to a running poll loop. Cancelling (or dropping) it stops the timer
/// and detaches the tracker, so in-flight responses are discarded.
pub struct Subscription<B: Backend> {
    tracker: Arc<PlantTracker<B>>,
    task: JoinHandle<()>,
}

pub fn subscribe<B: Backend>(tracker: Arc<PlantTracker<B>>, every: Duration) -> Subscription<B> {
    let polled = Arc::clone(&tracker);
    let task = tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // first tick completes immediately
            ticker.tick().await;
            // errors are recorded on the tracker and logged there
            let _ = polled.refresh_status().await;
        }
    });
    debug!(plant = %tracker.plant_id(), every_ms = every.as_millis() as u64, "polling started");
    Subscription { tracker, task }
}

impl<B: Backend> Subscription<B> {
    pub fn tracker(&self) -> &Arc<PlantTracker<B>> {
        &self.tracker
    }

    pub fn cancel(&self) {
        self.tracker.detach();
        self.task.abort();
    }
}

impl<B: Backend> Drop for Subscription<B> {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PlantForecastMsg, StatusReading};
    use crate::error::TrackerError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
        slow: bool,
    }

    impl CountingBackend {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Backend for CountingBackend {
        async fn fetch_status(&self, _plant_id: &str) -> Result<StatusReading, TrackerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow {
                time::sleep(Duration::from_secs(7)).await;
            }
            Ok(StatusReading {
                pump_on: false,
                water_level_percent: 55.0,
            })
        }

        async fn command_pump(&self, _plant_id: &str, _on: bool) -> Result<Option<bool>, TrackerError> {
            Ok(None)
        }

        async fn fetch_forecast(&self) -> Result<Vec<PlantForecastMsg>, TrackerError> {
            Ok(Vec::new())
        }
    }

    fn tracker(backend: Arc<CountingBackend>) -> Arc<PlantTracker<CountingBackend>> {
        Arc::new(PlantTracker::new("tomato-101", backend, Duration::from_secs(30)))
    }

    #[tokio::test(start_paused = true)]
    async fn polls_immediately_then_every_interval() {
        let backend = Arc::new(CountingBackend::default());
        let sub = subscribe(tracker(Arc::clone(&backend)), Duration::from_secs(5));

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.calls(), 1, "refresh at t=0");
        assert_eq!(sub.tracker().status().water_level_percent, Some(55.0));

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.calls(), 2, "refresh at t=5s");

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.calls(), 3, "refresh at t=10s");

        sub.cancel();
        assert!(sub.tracker().is_detached());
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.calls(), 3, "no refresh after unsubscribe");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_subscription_stops_polling() {
        let backend = Arc::new(CountingBackend::default());
        let t = tracker(Arc::clone(&backend));
        let sub = subscribe(Arc::clone(&t), Duration::from_secs(5));

        time::sleep(Duration::from_millis(100)).await;
        drop(sub);
        assert!(t.is_detached());

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_poll_does_not_burst() {
        // Each fetch takes 7 s against a 5 s interval.
        let backend = Arc::new(CountingBackend {
            slow: true,
            ..CountingBackend::default()
        });
        let _sub = subscribe(tracker(Arc::clone(&backend)), Duration::from_secs(5));

        // Starts: 0, 7 (tick overdue, delayed), 14, 21...
        time::sleep(Duration::from_millis(22_000)).await;
        assert_eq!(backend.calls(), 4);
    }
}

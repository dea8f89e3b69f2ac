//! Fixed-rate tick scheduling anchored to wall-clock deadlines.
//!
//! Unlike a plain periodic timer, a tick that runs long never queues up a
//! burst of make-up ticks: once the loop has fallen more than
//! [`MAX_DRIFT_TICKS`] intervals behind, the deadline is re-anchored to "now"
//! and the missed ticks are simply dropped.

use log::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::time::{Duration, Instant};

/// How many intervals the loop may lag before the deadline is reset.
pub const MAX_DRIFT_TICKS: u32 = 4;

/// What happened when a tick fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTiming {
    /// Ticks skipped because the loop fell too far behind.
    pub dropped_ticks: u32,
    /// Time between the deadline and the moment the tick actually ran.
    pub lateness: Duration,
}

#[derive(Debug, Clone)]
pub struct TickScheduler {
    interval: Duration,
    next_deadline: Instant,
}

impl TickScheduler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_deadline: now + interval,
        }
    }

    pub fn from_rate(tick_rate: u32, now: Instant) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1))), now)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Instant {
        self.next_deadline
    }

    /// Fixed simulation step in seconds.
    pub fn dt(&self) -> f64 {
        self.interval.as_secs_f64()
    }

    /// Advances the deadline after a tick fired at `now`.
    pub fn on_tick(&mut self, now: Instant) -> TickTiming {
        let lateness = now.saturating_duration_since(self.next_deadline);
        let mut dropped_ticks = 0;

        if lateness > self.interval * MAX_DRIFT_TICKS {
            dropped_ticks = (lateness.as_secs_f64() / self.interval.as_secs_f64()) as u32;
            warn!(
                "Tick loop {:.1}ms behind, dropping {} ticks",
                lateness.as_secs_f64() * 1000.0,
                dropped_ticks
            );
            self.next_deadline = now;
        }

        self.next_deadline += self.interval;
        TickTiming {
            dropped_ticks,
            lateness,
        }
    }
}

/// Runs one pipeline stage, catching a panic so later ticks keep running.
/// Returns `None` when the stage panicked; the caller keeps its old state.
pub fn run_guarded<T>(stage: &str, tick: u32, work: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Tick {} stage '{}' failed: {}", tick, stage, message);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_on_time_tick_advances_by_one_interval() {
        let start = Instant::now();
        let mut scheduler = TickScheduler::new(ms(50), start);

        let timing = scheduler.on_tick(start + ms(50));

        assert_eq!(timing.dropped_ticks, 0);
        assert_eq!(scheduler.deadline(), start + ms(100));
    }

    #[test]
    fn test_small_lag_keeps_original_cadence() {
        let start = Instant::now();
        let mut scheduler = TickScheduler::new(ms(50), start);

        // 2 intervals late: within tolerance, deadline stays anchored
        let timing = scheduler.on_tick(start + ms(150));

        assert_eq!(timing.dropped_ticks, 0);
        assert_eq!(timing.lateness, ms(100));
        assert_eq!(scheduler.deadline(), start + ms(100));
    }

    #[test]
    fn test_large_drift_resets_deadline_to_now() {
        let start = Instant::now();
        let mut scheduler = TickScheduler::new(ms(50), start);
        let now = start + ms(50) + ms(500);

        let timing = scheduler.on_tick(now);

        assert_eq!(timing.dropped_ticks, 10);
        assert_eq!(scheduler.deadline(), now + ms(50));
    }

    #[test]
    fn test_no_catch_up_burst_after_stall() {
        let start = Instant::now();
        let mut scheduler = TickScheduler::new(ms(50), start);
        let stalled = start + ms(2_000);

        scheduler.on_tick(stalled);

        // The next deadline is a full interval away, not in the past.
        assert!(scheduler.deadline() > stalled);
    }

    #[test]
    fn test_run_guarded_contains_panics() {
        let mut state = 5;
        let result = run_guarded("explode", 1, || {
            let next = state + 1;
            if next > 0 {
                panic!("boom");
            }
            next
        });
        assert!(result.is_none());

        let result = run_guarded("ok", 2, || state + 1);
        if let Some(value) = result {
            state = value;
        }
        assert_eq!(state, 6);
    }

    #[test]
    fn test_from_rate() {
        let scheduler = TickScheduler::from_rate(20, Instant::now());
        assert_eq!(scheduler.interval(), ms(50));
        assert!((scheduler.dt() - 0.05).abs() < 1e-9);
    }
}

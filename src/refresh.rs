//! Debounced UI refresh signalling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::RefreshConfig;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Coalesces "something changed" signals into few redraws.
///
/// A request is accepted when the debounce window has elapsed since the last
/// accepted one, or when it is forced. Safe to call from any thread.
#[derive(Debug)]
pub struct RefreshController {
    window: Duration,
    last_accepted: Mutex<Option<Instant>>,
    accepted: AtomicU64,
    suppressed: AtomicU64,
}

impl Default for RefreshController {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl RefreshController {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: Mutex::new(None),
            accepted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RefreshConfig) -> Self {
        Self::new(Duration::from_millis(config.debounce_ms))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` when the caller should redraw now.
    pub fn request_refresh(&self, force: bool) -> bool {
        self.request_refresh_at(force, Instant::now())
    }

    fn request_refresh_at(&self, force: bool, now: Instant) -> bool {
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let due = match *last {
            None => true,
            Some(prev) => now.saturating_duration_since(prev) >= self.window,
        };

        if force || due {
            *last = Some(now);
            self.accepted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            trace!("Refresh suppressed");
            false
        }
    }

    /// Seconds since the last accepted refresh, infinite if there was none.
    pub fn time_since_last(&self) -> f64 {
        self.last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|prev| prev.elapsed().as_secs_f64())
            .unwrap_or(f64::INFINITY)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn burst_within_window_yields_one_refresh() {
        let controller = RefreshController::new(Duration::from_millis(500));
        let start = Instant::now();
        let accepted = (0..1000)
            .filter(|i| controller.request_refresh_at(false, start + Duration::from_micros(i * 100)))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(controller.suppressed(), 999);
    }

    #[test]
    fn force_always_refreshes() {
        let controller = RefreshController::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(controller.request_refresh_at(false, start));
        for i in 1..10 {
            assert!(controller.request_refresh_at(true, start + Duration::from_millis(i)));
        }
        assert!(!controller.request_refresh_at(false, start + Duration::from_millis(20)));
    }

    #[test]
    fn window_elapsed_accepts_again() {
        let controller = RefreshController::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(controller.request_refresh_at(false, start));
        assert!(!controller.request_refresh_at(false, start + Duration::from_millis(499)));
        assert!(controller.request_refresh_at(false, start + Duration::from_millis(500)));
    }

    #[test]
    fn time_since_last_tracks_accepted_calls() {
        let controller = RefreshController::default();
        assert!(controller.time_since_last().is_infinite());
        controller.request_refresh(true);
        assert!(controller.time_since_last() < 1.0);
    }

    #[test]
    fn concurrent_requests_accept_once() {
        let controller = Arc::new(RefreshController::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = Arc::clone(&controller);
                std::thread::spawn(move || {
                    (0..100).filter(|_| controller.request_refresh(false)).count()
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }
}

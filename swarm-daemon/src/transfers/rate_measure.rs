//! Smoothed transfer-rate measurement
//!
//! The rate is a running average over a window that starts at the first
//! update and slides forward once it exceeds `max_window`. Shared between a
//! transfer's coordinator and the collaborators that move bytes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Window used for per-transfer upload and download rates
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(20);

/// Pretend the window had already been open this long at the first update
const INITIAL_WINDOW: Duration = Duration::from_secs(2);

struct MeasureState {
    total: u64,
    rate: f64,
    since: Instant,
    last: Instant,
}

pub struct RateMeasure {
    max_window: Duration,
    state: Mutex<MeasureState>,
}

impl RateMeasure {
    pub fn new(max_window: Duration) -> Self {
        Self::starting_at(max_window, Instant::now())
    }

    fn starting_at(max_window: Duration, now: Instant) -> Self {
        let since = now.checked_sub(INITIAL_WINDOW).unwrap_or(now);
        Self {
            max_window,
            state: Mutex::new(MeasureState {
                total: 0,
                rate: 0.0,
                since,
                last: since,
            }),
        }
    }

    pub fn update(&self, bytes: u64) {
        self.update_at(bytes, Instant::now());
    }

    fn update_at(&self, bytes: u64, now: Instant) {
        let mut state = self.state.lock().expect("rate measure lock poisoned");
        state.total += bytes;

        let covered = state.last.saturating_duration_since(state.since).as_secs_f64();
        let window = now.saturating_duration_since(state.since).as_secs_f64();
        if window > 0.0 {
            state.rate = (state.rate * covered + bytes as f64) / window;
        }
        state.last = now;

        if let Some(oldest) = now.checked_sub(self.max_window) {
            state.since = state.since.max(oldest);
        }
    }

    /// Bytes per second
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&self, now: Instant) -> f64 {
        self.update_at(0, now);
        self.state.lock().expect("rate measure lock poisoned").rate
    }

    pub fn total(&self) -> u64 {
        self.state.lock().expect("rate measure lock poisoned").total
    }
}

impl Default for RateMeasure {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

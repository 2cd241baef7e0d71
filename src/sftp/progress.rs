//! Transfer rate measurement
//!
//! Rate is computed over a trailing time window rather than since the start
//! of the transfer, so it follows throughput changes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Trailing-window throughput meter
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    /// (timestamp, cumulative bytes)
    samples: VecDeque<(Instant, u64)>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the cumulative byte count at `now`
    pub fn record(&mut self, now: Instant, transferred: u64) {
        self.samples.push_back((now, transferred));

        // Keep one sample at or beyond the window edge as the baseline
        while self.samples.len() > 2 {
            match self.samples.get(1) {
                Some((at, _)) if now.duration_since(*at) >= self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes per second over the window ending at the latest sample
    pub fn rate(&self) -> Option<f64> {
        let (last_at, _) = *self.samples.back()?;
        self.rate_at(last_at)
    }

    /// Bytes per second over the window ending at `now`.
    ///
    /// Time without samples counts as zero throughput, so a stall decays the
    /// rate toward 0. `None` until two samples exist.
    pub fn rate_at(&self, now: Instant) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let (last_at, last_bytes) = *self.samples.back()?;
        let edge = now.checked_sub(self.window);
        let (base_at, base_bytes) = self
            .samples
            .iter()
            .rev()
            .find(|(at, _)| edge.map_or(false, |edge| *at <= edge))
            .or_else(|| self.samples.front())
            .copied()?;

        let secs = now.max(last_at).duration_since(base_at).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(last_bytes.saturating_sub(base_bytes) as f64 / secs)
    }
}

/// Remaining time in milliseconds; requires a known total and a positive rate
pub fn eta_ms(total: Option<u64>, transferred: u64, rate: Option<f64>) -> Option<u64> {
    let total = total?;
    let rate = rate.filter(|r| *r > 0.0)?;
    let remaining = total.saturating_sub(transferred) as f64;
    Some((remaining / rate * 1000.0) as u64)
}

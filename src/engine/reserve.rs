//! Dynamic reserve manager
//!
//! Keeps a slice of the wallet out of play. Missed entries are pressure to
//! free capital (reserve down); missed hedges are pressure to keep powder
//! dry for defense (reserve up). The fraction drifts toward the pressure
//! target at the configured adaptation rate.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

const MIN_RESERVE_FRACTION: f64 = 0.10;
const MISS_WINDOW_SECS: i64 = 1_800;
/// Misses at which pressure saturates.
const PRESSURE_SATURATION: f64 = 5.0;

#[derive(Debug, Clone, Serialize)]
pub struct DynamicReserveState {
    pub base_fraction: f64,
    pub adapted_fraction: f64,
    pub recent_missed_entries: usize,
    pub recent_missed_hedges: usize,
}

#[derive(Debug)]
struct ReserveInner {
    fraction: f64,
    missed_entries: VecDeque<DateTime<Utc>>,
    missed_hedges: VecDeque<DateTime<Utc>>,
}

pub struct ReserveManager {
    base_fraction: f64,
    max_fraction: f64,
    adaptation_rate: f64,
    min_reserve_usd: f64,
    inner: Mutex<ReserveInner>,
}

impl ReserveManager {
    pub fn new(
        base_fraction: f64,
        max_fraction: f64,
        adaptation_rate: f64,
        min_reserve_usd: f64,
    ) -> Self {
        let base = base_fraction.clamp(MIN_RESERVE_FRACTION, max_fraction.max(MIN_RESERVE_FRACTION));
        Self {
            base_fraction: base,
            max_fraction: max_fraction.max(base),
            adaptation_rate: adaptation_rate.clamp(0.01, 1.0),
            min_reserve_usd,
            inner: Mutex::new(ReserveInner {
                fraction: base,
                missed_entries: VecDeque::new(),
                missed_hedges: VecDeque::new(),
            }),
        }
    }

    /// An entry the engine wanted but could not afford.
    pub fn record_missed_entry(&self) {
        let mut inner = self.inner.lock();
        inner.missed_entries.push_back(Utc::now());
        self.adapt(&mut inner);
    }

    /// A hedge the engine wanted but could not afford.
    pub fn record_missed_hedge(&self) {
        let mut inner = self.inner.lock();
        inner.missed_hedges.push_back(Utc::now());
        self.adapt(&mut inner);
    }

    fn adapt(&self, inner: &mut ReserveInner) {
        let cutoff = Utc::now() - Duration::seconds(MISS_WINDOW_SECS);
        while inner
            .missed_entries
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            inner.missed_entries.pop_front();
        }
        while inner
            .missed_hedges
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            inner.missed_hedges.pop_front();
        }

        let entry_pressure = (inner.missed_entries.len() as f64 / PRESSURE_SATURATION).min(1.0);
        let hedge_pressure = (inner.missed_hedges.len() as f64 / PRESSURE_SATURATION).min(1.0);

        let target = (self.base_fraction
            + (self.max_fraction - self.base_fraction) * hedge_pressure
            - (self.base_fraction - MIN_RESERVE_FRACTION) * entry_pressure)
            .clamp(MIN_RESERVE_FRACTION, self.max_fraction);

        inner.fraction += self.adaptation_rate * (target - inner.fraction);
        debug!(
            fraction = %format!("{:.3}", inner.fraction),
            target = %format!("{:.3}", target),
            missed_entries = %inner.missed_entries.len(),
            missed_hedges = %inner.missed_hedges.len(),
            "reserve adapted"
        );
    }

    /// Tradeable capital after the reserve is held back.
    pub fn effective_bankroll(&self, balance_usd: f64) -> f64 {
        let fraction = self.inner.lock().fraction;
        let reserved = (fraction * balance_usd).max(self.min_reserve_usd);
        (balance_usd - reserved).max(0.0)
    }

    pub fn state(&self) -> DynamicReserveState {
        let inner = self.inner.lock();
        DynamicReserveState {
            base_fraction: self.base_fraction,
            adapted_fraction: inner.fraction,
            recent_missed_entries: inner.missed_entries.len(),
            recent_missed_hedges: inner.missed_hedges.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ReserveManager {
        ReserveManager::new(0.25, 0.50, 0.20, 10.0)
    }

    #[test]
    fn effective_bankroll_holds_back_reserve() {
        let m = manager();
        // 25% of 500 = 125 reserved.
        assert!((m.effective_bankroll(500.0) - 375.0).abs() < 1e-9);
    }

    #[test]
    fn min_reserve_usd_dominates_small_wallets() {
        let m = manager();
        // 25% of 20 = 5, below the $10 floor.
        assert!((m.effective_bankroll(20.0) - 10.0).abs() < 1e-9);
        assert_eq!(m.effective_bankroll(5.0), 0.0);
    }

    #[test]
    fn missed_entries_lower_the_fraction() {
        let m = manager();
        for _ in 0..10 {
            m.record_missed_entry();
        }
        let state = m.state();
        assert!(state.adapted_fraction < 0.25);
        assert!(state.adapted_fraction >= MIN_RESERVE_FRACTION);
    }

    #[test]
    fn missed_hedges_raise_the_fraction() {
        let m = manager();
        for _ in 0..10 {
            m.record_missed_hedge();
        }
        let state = m.state();
        assert!(state.adapted_fraction > 0.25);
        assert!(state.adapted_fraction <= 0.50);
    }

    #[test]
    fn opposing_pressures_roughly_cancel() {
        let m = manager();
        for _ in 0..5 {
            m.record_missed_entry();
            m.record_missed_hedge();
        }
        let state = m.state();
        // Saturated both ways: target = base + 0.25 - 0.15 = 0.35.
        assert!(state.adapted_fraction > 0.25 && state.adapted_fraction < 0.40);
    }
}

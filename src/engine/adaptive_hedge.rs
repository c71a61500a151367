//! Adaptive hedge policy
//!
//! Watches realized price volatility and velocity, classifies the regime,
//! and drifts the hedge trigger, hedge ratio, and max-adverse threshold
//! toward regime-appropriate targets. Changes are rate-limited per adapt
//! interval so one wild observation cannot swing the policy.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use statrs::statistics::{Data, OrderStatistics};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use super::adaptive_ev::Ewma;

const PRICE_HISTORY_SECS: i64 = 300;
const MIN_ADVERSE_SAMPLES: usize = 5;
const TRIGGER_FLOOR_CENTS: f64 = 0.01;
const RATIO_FLOOR: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolRegime {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for VolRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolRegime::Low => write!(f, "LOW"),
            VolRegime::Normal => write!(f, "NORMAL"),
            VolRegime::High => write!(f, "HIGH"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveHedgeConfig {
    pub base_trigger_cents: f64,
    pub min_trigger_cents: f64,
    pub max_trigger_cents: f64,
    pub base_hedge_ratio: f64,
    pub min_hedge_ratio: f64,
    pub max_hedge_ratio: f64,
    pub base_max_adverse_cents: f64,
    pub min_max_adverse_cents: f64,
    pub max_max_adverse_cents: f64,
    /// Multiplier over p90(|adverse move|) when retargeting max-adverse.
    pub adverse_buffer: f64,
    /// σ below this (cents per observation) reads as a quiet book.
    pub low_vol_cents: f64,
    /// σ above this reads as a hot book.
    pub high_vol_cents: f64,
    /// Velocity above this (cents/sec) forces the HIGH regime.
    pub high_velocity_cents_per_sec: f64,
    pub min_observations: u64,
    pub adapt_interval_secs: i64,
    /// Per-interval relative change cap on each adapted value.
    pub max_change_per_interval: f64,
    pub effectiveness_window: usize,
}

impl Default for AdaptiveHedgeConfig {
    fn default() -> Self {
        Self {
            base_trigger_cents: 10.0,
            min_trigger_cents: 5.0,
            max_trigger_cents: 20.0,
            base_hedge_ratio: 0.35,
            min_hedge_ratio: 0.15,
            max_hedge_ratio: 0.75,
            base_max_adverse_cents: 30.0,
            min_max_adverse_cents: 15.0,
            max_max_adverse_cents: 45.0,
            adverse_buffer: 1.25,
            low_vol_cents: 0.5,
            high_vol_cents: 2.0,
            high_velocity_cents_per_sec: 0.5,
            min_observations: 20,
            adapt_interval_secs: 60,
            max_change_per_interval: 0.15,
            effectiveness_window: 20,
        }
    }
}

/// The currently-effective thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct HedgeParams {
    pub trigger_cents: f64,
    pub hedge_ratio: f64,
    pub max_adverse_cents: f64,
    pub regime: VolRegime,
}

#[derive(Debug, Clone)]
pub struct HedgeDecision {
    pub should_hedge: bool,
    pub ratio: f64,
    pub reason: String,
}

#[derive(Debug)]
struct HedgeState {
    price_history: HashMap<String, VecDeque<(DateTime<Utc>, f64)>>,
    sigma: Ewma,
    velocity: Ewma,
    trigger_cents: f64,
    hedge_ratio: f64,
    max_adverse_cents: f64,
    observations: u64,
    last_adapt: Option<DateTime<Utc>>,
    adverse_moves: VecDeque<f64>,
    hedge_outcomes: VecDeque<bool>,
}

pub struct AdaptiveHedgePolicy {
    config: AdaptiveHedgeConfig,
    state: Mutex<HedgeState>,
}

impl AdaptiveHedgePolicy {
    pub fn new(config: AdaptiveHedgeConfig) -> Self {
        let state = HedgeState {
            price_history: HashMap::new(),
            sigma: Ewma::new(0.1),
            velocity: Ewma::new(0.1),
            trigger_cents: config.base_trigger_cents,
            hedge_ratio: config.base_hedge_ratio,
            max_adverse_cents: config.base_max_adverse_cents,
            observations: 0,
            last_adapt: None,
            adverse_moves: VecDeque::new(),
            hedge_outcomes: VecDeque::new(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Feed one observed mid price (cents). Updates σ and velocity and may
    /// trigger an adaptation step.
    pub fn record_price(&self, token_id: &str, price_cents: f64, at: DateTime<Utc>) {
        if !price_cents.is_finite() {
            return;
        }
        let mut state = self.state.lock();

        let prev = state
            .price_history
            .get(token_id)
            .and_then(|h| h.back().copied());
        if let Some((prev_at, prev_price)) = prev {
            let delta = (price_cents - prev_price).abs();
            let dt_secs = (at - prev_at).num_milliseconds() as f64 / 1_000.0;
            let velocity_sample = if dt_secs > 0.0 { delta / dt_secs } else { 0.0 };
            state.sigma.update(delta);
            state.velocity.update(velocity_sample);
            state.observations += 1;
        }

        let history = state
            .price_history
            .entry(token_id.to_string())
            .or_default();
        history.push_back((at, price_cents));
        let cutoff = at - Duration::seconds(PRICE_HISTORY_SECS);
        while history.front().map(|(t, _)| *t < cutoff).unwrap_or(false) {
            history.pop_front();
        }

        self.maybe_adapt(&mut state, at);
    }

    /// Largest adverse excursion of a closed position, in cents.
    pub fn record_adverse_move(&self, adverse_cents: f64) {
        if !adverse_cents.is_finite() {
            return;
        }
        let mut state = self.state.lock();
        state.adverse_moves.push_back(adverse_cents.abs());
        while state.adverse_moves.len() > 100 {
            state.adverse_moves.pop_front();
        }
    }

    /// Whether a completed hedge ended up cheaper than staying naked.
    pub fn record_hedge_outcome(&self, was_effective: bool) {
        let mut state = self.state.lock();
        state.hedge_outcomes.push_back(was_effective);
        while state.hedge_outcomes.len() > self.config.effectiveness_window {
            state.hedge_outcomes.pop_front();
        }
    }

    fn regime_of(&self, state: &HedgeState) -> VolRegime {
        if state.velocity.value() >= self.config.high_velocity_cents_per_sec {
            return VolRegime::High;
        }
        let sigma = state.sigma.value();
        if sigma >= self.config.high_vol_cents {
            VolRegime::High
        } else if sigma <= self.config.low_vol_cents {
            VolRegime::Low
        } else {
            VolRegime::Normal
        }
    }

    fn maybe_adapt(&self, state: &mut HedgeState, now: DateTime<Utc>) {
        if state.observations < self.config.min_observations {
            return;
        }
        if let Some(last) = state.last_adapt {
            if (now - last).num_seconds() < self.config.adapt_interval_secs {
                return;
            }
        }
        state.last_adapt = Some(now);

        let regime = self.regime_of(state);
        let cfg = &self.config;

        let trigger_target = match regime {
            VolRegime::High => cfg.base_trigger_cents * 0.7,
            VolRegime::Low => cfg.base_trigger_cents * 1.3,
            VolRegime::Normal => cfg.base_trigger_cents,
        }
        .clamp(cfg.min_trigger_cents, cfg.max_trigger_cents);

        let mut ratio_target = match regime {
            VolRegime::High => cfg.base_hedge_ratio + 0.10,
            VolRegime::Low => cfg.base_hedge_ratio - 0.10,
            VolRegime::Normal => cfg.base_hedge_ratio,
        };
        if state.hedge_outcomes.len() >= cfg.effectiveness_window / 2 {
            let effective = state.hedge_outcomes.iter().filter(|e| **e).count() as f64
                / state.hedge_outcomes.len() as f64;
            if effective >= 0.7 {
                ratio_target += 0.05;
            } else if effective <= 0.3 {
                ratio_target -= 0.10;
            }
        }
        let ratio_target = ratio_target.clamp(cfg.min_hedge_ratio, cfg.max_hedge_ratio);

        let adverse_target = if state.adverse_moves.len() >= MIN_ADVERSE_SAMPLES {
            let mut data = Data::new(state.adverse_moves.iter().copied().collect::<Vec<f64>>());
            (data.percentile(90) * cfg.adverse_buffer)
                .clamp(cfg.min_max_adverse_cents, cfg.max_max_adverse_cents)
        } else {
            state.max_adverse_cents
        };

        state.trigger_cents = Self::step_toward(
            state.trigger_cents,
            trigger_target,
            cfg.max_change_per_interval,
            TRIGGER_FLOOR_CENTS,
        );
        state.hedge_ratio = Self::step_toward(
            state.hedge_ratio,
            ratio_target,
            cfg.max_change_per_interval,
            RATIO_FLOOR,
        );
        state.max_adverse_cents = Self::step_toward(
            state.max_adverse_cents,
            adverse_target,
            cfg.max_change_per_interval,
            TRIGGER_FLOOR_CENTS,
        );

        debug!(
            regime = %regime,
            sigma = %format!("{:.3}", state.sigma.value()),
            velocity = %format!("{:.3}", state.velocity.value()),
            trigger_cents = %format!("{:.2}", state.trigger_cents),
            hedge_ratio = %format!("{:.3}", state.hedge_ratio),
            max_adverse_cents = %format!("{:.1}", state.max_adverse_cents),
            "hedge policy adapted"
        );
    }

    /// Move `current` toward `target`, at most `rate` of current magnitude
    /// per step, never less than `floor` when a move is due.
    fn step_toward(current: f64, target: f64, rate: f64, floor: f64) -> f64 {
        let delta = target - current;
        if delta.abs() < f64::EPSILON {
            return current;
        }
        let max_step = (current.abs() * rate).max(floor);
        current + delta.clamp(-max_step, max_step)
    }

    pub fn current_params(&self) -> HedgeParams {
        let state = self.state.lock();
        HedgeParams {
            trigger_cents: state.trigger_cents,
            hedge_ratio: state.hedge_ratio,
            max_adverse_cents: state.max_adverse_cents,
            regime: self.regime_of(&state),
        }
    }

    /// Core hedge decision from current P&L and how much is already hedged.
    pub fn evaluate_hedge(&self, pnl_cents: f64, current_hedge_ratio: f64) -> HedgeDecision {
        let state = self.state.lock();

        if pnl_cents > -state.trigger_cents {
            return HedgeDecision {
                should_hedge: false,
                ratio: 0.0,
                reason: format!(
                    "loss {:.1}¢ inside trigger {:.1}¢",
                    pnl_cents, state.trigger_cents
                ),
            };
        }

        let headroom = self.config.max_hedge_ratio - current_hedge_ratio;
        if headroom <= RATIO_FLOOR {
            return HedgeDecision {
                should_hedge: false,
                ratio: 0.0,
                reason: format!(
                    "hedge ratio {:.2} at cap {:.2}",
                    current_hedge_ratio, self.config.max_hedge_ratio
                ),
            };
        }

        let ratio = state.hedge_ratio.min(headroom);
        let regime = self.regime_of(&state);
        HedgeDecision {
            should_hedge: true,
            ratio,
            reason: format!(
                "adverse {:.1}¢ past trigger {:.1}¢ ({} vol)",
                pnl_cents, state.trigger_cents, regime
            ),
        }
    }

    /// Overlay: scale the base decision by a factor derived from historical
    /// snapshots of similar setups, bounded so it can neither halve the
    /// hedge below usefulness nor breach the cap.
    pub fn evaluate_hedge_with_history(
        &self,
        pnl_cents: f64,
        current_hedge_ratio: f64,
        history_factor: f64,
    ) -> HedgeDecision {
        let base = self.evaluate_hedge(pnl_cents, current_hedge_ratio);
        if !base.should_hedge {
            return base;
        }

        let factor = if history_factor.is_finite() && history_factor > 0.0 {
            history_factor
        } else {
            1.0
        };
        let lo = base.ratio * 0.5;
        let hi = (self.config.max_hedge_ratio - current_hedge_ratio).max(lo);
        let ratio = (base.ratio * factor).clamp(lo, hi);

        HedgeDecision {
            should_hedge: true,
            ratio,
            reason: format!("{} × history {:.2}", base.reason, factor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AdaptiveHedgePolicy {
        AdaptiveHedgePolicy::new(AdaptiveHedgeConfig::default())
    }

    /// Walk prices with a fixed per-step move so σ converges there.
    fn feed_prices(policy: &AdaptiveHedgePolicy, step_cents: f64, steps: usize) {
        let mut t = Utc::now() - Duration::seconds(steps as i64 * 70);
        let mut price = 50.0;
        for i in 0..steps {
            policy.record_price("tok", price, t);
            price += if i % 2 == 0 { step_cents } else { -step_cents };
            t += Duration::seconds(70);
        }
    }

    #[test]
    fn no_hedge_inside_trigger() {
        let d = policy().evaluate_hedge(-4.0, 0.0);
        assert!(!d.should_hedge);
    }

    #[test]
    fn hedge_past_trigger_with_default_ratio() {
        let d = policy().evaluate_hedge(-12.0, 0.0);
        assert!(d.should_hedge);
        assert!((d.ratio - 0.35).abs() < 1e-9);
    }

    #[test]
    fn cap_leaves_no_headroom() {
        let d = policy().evaluate_hedge(-12.0, 0.75);
        assert!(!d.should_hedge);
    }

    #[test]
    fn partial_headroom_clamps_ratio() {
        let d = policy().evaluate_hedge(-12.0, 0.6);
        assert!(d.should_hedge);
        assert!((d.ratio - 0.15).abs() < 1e-9);
    }

    #[test]
    fn high_vol_tightens_trigger_over_time() {
        let p = policy();
        feed_prices(&p, 5.0, 60);
        let params = p.current_params();
        assert_eq!(params.regime, VolRegime::High);
        assert!(params.trigger_cents < 10.0);
        assert!(params.hedge_ratio > 0.35);
    }

    #[test]
    fn low_vol_loosens_trigger_over_time() {
        let p = policy();
        feed_prices(&p, 0.1, 60);
        let params = p.current_params();
        assert_eq!(params.regime, VolRegime::Low);
        assert!(params.trigger_cents > 10.0);
        assert!(params.hedge_ratio < 0.35);
    }

    #[test]
    fn adaptation_rate_is_clamped() {
        let p = policy();
        // One adapt step max: trigger can move at most 15% of 10¢.
        let mut t = Utc::now() - Duration::seconds(30 * 70);
        let mut price = 50.0;
        for i in 0..21 {
            p.record_price("tok", price, t);
            price += if i % 2 == 0 { 6.0 } else { -6.0 };
            t += Duration::seconds(70);
        }
        let params = p.current_params();
        assert!(params.trigger_cents >= 10.0 * (1.0 - 0.15) - 1e-9);
    }

    #[test]
    fn adverse_history_retargets_max_adverse() {
        let p = policy();
        for _ in 0..20 {
            p.record_adverse_move(-12.0);
        }
        // Force several adapt steps.
        feed_prices(&p, 1.0, 200);
        let params = p.current_params();
        // p90 = 12¢, ×1.25 = 15¢; drifting down from 30 toward the floor.
        assert!(params.max_adverse_cents < 30.0);
        assert!(params.max_adverse_cents >= 15.0);
    }

    #[test]
    fn history_overlay_respects_bounds() {
        let p = policy();
        let base = p.evaluate_hedge(-12.0, 0.0);
        let boosted = p.evaluate_hedge_with_history(-12.0, 0.0, 10.0);
        assert!(boosted.ratio <= 0.75);
        let shrunk = p.evaluate_hedge_with_history(-12.0, 0.0, 0.01);
        assert!((shrunk.ratio - base.ratio * 0.5).abs() < 1e-9);
    }

    #[test]
    fn ineffective_hedges_shrink_the_ratio_target() {
        let p = policy();
        for _ in 0..20 {
            p.record_hedge_outcome(false);
        }
        feed_prices(&p, 1.0, 200);
        let params = p.current_params();
        assert!(params.hedge_ratio < 0.35);
    }
}

//! Adaptive EV engine
//!
//! Replaces the static EV priors with exponentially-weighted estimates of
//! win size, loss size, win rate, and churn cost, each with its own decay.
//! The adaptive values only take over once the sample is big enough, both
//! magnitude estimates are stable, and enough notional has traded; until
//! then entries are sized off the static priors.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::ev::{DEFAULT_AVG_LOSS_CENTS, DEFAULT_AVG_WIN_CENTS};

/// Exponentially-weighted mean with an exponentially-weighted variance.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    variance: f64,
    count: u64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.001, 1.0),
            value: 0.0,
            variance: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        if self.count == 0 {
            self.value = x;
            self.variance = 0.0;
        } else {
            let diff = x - self.value;
            let incr = self.alpha * diff;
            self.value += incr;
            self.variance = (1.0 - self.alpha) * (self.variance + diff * incr);
        }
        self.count += 1;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Coefficient of variation; large means the estimate is still moving.
    pub fn normalized_deviation(&self) -> f64 {
        if self.count < 2 || self.value.abs() < 1e-9 {
            return f64::INFINITY;
        }
        self.variance.max(0.0).sqrt() / self.value.abs()
    }

    pub fn is_stable(&self, threshold: f64) -> bool {
        self.normalized_deviation() < threshold
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveEvConfig {
    pub win_alpha: f64,
    pub loss_alpha: f64,
    pub win_rate_alpha: f64,
    pub churn_alpha: f64,
    /// Sample size before adaptive values may replace the static priors.
    pub min_samples: u64,
    /// Notional volume before adaptive values may replace the priors.
    pub min_notional_usd: f64,
    /// Estimated wins and losses must each reach this count.
    pub min_outcome_count: f64,
    pub stability_threshold: f64,
    /// EV at or above this trades full size.
    pub full_ev_threshold_cents: f64,
    pub min_profit_factor: f64,
    pub min_confidence: f64,
    pub reduced_factor: f64,
    pub pause_seconds: i64,
    pub fallback_churn_cents: f64,
}

impl Default for AdaptiveEvConfig {
    fn default() -> Self {
        Self {
            win_alpha: 0.10,
            loss_alpha: 0.10,
            win_rate_alpha: 0.05,
            churn_alpha: 0.20,
            min_samples: 30,
            min_notional_usd: 500.0,
            min_outcome_count: 5.0,
            stability_threshold: 0.35,
            full_ev_threshold_cents: 2.0,
            min_profit_factor: 1.2,
            min_confidence: 0.5,
            reduced_factor: 0.5,
            pause_seconds: 300,
            fallback_churn_cents: 2.0,
        }
    }
}

/// Sizing verdict for a prospective entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryDecisionResult {
    /// 0 blocks, `reduced_factor` shrinks, 1 trades full size.
    pub size_factor: f64,
    pub ev_cents: f64,
    pub profit_factor: f64,
    pub confidence: f64,
    /// Whether adaptive estimates (vs static priors) produced the verdict.
    pub adaptive: bool,
    pub reason: String,
}

#[derive(Debug)]
struct AdaptiveState {
    win_cents: Ewma,
    loss_cents: Ewma,
    win_rate: Ewma,
    churn_cents: Ewma,
    samples: u64,
    notional_usd: f64,
    paused_until: Option<DateTime<Utc>>,
}

pub struct AdaptiveEvEngine {
    config: AdaptiveEvConfig,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveEvEngine {
    pub fn new(config: AdaptiveEvConfig) -> Self {
        let state = AdaptiveState {
            win_cents: Ewma::new(config.win_alpha),
            loss_cents: Ewma::new(config.loss_alpha),
            win_rate: Ewma::new(config.win_rate_alpha),
            churn_cents: Ewma::new(config.churn_alpha),
            samples: 0,
            notional_usd: 0.0,
            paused_until: None,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn record_trade(&self, pnl_cents: f64, size_usd: f64, churn_cents_observed: f64) {
        let mut state = self.state.lock();
        if pnl_cents > 0.0 {
            state.win_cents.update(pnl_cents);
            state.win_rate.update(1.0);
        } else {
            state.loss_cents.update(pnl_cents.abs());
            state.win_rate.update(0.0);
        }
        if churn_cents_observed.is_finite() && churn_cents_observed >= 0.0 {
            state.churn_cents.update(churn_cents_observed);
        }
        state.samples += 1;
        state.notional_usd += size_usd.max(0.0);

        if Self::is_ready(&state, &self.config) {
            let (ev, _, _) = Self::estimate(&state, &self.config);
            if ev <= 0.0 {
                let until = Utc::now() + Duration::seconds(self.config.pause_seconds);
                state.paused_until = Some(until);
                warn!(
                    ev_cents = %format!("{:.2}", ev),
                    samples = %state.samples,
                    paused_until = %until,
                    "adaptive EV negative, pausing entries"
                );
            }
        }
    }

    /// Whether the adaptive estimates have earned the right to drive sizing.
    fn is_ready(state: &AdaptiveState, cfg: &AdaptiveEvConfig) -> bool {
        if state.samples < cfg.min_samples || state.notional_usd < cfg.min_notional_usd {
            return false;
        }
        let p = state.win_rate.value().clamp(0.0, 1.0);
        let est_wins = state.samples as f64 * p;
        let est_losses = state.samples as f64 * (1.0 - p);
        if est_wins < cfg.min_outcome_count || est_losses < cfg.min_outcome_count {
            return false;
        }
        state.win_cents.is_stable(cfg.stability_threshold)
            && state.loss_cents.is_stable(cfg.stability_threshold)
    }

    /// (ev_cents, profit_factor, confidence) from whichever inputs apply.
    fn estimate(state: &AdaptiveState, cfg: &AdaptiveEvConfig) -> (f64, f64, f64) {
        let adaptive = Self::is_ready(state, cfg);
        let (p, w, l, churn) = if adaptive {
            (
                state.win_rate.value().clamp(0.0, 1.0),
                state.win_cents.value(),
                state.loss_cents.value(),
                state.churn_cents.value().max(0.0),
            )
        } else {
            (
                state.win_rate.value().clamp(0.0, 1.0),
                DEFAULT_AVG_WIN_CENTS,
                DEFAULT_AVG_LOSS_CENTS,
                cfg.fallback_churn_cents,
            )
        };

        let ev = p * w - (1.0 - p) * l - churn;
        let expected_loss = (1.0 - p) * l;
        let profit_factor = if expected_loss > 0.0 {
            (p * w) / expected_loss
        } else {
            f64::INFINITY
        };

        let sample_conf = (state.samples as f64 / (cfg.min_samples as f64 * 2.0)).min(1.0);
        let stability_conf = if state.win_cents.is_stable(cfg.stability_threshold)
            && state.loss_cents.is_stable(cfg.stability_threshold)
        {
            1.0
        } else {
            0.6
        };
        (ev, profit_factor, sample_conf * stability_conf)
    }

    pub fn evaluate_entry(&self) -> EntryDecisionResult {
        let state = self.state.lock();

        if let Some(until) = state.paused_until {
            if Utc::now() < until {
                return EntryDecisionResult {
                    size_factor: 0.0,
                    ev_cents: 0.0,
                    profit_factor: 0.0,
                    confidence: 0.0,
                    adaptive: true,
                    reason: format!("adaptive EV pause until {}", until),
                };
            }
        }

        // No history at all: trust the priors at full size.
        if state.samples == 0 {
            return EntryDecisionResult {
                size_factor: 1.0,
                ev_cents: 0.5 * DEFAULT_AVG_WIN_CENTS
                    - 0.5 * DEFAULT_AVG_LOSS_CENTS
                    - self.config.fallback_churn_cents,
                profit_factor: DEFAULT_AVG_WIN_CENTS / DEFAULT_AVG_LOSS_CENTS,
                confidence: 0.0,
                adaptive: false,
                reason: "no sample, static priors".to_string(),
            };
        }

        let adaptive = Self::is_ready(&state, &self.config);
        let (ev, profit_factor, confidence) = Self::estimate(&state, &self.config);

        let (size_factor, reason) = if adaptive && ev <= 0.0 {
            (0.0, format!("adaptive EV {:.2}¢ non-positive", ev))
        } else if adaptive && ev < self.config.full_ev_threshold_cents {
            (
                self.config.reduced_factor,
                format!(
                    "adaptive EV {:.2}¢ below full threshold {:.2}¢",
                    ev, self.config.full_ev_threshold_cents
                ),
            )
        } else if adaptive && profit_factor < self.config.min_profit_factor {
            (
                self.config.reduced_factor,
                format!("profit factor {:.2} thin", profit_factor),
            )
        } else if confidence < self.config.min_confidence {
            (
                self.config.reduced_factor,
                format!("confidence {:.2} low", confidence),
            )
        } else {
            (1.0, "full size".to_string())
        };

        debug!(
            size_factor = %size_factor,
            ev_cents = %format!("{:.2}", ev),
            adaptive = %adaptive,
            confidence = %format!("{:.2}", confidence),
            "adaptive entry evaluation"
        );

        EntryDecisionResult {
            size_factor,
            ev_cents: ev,
            profit_factor,
            confidence,
            adaptive,
            reason,
        }
    }
}

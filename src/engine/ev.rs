//! Rolling expected-value tracker
//!
//! A fixed window of closed trades and the derived edge statistics. Acts as
//! the circuit breaker: when the rolling EV or profit factor degrades past
//! the configured floor, new entries pause for a while; exits always run.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::models::ExitReason;

/// Static priors used until the window warms up: 14¢ average win, 9¢
/// average loss, 2¢ churn puts break-even near 47.8% win rate.
pub const DEFAULT_AVG_WIN_CENTS: f64 = 14.0;
pub const DEFAULT_AVG_LOSS_CENTS: f64 = 9.0;

const WARMUP_TRADES: usize = 10;

/// One closed trade.
#[derive(Debug, Clone, Serialize)]
pub struct TradeResult {
    pub token_id: String,
    pub pnl_cents: f64,
    pub pnl_usd: f64,
    pub entry_price_cents: f64,
    pub exit_price_cents: f64,
    pub size_usd: f64,
    pub reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_win_cents: f64,
    pub avg_loss_cents: f64,
    pub ev_cents: f64,
    /// Gross win over gross loss; infinite while the window has no losses.
    pub profit_factor: f64,
    pub total_pnl_usd: f64,
}

#[derive(Debug, Clone)]
pub struct TradingAllowance {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl TradingAllowance {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug)]
struct EvState {
    window: VecDeque<TradeResult>,
    paused_until: Option<DateTime<Utc>>,
}

pub struct EvTracker {
    state: Mutex<EvState>,
    window_size: usize,
    churn_cents: f64,
    min_ev_cents: f64,
    min_profit_factor: f64,
    pause_seconds: i64,
}

impl EvTracker {
    pub fn new(
        window_size: usize,
        churn_cents: f64,
        min_ev_cents: f64,
        min_profit_factor: f64,
        pause_seconds: i64,
    ) -> Self {
        Self {
            state: Mutex::new(EvState {
                window: VecDeque::with_capacity(window_size),
                paused_until: None,
            }),
            window_size: window_size.max(1),
            churn_cents,
            min_ev_cents,
            min_profit_factor,
            pause_seconds,
        }
    }

    pub fn record_trade(&self, result: TradeResult) {
        let mut state = self.state.lock();
        if state.window.len() >= self.window_size {
            state.window.pop_front();
        }
        state.window.push_back(result);

        let metrics = Self::compute(&state.window, self.churn_cents);
        if state.window.len() >= WARMUP_TRADES
            && (metrics.ev_cents < self.min_ev_cents
                || metrics.profit_factor < self.min_profit_factor)
        {
            let until = Utc::now() + Duration::seconds(self.pause_seconds);
            state.paused_until = Some(until);
            warn!(
                ev_cents = %format!("{:.2}", metrics.ev_cents),
                profit_factor = %format!("{:.2}", metrics.profit_factor),
                win_rate = %format!("{:.3}", metrics.win_rate),
                paused_until = %until,
                "EV degraded, pausing entries"
            );
        }
    }

    pub fn metrics(&self) -> EvMetrics {
        let state = self.state.lock();
        Self::compute(&state.window, self.churn_cents)
    }

    /// Minimum win rate at which the current averages still break even.
    pub fn break_even_win_rate(&self) -> f64 {
        let m = self.metrics();
        let (w, l) = if m.total_trades >= WARMUP_TRADES {
            (m.avg_win_cents, m.avg_loss_cents)
        } else {
            (DEFAULT_AVG_WIN_CENTS, DEFAULT_AVG_LOSS_CENTS)
        };
        (l + self.churn_cents) / (w + l)
    }

    pub fn is_trading_allowed(&self) -> TradingAllowance {
        let state = self.state.lock();

        if let Some(until) = state.paused_until {
            if Utc::now() < until {
                return TradingAllowance::blocked(format!("EV pause until {}", until));
            }
        }

        if state.window.len() < WARMUP_TRADES {
            return TradingAllowance::allowed();
        }

        let metrics = Self::compute(&state.window, self.churn_cents);
        if metrics.ev_cents < self.min_ev_cents {
            return TradingAllowance::blocked(format!(
                "EV {:.2}¢ below floor {:.2}¢",
                metrics.ev_cents, self.min_ev_cents
            ));
        }
        if metrics.profit_factor < self.min_profit_factor {
            return TradingAllowance::blocked(format!(
                "profit factor {:.2} below floor {:.2}",
                metrics.profit_factor, self.min_profit_factor
            ));
        }

        TradingAllowance::allowed()
    }

    fn compute(window: &VecDeque<TradeResult>, churn_cents: f64) -> EvMetrics {
        let total = window.len();
        if total == 0 {
            return EvMetrics {
                total_trades: 0,
                wins: 0,
                losses: 0,
                win_rate: 0.0,
                avg_win_cents: DEFAULT_AVG_WIN_CENTS,
                avg_loss_cents: DEFAULT_AVG_LOSS_CENTS,
                ev_cents: 0.0,
                profit_factor: 1.0,
                total_pnl_usd: 0.0,
            };
        }

        let wins: Vec<f64> = window
            .iter()
            .filter(|t| t.pnl_cents > 0.0)
            .map(|t| t.pnl_cents)
            .collect();
        let losses: Vec<f64> = window
            .iter()
            .filter(|t| t.pnl_cents <= 0.0)
            .map(|t| t.pnl_cents.abs())
            .collect();

        let win_rate = wins.len() as f64 / total as f64;
        let avg_win = if wins.is_empty() {
            DEFAULT_AVG_WIN_CENTS
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            DEFAULT_AVG_LOSS_CENTS
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };

        let gross_win: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_win / gross_loss
        } else {
            f64::INFINITY
        };

        EvMetrics {
            total_trades: total,
            wins: wins.len(),
            losses: losses.len(),
            win_rate,
            avg_win_cents: avg_win,
            avg_loss_cents: avg_loss,
            ev_cents: win_rate * avg_win - (1.0 - win_rate) * avg_loss - churn_cents,
            profit_factor,
            total_pnl_usd: window.iter().map(|t| t.pnl_usd).sum(),
        }
    }

    pub fn log_status(&self) {
        let m = self.metrics();
        info!(
            trades = %m.total_trades,
            win_rate = %format!("{:.3}", m.win_rate),
            ev_cents = %format!("{:.2}", m.ev_cents),
            profit_factor = %format!("{:.2}", m.profit_factor),
            total_pnl_usd = %format!("{:.2}", m.total_pnl_usd),
            "EV status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> EvTracker {
        EvTracker::new(50, 2.0, 0.5, 1.1, 300)
    }

    fn trade(pnl_cents: f64) -> TradeResult {
        TradeResult {
            token_id: "tok".to_string(),
            pnl_cents,
            pnl_usd: pnl_cents / 100.0 * 25.0 / 0.5,
            entry_price_cents: 50.0,
            exit_price_cents: 50.0 + pnl_cents,
            size_usd: 25.0,
            reason: if pnl_cents > 0.0 {
                ExitReason::TakeProfit
            } else {
                ExitReason::HardExit
            },
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn warmup_is_always_allowed() {
        let t = tracker();
        for _ in 0..9 {
            t.record_trade(trade(-9.0));
        }
        assert!(t.is_trading_allowed().allowed);
    }

    #[test]
    fn negative_ev_blocks_after_warmup() {
        let t = tracker();
        for _ in 0..10 {
            t.record_trade(trade(-9.0));
        }
        let allowance = t.is_trading_allowed();
        assert!(!allowance.allowed);
        assert!(allowance.reason.is_some());
    }

    #[test]
    fn all_wins_has_infinite_profit_factor() {
        let t = tracker();
        for _ in 0..12 {
            t.record_trade(trade(14.0));
        }
        let m = t.metrics();
        assert!(m.profit_factor.is_infinite());
        assert!(t.is_trading_allowed().allowed);
    }

    #[test]
    fn ev_formula_matches_hand_calc() {
        let t = tracker();
        // 6 wins of 14¢, 4 losses of 9¢: p=0.6, ev = 0.6*14 - 0.4*9 - 2 = 2.8
        for _ in 0..6 {
            t.record_trade(trade(14.0));
        }
        for _ in 0..4 {
            t.record_trade(trade(-9.0));
        }
        let m = t.metrics();
        assert!((m.win_rate - 0.6).abs() < 1e-9);
        assert!((m.ev_cents - 2.8).abs() < 1e-9);
    }

    #[test]
    fn default_break_even_is_about_478() {
        let t = tracker();
        let be = t.break_even_win_rate();
        assert!((be - (9.0 + 2.0) / (14.0 + 9.0)).abs() < 1e-9);
        assert!(be > 0.47 && be < 0.49);
    }

    #[test]
    fn window_is_bounded() {
        let t = EvTracker::new(5, 2.0, 0.5, 1.1, 300);
        for i in 0..20 {
            t.record_trade(trade(if i % 2 == 0 { 14.0 } else { -9.0 }));
        }
        assert_eq!(t.metrics().total_trades, 5);
    }
}

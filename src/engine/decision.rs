//! Entry/exit decision engine
//!
//! Stateless evaluators: the same inputs always produce the same decision.
//! All portfolio and market state arrives in the parameter structs; nothing
//! here holds or mutates anything.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::models::{BiasDirection, ExitReason, OrderBookSnapshot, Side, Urgency};

use super::position::ManagedPosition;

/// Reference-vs-mid distance below which an entry counts as "new" and the
/// deviation check is skipped: the bias signal is the edge, not the move.
const NEW_ENTRY_EPSILON_CENTS: f64 = 0.01;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryDecision {
    pub allowed: bool,
    pub side: Option<Side>,
    pub price_cents: Option<f64>,
    pub size_usd: Option<f64>,
    pub reason: Option<String>,
    pub checks: Vec<CheckResult>,
}

impl EntryDecision {
    fn rejected(reason: impl Into<String>, checks: Vec<CheckResult>) -> Self {
        Self {
            allowed: false,
            side: None,
            price_cents: None,
            size_usd: None,
            reason: Some(reason.into()),
            checks,
        }
    }
}

/// Everything an entry evaluation needs to know.
#[derive(Debug, Clone)]
pub struct EntryParams<'a> {
    pub token_id: &'a str,
    pub bias: BiasDirection,
    pub snapshot: &'a OrderBookSnapshot,
    pub trades_last_window: u32,
    pub updates_last_window: u32,
    /// Reference price for the deviation check; equals the mid for a new
    /// entry.
    pub reference_price_cents: f64,
    pub open_positions_total: usize,
    pub open_positions_on_token: usize,
    pub total_deployed_usd: f64,
    pub effective_bankroll_usd: f64,
    pub ev_allowed: bool,
    pub ev_reason: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitDecision {
    pub should_exit: bool,
    pub reason: Option<ExitReason>,
    pub urgency: Urgency,
}

impl ExitDecision {
    fn hold() -> Self {
        Self {
            should_exit: false,
            reason: None,
            urgency: Urgency::Low,
        }
    }

    fn exit(reason: ExitReason, urgency: Urgency) -> Self {
        Self {
            should_exit: true,
            reason: Some(reason),
            urgency,
        }
    }
}

pub struct DecisionEngine {
    config: Config,
}

impl DecisionEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Ordered entry gates; all must pass. The returned checks list carries
    /// one entry per gate evaluated, for the decision log.
    pub fn evaluate_entry(&self, params: &EntryParams<'_>) -> EntryDecision {
        let cfg = &self.config;
        let mut checks = Vec::new();
        let snap = params.snapshot;

        // Bias: the venue is long-only on outcome tokens; a SHORT bias is
        // expressed by going long the sibling, never by entering short here.
        match params.bias {
            BiasDirection::Long => {
                checks.push(CheckResult {
                    name: "bias",
                    passed: true,
                    detail: "LONG".to_string(),
                });
            }
            BiasDirection::Short => {
                checks.push(CheckResult {
                    name: "bias",
                    passed: false,
                    detail: "SHORT rejected: long-only exchange, take the sibling instead"
                        .to_string(),
                });
                return EntryDecision::rejected(
                    "SHORT rejected: long-only exchange, take the sibling instead",
                    checks,
                );
            }
            BiasDirection::None => {
                checks.push(CheckResult {
                    name: "bias",
                    passed: false,
                    detail: "no bias".to_string(),
                });
                return EntryDecision::rejected("no bias", checks);
            }
        }

        let (bid, ask, spread) = match (
            snap.best_bid_cents(),
            snap.best_ask_cents(),
            snap.spread_cents(),
        ) {
            (Some(b), Some(a), Some(s)) => (b, a, s),
            _ => {
                checks.push(CheckResult {
                    name: "liquidity",
                    passed: false,
                    detail: "book has an empty side".to_string(),
                });
                return EntryDecision::rejected("book has an empty side", checks);
            }
        };

        // Liquidity: tight spread, real depth, and a market that moves.
        let depth = snap.bid_depth_usd().min(snap.ask_depth_usd());
        let active = params.trades_last_window >= cfg.min_trades_last_x
            || params.updates_last_window >= cfg.min_book_updates_last_x;
        if spread > cfg.min_spread_cents {
            checks.push(CheckResult {
                name: "liquidity",
                passed: false,
                detail: format!("spread {:.1}¢ > {:.1}¢", spread, cfg.min_spread_cents),
            });
            return EntryDecision::rejected(
                format!("spread {:.1}¢ too wide", spread),
                checks,
            );
        }
        if depth < cfg.min_depth_usd_at_exit {
            checks.push(CheckResult {
                name: "liquidity",
                passed: false,
                detail: format!("depth ${:.0} < ${:.0}", depth, cfg.min_depth_usd_at_exit),
            });
            return EntryDecision::rejected(format!("depth ${:.0} too thin", depth), checks);
        }
        if !active {
            checks.push(CheckResult {
                name: "liquidity",
                passed: false,
                detail: format!(
                    "inactive: {} trades / {} updates",
                    params.trades_last_window, params.updates_last_window
                ),
            });
            return EntryDecision::rejected("market inactive", checks);
        }
        checks.push(CheckResult {
            name: "liquidity",
            passed: true,
            detail: format!("spread {:.1}¢ depth ${:.0}", spread, depth),
        });

        // Price deviation: skipped for a brand-new entry whose reference is
        // the current mid; otherwise the move itself must clear the band.
        let mid = (bid + ask) / 2.0;
        let deviation = (mid - params.reference_price_cents).abs();
        if deviation <= NEW_ENTRY_EPSILON_CENTS {
            checks.push(CheckResult {
                name: "deviation",
                passed: true,
                detail: "new entry, check skipped".to_string(),
            });
        } else if deviation < cfg.entry_band_cents {
            checks.push(CheckResult {
                name: "deviation",
                passed: false,
                detail: format!("move {:.2}¢ < band {:.2}¢", deviation, cfg.entry_band_cents),
            });
            return EntryDecision::rejected(
                format!("move {:.2}¢ inside entry band", deviation),
                checks,
            );
        } else {
            checks.push(CheckResult {
                name: "deviation",
                passed: true,
                detail: format!("move {:.2}¢", deviation),
            });
        }

        // Price bounds on the ask we would lift.
        if ask < cfg.min_entry_cents || ask > cfg.max_entry_cents {
            checks.push(CheckResult {
                name: "bounds",
                passed: false,
                detail: format!(
                    "ask {:.1}¢ outside [{:.0}, {:.0}]",
                    ask, cfg.min_entry_cents, cfg.max_entry_cents
                ),
            });
            return EntryDecision::rejected(format!("ask {:.1}¢ out of bounds", ask), checks);
        }
        let buffered_low = cfg.min_entry_cents + cfg.entry_buffer_cents;
        let buffered_high = cfg.max_entry_cents - cfg.entry_buffer_cents;
        if ask < buffered_low || ask > buffered_high {
            debug!(
                token_id = %crate::notify::token_prefix(params.token_id),
                ask_cents = %format!("{:.1}", ask),
                "entry at band edge"
            );
            checks.push(CheckResult {
                name: "bounds",
                passed: true,
                detail: format!("ask {:.1}¢ at band edge", ask),
            });
        } else {
            checks.push(CheckResult {
                name: "bounds",
                passed: true,
                detail: format!("ask {:.1}¢", ask),
            });
        }

        // Risk limits.
        if params.effective_bankroll_usd <= 0.0 {
            checks.push(CheckResult {
                name: "risk",
                passed: false,
                detail: "no effective bankroll".to_string(),
            });
            return EntryDecision::rejected("no effective bankroll", checks);
        }
        if params.open_positions_total >= cfg.max_open_positions_total {
            checks.push(CheckResult {
                name: "risk",
                passed: false,
                detail: format!("{} positions open", params.open_positions_total),
            });
            return EntryDecision::rejected("position cap reached", checks);
        }
        if params.open_positions_on_token >= cfg.max_open_positions_per_market {
            checks.push(CheckResult {
                name: "risk",
                passed: false,
                detail: "token already held".to_string(),
            });
            return EntryDecision::rejected("token already held", checks);
        }

        let size_usd = (params.effective_bankroll_usd * cfg.trade_fraction).min(cfg.max_trade_usd);
        let deploy_cap = params.effective_bankroll_usd * cfg.max_deployed_fraction_total;
        if params.total_deployed_usd + size_usd > deploy_cap {
            checks.push(CheckResult {
                name: "risk",
                passed: false,
                detail: format!(
                    "deployed ${:.0} + ${:.0} > cap ${:.0}",
                    params.total_deployed_usd, size_usd, deploy_cap
                ),
            });
            return EntryDecision::rejected("deployment cap reached", checks);
        }
        checks.push(CheckResult {
            name: "risk",
            passed: true,
            detail: format!("size ${:.2}", size_usd),
        });

        // EV circuit breaker.
        if !params.ev_allowed {
            let detail = params.ev_reason.unwrap_or("EV blocked").to_string();
            checks.push(CheckResult {
                name: "ev",
                passed: false,
                detail: detail.clone(),
            });
            return EntryDecision::rejected(detail, checks);
        }
        checks.push(CheckResult {
            name: "ev",
            passed: true,
            detail: "allowed".to_string(),
        });

        EntryDecision {
            allowed: true,
            side: Some(Side::Long),
            price_cents: Some(ask),
            size_usd: Some(size_usd),
            reason: None,
            checks,
        }
    }

    /// Ordered exit checks. First match wins.
    pub fn evaluate_exit(
        &self,
        position: &ManagedPosition,
        mid_price_cents: f64,
        bias: BiasDirection,
        ev_allowed: bool,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        let cfg = &self.config;
        let pnl = match position.side {
            Side::Long => mid_price_cents - position.entry_price_cents,
            Side::Short => position.entry_price_cents - mid_price_cents,
        };

        if pnl >= cfg.tp_cents {
            return ExitDecision::exit(ExitReason::TakeProfit, Urgency::Medium);
        }
        if pnl <= -cfg.max_adverse_cents {
            return ExitDecision::exit(ExitReason::HardExit, Urgency::Critical);
        }
        if position.age_seconds(now) >= cfg.max_hold_seconds {
            let urgency = if pnl > 0.0 { Urgency::Low } else { Urgency::Medium };
            return ExitDecision::exit(ExitReason::TimeStop, urgency);
        }

        let bias_matches = match (position.side, bias) {
            (Side::Long, BiasDirection::Long) => true,
            (Side::Short, BiasDirection::Short) => true,
            (_, BiasDirection::None) => true,
            _ => false,
        };
        if !bias_matches && pnl > -cfg.hedge_trigger_cents {
            return ExitDecision::exit(ExitReason::BiasFlip, Urgency::Low);
        }

        if !ev_allowed && pnl > 0.0 {
            return ExitDecision::exit(ExitReason::EvDegraded, Urgency::Low);
        }

        ExitDecision::hold()
    }

    /// Whether the position's loss warrants a hedge at all; the adaptive
    /// policy decides the ratio.
    pub fn needs_hedge(&self, position: &ManagedPosition) -> bool {
        position.pnl_cents <= -self.config.hedge_trigger_cents
            && position.total_hedge_ratio < self.config.max_hedge_ratio
            && position.opposite_token_id.is_some()
    }

    /// Hedge notional for a given ratio.
    pub fn calculate_hedge_size(&self, position: &ManagedPosition, ratio: f64) -> f64 {
        let headroom = (self.config.max_hedge_ratio - position.total_hedge_ratio).max(0.0);
        position.entry_size_usd * ratio.min(headroom).max(0.0)
    }

    /// Whether a price sits in the sweet spot between the configured
    /// preferred bounds.
    pub fn is_in_preferred_zone(&self, price_cents: f64) -> bool {
        price_cents >= self.config.preferred_entry_low_cents
            && price_cents <= self.config.preferred_entry_high_cents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookSource, Order};
    use uuid::Uuid;

    fn snapshot(bid: f64, ask: f64, depth_usd: f64) -> OrderBookSnapshot {
        let bid_size = depth_usd / bid;
        let ask_size = depth_usd / ask;
        OrderBookSnapshot {
            source: BookSource::Rest,
            token_id: "tok".to_string(),
            bids: vec![Order { price: bid, size: bid_size }],
            asks: vec![Order { price: ask, size: ask_size }],
            http_status: Some(200),
            latency_ms: 20,
            parsed_ok: true,
            fetch_failed: false,
            fetched_at: Utc::now(),
            attempt_id: Uuid::new_v4(),
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(Config::default())
    }

    fn params<'a>(snapshot: &'a OrderBookSnapshot, bias: BiasDirection) -> EntryParams<'a> {
        EntryParams {
            token_id: "tok",
            bias,
            snapshot,
            trades_last_window: 5,
            updates_last_window: 10,
            reference_price_cents: snapshot.mid_cents().unwrap_or(50.0),
            open_positions_total: 0,
            open_positions_on_token: 0,
            total_deployed_usd: 0.0,
            effective_bankroll_usd: 500.0,
            ev_allowed: true,
            ev_reason: None,
        }
    }

    fn position(entry_cents: f64) -> ManagedPosition {
        ManagedPosition {
            id: Uuid::new_v4(),
            token_id: "tok".to_string(),
            opposite_token_id: Some("sib".to_string()),
            side: Side::Long,
            entry_price_cents: entry_cents,
            entry_size_usd: 25.0,
            entry_time: Utc::now(),
            entry_bias: BiasDirection::Long,
            current_price_cents: entry_cents,
            pnl_cents: 0.0,
            pnl_usd: 0.0,
            take_profit_price_cents: entry_cents + 14.0,
            hedge_trigger_price_cents: entry_cents - 10.0,
            hard_exit_price_cents: entry_cents - 30.0,
            hedges: Vec::new(),
            total_hedge_ratio: 0.0,
            is_external: false,
            state: super::super::position::PositionState::Open,
            transitions: Vec::new(),
            last_hedge_at: None,
            max_adverse_cents_seen: 0.0,
        }
    }

    #[test]
    fn healthy_entry_path() {
        // Bias LONG, 48/52 book, $200 depth, $500 bankroll.
        let snap = snapshot(0.48, 0.52, 200.0);
        let decision = engine().evaluate_entry(&params(&snap, BiasDirection::Long));
        assert!(decision.allowed, "reason: {:?}", decision.reason);
        assert_eq!(decision.side, Some(Side::Long));
        assert_eq!(decision.price_cents, Some(52.0));
        // min(500 * 0.05, 25) = 25.
        assert_eq!(decision.size_usd, Some(25.0));
    }

    #[test]
    fn short_bias_is_rejected_with_explanation() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let decision = engine().evaluate_entry(&params(&snap, BiasDirection::Short));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("long-only"));
    }

    #[test]
    fn no_bias_is_rejected() {
        let snap = snapshot(0.48, 0.52, 200.0);
        assert!(!engine().evaluate_entry(&params(&snap, BiasDirection::None)).allowed);
    }

    #[test]
    fn wide_spread_rejects() {
        let snap = snapshot(0.40, 0.50, 200.0);
        let decision = engine().evaluate_entry(&params(&snap, BiasDirection::Long));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("spread"));
    }

    #[test]
    fn thin_depth_rejects() {
        let snap = snapshot(0.48, 0.52, 10.0);
        assert!(!engine().evaluate_entry(&params(&snap, BiasDirection::Long)).allowed);
    }

    #[test]
    fn inactive_market_rejects() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let mut p = params(&snap, BiasDirection::Long);
        p.trades_last_window = 0;
        p.updates_last_window = 0;
        assert!(!engine().evaluate_entry(&p).allowed);
    }

    #[test]
    fn deviation_check_skipped_for_new_entry() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let mut p = params(&snap, BiasDirection::Long);
        p.reference_price_cents = snap.mid_cents().unwrap();
        let decision = engine().evaluate_entry(&p);
        assert!(decision.allowed);
        assert!(decision
            .checks
            .iter()
            .any(|c| c.name == "deviation" && c.detail.contains("skipped")));
    }

    #[test]
    fn small_move_from_reference_rejects() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let mut p = params(&snap, BiasDirection::Long);
        // Mid is 50; reference 49 = a 1¢ move, inside the 2¢ band.
        p.reference_price_cents = 49.0;
        assert!(!engine().evaluate_entry(&p).allowed);

        // A 3¢ move clears the band.
        p.reference_price_cents = 47.0;
        assert!(engine().evaluate_entry(&p).allowed);
    }

    #[test]
    fn ask_out_of_bounds_rejects() {
        let snap = snapshot(0.84, 0.88, 300.0);
        let decision = engine().evaluate_entry(&params(&snap, BiasDirection::Long));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("out of bounds"));
    }

    #[test]
    fn position_caps_reject() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let mut p = params(&snap, BiasDirection::Long);
        p.open_positions_total = 5;
        assert!(!engine().evaluate_entry(&p).allowed);

        let mut p = params(&snap, BiasDirection::Long);
        p.open_positions_on_token = 1;
        assert!(!engine().evaluate_entry(&p).allowed);
    }

    #[test]
    fn deployment_cap_rejects() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let mut p = params(&snap, BiasDirection::Long);
        // Cap = 500 * 0.5 = 250; deployed 240 + size 25 breaches.
        p.total_deployed_usd = 240.0;
        assert!(!engine().evaluate_entry(&p).allowed);
    }

    #[test]
    fn ev_block_rejects() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let mut p = params(&snap, BiasDirection::Long);
        p.ev_allowed = false;
        p.ev_reason = Some("EV pause");
        let decision = engine().evaluate_entry(&p);
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("EV pause"));
    }

    #[test]
    fn entry_evaluation_is_idempotent() {
        let snap = snapshot(0.48, 0.52, 200.0);
        let p = params(&snap, BiasDirection::Long);
        let a = engine().evaluate_entry(&p);
        let b = engine().evaluate_entry(&p);
        assert_eq!(a.allowed, b.allowed);
        assert_eq!(a.size_usd, b.size_usd);
        assert_eq!(a.price_cents, b.price_cents);
    }

    #[test]
    fn exit_order_tp_first() {
        let e = engine();
        let pos = position(60.0);
        let now = Utc::now();

        let d = e.evaluate_exit(&pos, 74.0, BiasDirection::Long, true, now);
        assert_eq!(d.reason, Some(ExitReason::TakeProfit));
        assert_eq!(d.urgency, Urgency::Medium);

        let d = e.evaluate_exit(&pos, 29.0, BiasDirection::Long, true, now);
        assert_eq!(d.reason, Some(ExitReason::HardExit));
        assert_eq!(d.urgency, Urgency::Critical);
    }

    #[test]
    fn time_stop_urgency_depends_on_pnl() {
        let e = engine();
        let mut pos = position(60.0);
        pos.entry_time = Utc::now() - chrono::Duration::seconds(1_000);

        let d = e.evaluate_exit(&pos, 62.0, BiasDirection::Long, true, Utc::now());
        assert_eq!(d.reason, Some(ExitReason::TimeStop));
        assert_eq!(d.urgency, Urgency::Low);

        let d = e.evaluate_exit(&pos, 58.0, BiasDirection::Long, true, Utc::now());
        assert_eq!(d.reason, Some(ExitReason::TimeStop));
        assert_eq!(d.urgency, Urgency::Medium);
    }

    #[test]
    fn bias_flip_only_on_small_loss() {
        let e = engine();
        let pos = position(60.0);
        let now = Utc::now();

        // Small loss, bias flipped: exit.
        let d = e.evaluate_exit(&pos, 55.0, BiasDirection::Short, true, now);
        assert_eq!(d.reason, Some(ExitReason::BiasFlip));
        assert_eq!(d.urgency, Urgency::Low);

        // Loss past the hedge trigger: hold and let the hedge path act.
        let d = e.evaluate_exit(&pos, 48.0, BiasDirection::Short, true, now);
        assert!(!d.should_exit);
    }

    #[test]
    fn ev_degraded_exits_only_profitable() {
        let e = engine();
        let pos = position(60.0);
        let now = Utc::now();

        let d = e.evaluate_exit(&pos, 65.0, BiasDirection::Long, false, now);
        assert_eq!(d.reason, Some(ExitReason::EvDegraded));

        let d = e.evaluate_exit(&pos, 57.0, BiasDirection::Long, false, now);
        assert!(!d.should_exit);
    }

    #[test]
    fn hedge_helpers() {
        let e = engine();
        let mut pos = position(60.0);
        pos.pnl_cents = -12.0;
        assert!(e.needs_hedge(&pos));
        assert!((e.calculate_hedge_size(&pos, 0.4) - 10.0).abs() < 1e-9);

        pos.total_hedge_ratio = 0.75;
        assert!(!e.needs_hedge(&pos));
        assert_eq!(e.calculate_hedge_size(&pos, 0.4), 0.0);

        pos.total_hedge_ratio = 0.0;
        pos.opposite_token_id = None;
        assert!(!e.needs_hedge(&pos));
    }

    #[test]
    fn preferred_zone() {
        let e = engine();
        assert!(e.is_in_preferred_zone(50.0));
        assert!(!e.is_in_preferred_zone(30.0));
        assert!(!e.is_in_preferred_zone(70.0));
    }
}

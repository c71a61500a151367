//! Execution engine
//!
//! Turns decisions into orders. Entries go FOK-first with a slippage-padded
//! limit and fall back to a tighter resting GTC; exits pick their slippage
//! band from the exit reason and unwind every hedge leg after the primary
//! fill. All sizing is worst-case: shares are computed at the padded price
//! so the notional can never overshoot the budget.

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::BalanceCache;
use crate::clob::{ClobClient, MarketMetadata, MarketOrderArgs};
use crate::config::Config;
use crate::latency::LatencyMonitor;
use crate::models::{
    BiasDirection, ExitReason, OrderBookSnapshot, OrderSide, OrderType, Side, Urgency,
};
use crate::notify::token_prefix;
use crate::pricing::{clamp_hard_bounds, round_to_tick};

use super::adaptive_ev::AdaptiveEvEngine;
use super::adaptive_hedge::AdaptiveHedgePolicy;
use super::cooldown::CooldownManager;
use super::decision::{DecisionEngine, EntryParams};
use super::ev::{EvTracker, TradeResult};
use super::position::{HedgeLeg, PositionAction, PositionManager};
use super::reserve::ReserveManager;
use super::risk_guard::{PortfolioSnapshot, RiskGuard};

const PRICE_TICK: f64 = 0.001;
const MIN_ENTRY_USD: f64 = 1.0;
const MIN_HEDGE_SHARES: f64 = 0.000_1;
const MIN_HEDGE_MID: f64 = 0.001;
const MIN_SIBLING_ASK_DEPTH_USD: f64 = 5.0;

const SLIPPAGE_TAKE_PROFIT: f64 = 0.04;
const SLIPPAGE_NORMAL: f64 = 0.08;
const SLIPPAGE_URGENT: f64 = 0.15;
const SLIPPAGE_FORCE: f64 = 0.25;

/// How an entry attempt reached the engine; decides the effective bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryFlow {
    /// Accumulated whale bias.
    Bias(BiasDirection),
    /// High-volume market scan; scanner entries are always long.
    Scanner,
    /// Copy-any-whale-buy mode with this many non-stale buys.
    CopyBuy { non_stale_buys: u32 },
}

impl EntryFlow {
    fn effective_bias(&self) -> BiasDirection {
        match self {
            EntryFlow::Scanner => BiasDirection::Long,
            EntryFlow::CopyBuy { non_stale_buys } if *non_stale_buys >= 1 => BiasDirection::Long,
            EntryFlow::CopyBuy { .. } => BiasDirection::None,
            EntryFlow::Bias(b) => *b,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            EntryFlow::Bias(_) => "bias",
            EntryFlow::Scanner => "scanner",
            EntryFlow::CopyBuy { .. } => "copy_buy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntryResult {
    pub success: bool,
    /// A resting GTC was accepted; the fill will arrive through the
    /// external position sync, nothing is registered locally yet.
    pub pending: bool,
    pub position_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl EntryResult {
    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            pending: false,
            position_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// Per-position market data assembled by the control loop for one cycle.
#[derive(Debug, Clone)]
pub struct PositionTick {
    pub position_id: Uuid,
    pub mid_cents: f64,
    pub best_bid_cents: f64,
    pub bias: BiasDirection,
    /// Proactively fetched sibling book, if the loop had one.
    pub sibling_book: Option<OrderBookSnapshot>,
}

pub struct ExecutionEngine {
    config: Config,
    clob: Arc<dyn ClobClient>,
    metadata: Arc<dyn MarketMetadata>,
    positions: Arc<PositionManager>,
    decision: DecisionEngine,
    ev: Arc<EvTracker>,
    adaptive_ev: Option<Arc<AdaptiveEvEngine>>,
    hedge_policy: Arc<AdaptiveHedgePolicy>,
    reserve: Arc<ReserveManager>,
    risk: Arc<RiskGuard>,
    cooldowns: Arc<CooldownManager>,
    latency: Arc<LatencyMonitor>,
    balances: Arc<BalanceCache>,
    /// Post-entry throttle per token; distinct from failure cooldowns.
    entry_cooldowns: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    /// Tokens with a resting GTC whose fill has not been adopted yet.
    pending_entries: Mutex<HashSet<String>>,
    /// Set when residual fills may exist on chain that the local view has
    /// not absorbed; the loop forces a position re-sync.
    external_dirty: AtomicBool,
}

#[allow(clippy::too_many_arguments)]
impl ExecutionEngine {
    pub fn new(
        config: Config,
        clob: Arc<dyn ClobClient>,
        metadata: Arc<dyn MarketMetadata>,
        positions: Arc<PositionManager>,
        ev: Arc<EvTracker>,
        adaptive_ev: Option<Arc<AdaptiveEvEngine>>,
        hedge_policy: Arc<AdaptiveHedgePolicy>,
        reserve: Arc<ReserveManager>,
        risk: Arc<RiskGuard>,
        cooldowns: Arc<CooldownManager>,
        latency: Arc<LatencyMonitor>,
        balances: Arc<BalanceCache>,
    ) -> Self {
        Self {
            decision: DecisionEngine::new(config.clone()),
            config,
            clob,
            metadata,
            positions,
            ev,
            adaptive_ev,
            hedge_policy,
            reserve,
            risk,
            cooldowns,
            latency,
            balances,
            entry_cooldowns: Mutex::new(HashMap::new()),
            pending_entries: Mutex::new(HashSet::new()),
            external_dirty: AtomicBool::new(false),
        }
    }

    /// Combined EV allowance: static tracker gate and, when enabled, the
    /// adaptive sizing factor.
    fn ev_allowance(&self) -> (bool, Option<String>, f64) {
        let allowance = self.ev.is_trading_allowed();
        if !allowance.allowed {
            return (false, allowance.reason, 0.0);
        }
        if let Some(adaptive) = &self.adaptive_ev {
            let result = adaptive.evaluate_entry();
            if result.size_factor <= 0.0 {
                return (false, Some(result.reason), 0.0);
            }
            return (true, None, result.size_factor);
        }
        (true, None, 1.0)
    }

    /// Clear the pending-entry marker once the external sync adopts (or
    /// disproves) the fill.
    pub fn clear_pending_entry(&self, token_id: &str) {
        self.pending_entries.lock().remove(token_id);
    }

    pub fn has_pending_entry(&self, token_id: &str) -> bool {
        self.pending_entries.lock().contains(token_id)
    }

    pub fn take_external_dirty(&self) -> bool {
        self.external_dirty.swap(false, Ordering::SeqCst)
    }

    fn portfolio_snapshot(&self, wallet_balance_usd: f64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            wallet_balance_usd,
            open_positions: self.positions.open_count(),
            deployed_usd: self.positions.deployed_usd(),
            hedged_positions: self.positions.hedged_count(),
            total_hedge_usd: self.positions.total_hedge_usd(),
        }
    }

    // =========================================================================
    // Entry protocol
    // =========================================================================

    pub async fn attempt_entry(
        &self,
        token_id: &str,
        flow: EntryFlow,
        snapshot: &OrderBookSnapshot,
        trades_last_window: u32,
        updates_last_window: u32,
    ) -> EntryResult {
        if self.cooldowns.is_on_cooldown(token_id) {
            return EntryResult::blocked("COOLDOWN");
        }
        if let Some(until) = self.entry_cooldowns.lock().get(token_id) {
            if *until > Utc::now() {
                return EntryResult::blocked("COOLDOWN");
            }
        }
        if self.has_pending_entry(token_id) {
            return EntryResult::blocked("pending entry on token");
        }

        let balances = self.balances.get_balances().await;
        let bankroll = self.reserve.effective_bankroll(balances.usdc);
        if bankroll <= 0.0 {
            return EntryResult::blocked("NO_BANKROLL");
        }

        let snap_portfolio = self.portfolio_snapshot(balances.usdc);
        if self.risk.is_protective_mode_active(&snap_portfolio) {
            return EntryResult::blocked("protective mode active");
        }

        let bias = flow.effective_bias();
        let (ev_allowed, ev_reason, size_factor) = self.ev_allowance();

        let params = EntryParams {
            token_id,
            bias,
            snapshot,
            trades_last_window,
            updates_last_window,
            reference_price_cents: snapshot.mid_cents().unwrap_or(0.0),
            open_positions_total: self.positions.open_count(),
            open_positions_on_token: self.positions.open_count_on_token(token_id),
            total_deployed_usd: self.positions.deployed_usd(),
            effective_bankroll_usd: bankroll,
            ev_allowed,
            ev_reason: ev_reason.as_deref(),
        };
        let decision = self.decision.evaluate_entry(&params);
        if !decision.allowed {
            return EntryResult::blocked(decision.reason.unwrap_or_else(|| "rejected".to_string()));
        }

        let mut size_usd = decision.size_usd.unwrap_or(0.0) * size_factor;
        let best_ask_cents = decision.price_cents.unwrap_or(0.0);

        // Wallet-minimum and deployment gates; the guard may shrink.
        let gate = self.risk.check_entry(&snap_portfolio, size_usd);
        if !gate.allowed {
            self.reserve.record_missed_entry();
            return EntryResult::blocked(gate.reason.unwrap_or_else(|| "risk gate".to_string()));
        }
        size_usd = gate.size_usd;
        if size_usd < MIN_ENTRY_USD {
            self.reserve.record_missed_entry();
            return EntryResult::blocked("NO_BANKROLL");
        }

        // Live-only safety gate, then the dynamic slippage band.
        if self.config.live_trading_enabled {
            let safety = self.latency.is_trading_safe();
            if !safety.safe {
                return EntryResult::blocked(format!(
                    "NETWORK_UNSAFE: {}",
                    safety.reason.unwrap_or_default()
                ));
            }
        }
        let slippage_pct = self.latency.get_network_health().recommended_slippage_pct;

        let best_ask = best_ask_cents / 100.0;
        let fok_price = match self.order_price(best_ask, slippage_pct, OrderSide::Buy) {
            Ok(p) => p,
            Err(e) => return EntryResult::blocked(format!("INVALID_PRICES: {}", e)),
        };

        info!(
            token_id = %token_prefix(token_id),
            flow = %flow.label(),
            best_ask_cents = %format!("{:.1}", best_ask_cents),
            fok_price = %format!("{:.3}", fok_price),
            size_usd = %format!("{:.2}", size_usd),
            slippage_pct = %format!("{:.3}", slippage_pct),
            "entry order"
        );

        // FOK at the padded price; shares derive from the padded price so a
        // full fill can never exceed the notional budget.
        let fok_result = self
            .post_market(token_id, OrderSide::Buy, size_usd, fok_price, OrderType::Fok)
            .await;

        match fok_result {
            Ok(resp) if resp.is_filled() => {
                let position = match self.positions.open_position(
                    token_id,
                    Side::Long,
                    best_ask_cents,
                    size_usd,
                    bias,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        // Filled on the wire but out of local slots; the
                        // external sync will adopt it.
                        warn!(token_id = %token_prefix(token_id), error = %e, "fill without local slot");
                        self.external_dirty.store(true, Ordering::SeqCst);
                        self.arm_entry_cooldown(token_id);
                        return EntryResult {
                            success: true,
                            pending: true,
                            position_id: None,
                            reason: Some(e.to_string()),
                        };
                    }
                };

                if let Ok(Some(opposite)) = self.metadata.get_opposite_token_id(token_id).await {
                    let _ = self.positions.set_opposite_token(position.id, &opposite);
                }
                self.balances.force_refresh();
                self.arm_entry_cooldown(token_id);

                EntryResult {
                    success: true,
                    pending: false,
                    position_id: Some(position.id),
                    reason: None,
                }
            }
            _ => {
                // Tighter resting limit; half the slippage pad.
                let gtc_price =
                    match self.order_price(best_ask, slippage_pct * 0.5, OrderSide::Buy) {
                        Ok(p) => p,
                        Err(e) => return EntryResult::blocked(format!("INVALID_PRICES: {}", e)),
                    };

                let gtc_result = match self
                    .clob
                    .create_order(crate::clob::LimitOrderArgs {
                        side: OrderSide::Buy,
                        token_id: token_id.to_string(),
                        size: size_usd / gtc_price,
                        price: gtc_price,
                    })
                    .await
                {
                    Ok(order) => self.clob.post_order(&order, OrderType::Gtc).await,
                    Err(e) => Err(e),
                };

                match gtc_result {
                    Ok(resp) if resp.success => {
                        info!(
                            token_id = %token_prefix(token_id),
                            gtc_price = %format!("{:.3}", gtc_price),
                            "FOK missed, resting GTC accepted"
                        );
                        self.pending_entries.lock().insert(token_id.to_string());
                        self.arm_entry_cooldown(token_id);
                        EntryResult {
                            success: true,
                            pending: true,
                            position_id: None,
                            reason: None,
                        }
                    }
                    Ok(resp) => EntryResult::blocked(format!(
                        "ORDER_REJECTED: {}",
                        resp.error_msg.unwrap_or_default()
                    )),
                    Err(e) => EntryResult::blocked(format!("ORDER_REJECTED: {}", e)),
                }
            }
        }
    }

    fn arm_entry_cooldown(&self, token_id: &str) {
        let until = Utc::now() + chrono::Duration::seconds(self.config.cooldown_seconds_per_token);
        self.entry_cooldowns
            .lock()
            .insert(token_id.to_string(), until);
    }

    fn order_price(
        &self,
        best_price: f64,
        slippage_pct: f64,
        side: OrderSide,
    ) -> Result<f64, crate::pricing::PriceError> {
        let padded = match side {
            OrderSide::Buy => best_price * (1.0 + slippage_pct),
            OrderSide::Sell => best_price * (1.0 - slippage_pct),
        };
        let clamped = clamp_hard_bounds(padded.clamp(0.0, 1.0))?;
        round_to_tick(clamped, PRICE_TICK, side)
    }

    async fn post_market(
        &self,
        token_id: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
        order_type: OrderType,
    ) -> Result<crate::clob::PostOrderResponse, crate::clob::ClobError> {
        let order = self
            .clob
            .create_market_order(MarketOrderArgs {
                side,
                token_id: token_id.to_string(),
                amount,
                price,
            })
            .await?;
        self.clob.post_order(&order, order_type).await
    }

    // =========================================================================
    // Exit protocol
    // =========================================================================

    /// Evaluate and execute exits/hedges for every open position in
    /// parallel. A failure on one position never touches its siblings.
    pub async fn process_exits(&self, ticks: Vec<PositionTick>) {
        let tasks = ticks.into_iter().map(|tick| self.process_one(tick));
        join_all(tasks).await;
    }

    async fn process_one(&self, tick: PositionTick) {
        let position_id = tick.position_id;
        let action = match self.positions.update_price(position_id, tick.mid_cents) {
            Ok(a) => a,
            Err(e) => {
                debug!(position_id = %position_id, error = %e, "price update skipped");
                return;
            }
        };

        let position = match self.positions.get(position_id) {
            Some(p) => p,
            None => return,
        };

        let (ev_allowed, _, _) = self.ev_allowance();
        let resolved = match action {
            PositionAction::Exit(reason) => Some((reason, Self::urgency_for(reason, &position))),
            PositionAction::Hedge => {
                self.execute_hedge(&position, tick.sibling_book.as_ref())
                    .await;
                None
            }
            PositionAction::None => {
                let decision = self.decision.evaluate_exit(
                    &position,
                    tick.mid_cents,
                    tick.bias,
                    ev_allowed,
                    Utc::now(),
                );
                decision.reason.map(|r| (r, decision.urgency))
            }
        };

        if let Some((reason, urgency)) = resolved {
            info!(
                event = "EXIT_DECISION",
                position_id = %position_id,
                token_id = %token_prefix(&position.token_id),
                reason = %reason,
                urgency = ?urgency,
                pnl_cents = %format!("{:.1}", position.pnl_cents),
                "exit decision"
            );
            self.execute_exit(position_id, reason, urgency, tick.best_bid_cents)
                .await;
        }
    }

    fn urgency_for(reason: ExitReason, position: &super::position::ManagedPosition) -> Urgency {
        match reason {
            ExitReason::TakeProfit => Urgency::Medium,
            ExitReason::HardExit | ExitReason::Liquidation => Urgency::Critical,
            ExitReason::TimeStop => {
                if position.pnl_cents > 0.0 {
                    Urgency::Low
                } else {
                    Urgency::Medium
                }
            }
            ExitReason::BiasFlip | ExitReason::EvDegraded => Urgency::Low,
        }
    }

    fn slippage_for(reason: ExitReason) -> f64 {
        match reason {
            ExitReason::TakeProfit => SLIPPAGE_TAKE_PROFIT,
            ExitReason::HardExit | ExitReason::Liquidation => SLIPPAGE_URGENT,
            _ => SLIPPAGE_NORMAL,
        }
    }

    /// Sell the primary at a reason-scaled band, then unwind hedges.
    pub async fn execute_exit(
        &self,
        position_id: Uuid,
        reason: ExitReason,
        urgency: Urgency,
        best_bid_cents: f64,
    ) {
        let position = match self.positions.get(position_id) {
            Some(p) => p,
            None => return,
        };
        if self.positions.begin_exit(position_id, reason).is_err() {
            return;
        }

        let slippage = if reason == ExitReason::Liquidation {
            self.config.liquidation_max_slippage_pct
        } else {
            Self::slippage_for(reason)
        };
        let best_bid = best_bid_cents / 100.0;
        let shares = position.shares();

        let sell_price = match self.order_price(best_bid, slippage, OrderSide::Sell) {
            Ok(p) => p,
            Err(e) => {
                warn!(position_id = %position_id, error = %e, "exit price invalid");
                return;
            }
        };

        info!(
            event = "EXIT_ORDER_SUBMIT",
            position_id = %position_id,
            token_id = %token_prefix(&position.token_id),
            reason = %reason,
            sell_price = %format!("{:.3}", sell_price),
            shares = %format!("{:.4}", shares),
            slippage_pct = %format!("{:.2}", slippage),
            "exit order submit"
        );

        let mut filled = matches!(
            self.post_market(
                &position.token_id,
                OrderSide::Sell,
                shares,
                sell_price,
                OrderType::Fok,
            )
            .await,
            Ok(resp) if resp.is_filled()
        );

        // Urgent exits get one more shot with a wider band and force-sell.
        if !filled && urgency == Urgency::Critical {
            if let Ok(force_price) = self.order_price(best_bid, SLIPPAGE_FORCE, OrderSide::Sell) {
                warn!(
                    position_id = %position_id,
                    force_price = %format!("{:.3}", force_price),
                    "FOK_NOT_FILLED, forcing sell at wide band"
                );
                filled = matches!(
                    self.post_market(
                        &position.token_id,
                        OrderSide::Sell,
                        shares,
                        force_price,
                        OrderType::Fok,
                    )
                    .await,
                    Ok(resp) if resp.is_filled()
                );
            }
        }

        info!(
            event = "EXIT_ORDER_RESULT",
            position_id = %position_id,
            token_id = %token_prefix(&position.token_id),
            filled = %filled,
            "exit order result"
        );

        if !filled {
            // The position stays EXITING; the next cycle's external sync
            // reconciles whatever actually happened on the venue.
            warn!(position_id = %position_id, "FOK_NOT_FILLED");
            self.external_dirty.store(true, Ordering::SeqCst);
            return;
        }

        let closed = match self
            .positions
            .close_position(position_id, best_bid_cents, reason)
        {
            Ok(c) => c,
            Err(e) => {
                warn!(position_id = %position_id, error = %e, "close bookkeeping failed");
                return;
            }
        };

        // Primary is flat; no reason to keep paying for protection.
        let unwind_failures = self.unwind_hedges(&closed).await;
        if unwind_failures > 0 {
            self.external_dirty.store(true, Ordering::SeqCst);
        }

        self.record_closed_trade(&closed, reason);
        self.balances.force_refresh();
        self.cooldowns.record_success(&closed.token_id);
    }

    /// FOK-sell each hedge leg at the sibling's current best bid. Returns
    /// the number of legs that could not be confirmed filled.
    async fn unwind_hedges(&self, position: &super::position::ManagedPosition) -> usize {
        let mut failures = 0;
        for leg in &position.hedges {
            let book = match self.clob.get_order_book(&leg.sibling_token_id).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        sibling = %token_prefix(&leg.sibling_token_id),
                        error = %e,
                        "hedge unwind book fetch failed"
                    );
                    failures += 1;
                    continue;
                }
            };
            let best_bid = match book.best_bid() {
                Some(b) if b > 0.0 => b,
                _ => {
                    failures += 1;
                    continue;
                }
            };

            let shares = if leg.entry_price_cents > 0.0 {
                leg.size_usd / (leg.entry_price_cents / 100.0)
            } else {
                0.0
            };
            if shares < MIN_HEDGE_SHARES {
                continue;
            }

            let sell_price = match self.order_price(best_bid, SLIPPAGE_NORMAL, OrderSide::Sell) {
                Ok(p) => p,
                Err(_) => {
                    failures += 1;
                    continue;
                }
            };

            let result = self
                .post_market(
                    &leg.sibling_token_id,
                    OrderSide::Sell,
                    shares,
                    sell_price,
                    OrderType::Fok,
                )
                .await;

            // Fill confirmation is strict: a response without MATCHED/FILLED
            // or positive amounts is a miss, not a fill.
            match result {
                Ok(resp) if resp.is_filled() => {
                    let effective = best_bid * 100.0 > leg.entry_price_cents;
                    self.hedge_policy.record_hedge_outcome(effective);
                    debug!(
                        sibling = %token_prefix(&leg.sibling_token_id),
                        effective = %effective,
                        "hedge leg unwound"
                    );
                }
                _ => {
                    warn!(
                        sibling = %token_prefix(&leg.sibling_token_id),
                        "hedge leg FOK_NOT_FILLED"
                    );
                    failures += 1;
                }
            }
        }
        failures
    }

    fn record_closed_trade(&self, closed: &super::position::ManagedPosition, reason: ExitReason) {
        self.ev.record_trade(TradeResult {
            token_id: closed.token_id.clone(),
            pnl_cents: closed.pnl_cents,
            pnl_usd: closed.pnl_usd,
            entry_price_cents: closed.entry_price_cents,
            exit_price_cents: closed.current_price_cents,
            size_usd: closed.entry_size_usd,
            reason,
            closed_at: Utc::now(),
        });
        if let Some(adaptive) = &self.adaptive_ev {
            adaptive.record_trade(
                closed.pnl_cents,
                closed.entry_size_usd,
                self.config.churn_cost_cents_estimate,
            );
        }
        self.hedge_policy
            .record_adverse_move(closed.max_adverse_cents_seen);
    }

    // =========================================================================
    // Hedge placement
    // =========================================================================

    pub async fn execute_hedge(
        &self,
        position: &super::position::ManagedPosition,
        sibling_book: Option<&OrderBookSnapshot>,
    ) {
        let sibling_token = match &position.opposite_token_id {
            Some(t) => t.clone(),
            None => {
                debug!(position_id = %position.id, "NO_OPPOSITE_TOKEN");
                return;
            }
        };

        let decision = self
            .hedge_policy
            .evaluate_hedge(position.pnl_cents, position.total_hedge_ratio);
        if !decision.should_hedge {
            debug!(position_id = %position.id, reason = %decision.reason, "hedge declined");
            return;
        }

        let hedge_usd = self
            .decision
            .calculate_hedge_size(position, decision.ratio);
        if hedge_usd < MIN_ENTRY_USD {
            return;
        }

        let balances = self.balances.get_balances().await;
        let gate = self.risk.check_hedge(
            &self.portfolio_snapshot(balances.usdc),
            hedge_usd,
            position.last_hedge_at,
        );
        if !gate.allowed {
            debug!(
                position_id = %position.id,
                reason = %gate.reason.unwrap_or_default(),
                "hedge gated"
            );
            self.reserve.record_missed_hedge();
            return;
        }

        // Prefer the proactively fetched sibling book when it is fresh and
        // has real ask depth; otherwise pull a fresh one.
        let (best_ask, best_bid) = match sibling_book {
            Some(snap) if snap.ask_depth_usd() >= MIN_SIBLING_ASK_DEPTH_USD => {
                match (snap.best_ask(), snap.best_bid()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return,
                }
            }
            _ => {
                let book = match self.clob.get_order_book(&sibling_token).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(sibling = %token_prefix(&sibling_token), error = %e, "hedge book fetch failed");
                        return;
                    }
                };
                match (book.best_ask(), book.best_bid()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return,
                }
            }
        };

        let mid = (best_ask + best_bid) / 2.0;
        if mid <= MIN_HEDGE_MID {
            debug!(position_id = %position.id, "PRICE_TOO_LOW");
            return;
        }
        let shares = hedge_usd / best_ask;
        if shares < MIN_HEDGE_SHARES {
            debug!(position_id = %position.id, "SIZE_TOO_SMALL");
            return;
        }

        let result = self
            .post_market(
                &sibling_token,
                OrderSide::Buy,
                hedge_usd,
                best_ask,
                OrderType::Fok,
            )
            .await;

        match result {
            Ok(resp) if resp.is_filled() => {
                let leg = HedgeLeg {
                    sibling_token_id: sibling_token.clone(),
                    size_usd: hedge_usd,
                    entry_price_cents: best_ask * 100.0,
                    entry_time: Utc::now(),
                    current_pnl_cents: 0.0,
                    ratio: decision.ratio,
                };
                if self.positions.record_hedge(position.id, leg).is_ok() {
                    info!(
                        position_id = %position.id,
                        sibling = %token_prefix(&sibling_token),
                        hedge_usd = %format!("{:.2}", hedge_usd),
                        price_cents = %format!("{:.1}", best_ask * 100.0),
                        reason = %decision.reason,
                        "hedge placed"
                    );
                    self.balances.force_refresh();
                }
            }
            _ => {
                warn!(position_id = %position.id, "hedge FOK_NOT_FILLED");
            }
        }
    }

    // =========================================================================
    // Liquidation
    // =========================================================================

    /// Sell one position at the configured liquidation band.
    pub async fn liquidate_position(&self, position_id: Uuid, best_bid_cents: f64) {
        self.execute_exit(
            position_id,
            ExitReason::Liquidation,
            Urgency::Critical,
            best_bid_cents,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{BalanceSource, Balances};
    use crate::clob::{
        ClobError, LimitOrderArgs, PostOrderResponse, SignedOrder, StaticMetadata,
    };
    use crate::engine::adaptive_hedge::AdaptiveHedgeConfig;
    use crate::engine::position::PositionConfig;
    use crate::engine::risk_guard::RiskGuardConfig;
    use crate::models::{BookSource, Order, OrderBook};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    struct PostedOrder {
        token_id: String,
        side: String,
        price: f64,
        size: f64,
        order_type: OrderType,
    }

    /// Scripted CLOB: pops post-order responses in sequence, records
    /// everything that was posted.
    struct ScriptedClob {
        post_responses: PlMutex<VecDeque<Result<PostOrderResponse, ClobError>>>,
        books: PlMutex<HashMap<String, OrderBook>>,
        posted: PlMutex<Vec<PostedOrder>>,
    }

    impl ScriptedClob {
        fn new(responses: Vec<Result<PostOrderResponse, ClobError>>) -> Self {
            Self {
                post_responses: PlMutex::new(responses.into()),
                books: PlMutex::new(HashMap::new()),
                posted: PlMutex::new(Vec::new()),
            }
        }

        fn with_book(self, token: &str, bid: f64, ask: f64) -> Self {
            self.books.lock().insert(
                token.to_string(),
                OrderBook {
                    bids: vec![Order { price: bid, size: 500.0 }],
                    asks: vec![Order { price: ask, size: 500.0 }],
                },
            );
            self
        }

        fn posted(&self) -> Vec<PostedOrder> {
            self.posted.lock().clone()
        }
    }

    fn filled() -> Result<PostOrderResponse, ClobError> {
        Ok(PostOrderResponse {
            success: true,
            status: Some("MATCHED".to_string()),
            taking_amount: Some("10".to_string()),
            ..Default::default()
        })
    }

    fn unfilled() -> Result<PostOrderResponse, ClobError> {
        Ok(PostOrderResponse {
            success: false,
            status: Some("UNMATCHED".to_string()),
            ..Default::default()
        })
    }

    fn accepted_resting() -> Result<PostOrderResponse, ClobError> {
        Ok(PostOrderResponse {
            success: true,
            status: Some("LIVE".to_string()),
            order_id: Some("gtc-1".to_string()),
            ..Default::default()
        })
    }

    #[async_trait]
    impl ClobClient for ScriptedClob {
        async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ClobError> {
            self.books
                .lock()
                .get(token_id)
                .cloned()
                .ok_or(ClobError::Http { status: 404 })
        }

        async fn create_market_order(
            &self,
            args: MarketOrderArgs,
        ) -> Result<SignedOrder, ClobError> {
            let size = match args.side {
                OrderSide::Buy => args.amount / args.price,
                OrderSide::Sell => args.amount,
            };
            Ok(SignedOrder {
                token_id: args.token_id,
                side: args.side.as_str().to_string(),
                price: format!("{:.4}", args.price),
                size: format!("{:.6}", size),
                price_raw: args.price,
                size_raw: size,
            })
        }

        async fn create_order(&self, args: LimitOrderArgs) -> Result<SignedOrder, ClobError> {
            Ok(SignedOrder {
                token_id: args.token_id,
                side: args.side.as_str().to_string(),
                price: format!("{:.4}", args.price),
                size: format!("{:.6}", args.size),
                price_raw: args.price,
                size_raw: args.size,
            })
        }

        async fn post_order(
            &self,
            order: &SignedOrder,
            order_type: OrderType,
        ) -> Result<PostOrderResponse, ClobError> {
            self.posted.lock().push(PostedOrder {
                token_id: order.token_id.clone(),
                side: order.side.clone(),
                price: order.price_raw,
                size: order.size_raw,
                order_type,
            });
            self.post_responses
                .lock()
                .pop_front()
                .unwrap_or_else(unfilled)
        }
    }

    struct FixedBalance(f64);

    #[async_trait]
    impl BalanceSource for FixedBalance {
        async fn fetch_balances(&self) -> anyhow::Result<Balances> {
            Ok(Balances {
                usdc: self.0,
                pol: 1.0,
            })
        }
    }

    fn snapshot(bid: f64, ask: f64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            source: BookSource::Rest,
            token_id: "tok".to_string(),
            bids: vec![Order { price: bid, size: 800.0 }],
            asks: vec![Order { price: ask, size: 800.0 }],
            http_status: Some(200),
            latency_ms: 15,
            parsed_ok: true,
            fetch_failed: false,
            fetched_at: Utc::now(),
            attempt_id: Uuid::new_v4(),
        }
    }

    fn engine_with(clob: Arc<ScriptedClob>, balance_usd: f64) -> ExecutionEngine {
        let config = Config::default();
        let metadata = StaticMetadata::default();
        metadata.insert_pair("tok", "sib", "test market");

        let positions = Arc::new(PositionManager::new(PositionConfig {
            tp_cents: config.tp_cents,
            hedge_trigger_cents: config.hedge_trigger_cents,
            max_adverse_cents: config.max_adverse_cents,
            max_hold_seconds: config.max_hold_seconds,
            max_hedge_ratio: config.max_hedge_ratio,
            max_open_positions_total: config.max_open_positions_total,
            max_open_positions_per_market: config.max_open_positions_per_market,
        }));
        let ev = Arc::new(EvTracker::new(50, 2.0, 0.5, 1.1, 300));
        let hedge_policy = Arc::new(AdaptiveHedgePolicy::new(AdaptiveHedgeConfig::default()));
        let reserve = Arc::new(ReserveManager::new(0.25, 0.50, 0.20, 10.0));
        let risk = Arc::new(RiskGuard::new(RiskGuardConfig {
            min_wallet_balance_usd: 50.0,
            max_total_deployment_fraction: 0.50,
            max_hedged_positions: 3,
            max_total_hedge_usd: 100.0,
            max_global_hedge_exposure: 0.50,
            hedge_cooldown_seconds: 30,
        }));
        let cooldowns = Arc::new(CooldownManager::new());
        let latency = Arc::new(LatencyMonitor::new(config.base_slippage_pct));
        let balances = Arc::new(BalanceCache::new(
            Arc::new(FixedBalance(balance_usd)),
            std::time::Duration::from_secs(60),
        ));

        ExecutionEngine::new(
            config,
            clob,
            Arc::new(metadata),
            positions,
            ev,
            None,
            hedge_policy,
            reserve,
            risk,
            cooldowns,
            latency,
            balances,
        )
    }

    #[tokio::test]
    async fn fok_fill_registers_position_with_sibling() {
        let clob = Arc::new(ScriptedClob::new(vec![filled()]));
        let engine = engine_with(clob.clone(), 500.0);
        let snap = snapshot(0.48, 0.52);

        let result = engine
            .attempt_entry("tok", EntryFlow::Bias(BiasDirection::Long), &snap, 5, 10)
            .await;
        assert!(result.success, "reason: {:?}", result.reason);
        assert!(!result.pending);

        let pos = engine.positions.get(result.position_id.unwrap()).unwrap();
        assert_eq!(pos.entry_price_cents, 52.0);
        assert_eq!(pos.opposite_token_id.as_deref(), Some("sib"));

        let posted = clob.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].order_type, OrderType::Fok);
        // Worst-case sizing: shares priced at the padded limit, notional
        // never exceeds the budget. Wallet $500 reserves 25%, so the
        // tradeable bankroll is $375 and the entry is 375 × 0.05 = $18.75.
        assert!(posted[0].price > 0.52);
        assert!((posted[0].size * posted[0].price - 18.75).abs() < 1e-6);
    }

    #[tokio::test]
    async fn fok_miss_falls_back_to_pending_gtc() {
        let clob = Arc::new(ScriptedClob::new(vec![unfilled(), accepted_resting()]));
        let engine = engine_with(clob.clone(), 500.0);
        let snap = snapshot(0.48, 0.52);

        let result = engine
            .attempt_entry("tok", EntryFlow::Bias(BiasDirection::Long), &snap, 5, 10)
            .await;
        assert!(result.success);
        assert!(result.pending);
        assert!(result.position_id.is_none());
        // Nothing registered locally; the fill arrives via external sync.
        assert_eq!(engine.positions.open_count(), 0);
        assert!(engine.has_pending_entry("tok"));

        let posted = clob.posted();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].order_type, OrderType::Fok);
        assert_eq!(posted[1].order_type, OrderType::Gtc);
        // The GTC limit is tighter than the FOK limit.
        assert!(posted[1].price < posted[0].price);

        // A second attempt on the same token is blocked while pending.
        let again = engine
            .attempt_entry("tok", EntryFlow::Bias(BiasDirection::Long), &snap, 5, 10)
            .await;
        assert!(!again.success);
    }

    #[tokio::test]
    async fn both_legs_failing_is_order_rejected() {
        let clob = Arc::new(ScriptedClob::new(vec![unfilled(), unfilled()]));
        let engine = engine_with(clob, 500.0);
        let snap = snapshot(0.48, 0.52);

        let result = engine
            .attempt_entry("tok", EntryFlow::Bias(BiasDirection::Long), &snap, 5, 10)
            .await;
        assert!(!result.success);
        assert!(result.reason.unwrap().starts_with("ORDER_REJECTED"));
    }

    #[tokio::test]
    async fn short_bias_entry_is_blocked() {
        let clob = Arc::new(ScriptedClob::new(vec![]));
        let engine = engine_with(clob.clone(), 500.0);
        let snap = snapshot(0.48, 0.52);

        let result = engine
            .attempt_entry("tok", EntryFlow::Bias(BiasDirection::Short), &snap, 5, 10)
            .await;
        assert!(!result.success);
        assert!(clob.posted().is_empty());
    }

    #[tokio::test]
    async fn scanner_flow_defaults_to_long() {
        let clob = Arc::new(ScriptedClob::new(vec![filled()]));
        let engine = engine_with(clob, 500.0);
        let snap = snapshot(0.48, 0.52);

        let result = engine
            .attempt_entry("tok", EntryFlow::Scanner, &snap, 5, 10)
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn entry_cooldown_blocks_immediate_reentry() {
        let clob = Arc::new(ScriptedClob::new(vec![filled(), filled()]));
        let engine = engine_with(clob, 500.0);
        let snap = snapshot(0.48, 0.52);

        let first = engine
            .attempt_entry("tok", EntryFlow::Bias(BiasDirection::Long), &snap, 5, 10)
            .await;
        assert!(first.success);

        let second = engine
            .attempt_entry("tok", EntryFlow::Bias(BiasDirection::Long), &snap, 5, 10)
            .await;
        assert!(!second.success);
        assert_eq!(second.reason.as_deref(), Some("COOLDOWN"));
    }

    #[tokio::test]
    async fn hard_exit_unwinds_hedge_leg_at_urgent_band() {
        // Exit FOK fill, then hedge-leg FOK fill.
        let clob = Arc::new(
            ScriptedClob::new(vec![filled(), filled()]).with_book("sib", 0.40, 0.44),
        );
        let engine = engine_with(clob.clone(), 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();
        engine.positions.set_opposite_token(pos.id, "sib").unwrap();
        engine
            .positions
            .record_hedge(
                pos.id,
                HedgeLeg {
                    sibling_token_id: "sib".to_string(),
                    size_usd: 10.0,
                    entry_price_cents: 38.0,
                    entry_time: Utc::now(),
                    current_pnl_cents: 0.0,
                    ratio: 0.4,
                },
            )
            .unwrap();

        // Price collapsed to 29¢: −31¢ breaches the 30¢ hard stop.
        engine
            .process_exits(vec![PositionTick {
                position_id: pos.id,
                mid_cents: 29.0,
                best_bid_cents: 28.0,
                bias: BiasDirection::Long,
                sibling_book: None,
            }])
            .await;

        let closed = engine.positions.get(pos.id).unwrap();
        assert_eq!(closed.state, super::super::position::PositionState::Closed);
        assert!((closed.pnl_cents - (28.0 - 60.0)).abs() < 1e-9);

        let posted = clob.posted();
        assert_eq!(posted.len(), 2);
        // Primary sell at the 15% urgent band off the 28¢ bid.
        assert_eq!(posted[0].token_id, "tok");
        assert_eq!(posted[0].side, "SELL");
        let expect = 0.28 * (1.0 - SLIPPAGE_URGENT);
        assert!((posted[0].price - expect).abs() < PRICE_TICK + 1e-9);
        // Then the hedge leg goes out on the sibling.
        assert_eq!(posted[1].token_id, "sib");
        assert_eq!(posted[1].side, "SELL");
    }

    #[tokio::test]
    async fn urgent_miss_retries_once_at_force_band() {
        let clob = Arc::new(ScriptedClob::new(vec![unfilled(), filled()]));
        let engine = engine_with(clob.clone(), 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();

        engine
            .process_exits(vec![PositionTick {
                position_id: pos.id,
                mid_cents: 29.0,
                best_bid_cents: 28.0,
                bias: BiasDirection::Long,
                sibling_book: None,
            }])
            .await;

        let posted = clob.posted();
        assert_eq!(posted.len(), 2);
        let expect_force = 0.28 * (1.0 - SLIPPAGE_FORCE);
        assert!((posted[1].price - expect_force).abs() < PRICE_TICK + 1e-9);
        assert_eq!(
            engine.positions.get(pos.id).unwrap().state,
            super::super::position::PositionState::Closed
        );
    }

    #[tokio::test]
    async fn take_profit_uses_tight_band_and_records_ev() {
        let clob = Arc::new(ScriptedClob::new(vec![filled()]));
        let engine = engine_with(clob.clone(), 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();

        engine
            .process_exits(vec![PositionTick {
                position_id: pos.id,
                mid_cents: 75.0,
                best_bid_cents: 74.0,
                bias: BiasDirection::Long,
                sibling_book: None,
            }])
            .await;

        let posted = clob.posted();
        let expect = 0.74 * (1.0 - SLIPPAGE_TAKE_PROFIT);
        assert!((posted[0].price - expect).abs() < PRICE_TICK + 1e-9);
        assert_eq!(engine.ev.metrics().total_trades, 1);
        assert_eq!(engine.ev.metrics().wins, 1);
    }

    #[tokio::test]
    async fn unfilled_exit_keeps_position_exiting_and_flags_sync() {
        let clob = Arc::new(ScriptedClob::new(vec![unfilled()]));
        let engine = engine_with(clob, 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();

        engine
            .process_exits(vec![PositionTick {
                position_id: pos.id,
                mid_cents: 75.0,
                best_bid_cents: 74.0,
                bias: BiasDirection::Long,
                sibling_book: None,
            }])
            .await;

        assert_eq!(
            engine.positions.get(pos.id).unwrap().state,
            super::super::position::PositionState::Exiting
        );
        assert!(engine.take_external_dirty());
    }

    #[tokio::test]
    async fn hedge_trigger_places_sibling_buy() {
        let clob = Arc::new(
            ScriptedClob::new(vec![filled()]).with_book("sib", 0.40, 0.44),
        );
        let engine = engine_with(clob.clone(), 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();
        engine.positions.set_opposite_token(pos.id, "sib").unwrap();

        // 48¢ mid: −12¢ past the 10¢ trigger, inside the 30¢ stop.
        engine
            .process_exits(vec![PositionTick {
                position_id: pos.id,
                mid_cents: 48.0,
                best_bid_cents: 47.0,
                bias: BiasDirection::Long,
                sibling_book: None,
            }])
            .await;

        let posted = clob.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].token_id, "sib");
        assert_eq!(posted[0].side, "BUY");
        assert!((posted[0].price - 0.44).abs() < 1e-9);

        let hedged = engine.positions.get(pos.id).unwrap();
        assert_eq!(hedged.state, super::super::position::PositionState::Hedged);
        assert_eq!(hedged.hedges.len(), 1);
        assert!((hedged.hedges[0].entry_price_cents - 44.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hedge_without_sibling_token_is_skipped() {
        let clob = Arc::new(ScriptedClob::new(vec![]));
        let engine = engine_with(clob.clone(), 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();

        engine
            .process_exits(vec![PositionTick {
                position_id: pos.id,
                mid_cents: 48.0,
                best_bid_cents: 47.0,
                bias: BiasDirection::Long,
                sibling_book: None,
            }])
            .await;
        assert!(clob.posted().is_empty());
    }

    #[tokio::test]
    async fn phantom_fill_on_unwind_counts_as_failure() {
        // Exit fills; hedge unwind gets a success-but-no-evidence response.
        let phantom = Ok(PostOrderResponse {
            success: true,
            status: None,
            taking_amount: Some("0".to_string()),
            ..Default::default()
        });
        let clob = Arc::new(
            ScriptedClob::new(vec![filled(), phantom]).with_book("sib", 0.40, 0.44),
        );
        let engine = engine_with(clob, 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();
        engine.positions.set_opposite_token(pos.id, "sib").unwrap();
        engine
            .positions
            .record_hedge(
                pos.id,
                HedgeLeg {
                    sibling_token_id: "sib".to_string(),
                    size_usd: 10.0,
                    entry_price_cents: 38.0,
                    entry_time: Utc::now(),
                    current_pnl_cents: 0.0,
                    ratio: 0.4,
                },
            )
            .unwrap();

        engine
            .process_exits(vec![PositionTick {
                position_id: pos.id,
                mid_cents: 29.0,
                best_bid_cents: 28.0,
                bias: BiasDirection::Long,
                sibling_book: None,
            }])
            .await;

        // The phantom fill forces an external re-sync.
        assert!(engine.take_external_dirty());
    }

    #[tokio::test]
    async fn liquidation_uses_configured_band() {
        let clob = Arc::new(ScriptedClob::new(vec![filled()]));
        let engine = engine_with(clob.clone(), 500.0);

        let pos = engine
            .positions
            .open_position("tok", Side::Long, 60.0, 25.0, BiasDirection::Long)
            .unwrap();

        engine.liquidate_position(pos.id, 50.0).await;

        let posted = clob.posted();
        let expect = 0.50 * (1.0 - Config::default().liquidation_max_slippage_pct);
        assert!((posted[0].price - expect).abs() < PRICE_TICK + 1e-9);
    }
}

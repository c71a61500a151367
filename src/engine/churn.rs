//! Churn engine: the trading control loop
//!
//! One serial decision point per cycle with concurrent I/O inside it:
//! balances, whale trades, position sync, and the market scan fan out and
//! join; per-position book fetches and exit/hedge executions run in
//! parallel with failures isolated per position. Entries ride the bias
//! signals first and fall back to scanned tokens when whale flow is quiet.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::balance::BalanceCache;
use crate::clob::{MarketDataFacade, MarketMetadata};
use crate::config::{Config, LiquidationMode};
use crate::feeds::{
    LeaderboardFeed, MarketScanner, OnChainEvent, OnChainMonitor, PositionFetcher, TradeDeduper,
};
use crate::models::{BiasDirection, BookHealth, LeaderboardTrade, MarketDataFailure};
use crate::notify::token_prefix;

use super::adaptive_hedge::AdaptiveHedgePolicy;
use super::bias::BiasAccumulator;
use super::book_resolver::{BookResolver, ResolvedBook};
use super::cooldown::CooldownManager;
use super::ev::EvTracker;
use super::execution::{EntryFlow, ExecutionEngine, PositionTick};
use super::position::PositionManager;
use super::reserve::ReserveManager;
use super::risk_guard::{PortfolioSnapshot, RiskGuard};

const POLL_MS_WITH_POSITIONS: u64 = 100;
const POLL_MS_IDLE: u64 = 200;
const POSITION_SYNC_EVERY_CYCLES: u64 = 10;
const MAX_BIAS_ENTRIES_PER_CYCLE: usize = 3;
const MAX_SCAN_ENTRIES_PER_CYCLE: usize = 2;
const COOLDOWN_CLEANUP_SECS: u64 = 600;
const PRUNE_CLOSED_SECS: u64 = 3_600;

struct Timers {
    last_scan: Option<Instant>,
    last_status: Option<Instant>,
    last_redemption: Option<Instant>,
    last_prune: Option<Instant>,
    last_cooldown_cleanup: Option<Instant>,
}

impl Timers {
    fn new() -> Self {
        Self {
            last_scan: None,
            last_status: None,
            last_redemption: None,
            last_prune: None,
            last_cooldown_cleanup: None,
        }
    }

    fn due(slot: &mut Option<Instant>, every: Duration) -> bool {
        let due = slot.map(|t| t.elapsed() >= every).unwrap_or(true);
        if due {
            *slot = Some(Instant::now());
        }
        due
    }
}

pub struct ChurnEngine {
    config: Config,
    execution: Arc<ExecutionEngine>,
    positions: Arc<PositionManager>,
    resolver: Arc<BookResolver>,
    bias: Arc<BiasAccumulator>,
    leaderboard: Arc<dyn LeaderboardFeed>,
    onchain: Option<Arc<OnChainMonitor>>,
    position_fetcher: Option<Arc<dyn PositionFetcher>>,
    scanner: Arc<dyn MarketScanner>,
    metadata: Arc<dyn MarketMetadata>,
    market_data: Arc<dyn MarketDataFacade>,
    cooldowns: Arc<CooldownManager>,
    reserve: Arc<ReserveManager>,
    risk: Arc<RiskGuard>,
    ev: Arc<EvTracker>,
    hedge_policy: Arc<AdaptiveHedgePolicy>,
    balances: Arc<BalanceCache>,
    deduper: Mutex<TradeDeduper>,
    scanned_tokens: Mutex<Vec<String>>,
    timers: Mutex<Timers>,
    cycle: AtomicU64,
    /// Liquidation forced by a depleted starting bankroll, as opposed to
    /// the configured mode.
    auto_liquidation: AtomicBool,
}

#[allow(clippy::too_many_arguments)]
impl ChurnEngine {
    pub fn new(
        config: Config,
        execution: Arc<ExecutionEngine>,
        positions: Arc<PositionManager>,
        resolver: Arc<BookResolver>,
        bias: Arc<BiasAccumulator>,
        leaderboard: Arc<dyn LeaderboardFeed>,
        onchain: Option<Arc<OnChainMonitor>>,
        position_fetcher: Option<Arc<dyn PositionFetcher>>,
        scanner: Arc<dyn MarketScanner>,
        metadata: Arc<dyn MarketMetadata>,
        market_data: Arc<dyn MarketDataFacade>,
        cooldowns: Arc<CooldownManager>,
        reserve: Arc<ReserveManager>,
        risk: Arc<RiskGuard>,
        ev: Arc<EvTracker>,
        hedge_policy: Arc<AdaptiveHedgePolicy>,
        balances: Arc<BalanceCache>,
    ) -> Self {
        Self {
            config,
            execution,
            positions,
            resolver,
            bias,
            leaderboard,
            onchain,
            position_fetcher,
            scanner,
            metadata,
            market_data,
            cooldowns,
            reserve,
            risk,
            ev,
            hedge_policy,
            balances,
            deduper: Mutex::new(TradeDeduper::new(10_000)),
            scanned_tokens: Mutex::new(Vec::new()),
            timers: Mutex::new(Timers::new()),
            cycle: AtomicU64::new(0),
            auto_liquidation: AtomicBool::new(false),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            live = %self.config.live_trading_enabled,
            liquidation_mode = ?self.config.liquidation_mode,
            "churn engine started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            self.run_cycle().await;

            let poll_ms = if self.positions.open_count() > 0 {
                POLL_MS_WITH_POSITIONS
            } else {
                POLL_MS_IDLE
            };
            let budget = Duration::from_millis(poll_ms);
            let elapsed = started.elapsed();
            if elapsed < budget {
                tokio::select! {
                    _ = tokio::time::sleep(budget - elapsed) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("churn engine stopped");
    }

    async fn run_cycle(&self) {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;

        // Chain events arrive over a channel; drain them before deciding
        // whether this cycle needs a position sync.
        let mut chain_trades: Vec<LeaderboardTrade> = Vec::new();
        let mut position_changed = false;
        if let Some(onchain) = &self.onchain {
            for event in onchain.drain() {
                match event {
                    OnChainEvent::WhaleTrade(trade) => chain_trades.push(trade),
                    OnChainEvent::PositionChange { wallet, token_id } => {
                        debug!(
                            wallet = %token_prefix(&wallet),
                            token_id = %token_prefix(&token_id),
                            "position change on chain"
                        );
                        position_changed = true;
                    }
                }
            }
        }

        let need_sync = self.position_fetcher.is_some()
            && (cycle == 1
                || cycle % POSITION_SYNC_EVERY_CYCLES == 0
                || position_changed
                || self.execution.take_external_dirty());
        let scan_due = Timers::due(
            &mut self.timers.lock().last_scan,
            Duration::from_secs(self.config.scan_interval_seconds.max(1) as u64),
        );

        // Concurrent fan-out, one join.
        let (balances, trades_result, sync_result, scan_result) = tokio::join!(
            self.balances.get_balances(),
            self.leaderboard.poll_trades(),
            async {
                match (&self.position_fetcher, need_sync) {
                    (Some(fetcher), true) => fetcher.fetch_positions().await.map(Some),
                    _ => Ok(None),
                }
            },
            async {
                if scan_due {
                    self.scanner
                        .scan_top_tokens(MAX_SCAN_ENTRIES_PER_CYCLE * 3)
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
        );

        // Whale flow into the bias accumulator, deduped across feeds.
        let mut trades = match trades_result {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "whale trade poll failed");
                Vec::new()
            }
        };
        trades.extend(chain_trades);
        let fresh = self.deduper.lock().dedup(trades);
        self.bias.ingest(&fresh);

        match scan_result {
            Ok(Some(tokens)) => *self.scanned_tokens.lock() = tokens,
            Ok(None) => {}
            Err(e) => debug!(error = %e, "market scan failed"),
        }

        match sync_result {
            Ok(Some(chain_positions)) => self.adopt_external_positions(chain_positions).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "position sync failed"),
        }

        self.positions.set_ev_context(self.ev.metrics().ev_cents);

        // Manage whatever is open.
        let books = self.manage_open_positions().await;

        let liquidating = self.liquidation_pass(&books).await;

        if !liquidating {
            self.entry_pass(balances.usdc).await;
        }

        self.reconcile_subscriptions();
        self.housekeeping(balances.usdc);
    }

    // =========================================================================
    // Position management
    // =========================================================================

    /// Resolve one book per distinct token (positions plus their hedge
    /// siblings), feed the hedge policy's price history, and hand the ticks
    /// to the execution engine. Returns the resolved books for reuse by the
    /// liquidation pass.
    async fn manage_open_positions(&self) -> HashMap<String, ResolvedBook> {
        let open = self.positions.open_positions();
        if open.is_empty() {
            return HashMap::new();
        }

        let mut tokens: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for pos in &open {
            if seen.insert(pos.token_id.clone()) {
                tokens.push(pos.token_id.clone());
            }
            // Sibling books only matter while a hedge could still be added.
            if let Some(sibling) = &pos.opposite_token_id {
                if pos.total_hedge_ratio < self.config.max_hedge_ratio
                    && seen.insert(sibling.clone())
                {
                    tokens.push(sibling.clone());
                }
            }
        }

        let fetches = tokens.iter().map(|token| async {
            (
                token.clone(),
                self.resolver
                    .resolve_healthy_book(token, "manage", self.config.max_spread_cents)
                    .await,
            )
        });
        let books: HashMap<String, ResolvedBook> = join_all(fetches).await.into_iter().collect();

        for (token, resolved) in &books {
            if let Some(snap) = &resolved.snapshot {
                if let Some(mid) = snap.mid_cents() {
                    self.hedge_policy.record_price(token, mid, snap.fetched_at);
                }
            }
        }

        let mut ticks = Vec::new();
        for pos in &open {
            let resolved = match books.get(&pos.token_id) {
                Some(r) => r,
                None => continue,
            };
            let snap = match &resolved.snapshot {
                Some(s) => s,
                None => {
                    debug!(
                        token_id = %token_prefix(&pos.token_id),
                        health = %resolved.health.health,
                        "no book for open position this cycle"
                    );
                    continue;
                }
            };
            let (mid, bid) = match (snap.mid_cents(), snap.best_bid_cents()) {
                (Some(m), Some(b)) => (m, b),
                _ => continue,
            };

            let bias = self
                .bias
                .get_bias(&pos.token_id)
                .filter(|b| !b.is_stale)
                .map(|b| b.direction)
                .unwrap_or(BiasDirection::None);

            let sibling_book = pos
                .opposite_token_id
                .as_ref()
                .and_then(|sibling| books.get(sibling))
                .and_then(|r| r.snapshot.clone());

            if let Some(sibling_snap) = &sibling_book {
                if let Some(sibling_mid) = sibling_snap.mid_cents() {
                    let _ = self.positions.update_hedge_prices(pos.id, sibling_mid);
                }
            }

            ticks.push(PositionTick {
                position_id: pos.id,
                mid_cents: mid,
                best_bid_cents: bid,
                bias,
                sibling_book,
            });
        }

        if !ticks.is_empty() {
            self.execution.process_exits(ticks).await;
        }
        books
    }

    async fn adopt_external_positions(&self, chain_positions: Vec<crate::feeds::ChainPosition>) {
        for chain_pos in chain_positions {
            if self.positions.has_open_on_token(&chain_pos.token_id) {
                continue;
            }
            // A resting GTC that filled arrives here; the pending marker has
            // done its job.
            self.execution.clear_pending_entry(&chain_pos.token_id);

            // Mapping verification races a hard 3s timer; a slow metadata
            // lookup must not stall the cycle.
            let outcome = match &chain_pos.outcome {
                Some(o) => o.clone(),
                None => match tokio::time::timeout(
                    Duration::from_secs(3),
                    self.metadata.get_market_token_pair(&chain_pos.token_id),
                )
                .await
                {
                    Ok(Ok(pair)) => pair
                        .tokens
                        .iter()
                        .find(|t| t.token_id == chain_pos.token_id)
                        .map(|t| t.outcome_label.clone())
                        .unwrap_or_default(),
                    Ok(Err(e)) => {
                        debug!(
                            token_id = %token_prefix(&chain_pos.token_id),
                            error = %e,
                            "metadata lookup failed for adoption"
                        );
                        String::new()
                    }
                    Err(_) => {
                        debug!(
                            token_id = %token_prefix(&chain_pos.token_id),
                            "metadata lookup timed out for adoption"
                        );
                        String::new()
                    }
                },
            };

            let avg_price_cents = chain_pos.avg_price * 100.0;
            let size_usd = chain_pos.size * chain_pos.avg_price;
            if size_usd <= 0.0 || avg_price_cents <= 0.0 {
                continue;
            }

            match self.positions.register_external_position(
                &chain_pos.token_id,
                &outcome,
                avg_price_cents,
                size_usd,
            ) {
                Ok(adopted) => {
                    if let Ok(Ok(Some(opposite))) = tokio::time::timeout(
                        Duration::from_secs(3),
                        self.metadata.get_opposite_token_id(&chain_pos.token_id),
                    )
                    .await
                    {
                        let _ = self.positions.set_opposite_token(adopted.id, &opposite);
                    }
                }
                Err(e) => {
                    warn!(
                        token_id = %token_prefix(&chain_pos.token_id),
                        error = %e,
                        "external adoption failed"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Liquidation mode
    // =========================================================================

    /// True while liquidation owns the cycle (entries suppressed). Sells
    /// the single largest eligible position per cycle.
    async fn liquidation_pass(&self, books: &HashMap<String, ResolvedBook>) -> bool {
        let cycle = self.cycle.load(Ordering::SeqCst);
        if cycle == 1 && self.config.liquidation_mode == LiquidationMode::Off {
            // A depleted starting bankroll with inherited positions forces
            // liquidation until the wallet breathes again.
            let balances = self.balances.get_balances().await;
            if self.reserve.effective_bankroll(balances.usdc) <= 0.0
                && self.positions.open_count() > 0
            {
                warn!("no effective bankroll at startup, entering liquidation");
                self.auto_liquidation.store(true, Ordering::SeqCst);
            }
        }

        let configured = self.config.liquidation_mode != LiquidationMode::Off;
        let auto = self.auto_liquidation.load(Ordering::SeqCst);
        if !configured && !auto {
            return false;
        }

        let losing_only = self.config.liquidation_mode == LiquidationMode::Losing && !auto;
        let candidate = self
            .positions
            .open_positions()
            .into_iter()
            .filter(|p| p.state != super::position::PositionState::Exiting)
            .filter(|p| !losing_only || p.pnl_cents < 0.0)
            .max_by(|a, b| {
                a.entry_size_usd
                    .partial_cmp(&b.entry_size_usd)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        let position = match candidate {
            Some(p) => p,
            None => {
                if auto {
                    info!("liquidation complete, resuming normal operation");
                    self.auto_liquidation.store(false, Ordering::SeqCst);
                }
                return configured;
            }
        };

        let best_bid = match books
            .get(&position.token_id)
            .and_then(|r| r.snapshot.as_ref())
            .and_then(|s| s.best_bid_cents())
        {
            Some(b) => b,
            None => {
                let resolved = self
                    .resolver
                    .resolve_healthy_book(
                        &position.token_id,
                        "liquidation",
                        self.config.max_spread_cents,
                    )
                    .await;
                match resolved.snapshot.as_ref().and_then(|s| s.best_bid_cents()) {
                    Some(b) => b,
                    None => {
                        self.route_failure(&position.token_id, resolved.health.health);
                        return true;
                    }
                }
            }
        };

        info!(
            position_id = %position.id,
            token_id = %token_prefix(&position.token_id),
            size_usd = %format!("{:.2}", position.entry_size_usd),
            "liquidating largest eligible position"
        );
        self.execution.liquidate_position(position.id, best_bid).await;
        true
    }

    // =========================================================================
    // Entries
    // =========================================================================

    async fn entry_pass(&self, wallet_balance_usd: f64) {
        let snapshot = PortfolioSnapshot {
            wallet_balance_usd,
            open_positions: self.positions.open_count(),
            deployed_usd: self.positions.deployed_usd(),
            hedged_positions: self.positions.hedged_count(),
            total_hedge_usd: self.positions.total_hedge_usd(),
        };
        if self.risk.is_protective_mode_active(&snapshot) {
            debug!("protective mode, skipping entries");
            return;
        }

        // Bias tokens first: stale and thin flow already filtered by the
        // accumulator, cooldowns and held tokens filtered here.
        let biases: Vec<_> = self
            .bias
            .active_biases()
            .into_iter()
            .filter(|b| !self.cooldowns.is_on_cooldown(&b.token_id))
            .filter(|b| !self.positions.has_open_on_token(&b.token_id))
            .filter(|b| !self.execution.has_pending_entry(&b.token_id))
            .take(MAX_BIAS_ENTRIES_PER_CYCLE)
            .collect();

        if !biases.is_empty() {
            let attempts = biases.iter().map(|b| {
                let flow = if self.config.copy_any_whale_buy {
                    EntryFlow::CopyBuy {
                        non_stale_buys: b.trade_count,
                    }
                } else {
                    EntryFlow::Bias(b.direction)
                };
                self.try_entry(b.token_id.clone(), flow)
            });
            join_all(attempts).await;
            return;
        }

        // Quiet tape: scanned tokens instead.
        let scans: Vec<String> = self
            .scanned_tokens
            .lock()
            .iter()
            .filter(|t| !self.cooldowns.is_on_cooldown(t))
            .filter(|t| !self.positions.has_open_on_token(t))
            .filter(|t| !self.execution.has_pending_entry(t))
            .take(MAX_SCAN_ENTRIES_PER_CYCLE)
            .cloned()
            .collect();

        let attempts = scans
            .into_iter()
            .map(|token| self.try_entry(token, EntryFlow::Scanner));
        join_all(attempts).await;
    }

    async fn try_entry(&self, token_id: String, flow: EntryFlow) {
        let resolved = self
            .resolver
            .resolve_healthy_book(&token_id, "entry", self.config.max_spread_cents)
            .await;

        let snapshot = match (resolved.success, resolved.snapshot) {
            (true, Some(snap)) => {
                self.cooldowns.record_success(&token_id);
                snap
            }
            _ => {
                self.route_failure(&token_id, resolved.health.health);
                return;
            }
        };

        let (trades_w, updates_w) = self
            .market_data
            .get_orderbook_state(&token_id)
            .map(|s| (s.trades_last_window, s.updates_last_window))
            .unwrap_or((0, 0));

        let result = self
            .execution
            .attempt_entry(&token_id, flow, &snapshot, trades_w, updates_w)
            .await;

        if result.success {
            info!(
                token_id = %token_prefix(&token_id),
                pending = %result.pending,
                "entry placed"
            );
        } else if let Some(reason) = &result.reason {
            debug!(token_id = %token_prefix(&token_id), reason = %reason, "entry skipped");
        }
    }

    /// Map a failed book resolution onto the cooldown taxonomy. Permanent
    /// market conditions are not cooldown causes; the loop keeps scanning.
    fn route_failure(&self, token_id: &str, health: BookHealth) {
        let reason = match health {
            BookHealth::BookFetchFailed => Some(MarketDataFailure::NetworkError),
            BookHealth::NoData => Some(MarketDataFailure::NoOrderbook),
            BookHealth::EmptyBook => Some(MarketDataFailure::NoOrderbook),
            BookHealth::ParseError => Some(MarketDataFailure::ParseError),
            // Dust, wide spread, high ask: the market is just like that.
            BookHealth::DustBook | BookHealth::WideSpread | BookHealth::AskTooHigh => None,
            BookHealth::Ok => None,
        };
        if let Some(reason) = reason {
            self.cooldowns.record_failure(token_id, reason);
        }
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// The WS subscription set is the union of open positions, their
    /// siblings, the strongest biases, and the current scan picks.
    fn reconcile_subscriptions(&self) {
        let mut wanted: HashSet<String> = HashSet::new();
        for pos in self.positions.open_positions() {
            wanted.insert(pos.token_id.clone());
            if let Some(sibling) = pos.opposite_token_id {
                wanted.insert(sibling);
            }
        }
        for bias in self.bias.active_biases().into_iter().take(MAX_BIAS_ENTRIES_PER_CYCLE) {
            wanted.insert(bias.token_id);
        }
        for token in self
            .scanned_tokens
            .lock()
            .iter()
            .take(MAX_SCAN_ENTRIES_PER_CYCLE)
        {
            wanted.insert(token.clone());
        }
        self.market_data.set_subscriptions(wanted);
    }

    fn housekeeping(&self, wallet_balance_usd: f64) {
        let mut timers = self.timers.lock();

        if Timers::due(
            &mut timers.last_cooldown_cleanup,
            Duration::from_secs(COOLDOWN_CLEANUP_SECS),
        ) {
            self.cooldowns.cleanup();
        }

        if Timers::due(
            &mut timers.last_redemption,
            Duration::from_secs(self.config.redemption_interval_seconds.max(1) as u64),
        ) {
            // Redemption and gas top-up run outside this crate; the sweep
            // request is the integration point.
            debug!("redemption sweep requested");
        }

        if Timers::due(
            &mut timers.last_prune,
            Duration::from_secs(PRUNE_CLOSED_SECS),
        ) {
            self.positions
                .prune_closed_positions(chrono::Duration::hours(1));
        }

        if Timers::due(
            &mut timers.last_status,
            Duration::from_secs(self.config.status_interval_seconds.max(1) as u64),
        ) {
            drop(timers);
            self.log_status(wallet_balance_usd);
        }
    }

    fn log_status(&self, wallet_balance_usd: f64) {
        let snapshot = PortfolioSnapshot {
            wallet_balance_usd,
            open_positions: self.positions.open_count(),
            deployed_usd: self.positions.deployed_usd(),
            hedged_positions: self.positions.hedged_count(),
            total_hedge_usd: self.positions.total_hedge_usd(),
        };
        let health = self.risk.portfolio_health(&snapshot);
        let reserve = self.reserve.state();
        let cooldowns = self.cooldowns.stats();
        let hedge = self.hedge_policy.current_params();

        info!(
            cycle = %self.cycle.load(Ordering::SeqCst),
            wallet_usd = %format!("{:.2}", wallet_balance_usd),
            effective_bankroll = %format!("{:.2}", self.reserve.effective_bankroll(wallet_balance_usd)),
            open_positions = %snapshot.open_positions,
            deployed_usd = %format!("{:.2}", snapshot.deployed_usd),
            hedged = %snapshot.hedged_positions,
            hedge_usd = %format!("{:.2}", snapshot.total_hedge_usd),
            reserve_fraction = %format!("{:.3}", reserve.adapted_fraction),
            hedge_trigger_cents = %format!("{:.1}", hedge.trigger_cents),
            vol_regime = %hedge.regime,
            cooldown_entries = %cooldowns.active_entries,
            cooldown_hits = %cooldowns.cooldown_hits,
            portfolio_health = ?health.status,
            "status"
        );
        for issue in &health.issues {
            info!(issue = %issue, "portfolio issue");
        }
        self.ev.log_status();
    }

    /// Expose the cycle counter for tests and diagnostics.
    pub fn cycles_run(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// One cycle, public for integration tests that drive the loop by hand.
    pub async fn tick(&self) {
        self.run_cycle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The churn engine's cycle composition is exercised end-to-end in
    // tests/engine_cycle.rs with scripted collaborators; the units here
    // cover the pure helpers.

    #[test]
    fn timers_fire_immediately_then_respect_period() {
        let mut slot = None;
        assert!(Timers::due(&mut slot, Duration::from_secs(60)));
        assert!(!Timers::due(&mut slot, Duration::from_secs(60)));
    }
}

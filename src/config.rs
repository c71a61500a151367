//! Engine configuration
//!
//! Flat config with safe defaults, overridable per-field from the
//! environment (CHURN_* variables). Loaded once at startup.

use serde::{Deserialize, Serialize};

/// What liquidation mode sells each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationMode {
    Off,
    /// Only positions with negative unrealized P&L.
    Losing,
    /// Every open position.
    All,
}

impl LiquidationMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "losing" => LiquidationMode::Losing,
            "all" => LiquidationMode::All,
            _ => LiquidationMode::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // === Capital ===
    pub max_trade_usd: f64,
    /// Fraction of effective bankroll per entry.
    pub trade_fraction: f64,
    pub max_deployed_fraction_total: f64,
    /// Base reserve fraction; the reserve manager adapts around it.
    pub reserve_fraction: f64,
    pub max_reserve_fraction: f64,
    pub reserve_adaptation_rate: f64,
    pub min_reserve_usd: f64,
    pub min_wallet_balance_usd: f64,

    // === Bands (cents) ===
    pub entry_band_cents: f64,
    pub tp_cents: f64,
    pub hedge_trigger_cents: f64,
    pub max_adverse_cents: f64,
    pub max_hold_seconds: i64,
    pub entry_buffer_cents: f64,
    pub min_entry_cents: f64,
    pub max_entry_cents: f64,
    pub preferred_entry_low_cents: f64,
    pub preferred_entry_high_cents: f64,
    pub max_ask_cents: f64,
    pub max_spread_cents: f64,

    // === Liquidity gates ===
    pub min_spread_cents: f64,
    pub min_depth_usd_at_exit: f64,
    pub min_trades_last_x: u32,
    pub min_book_updates_last_x: u32,

    // === EV ===
    pub rolling_window_trades: usize,
    pub churn_cost_cents_estimate: f64,
    pub min_ev_cents: f64,
    pub min_profit_factor: f64,
    pub pause_seconds: i64,
    pub adaptive_ev_enabled: bool,

    // === Bias ===
    pub bias_window_seconds: i64,
    pub bias_min_net_usd: f64,
    pub bias_min_trades: u32,
    pub bias_stale_seconds: i64,
    pub copy_any_whale_buy: bool,
    /// Conservative mode applies the min-trades / min-net filters.
    pub conservative_bias: bool,

    // === Position / hedge limits ===
    pub max_open_positions_total: usize,
    pub max_open_positions_per_market: usize,
    pub max_hedge_ratio: f64,
    pub max_hedged_positions: usize,
    pub max_total_hedge_usd: f64,
    pub max_global_hedge_exposure: f64,
    pub hedge_cooldown_seconds: i64,

    // === Execution ===
    pub cooldown_seconds_per_token: i64,
    pub base_slippage_pct: f64,
    pub order_timeout_ms: u64,

    // === Modes ===
    pub live_trading_enabled: bool,
    pub liquidation_mode: LiquidationMode,
    pub liquidation_max_slippage_pct: f64,

    // === Loop cadence ===
    pub scan_interval_seconds: i64,
    pub balance_refresh_seconds: u64,
    pub redemption_interval_seconds: i64,
    pub status_interval_seconds: i64,

    // === Wallets to copy ===
    pub watched_wallets: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_trade_usd: 25.0,
            trade_fraction: 0.05,
            max_deployed_fraction_total: 0.50,
            reserve_fraction: 0.25,
            max_reserve_fraction: 0.50,
            reserve_adaptation_rate: 0.20,
            min_reserve_usd: 10.0,
            min_wallet_balance_usd: 50.0,

            entry_band_cents: 2.0,
            tp_cents: 14.0,
            hedge_trigger_cents: 10.0,
            max_adverse_cents: 30.0,
            max_hold_seconds: 900,
            entry_buffer_cents: 5.0,
            min_entry_cents: 20.0,
            max_entry_cents: 80.0,
            preferred_entry_low_cents: 35.0,
            preferred_entry_high_cents: 65.0,
            max_ask_cents: 95.0,
            max_spread_cents: 10.0,

            min_spread_cents: 6.0,
            min_depth_usd_at_exit: 50.0,
            min_trades_last_x: 3,
            min_book_updates_last_x: 5,

            rolling_window_trades: 50,
            churn_cost_cents_estimate: 2.0,
            min_ev_cents: 0.5,
            min_profit_factor: 1.1,
            pause_seconds: 300,
            adaptive_ev_enabled: true,

            bias_window_seconds: 600,
            bias_min_net_usd: 500.0,
            bias_min_trades: 2,
            bias_stale_seconds: 300,
            copy_any_whale_buy: false,
            conservative_bias: true,

            max_open_positions_total: 5,
            max_open_positions_per_market: 1,
            max_hedge_ratio: 0.75,
            max_hedged_positions: 3,
            max_total_hedge_usd: 100.0,
            max_global_hedge_exposure: 0.50,
            hedge_cooldown_seconds: 30,

            cooldown_seconds_per_token: 120,
            base_slippage_pct: 0.02,
            order_timeout_ms: 10_000,

            live_trading_enabled: false,
            liquidation_mode: LiquidationMode::Off,
            liquidation_max_slippage_pct: 0.15,

            scan_interval_seconds: 30,
            balance_refresh_seconds: 15,
            redemption_interval_seconds: 600,
            status_interval_seconds: 300,

            watched_wallets: Vec::new(),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let d = Self::default();

        Self {
            max_trade_usd: env_f64("CHURN_MAX_TRADE_USD", d.max_trade_usd),
            trade_fraction: env_f64("CHURN_TRADE_FRACTION", d.trade_fraction),
            max_deployed_fraction_total: env_f64(
                "CHURN_MAX_DEPLOYED_FRACTION_TOTAL",
                d.max_deployed_fraction_total,
            ),
            reserve_fraction: env_f64("CHURN_RESERVE_FRACTION", d.reserve_fraction),
            max_reserve_fraction: env_f64("CHURN_MAX_RESERVE_FRACTION", d.max_reserve_fraction),
            reserve_adaptation_rate: env_f64(
                "CHURN_RESERVE_ADAPTATION_RATE",
                d.reserve_adaptation_rate,
            ),
            min_reserve_usd: env_f64("CHURN_MIN_RESERVE_USD", d.min_reserve_usd),
            min_wallet_balance_usd: env_f64(
                "CHURN_MIN_WALLET_BALANCE_USD",
                d.min_wallet_balance_usd,
            ),

            entry_band_cents: env_f64("CHURN_ENTRY_BAND_CENTS", d.entry_band_cents),
            tp_cents: env_f64("CHURN_TP_CENTS", d.tp_cents),
            hedge_trigger_cents: env_f64("CHURN_HEDGE_TRIGGER_CENTS", d.hedge_trigger_cents),
            max_adverse_cents: env_f64("CHURN_MAX_ADVERSE_CENTS", d.max_adverse_cents),
            max_hold_seconds: env_i64("CHURN_MAX_HOLD_SECONDS", d.max_hold_seconds),
            entry_buffer_cents: env_f64("CHURN_ENTRY_BUFFER_CENTS", d.entry_buffer_cents),
            min_entry_cents: env_f64("CHURN_MIN_ENTRY_CENTS", d.min_entry_cents),
            max_entry_cents: env_f64("CHURN_MAX_ENTRY_CENTS", d.max_entry_cents),
            preferred_entry_low_cents: env_f64(
                "CHURN_PREFERRED_ENTRY_LOW_CENTS",
                d.preferred_entry_low_cents,
            ),
            preferred_entry_high_cents: env_f64(
                "CHURN_PREFERRED_ENTRY_HIGH_CENTS",
                d.preferred_entry_high_cents,
            ),
            max_ask_cents: env_f64("CHURN_MAX_ASK_CENTS", d.max_ask_cents),
            max_spread_cents: env_f64("CHURN_MAX_SPREAD_CENTS", d.max_spread_cents),

            min_spread_cents: env_f64("CHURN_MIN_SPREAD_CENTS", d.min_spread_cents),
            min_depth_usd_at_exit: env_f64("CHURN_MIN_DEPTH_USD_AT_EXIT", d.min_depth_usd_at_exit),
            min_trades_last_x: env_u32("CHURN_MIN_TRADES_LAST_X", d.min_trades_last_x),
            min_book_updates_last_x: env_u32(
                "CHURN_MIN_BOOK_UPDATES_LAST_X",
                d.min_book_updates_last_x,
            ),

            rolling_window_trades: env_usize("CHURN_ROLLING_WINDOW_TRADES", d.rolling_window_trades),
            churn_cost_cents_estimate: env_f64(
                "CHURN_COST_CENTS_ESTIMATE",
                d.churn_cost_cents_estimate,
            ),
            min_ev_cents: env_f64("CHURN_MIN_EV_CENTS", d.min_ev_cents),
            min_profit_factor: env_f64("CHURN_MIN_PROFIT_FACTOR", d.min_profit_factor),
            pause_seconds: env_i64("CHURN_PAUSE_SECONDS", d.pause_seconds),
            adaptive_ev_enabled: env_bool("CHURN_ADAPTIVE_EV_ENABLED", d.adaptive_ev_enabled),

            bias_window_seconds: env_i64("CHURN_BIAS_WINDOW_SECONDS", d.bias_window_seconds),
            bias_min_net_usd: env_f64("CHURN_BIAS_MIN_NET_USD", d.bias_min_net_usd),
            bias_min_trades: env_u32("CHURN_BIAS_MIN_TRADES", d.bias_min_trades),
            bias_stale_seconds: env_i64("CHURN_BIAS_STALE_SECONDS", d.bias_stale_seconds),
            copy_any_whale_buy: env_bool("CHURN_COPY_ANY_WHALE_BUY", d.copy_any_whale_buy),
            conservative_bias: env_bool("CHURN_CONSERVATIVE_BIAS", d.conservative_bias),

            max_open_positions_total: env_usize(
                "CHURN_MAX_OPEN_POSITIONS_TOTAL",
                d.max_open_positions_total,
            ),
            max_open_positions_per_market: env_usize(
                "CHURN_MAX_OPEN_POSITIONS_PER_MARKET",
                d.max_open_positions_per_market,
            ),
            max_hedge_ratio: env_f64("CHURN_MAX_HEDGE_RATIO", d.max_hedge_ratio),
            max_hedged_positions: env_usize("CHURN_MAX_HEDGED_POSITIONS", d.max_hedged_positions),
            max_total_hedge_usd: env_f64("CHURN_MAX_TOTAL_HEDGE_USD", d.max_total_hedge_usd),
            max_global_hedge_exposure: env_f64(
                "CHURN_MAX_GLOBAL_HEDGE_EXPOSURE",
                d.max_global_hedge_exposure,
            ),
            hedge_cooldown_seconds: env_i64(
                "CHURN_HEDGE_COOLDOWN_SECONDS",
                d.hedge_cooldown_seconds,
            ),

            cooldown_seconds_per_token: env_i64(
                "CHURN_COOLDOWN_SECONDS_PER_TOKEN",
                d.cooldown_seconds_per_token,
            ),
            base_slippage_pct: env_f64("CHURN_BASE_SLIPPAGE_PCT", d.base_slippage_pct),
            order_timeout_ms: env_u64("CHURN_ORDER_TIMEOUT_MS", d.order_timeout_ms),

            live_trading_enabled: env_bool("CHURN_LIVE_TRADING_ENABLED", d.live_trading_enabled),
            liquidation_mode: std::env::var("CHURN_LIQUIDATION_MODE")
                .map(|v| LiquidationMode::parse(&v))
                .unwrap_or(d.liquidation_mode),
            liquidation_max_slippage_pct: env_f64(
                "CHURN_LIQUIDATION_MAX_SLIPPAGE_PCT",
                d.liquidation_max_slippage_pct,
            ),

            scan_interval_seconds: env_i64("CHURN_SCAN_INTERVAL_SECONDS", d.scan_interval_seconds),
            balance_refresh_seconds: env_u64(
                "CHURN_BALANCE_REFRESH_SECONDS",
                d.balance_refresh_seconds,
            ),
            redemption_interval_seconds: env_i64(
                "CHURN_REDEMPTION_INTERVAL_SECONDS",
                d.redemption_interval_seconds,
            ),
            status_interval_seconds: env_i64(
                "CHURN_STATUS_INTERVAL_SECONDS",
                d.status_interval_seconds,
            ),

            watched_wallets: std::env::var("CHURN_WATCHED_WALLETS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.trade_fraction > 0.0 && c.trade_fraction < 1.0);
        assert!(c.min_entry_cents < c.preferred_entry_low_cents);
        assert!(c.preferred_entry_high_cents < c.max_entry_cents);
        assert!(c.max_hedge_ratio <= 1.0);
        assert_eq!(c.liquidation_mode, LiquidationMode::Off);
    }

    #[test]
    fn liquidation_mode_parses() {
        assert_eq!(LiquidationMode::parse("losing"), LiquidationMode::Losing);
        assert_eq!(LiquidationMode::parse("ALL"), LiquidationMode::All);
        assert_eq!(LiquidationMode::parse("nonsense"), LiquidationMode::Off);
    }
}

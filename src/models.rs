//! Shared domain models
//!
//! Wire prices are decimals in [0, 1]; engine thresholds and P&L are in
//! cents. Conversion happens at the snapshot boundary and nowhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// One price level of a CLOB book. Prices in [0, 1], sizes in shares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<Order>,
    #[serde(default)]
    pub asks: Vec<Order>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|o| o.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|o| o.price)
    }
}

/// Polymarket returns prices/sizes as strings or numbers depending on the
/// endpoint; accept both.
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("invalid float string")),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

/// Where a book snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSource {
    WsCache,
    Rest,
    AltRest,
}

impl std::fmt::Display for BookSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookSource::WsCache => write!(f, "WS_CACHE"),
            BookSource::Rest => write!(f, "REST"),
            BookSource::AltRest => write!(f, "ALT_REST"),
        }
    }
}

/// One fetch attempt against one source. Consumed immediately, never retained.
#[derive(Debug, Clone)]
pub struct OrderBookSnapshot {
    pub source: BookSource,
    pub token_id: String,
    /// Bids sorted strictly descending by price.
    pub bids: Vec<Order>,
    /// Asks sorted strictly ascending by price.
    pub asks: Vec<Order>,
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub parsed_ok: bool,
    /// The fetch itself errored or timed out. Implies `parsed_ok == false`.
    pub fetch_failed: bool,
    pub fetched_at: DateTime<Utc>,
    pub attempt_id: Uuid,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|o| o.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|o| o.price)
    }

    pub fn best_bid_cents(&self) -> Option<f64> {
        self.best_bid().map(|p| p * 100.0)
    }

    pub fn best_ask_cents(&self) -> Option<f64> {
        self.best_ask().map(|p| p * 100.0)
    }

    pub fn spread_cents(&self) -> Option<f64> {
        match (self.best_bid_cents(), self.best_ask_cents()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    pub fn mid_cents(&self) -> Option<f64> {
        match (self.best_bid_cents(), self.best_ask_cents()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    /// USD notional resting on the bid side.
    pub fn bid_depth_usd(&self) -> f64 {
        self.bids.iter().map(|o| o.price * o.size).sum()
    }

    pub fn ask_depth_usd(&self) -> f64 {
        self.asks.iter().map(|o| o.price * o.size).sum()
    }
}

/// Health classification of a single snapshot. Exactly one per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookHealth {
    Ok,
    EmptyBook,
    DustBook,
    WideSpread,
    AskTooHigh,
    NoData,
    ParseError,
    BookFetchFailed,
}

impl std::fmt::Display for BookHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookHealth::Ok => "OK",
            BookHealth::EmptyBook => "EMPTY_BOOK",
            BookHealth::DustBook => "DUST_BOOK",
            BookHealth::WideSpread => "WIDE_SPREAD",
            BookHealth::AskTooHigh => "ASK_TOO_HIGH",
            BookHealth::NoData => "NO_DATA",
            BookHealth::ParseError => "PARSE_ERROR",
            BookHealth::BookFetchFailed => "BOOK_FETCH_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Health plus the numbers that drove the classification.
#[derive(Debug, Clone)]
pub struct BookHealthReport {
    pub health: BookHealth,
    pub best_bid_cents: Option<f64>,
    pub best_ask_cents: Option<f64>,
    pub spread_cents: Option<f64>,
    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl BookHealthReport {
    pub fn is_ok(&self) -> bool {
        self.health == BookHealth::Ok
    }
}

/// Position direction. SHORT is never entered on a long-only venue; it only
/// exists as a flip signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

/// Net whale-flow direction on a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiasDirection {
    Long,
    Short,
    None,
}

/// Wire order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order time-in-force supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Fok,
    Gtc,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Fok => "FOK",
            OrderType::Gtc => "GTC",
        }
    }
}

/// One whale trade observed on the leaderboard or on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardTrade {
    pub trade_id: String,
    pub wallet: String,
    pub token_id: String,
    pub side: OrderSide,
    pub size_usd: f64,
    /// Fill price in [0, 1].
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Why a position is being exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    HardExit,
    TimeStop,
    BiasFlip,
    EvDegraded,
    Liquidation,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::HardExit => "HARD_EXIT",
            ExitReason::TimeStop => "TIME_STOP",
            ExitReason::BiasFlip => "BIAS_FLIP",
            ExitReason::EvDegraded => "EV_DEGRADED",
            ExitReason::Liquidation => "LIQUIDATION",
        };
        write!(f, "{}", s)
    }
}

/// How fast an exit needs to happen; maps to the slippage band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Medium,
    Critical,
}

/// Market-data failure taxonomy. Transient reasons may be routed to the
/// cooldown manager; permanent market conditions must not be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MarketDataFailure {
    #[error("NO_ORDERBOOK")]
    NoOrderbook,
    #[error("NOT_FOUND")]
    NotFound,
    #[error("RATE_LIMIT")]
    RateLimit,
    #[error("NETWORK_ERROR")]
    NetworkError,
    #[error("PARSE_ERROR")]
    ParseError,
    #[error("INVALID_LIQUIDITY")]
    InvalidLiquidity,
    #[error("DUST_BOOK")]
    DustBook,
    #[error("INVALID_PRICES")]
    InvalidPrices,
}

impl MarketDataFailure {
    /// Short-lived faults that deserve a brief backoff without strikes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketDataFailure::RateLimit
                | MarketDataFailure::NetworkError
                | MarketDataFailure::ParseError
        )
    }

    /// Persistent absence of a book; escalates through the backoff schedule.
    pub fn is_long_cooldown(&self) -> bool {
        matches!(
            self,
            MarketDataFailure::NoOrderbook | MarketDataFailure::NotFound
        )
    }

    /// Permanent market conditions. Never a cooldown cause; the scanner just
    /// keeps moving.
    pub fn is_permanent_condition(&self) -> bool {
        matches!(
            self,
            MarketDataFailure::InvalidLiquidity
                | MarketDataFailure::DustBook
                | MarketDataFailure::InvalidPrices
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderbook_parses_string_and_number_levels() {
        let raw =
            r#"{"bids":[{"price":"0.48","size":"100"}],"asks":[{"price":0.52,"size":250.0}]}"#;
        let book: OrderBook = serde_json::from_str(raw).unwrap();
        assert_eq!(book.best_bid(), Some(0.48));
        assert_eq!(book.best_ask(), Some(0.52));
        assert_eq!(book.asks[0].size, 250.0);
    }

    #[test]
    fn failure_taxonomy_partitions() {
        use MarketDataFailure::*;
        for r in [NoOrderbook, NotFound, RateLimit, NetworkError, ParseError] {
            assert!(!r.is_permanent_condition());
        }
        for r in [InvalidLiquidity, DustBook, InvalidPrices] {
            assert!(r.is_permanent_condition());
            assert!(!r.is_transient());
            assert!(!r.is_long_cooldown());
        }
    }
}

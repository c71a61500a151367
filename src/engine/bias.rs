//! Whale-flow bias accumulator
//!
//! Folds de-duplicated whale trades into a per-token sliding window of net
//! signed USD flow. The sign of the window is the bias; a quiet window goes
//! stale and stops producing signals.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::models::{BiasDirection, LeaderboardTrade, OrderSide};

#[derive(Debug, Clone, Serialize)]
pub struct TokenBias {
    pub token_id: String,
    pub direction: BiasDirection,
    pub net_usd: f64,
    pub trade_count: u32,
    pub last_activity: DateTime<Utc>,
    pub is_stale: bool,
}

#[derive(Debug, Clone)]
pub struct BiasConfig {
    pub window_seconds: i64,
    pub min_net_usd: f64,
    pub min_trades: u32,
    pub stale_seconds: i64,
    pub copy_any_whale_buy: bool,
    /// Conservative mode applies the min-trades / min-net filters.
    pub conservative: bool,
}

#[derive(Debug, Clone, Copy)]
struct WindowTrade {
    at: DateTime<Utc>,
    signed_usd: f64,
}

#[derive(Debug, Default)]
struct TokenWindow {
    trades: Vec<WindowTrade>,
    last_activity: Option<DateTime<Utc>>,
}

pub struct BiasAccumulator {
    config: BiasConfig,
    windows: Mutex<HashMap<String, TokenWindow>>,
}

impl BiasAccumulator {
    pub fn new(config: BiasConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Fold in a batch of (already de-duplicated) whale trades.
    pub fn ingest(&self, trades: &[LeaderboardTrade]) {
        if trades.is_empty() {
            return;
        }
        let mut windows = self.windows.lock();
        for trade in trades {
            let signed = match trade.side {
                OrderSide::Buy => trade.size_usd,
                OrderSide::Sell => -trade.size_usd,
            };
            let window = windows.entry(trade.token_id.clone()).or_default();
            window.trades.push(WindowTrade {
                at: trade.timestamp,
                signed_usd: signed,
            });
            let newest = window.last_activity.map_or(trade.timestamp, |t| t.max(trade.timestamp));
            window.last_activity = Some(newest);
        }

        let cutoff = Utc::now() - Duration::seconds(self.config.window_seconds);
        windows.retain(|_, w| {
            w.trades.retain(|t| t.at >= cutoff);
            !w.trades.is_empty()
        });
        debug!(tokens = windows.len(), "bias windows updated");
    }

    fn bias_of(&self, token_id: &str, window: &TokenWindow, now: DateTime<Utc>) -> TokenBias {
        let cutoff = now - Duration::seconds(self.config.window_seconds);
        let live: Vec<&WindowTrade> = window.trades.iter().filter(|t| t.at >= cutoff).collect();
        let net_usd: f64 = live.iter().map(|t| t.signed_usd).sum();
        let last_activity = window.last_activity.unwrap_or(now);
        let is_stale =
            (now - last_activity).num_seconds() > self.config.stale_seconds || live.is_empty();

        let direction = if self.config.copy_any_whale_buy {
            // Copy mode: any live buy is a long signal.
            if !is_stale && live.iter().any(|t| t.signed_usd > 0.0) {
                BiasDirection::Long
            } else {
                BiasDirection::None
            }
        } else if net_usd > 0.0 {
            BiasDirection::Long
        } else if net_usd < 0.0 {
            BiasDirection::Short
        } else {
            BiasDirection::None
        };

        TokenBias {
            token_id: token_id.to_string(),
            direction,
            net_usd,
            trade_count: live.len() as u32,
            last_activity,
            is_stale,
        }
    }

    pub fn get_bias(&self, token_id: &str) -> Option<TokenBias> {
        let windows = self.windows.lock();
        let window = windows.get(token_id)?;
        Some(self.bias_of(token_id, window, Utc::now()))
    }

    /// Live signals, strongest flow first. Conservative mode drops tokens
    /// under the trade-count or net-flow thresholds.
    pub fn active_biases(&self) -> Vec<TokenBias> {
        let now = Utc::now();
        let windows = self.windows.lock();
        let mut out: Vec<TokenBias> = windows
            .iter()
            .map(|(token, window)| self.bias_of(token, window, now))
            .filter(|b| !b.is_stale && b.direction != BiasDirection::None)
            .filter(|b| {
                if self.config.copy_any_whale_buy {
                    return true;
                }
                if !self.config.conservative {
                    return true;
                }
                b.trade_count >= self.config.min_trades && b.net_usd.abs() >= self.config.min_net_usd
            })
            .collect();
        out.sort_by(|a, b| {
            b.net_usd
                .abs()
                .partial_cmp(&a.net_usd.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }
}

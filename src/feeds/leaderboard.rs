//! Leaderboard whale-trade feed
//!
//! Polls recent fills of watched wallets. The on-chain monitor surfaces the
//! same trades earlier; the deduper collapses the two feeds before the bias
//! accumulator sees them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

use crate::models::{LeaderboardTrade, OrderSide};

#[async_trait]
pub trait LeaderboardFeed: Send + Sync {
    /// Fetch trades since the last poll. Order is oldest-first; duplicates
    /// across polls are the deduper's problem, not the feed's.
    async fn poll_trades(&self) -> anyhow::Result<Vec<LeaderboardTrade>>;
}

const DATA_API_HOST: &str = "https://data-api.polymarket.com";

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "transactionHash", alias = "id", default)]
    id: String,
    #[serde(rename = "proxyWallet", alias = "wallet", default)]
    wallet: String,
    #[serde(rename = "asset", alias = "token_id", default)]
    token_id: String,
    #[serde(default)]
    side: String,
    #[serde(deserialize_with = "crate::models::de_f64", default)]
    size: f64,
    #[serde(deserialize_with = "crate::models::de_f64", default)]
    price: f64,
    #[serde(default)]
    timestamp: i64,
}

/// Polling client over the data API.
pub struct HttpLeaderboardFeed {
    client: Client,
    host: String,
    watched_wallets: Vec<String>,
    page_limit: usize,
}

impl HttpLeaderboardFeed {
    pub fn new(watched_wallets: Vec<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            host: DATA_API_HOST.to_string(),
            watched_wallets,
            page_limit: 50,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn convert(raw: RawTrade) -> Option<LeaderboardTrade> {
        if raw.token_id.is_empty() || raw.price <= 0.0 || raw.size <= 0.0 {
            return None;
        }
        let side = match raw.side.to_ascii_uppercase().as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            _ => return None,
        };
        let timestamp = DateTime::<Utc>::from_timestamp(raw.timestamp, 0)?;
        Some(LeaderboardTrade {
            trade_id: raw.id,
            wallet: raw.wallet,
            token_id: raw.token_id,
            side,
            size_usd: raw.size * raw.price,
            price: raw.price,
            timestamp,
        })
    }
}

#[async_trait]
impl LeaderboardFeed for HttpLeaderboardFeed {
    async fn poll_trades(&self) -> anyhow::Result<Vec<LeaderboardTrade>> {
        let mut out = Vec::new();

        for wallet in &self.watched_wallets {
            let url = format!("{}/trades", self.host);
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("user", wallet.as_str()),
                    ("limit", &self.page_limit.to_string()),
                ])
                .send()
                .await?;

            if !response.status().is_success() {
                debug!(wallet = %wallet, status = %response.status(), "trade poll failed");
                continue;
            }

            let raw: Vec<RawTrade> = response.json().await.unwrap_or_default();
            out.extend(raw.into_iter().filter_map(Self::convert));
        }

        out.sort_by_key(|t| t.timestamp);
        Ok(out)
    }
}

/// De-duplicates whale trades across the leaderboard and on-chain feeds.
/// Identity is (wallet, token, timestamp, size); the same fill surfaces on
/// both with different trade ids.
pub struct TradeDeduper {
    seen: HashSet<(String, String, i64, i64)>,
    order: VecDeque<(String, String, i64, i64)>,
    max_entries: usize,
}

impl TradeDeduper {
    pub fn new(max_entries: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn key(trade: &LeaderboardTrade) -> (String, String, i64, i64) {
        (
            trade.wallet.clone(),
            trade.token_id.clone(),
            trade.timestamp.timestamp(),
            (trade.size_usd * 100.0).round() as i64,
        )
    }

    /// Keep only first sightings, in input order.
    pub fn dedup(&mut self, trades: Vec<LeaderboardTrade>) -> Vec<LeaderboardTrade> {
        let mut fresh = Vec::new();
        for trade in trades {
            let key = Self::key(&trade);
            if self.seen.insert(key.clone()) {
                self.order.push_back(key);
                fresh.push(trade);
            }
        }
        while self.order.len() > self.max_entries {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(wallet: &str, token: &str, ts: i64, size_usd: f64) -> LeaderboardTrade {
        LeaderboardTrade {
            trade_id: format!("{}:{}:{}", wallet, token, ts),
            wallet: wallet.to_string(),
            token_id: token.to_string(),
            side: OrderSide::Buy,
            size_usd,
            price: 0.5,
            timestamp: DateTime::<Utc>::from_timestamp(ts, 0).unwrap(),
        }
    }

    #[test]
    fn same_fill_from_two_feeds_collapses() {
        let mut deduper = TradeDeduper::new(100);
        let api = trade("whale", "tok", 1_700_000_000, 250.0);
        let mut chain = api.clone();
        chain.trade_id = "chain:abc".to_string();

        let fresh = deduper.dedup(vec![api, chain]);
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn distinct_fills_pass() {
        let mut deduper = TradeDeduper::new(100);
        let fresh = deduper.dedup(vec![
            trade("whale", "tok", 1_700_000_000, 250.0),
            trade("whale", "tok", 1_700_000_005, 250.0),
            trade("whale", "other", 1_700_000_000, 250.0),
        ]);
        assert_eq!(fresh.len(), 3);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut deduper = TradeDeduper::new(2);
        deduper.dedup(vec![
            trade("a", "t", 1, 1.0),
            trade("b", "t", 2, 1.0),
            trade("c", "t", 3, 1.0),
        ]);
        assert!(deduper.seen.len() <= 2);
    }
}

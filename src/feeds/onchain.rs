//! On-chain monitor contract and position sync
//!
//! The chain watcher runs outside this crate and pushes events over a
//! channel: whale fills seen in the mempool before the leaderboard reports
//! them, and position changes that invalidate the local position view.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::models::LeaderboardTrade;

#[derive(Debug, Clone)]
pub enum OnChainEvent {
    WhaleTrade(LeaderboardTrade),
    /// A wallet's holdings changed; the cached position view is dirty.
    PositionChange {
        wallet: String,
        token_id: String,
    },
}

/// Receiving half of the chain watcher channel. Drained once per cycle.
pub struct OnChainMonitor {
    rx: Mutex<mpsc::UnboundedReceiver<OnChainEvent>>,
}

impl OnChainMonitor {
    pub fn channel() -> (mpsc::UnboundedSender<OnChainEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Mutex::new(rx) })
    }

    /// Non-blocking drain of everything queued since the last cycle.
    pub fn drain(&self) -> Vec<OnChainEvent> {
        let mut rx = self.rx.lock();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// One holding as reported by the venue's position view.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainPosition {
    #[serde(rename = "asset", alias = "token_id", default)]
    pub token_id: String,
    #[serde(deserialize_with = "crate::models::de_f64", default)]
    pub size: f64,
    #[serde(rename = "avgPrice", alias = "avg_price", deserialize_with = "crate::models::de_f64", default)]
    pub avg_price: f64,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(rename = "curPrice", alias = "cur_price", default)]
    pub current_price: Option<f64>,
}

#[async_trait]
pub trait PositionFetcher: Send + Sync {
    async fn fetch_positions(&self) -> anyhow::Result<Vec<ChainPosition>>;
}

const DATA_API_HOST: &str = "https://data-api.polymarket.com";

pub struct HttpPositionFetcher {
    client: Client,
    host: String,
    wallet: String,
}

impl HttpPositionFetcher {
    pub fn new(wallet: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            host: DATA_API_HOST.to_string(),
            wallet,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

#[async_trait]
impl PositionFetcher for HttpPositionFetcher {
    async fn fetch_positions(&self) -> anyhow::Result<Vec<ChainPosition>> {
        let url = format!("{}/positions", self.host);
        let response = self
            .client
            .get(&url)
            .query(&[("user", self.wallet.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("positions request failed ({})", status);
        }

        let positions: Vec<ChainPosition> = response.json().await?;
        Ok(positions
            .into_iter()
            .filter(|p| !p.token_id.is_empty() && p.size > 0.0)
            .collect())
    }
}

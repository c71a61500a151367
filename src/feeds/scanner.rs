//! High-volume market scanner
//!
//! Produces candidate tokens when whale flow is quiet. Scanner entries are
//! always long; the engine's gates do the actual vetting.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait MarketScanner: Send + Sync {
    /// Token ids of the busiest markets, best first.
    async fn scan_top_tokens(&self, limit: usize) -> anyhow::Result<Vec<String>>;
}

const GAMMA_HOST: &str = "https://gamma-api.polymarket.com";

#[derive(Debug, Deserialize)]
struct ScanMarket {
    #[serde(rename = "clobTokenIds", alias = "clob_token_ids", default)]
    clob_token_ids: Option<serde_json::Value>,
    #[serde(rename = "volume24hr", alias = "volume_24hr", default)]
    volume_24hr: Option<f64>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    closed: bool,
}

pub struct HttpMarketScanner {
    client: Client,
    host: String,
}

impl HttpMarketScanner {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            host: GAMMA_HOST.to_string(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

impl Default for HttpMarketScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketScanner for HttpMarketScanner {
    async fn scan_top_tokens(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let url = format!("{}/markets", self.host);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("active", "true"),
                ("closed", "false"),
                ("order", "volume24hr"),
                ("ascending", "false"),
                ("limit", "50"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("scan request failed ({})", response.status());
        }

        let markets: Vec<ScanMarket> = response.json().await?;
        let mut tokens = Vec::new();
        for market in markets {
            if !market.active || market.closed || market.volume_24hr.unwrap_or(0.0) <= 0.0 {
                continue;
            }
            // First token of the pair is the YES side; that is the one the
            // scanner bids on.
            let first = market.clob_token_ids.as_ref().and_then(|v| match v {
                serde_json::Value::Array(arr) => {
                    arr.first().and_then(|x| x.as_str()).map(str::to_string)
                }
                serde_json::Value::String(s) => serde_json::from_str::<Vec<String>>(s)
                    .ok()
                    .and_then(|ids| ids.into_iter().next()),
                _ => None,
            });
            if let Some(token) = first {
                tokens.push(token);
                if tokens.len() >= limit {
                    break;
                }
            }
        }

        debug!(found = tokens.len(), "market scan complete");
        Ok(tokens)
    }
}

/// Scanner that never finds anything; used when scanning is disabled.
pub struct NullScanner;

#[async_trait]
impl MarketScanner for NullScanner {
    async fn scan_top_tokens(&self, _limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

//! Market metadata lookup
//!
//! Resolves a token id to its market (question, condition id, both outcome
//! tokens). The sibling token of a binary market is what hedges buy.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::client::ClobError;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    pub token_id: String,
    pub outcome_label: String,
    pub outcome_index: usize,
}

#[derive(Debug, Clone)]
pub struct MarketTokenPair {
    pub tokens: Vec<TokenInfo>,
    pub question: String,
    pub condition_id: String,
}

impl MarketTokenPair {
    /// The other outcome token of a binary market, if present.
    pub fn opposite_of(&self, token_id: &str) -> Option<&TokenInfo> {
        if self.tokens.len() != 2 {
            return None;
        }
        self.tokens.iter().find(|t| t.token_id != token_id)
    }
}

#[async_trait]
pub trait MarketMetadata: Send + Sync {
    async fn get_market_token_pair(&self, token_id: &str) -> Result<MarketTokenPair, ClobError>;

    async fn get_opposite_token_id(&self, token_id: &str) -> Result<Option<String>, ClobError> {
        let pair = self.get_market_token_pair(token_id).await?;
        Ok(pair.opposite_of(token_id).map(|t| t.token_id.clone()))
    }
}

const GAMMA_HOST: &str = "https://gamma-api.polymarket.com";

#[derive(Debug, Deserialize)]
struct GammaMarket {
    #[serde(rename = "conditionId", alias = "condition_id", default)]
    condition_id: String,
    #[serde(default)]
    question: String,
    #[serde(rename = "clobTokenIds", alias = "clob_token_ids", default)]
    clob_token_ids: Option<serde_json::Value>,
    #[serde(default)]
    outcomes: Option<serde_json::Value>,
}

/// Metadata over the gamma API with a permanent in-process cache; market
/// token pairs never change once listed.
pub struct HttpMetadataClient {
    client: Client,
    host: String,
    cache: RwLock<HashMap<String, MarketTokenPair>>,
}

impl HttpMetadataClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            host: GAMMA_HOST.to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Gamma sometimes ships list fields as JSON-encoded strings.
    fn string_list(v: &serde_json::Value) -> Vec<String> {
        match v {
            serde_json::Value::Array(arr) => arr
                .iter()
                .filter_map(|x| x.as_str().map(str::to_string))
                .collect(),
            serde_json::Value::String(s) => serde_json::from_str::<Vec<String>>(s).unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

impl Default for HttpMetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketMetadata for HttpMetadataClient {
    async fn get_market_token_pair(&self, token_id: &str) -> Result<MarketTokenPair, ClobError> {
        if let Some(cached) = self.cache.read().get(token_id) {
            return Ok(cached.clone());
        }

        let url = format!("{}/markets", self.host);
        let response = self
            .client
            .get(&url)
            .query(&[("clob_token_ids", token_id)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClobError::Http {
                status: status.as_u16(),
            });
        }

        let markets: Vec<GammaMarket> = response
            .json()
            .await
            .map_err(|e| ClobError::Parse(format!("gamma markets: {}", e)))?;

        let market = markets
            .into_iter()
            .next()
            .ok_or_else(|| ClobError::Parse(format!("no market for token {}", token_id)))?;

        let token_ids = market
            .clob_token_ids
            .as_ref()
            .map(Self::string_list)
            .unwrap_or_default();
        let outcomes = market
            .outcomes
            .as_ref()
            .map(Self::string_list)
            .unwrap_or_default();

        if token_ids.is_empty() {
            return Err(ClobError::Parse(format!(
                "market {} has no token ids",
                market.condition_id
            )));
        }

        let tokens = token_ids
            .into_iter()
            .enumerate()
            .map(|(i, tid)| TokenInfo {
                token_id: tid,
                outcome_label: outcomes.get(i).cloned().unwrap_or_default(),
                outcome_index: i,
            })
            .collect();

        let pair = MarketTokenPair {
            tokens,
            question: market.question,
            condition_id: market.condition_id,
        };

        debug!(token_id = %token_id, condition_id = %pair.condition_id, "market metadata cached");
        self.cache
            .write()
            .insert(token_id.to_string(), pair.clone());
        // Cache under the sibling too; one market, one fetch.
        if let Some(opp) = pair.opposite_of(token_id) {
            self.cache
                .write()
                .insert(opp.token_id.clone(), pair.clone());
        }

        Ok(pair)
    }
}

/// Fixed metadata for tests and paper runs without network.
#[derive(Default)]
pub struct StaticMetadata {
    pairs: RwLock<HashMap<String, MarketTokenPair>>,
}

impl StaticMetadata {
    pub fn insert_pair(&self, yes_token: &str, no_token: &str, question: &str) {
        let pair = MarketTokenPair {
            tokens: vec![
                TokenInfo {
                    token_id: yes_token.to_string(),
                    outcome_label: "Yes".to_string(),
                    outcome_index: 0,
                },
                TokenInfo {
                    token_id: no_token.to_string(),
                    outcome_label: "No".to_string(),
                    outcome_index: 1,
                },
            ],
            question: question.to_string(),
            condition_id: format!("cond:{}", question),
        };
        let mut pairs = self.pairs.write();
        pairs.insert(yes_token.to_string(), pair.clone());
        pairs.insert(no_token.to_string(), pair);
    }
}

#[async_trait]
impl MarketMetadata for StaticMetadata {
    async fn get_market_token_pair(&self, token_id: &str) -> Result<MarketTokenPair, ClobError> {
        self.pairs
            .read()
            .get(token_id)
            .cloned()
            .ok_or_else(|| ClobError::Parse(format!("unknown token {}", token_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opposite_token_resolves_both_ways() {
        let meta = StaticMetadata::default();
        meta.insert_pair("yes", "no", "Will it rain?");

        assert_eq!(
            meta.get_opposite_token_id("yes").await.unwrap().as_deref(),
            Some("no")
        );
        assert_eq!(
            meta.get_opposite_token_id("no").await.unwrap().as_deref(),
            Some("yes")
        );
    }

    #[test]
    fn string_list_accepts_encoded_arrays() {
        let v = serde_json::json!("[\"a\",\"b\"]");
        assert_eq!(HttpMetadataClient::string_list(&v), vec!["a", "b"]);
        let v = serde_json::json!(["x", "y"]);
        assert_eq!(HttpMetadataClient::string_list(&v), vec!["x", "y"]);
    }
}

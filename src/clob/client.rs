//! Polymarket CLOB client
//!
//! REST access to the book endpoint and authenticated order placement with
//! L2 HMAC headers. Wallet/EIP-712 signing lives outside this crate; the
//! client builds the payload and the auth envelope.

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{Order, OrderBook, OrderSide, OrderType};

type HmacSha256 = Hmac<Sha256>;

pub const CLOB_HOST: &str = "https://clob.polymarket.com";

/// Boundary errors, split so the book resolver can classify a failed fetch
/// apart from a malformed-but-delivered response.
#[derive(Debug, thiserror::Error)]
pub enum ClobError {
    #[error("http status {status}")]
    Http { status: u16 },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("missing credentials")]
    NoCredentials,
}

impl From<reqwest::Error> for ClobError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClobError::Timeout
        } else {
            ClobError::Network(e.to_string())
        }
    }
}

/// Arguments for an immediate (market) order. `amount` is USD notional for
/// BUY and shares for SELL, matching the venue convention.
#[derive(Debug, Clone)]
pub struct MarketOrderArgs {
    pub side: OrderSide,
    pub token_id: String,
    pub amount: f64,
    pub price: f64,
}

/// Arguments for a resting limit order. `size` is shares.
#[derive(Debug, Clone)]
pub struct LimitOrderArgs {
    pub side: OrderSide,
    pub token_id: String,
    pub size: f64,
    pub price: f64,
}

/// A built order ready to post. Opaque to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct SignedOrder {
    #[serde(rename = "tokenID")]
    pub token_id: String,
    pub side: String,
    /// Limit price, 4 decimals on the wire.
    pub price: String,
    /// Shares, 6 decimals on the wire.
    pub size: String,
    #[serde(skip)]
    pub price_raw: f64,
    #[serde(skip)]
    pub size_raw: f64,
}

/// Response from the order endpoint. Field names drift across venue
/// versions; aliases cover the observed shapes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostOrderResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "takingAmount", alias = "taking_amount", default)]
    pub taking_amount: Option<String>,
    #[serde(rename = "makingAmount", alias = "making_amount", default)]
    pub making_amount: Option<String>,
    #[serde(rename = "errorMsg", alias = "error", default)]
    pub error_msg: Option<String>,
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id", default)]
    pub order_id: Option<String>,
}

fn amount_is_positive(v: &Option<String>) -> bool {
    v.as_deref()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|x| x > 0.0)
        .unwrap_or(false)
}

impl PostOrderResponse {
    /// A FOK is filled iff the venue says MATCHED/FILLED or reports a
    /// positive taking/making amount. Absence of both means not filled; a
    /// bare `success` flag is not a fill.
    pub fn is_filled(&self) -> bool {
        let status_filled = self
            .status
            .as_deref()
            .map(|s| {
                let s = s.to_ascii_uppercase();
                s == "MATCHED" || s == "FILLED"
            })
            .unwrap_or(false);
        status_filled
            || amount_is_positive(&self.taking_amount)
            || amount_is_positive(&self.making_amount)
    }
}

#[async_trait]
pub trait ClobClient: Send + Sync {
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ClobError>;

    async fn create_market_order(&self, args: MarketOrderArgs) -> Result<SignedOrder, ClobError>;

    async fn create_order(&self, args: LimitOrderArgs) -> Result<SignedOrder, ClobError>;

    async fn post_order(
        &self,
        order: &SignedOrder,
        order_type: OrderType,
    ) -> Result<PostOrderResponse, ClobError>;
}

/// L2 API credentials.
#[derive(Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
    pub wallet_address: String,
}

impl std::fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("api_key", &"[REDACTED]")
            .field("wallet_address", &self.wallet_address)
            .finish()
    }
}

impl ClobCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("POLYMARKET_CLOB_API_KEY").ok()?;
        let secret = std::env::var("POLYMARKET_CLOB_SECRET").ok()?;
        let passphrase = std::env::var("POLYMARKET_CLOB_PASSPHRASE").ok()?;
        let wallet_address = std::env::var("POLYMARKET_WALLET_ADDRESS").unwrap_or_default();

        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
            return None;
        }

        Some(Self {
            api_key,
            secret,
            passphrase,
            wallet_address,
        })
    }
}

/// Live REST client.
#[derive(Debug, Clone)]
pub struct HttpClobClient {
    client: Client,
    host: String,
    creds: Option<ClobCredentials>,
}

impl HttpClobClient {
    pub fn new(creds: Option<ClobCredentials>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            host: CLOB_HOST.to_string(),
            creds,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// HMAC-SHA256 over `timestamp + method + path + body`, URL-safe base64.
    fn sign_request(
        creds: &ClobCredentials,
        method: &str,
        path: &str,
        body: &str,
        timestamp: i64,
    ) -> Result<String, ClobError> {
        let message = format!("{}{}{}{}", timestamp, method, path, body);

        let secret_bytes = URL_SAFE
            .decode(&creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&creds.secret))
            .or_else(|_| BASE64.decode(&creds.secret))
            .map_err(|e| ClobError::Parse(format!("bad CLOB secret: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| ClobError::Parse(format!("HMAC key error: {}", e)))?;
        mac.update(message.as_bytes());

        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(String, String)>, ClobError> {
        let creds = self.creds.as_ref().ok_or(ClobError::NoCredentials)?;
        let timestamp = Utc::now().timestamp();
        let signature = Self::sign_request(creds, method, path, body, timestamp)?;

        Ok(vec![
            ("POLY_ADDRESS".to_string(), creds.wallet_address.clone()),
            ("POLY_API_KEY".to_string(), creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), creds.passphrase.clone()),
        ])
    }

    fn build_order(token_id: &str, side: OrderSide, price: f64, size: f64) -> SignedOrder {
        SignedOrder {
            token_id: token_id.to_string(),
            side: side.as_str().to_string(),
            price: format!("{:.4}", price),
            size: format!("{:.6}", size),
            price_raw: price,
            size_raw: size,
        }
    }
}

/// Parse book levels tolerantly: individual garbage levels are dropped, a
/// non-book payload is a parse error.
fn parse_book_body(body: &str) -> Result<OrderBook, ClobError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ClobError::Parse(format!("book body not JSON: {}", e)))?;

    if !value.is_object() {
        return Err(ClobError::Parse("book body not an object".to_string()));
    }

    let levels = |key: &str| -> Vec<Order> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|lvl| serde_json::from_value::<Order>(lvl.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(OrderBook {
        bids: levels("bids"),
        asks: levels("asks"),
    })
}

#[async_trait]
impl ClobClient for HttpClobClient {
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ClobError> {
        let url = format!("{}/book", self.host);

        let response = self
            .client
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClobError::Http {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        parse_book_body(&body)
    }

    async fn create_market_order(&self, args: MarketOrderArgs) -> Result<SignedOrder, ClobError> {
        if !(args.price.is_finite() && args.price > 0.0 && args.price < 1.0) {
            return Err(ClobError::Rejected(format!("invalid price: {}", args.price)));
        }
        if !(args.amount.is_finite() && args.amount > 0.0) {
            return Err(ClobError::Rejected(format!(
                "invalid amount: {}",
                args.amount
            )));
        }

        // BUY amount is USD notional; convert to shares at the limit price.
        let size = match args.side {
            OrderSide::Buy => args.amount / args.price,
            OrderSide::Sell => args.amount,
        };

        Ok(Self::build_order(&args.token_id, args.side, args.price, size))
    }

    async fn create_order(&self, args: LimitOrderArgs) -> Result<SignedOrder, ClobError> {
        if !(args.price.is_finite() && args.price > 0.0 && args.price < 1.0) {
            return Err(ClobError::Rejected(format!("invalid price: {}", args.price)));
        }
        if !(args.size.is_finite() && args.size > 0.0) {
            return Err(ClobError::Rejected(format!("invalid size: {}", args.size)));
        }

        Ok(Self::build_order(&args.token_id, args.side, args.price, args.size))
    }

    async fn post_order(
        &self,
        order: &SignedOrder,
        order_type: OrderType,
    ) -> Result<PostOrderResponse, ClobError> {
        let start = std::time::Instant::now();

        #[derive(Serialize)]
        struct PostBody<'a> {
            #[serde(flatten)]
            order: &'a SignedOrder,
            #[serde(rename = "orderType")]
            order_type: &'static str,
        }

        let body = serde_json::to_string(&PostBody {
            order,
            order_type: order_type.as_str(),
        })
        .map_err(|e| ClobError::Parse(e.to_string()))?;

        let path = "/order";
        let headers = self.auth_headers("POST", path, &body)?;

        let url = format!("{}{}", self.host, path);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let latency_ms = start.elapsed().as_millis() as u64;

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(
                status = %status,
                error = %error_text,
                latency_ms = %latency_ms,
                token_id = %order.token_id,
                "CLOB order rejected"
            );
            return Err(ClobError::Http {
                status: status.as_u16(),
            });
        }

        let resp_text = response.text().await?;
        let resp: PostOrderResponse = serde_json::from_str(&resp_text)
            .map_err(|e| ClobError::Parse(format!("order response: {}", e)))?;

        debug!(
            token_id = %order.token_id,
            side = %order.side,
            order_type = %order_type.as_str(),
            success = %resp.success,
            status = ?resp.status,
            latency_ms = %latency_ms,
            "CLOB order posted"
        );

        Ok(resp)
    }
}

/// Balance source over the authenticated balance-allowance endpoint. POL
/// gas balance lives on chain and is reported by the external monitor, not
/// here.
pub struct ClobBalanceSource {
    client: HttpClobClient,
}

impl ClobBalanceSource {
    pub fn new(client: HttpClobClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl crate::balance::BalanceSource for ClobBalanceSource {
    async fn fetch_balances(&self) -> anyhow::Result<crate::balance::Balances> {
        let path = "/balance-allowance?signature_type=2";
        let headers = self.client.auth_headers("GET", path, "")?;
        let url = format!("{}{}", self.client.host, path);

        let mut request = self.client.client.get(&url);
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("balance request failed ({}): {}", status, body);
        }

        // {"balance": "123450000", ...}: USDC with 6 decimals, sometimes a
        // plain number.
        let usdc = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                let bal = v.get("balance")?;
                if let Some(n) = bal.as_f64() {
                    return Some(n);
                }
                bal.as_str()?.parse::<f64>().ok().map(|raw| raw / 1_000_000.0)
            })
            .unwrap_or(0.0);

        Ok(crate::balance::Balances { usdc, pol: 0.0 })
    }
}

/// Fill simulation knobs for paper trading.
#[derive(Debug, Clone)]
pub struct PaperFillConfig {
    pub base_latency_ms: u64,
    pub latency_jitter_ms: u64,
    /// Probability a FOK comes back unfilled.
    pub fok_miss_prob: f64,
    /// Probability the venue rejects outright.
    pub reject_prob: f64,
}

impl Default for PaperFillConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 120,
            latency_jitter_ms: 180,
            fok_miss_prob: 0.10,
            reject_prob: 0.02,
        }
    }
}

/// Paper client: real book reads through the inner client, simulated fills.
/// The engine runs the same code path in both modes.
pub struct PaperClobClient<C: ClobClient> {
    inner: C,
    config: PaperFillConfig,
}

impl<C: ClobClient> PaperClobClient<C> {
    pub fn new(inner: C, config: PaperFillConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<C: ClobClient> ClobClient for PaperClobClient<C> {
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ClobError> {
        self.inner.get_order_book(token_id).await
    }

    async fn create_market_order(&self, args: MarketOrderArgs) -> Result<SignedOrder, ClobError> {
        self.inner.create_market_order(args).await
    }

    async fn create_order(&self, args: LimitOrderArgs) -> Result<SignedOrder, ClobError> {
        self.inner.create_order(args).await
    }

    async fn post_order(
        &self,
        order: &SignedOrder,
        order_type: OrderType,
    ) -> Result<PostOrderResponse, ClobError> {
        let mut rng = StdRng::from_entropy();

        let jitter: u64 = rng.gen_range(0..=self.config.latency_jitter_ms);
        tokio::time::sleep(Duration::from_millis(self.config.base_latency_ms + jitter)).await;

        if rng.gen::<f64>() < self.config.reject_prob {
            return Err(ClobError::Rejected("rejected (paper)".to_string()));
        }

        if order_type == OrderType::Fok && rng.gen::<f64>() < self.config.fok_miss_prob {
            // Unfilled FOK: a delivered response with no fill evidence.
            return Ok(PostOrderResponse {
                success: false,
                status: Some("UNMATCHED".to_string()),
                ..Default::default()
            });
        }

        let notional = order.price_raw * order.size_raw;
        info!(
            token_id = %order.token_id,
            side = %order.side,
            price = %order.price,
            notional = %format!("{:.2}", notional),
            order_type = %order_type.as_str(),
            "paper fill"
        );

        Ok(PostOrderResponse {
            success: true,
            status: Some("MATCHED".to_string()),
            taking_amount: Some(format!("{:.6}", order.size_raw)),
            making_amount: Some(format!("{:.6}", notional)),
            error_msg: None,
            order_id: Some(format!("paper:{}", uuid::Uuid::new_v4())),
        })
    }
}

//! Book resolver
//!
//! One public operation: resolve a healthy book for a token. For one
//! attempt, exactly one snapshot drives health, pricing, and order
//! placement; there are no hidden re-fetches. A failed fetch gets one
//! spaced REST retry; a dust/empty primary gets one cross-check read from
//! the alternate source. Every attempt emits one BOOK_CHECK record.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;
use uuid::Uuid;

use crate::clob::{ClobClient, ClobError, MarketDataFacade};
use crate::latency::LatencyMonitor;
use crate::models::{
    BookHealth, BookHealthReport, BookSource, Order, OrderBook, OrderBookSnapshot,
};
use crate::notify::token_prefix;
use crate::pricing::{is_dead_book, is_dust_book};

const RETRY_DELAY_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct ResolvedBook {
    pub success: bool,
    pub snapshot: Option<OrderBookSnapshot>,
    pub health: BookHealthReport,
    pub cross_checked: bool,
    pub cross_check_source: Option<BookSource>,
    pub attempt_id: Uuid,
}

struct FetchOutcome {
    snapshot: OrderBookSnapshot,
    /// The response arrived but its body was not a book.
    body_parse_failed: bool,
}

pub struct BookResolver {
    clob: Arc<dyn ClobClient>,
    market_data: Arc<dyn MarketDataFacade>,
    latency: Arc<LatencyMonitor>,
    max_ask_cents: f64,
}

impl BookResolver {
    pub fn new(
        clob: Arc<dyn ClobClient>,
        market_data: Arc<dyn MarketDataFacade>,
        latency: Arc<LatencyMonitor>,
        max_ask_cents: f64,
    ) -> Self {
        Self {
            clob,
            market_data,
            latency,
            max_ask_cents,
        }
    }

    pub async fn resolve_healthy_book(
        &self,
        token_id: &str,
        flow: &str,
        max_spread_cents: f64,
    ) -> ResolvedBook {
        let attempt_id = Uuid::new_v4();

        // Primary: fresh WS cache wins, otherwise REST.
        let ws_primary = self.ws_snapshot(token_id, attempt_id, false);
        let (mut outcome, primary_source) = match ws_primary {
            Some(outcome) => (outcome, BookSource::WsCache),
            None => (
                self.rest_snapshot(token_id, attempt_id, BookSource::Rest).await,
                BookSource::Rest,
            ),
        };

        // One spaced REST retry on a failed fetch.
        if outcome.snapshot.fetch_failed {
            sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            outcome = self.rest_snapshot(token_id, attempt_id, BookSource::Rest).await;
        }

        let mut health = self.classify(&outcome, max_spread_cents);
        let mut snapshot = outcome.snapshot;
        let mut cross_checked = false;
        let mut cross_check_source = None;

        // Dust/empty on one source is often a partial view; confirm against
        // the other source once before giving up on the market.
        if matches!(health.health, BookHealth::EmptyBook | BookHealth::DustBook) {
            let alternate = match primary_source {
                BookSource::WsCache => {
                    Some(self.rest_snapshot(token_id, attempt_id, BookSource::AltRest).await)
                }
                _ => self.ws_snapshot(token_id, attempt_id, true),
            };

            if let Some(alt_outcome) = alternate {
                let alt_health = self.classify(&alt_outcome, max_spread_cents);
                if alt_health.is_ok() {
                    cross_checked = true;
                    cross_check_source = Some(alt_outcome.snapshot.source);
                    snapshot = alt_outcome.snapshot;
                    health = alt_health;
                }
            }
        }

        let success = health.is_ok();
        info!(
            event = "BOOK_CHECK",
            attempt_id = %attempt_id,
            flow = %flow,
            token_id = %token_prefix(token_id),
            primary_source = %primary_source,
            bids = %health.bid_levels,
            asks = %health.ask_levels,
            best_bid_cents = ?health.best_bid_cents,
            best_ask_cents = ?health.best_ask_cents,
            spread_cents = ?health.spread_cents,
            decision = %health.health,
            healthy = %success,
            cross_checked = %cross_checked,
            latency_ms = %snapshot.latency_ms,
            "book check"
        );

        ResolvedBook {
            success,
            snapshot: if success { Some(snapshot) } else { None },
            health,
            cross_checked,
            cross_check_source,
            attempt_id,
        }
    }

    /// Read the WS cache. `None` when unsubscribed/stale or the cached book
    /// has an empty side; those fall through to REST rather than
    /// classifying a transient cache state as market structure. The relaxed
    /// mode is for cross-checks only and tolerates an older book.
    fn ws_snapshot(&self, token_id: &str, attempt_id: Uuid, relaxed: bool) -> Option<FetchOutcome> {
        let state = if relaxed {
            self.market_data.get_orderbook_state_relaxed(token_id)?
        } else {
            self.market_data.get_orderbook_state(token_id)?
        };
        if state.book.bids.is_empty() || state.book.asks.is_empty() {
            return None;
        }
        Some(FetchOutcome {
            snapshot: Self::snapshot_from_book(
                token_id,
                state.book,
                BookSource::WsCache,
                attempt_id,
                None,
                0,
            ),
            body_parse_failed: false,
        })
    }

    async fn rest_snapshot(
        &self,
        token_id: &str,
        attempt_id: Uuid,
        source: BookSource,
    ) -> FetchOutcome {
        let start = std::time::Instant::now();
        let result = self.clob.get_order_book(token_id).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        self.latency.record_api_latency(latency_ms as f64);

        match result {
            Ok(book) => FetchOutcome {
                snapshot: Self::snapshot_from_book(
                    token_id,
                    book,
                    source,
                    attempt_id,
                    Some(200),
                    latency_ms,
                ),
                body_parse_failed: false,
            },
            Err(ClobError::Parse(_)) => FetchOutcome {
                snapshot: OrderBookSnapshot {
                    source,
                    token_id: token_id.to_string(),
                    bids: Vec::new(),
                    asks: Vec::new(),
                    http_status: Some(200),
                    latency_ms,
                    parsed_ok: false,
                    fetch_failed: false,
                    fetched_at: chrono::Utc::now(),
                    attempt_id,
                },
                body_parse_failed: true,
            },
            Err(e) => {
                let http_status = match &e {
                    ClobError::Http { status } => Some(*status),
                    _ => None,
                };
                FetchOutcome {
                    snapshot: OrderBookSnapshot {
                        source,
                        token_id: token_id.to_string(),
                        bids: Vec::new(),
                        asks: Vec::new(),
                        http_status,
                        latency_ms,
                        parsed_ok: false,
                        fetch_failed: true,
                        fetched_at: chrono::Utc::now(),
                        attempt_id,
                    },
                    body_parse_failed: false,
                }
            }
        }
    }

    fn snapshot_from_book(
        token_id: &str,
        book: OrderBook,
        source: BookSource,
        attempt_id: Uuid,
        http_status: Option<u16>,
        latency_ms: u64,
    ) -> OrderBookSnapshot {
        let mut bids: Vec<Order> = book
            .bids
            .into_iter()
            .filter(|o| o.price.is_finite() && o.size.is_finite() && o.size > 0.0)
            .collect();
        let mut asks: Vec<Order> = book
            .asks
            .into_iter()
            .filter(|o| o.price.is_finite() && o.size.is_finite() && o.size > 0.0)
            .collect();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        let crossed = match (bids.first(), asks.first()) {
            (Some(b), Some(a)) => b.price >= a.price,
            _ => false,
        };
        let parsed_ok = !bids.is_empty() && !asks.is_empty() && !crossed;

        OrderBookSnapshot {
            source,
            token_id: token_id.to_string(),
            bids,
            asks,
            http_status,
            latency_ms,
            parsed_ok,
            fetch_failed: false,
            fetched_at: chrono::Utc::now(),
            attempt_id,
        }
    }

    /// Ordered classification. Exactly one health per snapshot.
    fn classify(&self, outcome: &FetchOutcome, max_spread_cents: f64) -> BookHealthReport {
        let snap = &outcome.snapshot;
        let best_bid = snap.best_bid_cents();
        let best_ask = snap.best_ask_cents();
        let spread = snap.spread_cents();
        let report = |health| BookHealthReport {
            health,
            best_bid_cents: best_bid,
            best_ask_cents: best_ask,
            spread_cents: spread,
            bid_levels: snap.bids.len(),
            ask_levels: snap.asks.len(),
        };

        if snap.fetch_failed {
            return report(BookHealth::BookFetchFailed);
        }
        if outcome.body_parse_failed {
            return report(BookHealth::ParseError);
        }
        if snap.bids.is_empty() || snap.asks.is_empty() {
            return report(BookHealth::NoData);
        }

        let (bid, ask) = match (best_bid, best_ask) {
            (Some(b), Some(a)) => (b, a),
            _ => return report(BookHealth::NoData),
        };
        if bid >= ask {
            return report(BookHealth::ParseError);
        }
        if is_dead_book(bid, ask) {
            return report(BookHealth::EmptyBook);
        }
        if is_dust_book(bid, ask) {
            return report(BookHealth::DustBook);
        }
        if ask > self.max_ask_cents {
            return report(BookHealth::AskTooHigh);
        }
        if ask - bid > max_spread_cents {
            return report(BookHealth::WideSpread);
        }
        report(BookHealth::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clob::{
        LimitOrderArgs, MarketOrderArgs, OrderbookState, PostOrderResponse, SignedOrder,
        WsBookCache,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct MockClob {
        responses: Mutex<VecDeque<Result<OrderBook, ClobError>>>,
        calls: Mutex<u32>,
    }

    impl MockClob {
        fn new(responses: Vec<Result<OrderBook, ClobError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ClobClient for MockClob {
        async fn get_order_book(&self, _token_id: &str) -> Result<OrderBook, ClobError> {
            *self.calls.lock() += 1;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Err(ClobError::Timeout))
        }

        async fn create_market_order(
            &self,
            _args: MarketOrderArgs,
        ) -> Result<SignedOrder, ClobError> {
            Err(ClobError::Rejected("mock".to_string()))
        }

        async fn create_order(&self, _args: LimitOrderArgs) -> Result<SignedOrder, ClobError> {
            Err(ClobError::Rejected("mock".to_string()))
        }

        async fn post_order(
            &self,
            _order: &SignedOrder,
            _order_type: crate::models::OrderType,
        ) -> Result<PostOrderResponse, ClobError> {
            Err(ClobError::Rejected("mock".to_string()))
        }
    }

    fn book(bid: f64, ask: f64) -> OrderBook {
        OrderBook {
            bids: vec![Order { price: bid, size: 400.0 }],
            asks: vec![Order { price: ask, size: 400.0 }],
        }
    }

    fn resolver(clob: Arc<MockClob>, ws: Arc<WsBookCache>) -> BookResolver {
        BookResolver::new(clob, ws, Arc::new(LatencyMonitor::new(0.02)), 95.0)
    }

    #[tokio::test]
    async fn healthy_rest_book_resolves() {
        let clob = Arc::new(MockClob::new(vec![Ok(book(0.48, 0.52))]));
        let ws = Arc::new(WsBookCache::new(5_000));
        let r = resolver(clob, ws);

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert!(resolved.success);
        assert!(!resolved.cross_checked);
        let snap = resolved.snapshot.unwrap();
        assert!(snap.parsed_ok);
        assert_eq!(snap.best_ask_cents(), Some(52.0));
    }

    #[tokio::test]
    async fn fresh_ws_cache_wins_over_rest() {
        let clob = Arc::new(MockClob::new(vec![]));
        let ws = Arc::new(WsBookCache::new(5_000));
        ws.apply_snapshot("tok", book(0.40, 0.44));
        let r = resolver(clob.clone(), ws);

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert!(resolved.success);
        assert_eq!(resolved.snapshot.unwrap().source, BookSource::WsCache);
        assert_eq!(clob.call_count(), 0);
    }

    /// Facade whose strict read misses (stale) while the relaxed
    /// cross-check read still has a real book.
    struct StaleFacade {
        book: OrderBook,
    }

    impl MarketDataFacade for StaleFacade {
        fn get_orderbook_state(&self, _token_id: &str) -> Option<OrderbookState> {
            None
        }

        fn get_orderbook_state_relaxed(&self, token_id: &str) -> Option<OrderbookState> {
            Some(OrderbookState {
                token_id: token_id.to_string(),
                book: self.book.clone(),
                last_update: chrono::Utc::now(),
                trades_last_window: 5,
                updates_last_window: 10,
            })
        }

        fn set_subscriptions(&self, _tokens: std::collections::HashSet<String>) {}

        fn subscriptions(&self) -> std::collections::HashSet<String> {
            std::collections::HashSet::new()
        }
    }

    #[tokio::test]
    async fn dust_rest_primary_recovers_via_ws_cross_check() {
        let clob = Arc::new(MockClob::new(vec![Ok(book(0.01, 0.99))]));
        let facade = Arc::new(StaleFacade {
            book: book(0.48, 0.52),
        });
        let r = BookResolver::new(
            clob.clone(),
            facade,
            Arc::new(LatencyMonitor::new(0.02)),
            95.0,
        );

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert!(resolved.success);
        assert!(resolved.cross_checked);
        assert_eq!(resolved.cross_check_source, Some(BookSource::WsCache));
        let snap = resolved.snapshot.unwrap();
        assert_eq!(snap.source, BookSource::WsCache);
        assert_eq!(snap.best_bid_cents(), Some(48.0));
        // Primary fetched once; the OK result is never re-fetched.
        assert_eq!(clob.call_count(), 1);
    }

    #[tokio::test]
    async fn dead_book_stands_when_no_alternate_exists() {
        let clob = Arc::new(MockClob::new(vec![Ok(book(0.01, 0.99))]));
        let ws = Arc::new(WsBookCache::new(5_000));
        let r = resolver(clob.clone(), ws);

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert!(!resolved.success);
        assert_eq!(resolved.health.health, BookHealth::EmptyBook);
        assert_eq!(clob.call_count(), 1);
    }

    #[tokio::test]
    async fn dust_ws_primary_cross_checks_rest() {
        let clob = Arc::new(MockClob::new(vec![Ok(book(0.48, 0.52))]));
        let ws = Arc::new(WsBookCache::new(5_000));
        ws.apply_snapshot("tok", book(0.01, 0.99));
        let r = resolver(clob.clone(), ws);

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert!(resolved.success);
        assert!(resolved.cross_checked);
        assert_eq!(resolved.cross_check_source, Some(BookSource::AltRest));
        assert_eq!(resolved.snapshot.unwrap().best_bid_cents(), Some(48.0));
    }

    #[tokio::test]
    async fn fetch_failure_retries_once_then_reports() {
        let clob = Arc::new(MockClob::new(vec![
            Err(ClobError::Timeout),
            Err(ClobError::Network("down".to_string())),
        ]));
        let ws = Arc::new(WsBookCache::new(5_000));
        let r = resolver(clob.clone(), ws);

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert!(!resolved.success);
        assert_eq!(resolved.health.health, BookHealth::BookFetchFailed);
        assert_eq!(clob.call_count(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_then_recovery_on_retry() {
        let clob = Arc::new(MockClob::new(vec![
            Err(ClobError::Http { status: 502 }),
            Ok(book(0.48, 0.52)),
        ]));
        let ws = Arc::new(WsBookCache::new(5_000));
        let r = resolver(clob, ws);

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert!(resolved.success);
        assert!(!resolved.cross_checked);
    }

    #[tokio::test]
    async fn crossed_book_is_parse_error() {
        let clob = Arc::new(MockClob::new(vec![Ok(book(0.60, 0.55))]));
        let ws = Arc::new(WsBookCache::new(5_000));
        let r = resolver(clob, ws);

        let resolved = r.resolve_healthy_book("tok", "entry", 6.0).await;
        assert_eq!(resolved.health.health, BookHealth::ParseError);
    }

    #[tokio::test]
    async fn health_ladder_orders_empty_before_dust() {
        let ws = Arc::new(WsBookCache::new(5_000));

        let clob = Arc::new(MockClob::new(vec![Ok(book(0.01, 0.99))]));
        let r = resolver(clob, ws.clone());
        let resolved = r.resolve_healthy_book("tok", "x", 6.0).await;
        assert_eq!(resolved.health.health, BookHealth::EmptyBook);

        let clob = Arc::new(MockClob::new(vec![Ok(book(0.02, 0.98))]));
        let r = resolver(clob, ws.clone());
        let resolved = r.resolve_healthy_book("tok", "x", 6.0).await;
        assert_eq!(resolved.health.health, BookHealth::DustBook);

        let clob = Arc::new(MockClob::new(vec![Ok(book(0.90, 0.97))]));
        let r = resolver(clob, ws.clone());
        let resolved = r.resolve_healthy_book("tok", "x", 6.0).await;
        assert_eq!(resolved.health.health, BookHealth::AskTooHigh);

        let clob = Arc::new(MockClob::new(vec![Ok(book(0.30, 0.45))]));
        let r = resolver(clob, ws.clone());
        let resolved = r.resolve_healthy_book("tok", "x", 6.0).await;
        assert_eq!(resolved.health.health, BookHealth::WideSpread);

        let clob = Arc::new(MockClob::new(vec![Ok(OrderBook::default())]));
        let r = resolver(clob, ws);
        let resolved = r.resolve_healthy_book("tok", "x", 6.0).await;
        assert_eq!(resolved.health.health, BookHealth::NoData);
    }

    #[tokio::test]
    async fn levels_are_sorted_and_garbage_dropped() {
        let messy = OrderBook {
            bids: vec![
                Order { price: 0.40, size: 10.0 },
                Order { price: 0.48, size: 10.0 },
                Order { price: 0.44, size: 0.0 },
                Order { price: f64::NAN, size: 5.0 },
            ],
            asks: vec![
                Order { price: 0.60, size: 10.0 },
                Order { price: 0.52, size: 10.0 },
            ],
        };
        let clob = Arc::new(MockClob::new(vec![Ok(messy)]));
        let ws = Arc::new(WsBookCache::new(5_000));
        let r = resolver(clob, ws);

        let resolved = r.resolve_healthy_book("tok", "x", 6.0).await;
        let snap = resolved.snapshot.unwrap();
        assert!(snap.parsed_ok);
        assert_eq!(snap.bids.len(), 2);
        assert!(snap.bids[0].price > snap.bids[1].price);
        assert!(snap.asks[0].price < snap.asks[1].price);
        assert!(snap.best_bid().unwrap() < snap.best_ask().unwrap());
    }

    #[tokio::test]
    async fn parse_error_body_is_not_fetch_failed() {
        let clob = Arc::new(MockClob::new(vec![Err(ClobError::Parse(
            "bad body".to_string(),
        ))]));
        let ws = Arc::new(WsBookCache::new(5_000));
        let r = resolver(clob.clone(), ws);

        let resolved = r.resolve_healthy_book("tok", "x", 6.0).await;
        assert_eq!(resolved.health.health, BookHealth::ParseError);
        // No retry: the fetch itself did not fail.
        assert_eq!(clob.call_count(), 1);
    }
}

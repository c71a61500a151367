//! WS-fed book cache facade
//!
//! The WebSocket client itself lives outside this crate; it feeds snapshots
//! and trade prints into this cache. Reads are cache-only with skip-tick
//! semantics: `None` means rate-limited, stale, or not yet subscribed,
//! never "the market has no book".

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::models::OrderBook;

/// A cached book plus the activity counters the entry gates look at.
#[derive(Debug, Clone)]
pub struct OrderbookState {
    pub token_id: String,
    pub book: OrderBook,
    pub last_update: DateTime<Utc>,
    /// Trade prints inside the activity window.
    pub trades_last_window: u32,
    /// Book updates inside the activity window.
    pub updates_last_window: u32,
}

pub trait MarketDataFacade: Send + Sync {
    /// Cache-only read. `None` is a transient fault (stale / unsubscribed /
    /// rate-limited); callers skip the tick instead of blocking.
    fn get_orderbook_state(&self, token_id: &str) -> Option<OrderbookState>;

    /// Relaxed read for cross-checks: a somewhat stale book is still good
    /// evidence that a market is not dead.
    fn get_orderbook_state_relaxed(&self, token_id: &str) -> Option<OrderbookState> {
        self.get_orderbook_state(token_id)
    }

    /// Reconcile the subscription set; the transport subscribes to additions
    /// and unsubscribes the complement.
    fn set_subscriptions(&self, tokens: HashSet<String>);

    fn subscriptions(&self) -> HashSet<String>;
}

#[derive(Debug)]
struct CachedBook {
    book: OrderBook,
    last_update: DateTime<Utc>,
    update_times: VecDeque<DateTime<Utc>>,
    trade_times: VecDeque<DateTime<Utc>>,
}

/// In-memory cache fed by the external WS client.
pub struct WsBookCache {
    books: RwLock<HashMap<String, CachedBook>>,
    subs: RwLock<HashSet<String>>,
    max_stale_ms: i64,
    activity_window_secs: i64,
}

impl WsBookCache {
    pub fn new(max_stale_ms: i64) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            subs: RwLock::new(HashSet::new()),
            max_stale_ms,
            activity_window_secs: 60,
        }
    }

    /// Ingest a book snapshot from the transport.
    pub fn apply_snapshot(&self, token_id: &str, book: OrderBook) {
        let now = Utc::now();
        let mut books = self.books.write();
        let entry = books.entry(token_id.to_string()).or_insert_with(|| CachedBook {
            book: OrderBook::default(),
            last_update: now,
            update_times: VecDeque::new(),
            trade_times: VecDeque::new(),
        });
        entry.book = book;
        entry.last_update = now;
        entry.update_times.push_back(now);
        Self::prune(&mut entry.update_times, now, self.activity_window_secs);
    }

    /// Ingest a trade print from the transport.
    pub fn record_trade(&self, token_id: &str) {
        let now = Utc::now();
        let mut books = self.books.write();
        if let Some(entry) = books.get_mut(token_id) {
            entry.trade_times.push_back(now);
            Self::prune(&mut entry.trade_times, now, self.activity_window_secs);
        }
    }

    fn prune(times: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window_secs: i64) {
        let cutoff = now - ChronoDuration::seconds(window_secs);
        while times.front().map(|t| *t < cutoff).unwrap_or(false) {
            times.pop_front();
        }
    }
}

impl WsBookCache {
    fn read_state(&self, token_id: &str, max_age_ms: i64) -> Option<OrderbookState> {
        let books = self.books.read();
        let entry = books.get(token_id)?;

        let age_ms = (Utc::now() - entry.last_update).num_milliseconds();
        if age_ms > max_age_ms {
            debug!(token_id = %token_id, age_ms = %age_ms, "ws book stale, skipping");
            return None;
        }

        let cutoff = Utc::now() - ChronoDuration::seconds(self.activity_window_secs);
        let trades = entry.trade_times.iter().filter(|t| **t >= cutoff).count() as u32;
        let updates = entry.update_times.iter().filter(|t| **t >= cutoff).count() as u32;

        Some(OrderbookState {
            token_id: token_id.to_string(),
            book: entry.book.clone(),
            last_update: entry.last_update,
            trades_last_window: trades,
            updates_last_window: updates,
        })
    }
}

impl MarketDataFacade for WsBookCache {
    fn get_orderbook_state(&self, token_id: &str) -> Option<OrderbookState> {
        self.read_state(token_id, self.max_stale_ms)
    }

    fn get_orderbook_state_relaxed(&self, token_id: &str) -> Option<OrderbookState> {
        self.read_state(token_id, self.max_stale_ms * 10)
    }

    fn set_subscriptions(&self, tokens: HashSet<String>) {
        let mut subs = self.subs.write();
        let added = tokens.difference(&subs).count();
        let removed = subs.difference(&tokens).count();
        if added > 0 || removed > 0 {
            debug!(total = tokens.len(), added, removed, "ws subscription set reconciled");
        }
        *subs = tokens;
    }

    fn subscriptions(&self) -> HashSet<String> {
        self.subs.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Order;

    fn book(bid: f64, ask: f64) -> OrderBook {
        OrderBook {
            bids: vec![Order { price: bid, size: 100.0 }],
            asks: vec![Order { price: ask, size: 100.0 }],
        }
    }

    #[test]
    fn fresh_snapshot_is_served() {
        let cache = WsBookCache::new(5_000);
        cache.apply_snapshot("tok", book(0.48, 0.52));
        let state = cache.get_orderbook_state("tok").unwrap();
        assert_eq!(state.book.best_bid(), Some(0.48));
        assert_eq!(state.updates_last_window, 1);
    }

    #[test]
    fn unknown_token_is_none_not_empty() {
        let cache = WsBookCache::new(5_000);
        assert!(cache.get_orderbook_state("nope").is_none());
    }

    #[test]
    fn trade_prints_are_counted() {
        let cache = WsBookCache::new(5_000);
        cache.apply_snapshot("tok", book(0.4, 0.6));
        cache.record_trade("tok");
        cache.record_trade("tok");
        let state = cache.get_orderbook_state("tok").unwrap();
        assert_eq!(state.trades_last_window, 2);
    }

    #[test]
    fn subscription_set_replaces() {
        let cache = WsBookCache::new(5_000);
        cache.set_subscriptions(["a", "b"].iter().map(|s| s.to_string()).collect());
        cache.set_subscriptions(["b", "c"].iter().map(|s| s.to_string()).collect());
        let subs = cache.subscriptions();
        assert!(subs.contains("b") && subs.contains("c") && !subs.contains("a"));
    }
}

//! Per-token cooldown manager
//!
//! Tokens that keep failing market-data checks get backed off on an
//! escalating schedule. Transient faults take a short fixed cooldown that
//! never accumulates strikes; permanent market conditions (dust, invalid
//! liquidity, invalid prices) are not cooldown material at all and are
//! rejected at this boundary.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::models::MarketDataFailure;

/// Escalation schedule for long-cooldown reasons: 10m, 30m, 2h, 24h.
pub const BACKOFF_SCHEDULE_SECS: [i64; 4] = [600, 1_800, 7_200, 86_400];

const TRANSIENT_COOLDOWN_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct CooldownEntry {
    pub strikes: u32,
    pub until: DateTime<Utc>,
    pub last_reason: MarketDataFailure,
}

#[derive(Debug, Default)]
pub struct CooldownStats {
    pub cooldown_hits: u64,
    pub resolved_later: u64,
    pub active_entries: usize,
}

pub struct CooldownManager {
    entries: Mutex<HashMap<String, CooldownEntry>>,
    cooldown_hits: AtomicU64,
    resolved_later: AtomicU64,
}

impl CooldownManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cooldown_hits: AtomicU64::new(0),
            resolved_later: AtomicU64::new(0),
        }
    }

    pub fn is_on_cooldown(&self, token_id: &str) -> bool {
        let entries = self.entries.lock();
        let blocked = entries
            .get(token_id)
            .map(|e| e.until > Utc::now())
            .unwrap_or(false);
        if blocked {
            self.cooldown_hits.fetch_add(1, Ordering::Relaxed);
        }
        blocked
    }

    pub fn record_failure(&self, token_id: &str, reason: MarketDataFailure) {
        if reason.is_permanent_condition() {
            // Callers route permanent conditions around the cooldown layer.
            debug_assert!(false, "permanent condition passed to cooldown: {}", reason);
            warn!(token_id = %token_id, reason = %reason, "permanent condition is not a cooldown reason, ignoring");
            return;
        }

        let now = Utc::now();
        let mut entries = self.entries.lock();
        let prior = entries.get(token_id).cloned();

        let entry = if reason.is_transient() {
            // Short fixed expiry. Strikes accumulated by long reasons are
            // preserved; transient noise never builds its own.
            let strikes = match &prior {
                Some(p) if p.strikes > 1 => p.strikes,
                _ => 1,
            };
            CooldownEntry {
                strikes,
                until: now + Duration::seconds(TRANSIENT_COOLDOWN_SECS),
                last_reason: reason,
            }
        } else {
            let strikes = match &prior {
                Some(p) if p.last_reason.is_long_cooldown() || p.strikes > 1 => p.strikes + 1,
                _ => 1,
            };
            let idx = (strikes as usize - 1).min(BACKOFF_SCHEDULE_SECS.len() - 1);
            CooldownEntry {
                strikes,
                until: now + Duration::seconds(BACKOFF_SCHEDULE_SECS[idx]),
                last_reason: reason,
            }
        };

        debug!(
            token_id = %token_id,
            reason = %reason,
            strikes = %entry.strikes,
            until = %entry.until,
            "cooldown recorded"
        );
        entries.insert(token_id.to_string(), entry);
    }

    /// A token that was failing produced a usable book; clear it.
    pub fn record_success(&self, token_id: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(token_id).is_some() {
            self.resolved_later.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop entries whose expiry is more than an hour in the past.
    pub fn cleanup(&self) {
        let cutoff = Utc::now() - Duration::hours(1);
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.until > cutoff);
    }

    pub fn entry(&self, token_id: &str) -> Option<CooldownEntry> {
        self.entries.lock().get(token_id).cloned()
    }

    pub fn stats(&self) -> CooldownStats {
        CooldownStats {
            cooldown_hits: self.cooldown_hits.load(Ordering::Relaxed),
            resolved_later: self.resolved_later.load(Ordering::Relaxed),
            active_entries: self.entries.lock().len(),
        }
    }
}

impl Default for CooldownManager {
    fn default() -> Self {
        Self::new()
    }
}

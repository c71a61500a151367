//! Wallet balance cache
//!
//! Lazy refresh at a configured interval; force-invalidated after fills so
//! the next cycle sizes against real capital.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Balances {
    pub usdc: f64,
    pub pol: f64,
}

#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_balances(&self) -> anyhow::Result<Balances>;
}

struct Cached {
    balances: Balances,
    fetched_at: Instant,
}

pub struct BalanceCache {
    source: Arc<dyn BalanceSource>,
    ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl BalanceCache {
    pub fn new(source: Arc<dyn BalanceSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Serve the cached value while fresh, otherwise refetch. A failed
    /// refresh falls back to the stale value rather than zeroing capital.
    pub async fn get_balances(&self) -> Balances {
        {
            let cached = self.cached.lock();
            if let Some(c) = cached.as_ref() {
                if c.fetched_at.elapsed() < self.ttl {
                    return c.balances;
                }
            }
        }

        match self.source.fetch_balances().await {
            Ok(balances) => {
                *self.cached.lock() = Some(Cached {
                    balances,
                    fetched_at: Instant::now(),
                });
                balances
            }
            Err(e) => {
                warn!(error = %e, "balance refresh failed, serving stale");
                self.cached
                    .lock()
                    .as_ref()
                    .map(|c| c.balances)
                    .unwrap_or_default()
            }
        }
    }

    /// Drop the cached value; the next read refetches.
    pub fn force_refresh(&self) {
        *self.cached.lock() = None;
    }
}

//! Network latency monitor
//!
//! Rolling RPC/API latency samples classified into a health status that the
//! execution engine consumes: the status gates live entries and widens the
//! slippage band when the network degrades.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;

const MAX_SAMPLES: usize = 200;
const MIN_SAMPLES_FOR_VERDICT: usize = 5;

const DEGRADED_P95_MS: f64 = 800.0;
const CRITICAL_P95_MS: f64 = 2_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NetworkStatus {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStatus::Healthy => write!(f, "healthy"),
            NetworkStatus::Degraded => write!(f, "degraded"),
            NetworkStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkHealth {
    pub status: NetworkStatus,
    pub rpc_latency_ms: f64,
    pub api_latency_ms: f64,
    /// Slippage the execution engine should allow at this health level.
    pub recommended_slippage_pct: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradingSafety {
    pub safe: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct Samples {
    rpc_ms: VecDeque<f64>,
    api_ms: VecDeque<f64>,
}

pub struct LatencyMonitor {
    samples: RwLock<Samples>,
    base_slippage_pct: f64,
}

impl LatencyMonitor {
    pub fn new(base_slippage_pct: f64) -> Self {
        Self {
            samples: RwLock::new(Samples::default()),
            base_slippage_pct,
        }
    }

    pub fn record_rpc_latency(&self, ms: f64) {
        let mut s = self.samples.write();
        Self::push(&mut s.rpc_ms, ms);
    }

    pub fn record_api_latency(&self, ms: f64) {
        let mut s = self.samples.write();
        Self::push(&mut s.api_ms, ms);
    }

    fn push(q: &mut VecDeque<f64>, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        if q.len() >= MAX_SAMPLES {
            q.pop_front();
        }
        q.push_back(ms);
    }

    fn p95(q: &VecDeque<f64>) -> f64 {
        if q.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = q.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[idx.min(sorted.len()) - 1]
    }

    pub fn get_network_health(&self) -> NetworkHealth {
        let s = self.samples.read();
        let rpc_p95 = Self::p95(&s.rpc_ms);
        let api_p95 = Self::p95(&s.api_ms);
        let worst = rpc_p95.max(api_p95);
        let have_verdict = s.rpc_ms.len() + s.api_ms.len() >= MIN_SAMPLES_FOR_VERDICT;

        let mut warnings = Vec::new();
        let status = if !have_verdict {
            NetworkStatus::Healthy
        } else if worst >= CRITICAL_P95_MS {
            warnings.push(format!("p95 latency {:.0}ms critical", worst));
            NetworkStatus::Critical
        } else if worst >= DEGRADED_P95_MS {
            warnings.push(format!("p95 latency {:.0}ms degraded", worst));
            NetworkStatus::Degraded
        } else {
            NetworkStatus::Healthy
        };

        let recommended_slippage_pct = match status {
            NetworkStatus::Healthy => self.base_slippage_pct,
            NetworkStatus::Degraded => self.base_slippage_pct * 2.0,
            NetworkStatus::Critical => self.base_slippage_pct * 4.0,
        };

        NetworkHealth {
            status,
            rpc_latency_ms: rpc_p95,
            api_latency_ms: api_p95,
            recommended_slippage_pct,
            warnings,
        }
    }

    pub fn is_trading_safe(&self) -> TradingSafety {
        let health = self.get_network_health();
        match health.status {
            NetworkStatus::Critical => TradingSafety {
                safe: false,
                reason: Some(format!(
                    "network critical (rpc p95 {:.0}ms, api p95 {:.0}ms)",
                    health.rpc_latency_ms, health.api_latency_ms
                )),
            },
            _ => TradingSafety {
                safe: true,
                reason: None,
            },
        }
    }
}

//! Portfolio-wide risk guard
//!
//! Gates entries and hedges against wallet minimums, deployment caps, and
//! hedge exposure caps, and classifies overall portfolio health. Protective
//! mode halts new entries; exits always run.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

/// The numbers the guard looks at; assembled by the control loop each time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortfolioSnapshot {
    pub wallet_balance_usd: f64,
    pub open_positions: usize,
    pub deployed_usd: f64,
    pub hedged_positions: usize,
    pub total_hedge_usd: f64,
}

#[derive(Debug, Clone)]
pub struct RiskGuardConfig {
    pub min_wallet_balance_usd: f64,
    pub max_total_deployment_fraction: f64,
    pub max_hedged_positions: usize,
    pub max_total_hedge_usd: f64,
    /// Cap on average hedge notional per deployed dollar.
    pub max_global_hedge_exposure: f64,
    pub hedge_cooldown_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct EntryGate {
    pub allowed: bool,
    /// Proposed size, possibly shrunk to fit the deployment cap.
    pub size_usd: f64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HedgeGate {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Caution,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioHealth {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

pub struct RiskGuard {
    config: RiskGuardConfig,
}

impl RiskGuard {
    pub fn new(config: RiskGuardConfig) -> Self {
        Self { config }
    }

    pub fn check_entry(&self, snapshot: &PortfolioSnapshot, proposed_size_usd: f64) -> EntryGate {
        let cfg = &self.config;

        let projected_balance = snapshot.wallet_balance_usd - proposed_size_usd;
        if projected_balance < cfg.min_wallet_balance_usd {
            return EntryGate {
                allowed: false,
                size_usd: 0.0,
                reason: Some("Entry would reduce wallet below minimum".to_string()),
            };
        }

        let cap_usd = snapshot.wallet_balance_usd * cfg.max_total_deployment_fraction;
        let projected_deployed = snapshot.deployed_usd + proposed_size_usd;
        if projected_deployed > cap_usd {
            let headroom = cap_usd - snapshot.deployed_usd;
            if headroom <= 1.0 {
                return EntryGate {
                    allowed: false,
                    size_usd: 0.0,
                    reason: Some(format!(
                        "deployment cap reached ({:.0}% of wallet)",
                        cfg.max_total_deployment_fraction * 100.0
                    )),
                };
            }
            warn!(
                proposed = %format!("{:.2}", proposed_size_usd),
                shrunk = %format!("{:.2}", headroom),
                "entry shrunk to fit deployment cap"
            );
            return EntryGate {
                allowed: true,
                size_usd: headroom,
                reason: Some("size reduced to deployment cap".to_string()),
            };
        }

        EntryGate {
            allowed: true,
            size_usd: proposed_size_usd,
            reason: None,
        }
    }

    pub fn check_hedge(
        &self,
        snapshot: &PortfolioSnapshot,
        proposed_hedge_usd: f64,
        last_hedge_at: Option<DateTime<Utc>>,
    ) -> HedgeGate {
        let cfg = &self.config;

        if let Some(at) = last_hedge_at {
            let since = Utc::now() - at;
            if since < Duration::seconds(cfg.hedge_cooldown_seconds) {
                return HedgeGate {
                    allowed: false,
                    reason: Some(format!(
                        "hedge cooldown ({}s since last)",
                        since.num_seconds()
                    )),
                };
            }
        }

        if snapshot.hedged_positions >= cfg.max_hedged_positions {
            return HedgeGate {
                allowed: false,
                reason: Some(format!(
                    "hedged position cap {} reached",
                    cfg.max_hedged_positions
                )),
            };
        }

        if snapshot.total_hedge_usd + proposed_hedge_usd > cfg.max_total_hedge_usd {
            return HedgeGate {
                allowed: false,
                reason: Some(format!(
                    "total hedge cap ${:.0} reached",
                    cfg.max_total_hedge_usd
                )),
            };
        }

        if snapshot.deployed_usd > 0.0 {
            let exposure = (snapshot.total_hedge_usd + proposed_hedge_usd) / snapshot.deployed_usd;
            if exposure > cfg.max_global_hedge_exposure {
                return HedgeGate {
                    allowed: false,
                    reason: Some(format!(
                        "global hedge exposure {:.2} above cap {:.2}",
                        exposure, cfg.max_global_hedge_exposure
                    )),
                };
            }
        }

        HedgeGate {
            allowed: true,
            reason: None,
        }
    }

    pub fn portfolio_health(&self, snapshot: &PortfolioSnapshot) -> PortfolioHealth {
        let cfg = &self.config;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let mut critical = false;

        if snapshot.wallet_balance_usd < cfg.min_wallet_balance_usd {
            issues.push(format!(
                "wallet ${:.2} below minimum ${:.2}",
                snapshot.wallet_balance_usd, cfg.min_wallet_balance_usd
            ));
            recommendations.push("stop entries, let exits rebuild the wallet".to_string());
            critical = true;
        } else if snapshot.wallet_balance_usd < cfg.min_wallet_balance_usd * 1.5 {
            issues.push(format!(
                "wallet ${:.2} near minimum",
                snapshot.wallet_balance_usd
            ));
            recommendations.push("reduce entry size".to_string());
        }

        if snapshot.wallet_balance_usd > 0.0 {
            let fraction = snapshot.deployed_usd / snapshot.wallet_balance_usd;
            if fraction > cfg.max_total_deployment_fraction {
                issues.push(format!(
                    "deployment {:.0}% above cap {:.0}%",
                    fraction * 100.0,
                    cfg.max_total_deployment_fraction * 100.0
                ));
                recommendations.push("no new entries until positions close".to_string());
                critical = true;
            } else if fraction > cfg.max_total_deployment_fraction * 0.85 {
                issues.push(format!("deployment {:.0}% near cap", fraction * 100.0));
            }
        }

        if snapshot.total_hedge_usd > cfg.max_total_hedge_usd * 0.85 {
            issues.push(format!(
                "hedge notional ${:.2} near cap ${:.2}",
                snapshot.total_hedge_usd, cfg.max_total_hedge_usd
            ));
            recommendations.push("unwind hedges on recovering positions".to_string());
        }

        let status = if critical {
            HealthStatus::Critical
        } else if !issues.is_empty() {
            HealthStatus::Caution
        } else {
            HealthStatus::Healthy
        };

        PortfolioHealth {
            status,
            issues,
            recommendations,
        }
    }

    /// Protective mode blocks new entries; exits keep running.
    pub fn is_protective_mode_active(&self, snapshot: &PortfolioSnapshot) -> bool {
        self.portfolio_health(snapshot).status == HealthStatus::Critical
            || snapshot.wallet_balance_usd < self.config.min_wallet_balance_usd * 1.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> RiskGuard {
        RiskGuard::new(RiskGuardConfig {
            min_wallet_balance_usd: 50.0,
            max_total_deployment_fraction: 0.50,
            max_hedged_positions: 3,
            max_total_hedge_usd: 100.0,
            max_global_hedge_exposure: 0.50,
            hedge_cooldown_seconds: 30,
        })
    }

    fn snapshot(balance: f64, deployed: f64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            wallet_balance_usd: balance,
            open_positions: 1,
            deployed_usd: deployed,
            hedged_positions: 0,
            total_hedge_usd: 0.0,
        }
    }

    #[test]
    fn entry_below_wallet_minimum_is_denied() {
        let gate = guard().check_entry(&snapshot(100.0, 0.0), 55.0);
        assert!(!gate.allowed);
        assert_eq!(
            gate.reason.as_deref(),
            Some("Entry would reduce wallet below minimum")
        );
    }

    #[test]
    fn entry_within_limits_passes_untouched() {
        let gate = guard().check_entry(&snapshot(500.0, 0.0), 25.0);
        assert!(gate.allowed);
        assert_eq!(gate.size_usd, 25.0);
        assert!(gate.reason.is_none());
    }

    #[test]
    fn oversized_entry_shrinks_to_cap() {
        // Cap = 250, deployed 230 leaves 20 of headroom.
        let gate = guard().check_entry(&snapshot(500.0, 230.0), 40.0);
        assert!(gate.allowed);
        assert!((gate.size_usd - 20.0).abs() < 1e-9);
    }

    #[test]
    fn no_headroom_denies() {
        let gate = guard().check_entry(&snapshot(500.0, 250.0), 25.0);
        assert!(!gate.allowed);
    }

    #[test]
    fn hedge_cooldown_blocks() {
        let g = guard();
        let gate = g.check_hedge(&snapshot(500.0, 100.0), 10.0, Some(Utc::now()));
        assert!(!gate.allowed);
        let gate = g.check_hedge(
            &snapshot(500.0, 100.0),
            10.0,
            Some(Utc::now() - Duration::seconds(60)),
        );
        assert!(gate.allowed);
    }

    #[test]
    fn hedge_caps_block() {
        let g = guard();
        let mut snap = snapshot(500.0, 100.0);
        snap.hedged_positions = 3;
        assert!(!g.check_hedge(&snap, 10.0, None).allowed);

        let mut snap = snapshot(500.0, 300.0);
        snap.total_hedge_usd = 95.0;
        assert!(!g.check_hedge(&snap, 10.0, None).allowed);

        let mut snap = snapshot(500.0, 40.0);
        snap.total_hedge_usd = 15.0;
        // (15 + 10) / 40 = 0.625 > 0.5
        assert!(!g.check_hedge(&snap, 10.0, None).allowed);
    }

    #[test]
    fn health_degrades_with_wallet() {
        let g = guard();
        assert_eq!(
            g.portfolio_health(&snapshot(500.0, 0.0)).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            g.portfolio_health(&snapshot(60.0, 0.0)).status,
            HealthStatus::Caution
        );
        assert_eq!(
            g.portfolio_health(&snapshot(40.0, 0.0)).status,
            HealthStatus::Critical
        );
    }

    #[test]
    fn protective_mode_triggers_early() {
        let g = guard();
        assert!(g.is_protective_mode_active(&snapshot(70.0, 0.0)));
        assert!(!g.is_protective_mode_active(&snapshot(500.0, 0.0)));
    }
}

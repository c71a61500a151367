//! Trading engine core: decision subsystems and the control loop.

pub mod adaptive_ev;
pub mod adaptive_hedge;
pub mod bias;
pub mod book_resolver;
pub mod churn;
pub mod cooldown;
pub mod decision;
pub mod ev;
pub mod execution;
pub mod position;
pub mod reserve;
pub mod risk_guard;

pub use adaptive_ev::{AdaptiveEvConfig, AdaptiveEvEngine, EntryDecisionResult, Ewma};
pub use adaptive_hedge::{
    AdaptiveHedgeConfig, AdaptiveHedgePolicy, HedgeDecision, HedgeParams, VolRegime,
};
pub use bias::{BiasAccumulator, BiasConfig, TokenBias};
pub use book_resolver::{BookResolver, ResolvedBook};
pub use churn::ChurnEngine;
pub use cooldown::{CooldownEntry, CooldownManager, CooldownStats, BACKOFF_SCHEDULE_SECS};
pub use decision::{CheckResult, DecisionEngine, EntryDecision, EntryParams, ExitDecision};
pub use ev::{EvMetrics, EvTracker, TradeResult, TradingAllowance};
pub use execution::{EntryFlow, EntryResult, ExecutionEngine, PositionTick};
pub use position::{
    HedgeLeg, ManagedPosition, PositionAction, PositionConfig, PositionError, PositionManager,
    PositionState, StateTransition, TransitionRecord,
};
pub use reserve::{DynamicReserveState, ReserveManager};
pub use risk_guard::{
    EntryGate, HealthStatus, HedgeGate, PortfolioHealth, PortfolioSnapshot, RiskGuard,
    RiskGuardConfig,
};

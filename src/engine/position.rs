//! Position lifecycle manager
//!
//! Sole owner of the position map. Every mutation goes through these
//! methods, the open-time cap check happens inside the single write lock,
//! and every state change is appended to the position's transition log and
//! broadcast to listeners.
//!
//! State machine:
//!   OPEN --(adverse past trigger, ratio below cap)--> HEDGED
//!   OPEN | HEDGED --(TP | HARD_EXIT | TIME_STOP | BIAS_FLIP | EV_DEGRADED)--> EXITING
//!   EXITING --(fill observed)--> CLOSED

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{BiasDirection, ExitReason, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionState {
    Open,
    Hedged,
    Exiting,
    Closed,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionState::Open => write!(f, "OPEN"),
            PositionState::Hedged => write!(f, "HEDGED"),
            PositionState::Exiting => write!(f, "EXITING"),
            PositionState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HedgeLeg {
    pub sibling_token_id: String,
    pub size_usd: f64,
    pub entry_price_cents: f64,
    pub entry_time: DateTime<Utc>,
    pub current_pnl_cents: f64,
    /// Fraction of the parent entry this leg offsets.
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    pub from: Option<PositionState>,
    pub to: PositionState,
    pub reason: String,
    pub pnl_cents: f64,
    pub pnl_usd: f64,
    pub ev_cents: Option<f64>,
    pub bias: BiasDirection,
}

/// Broadcast form of a transition, consumed by notifiers.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub position_id: Uuid,
    pub token_id: String,
    pub from: Option<PositionState>,
    pub to: PositionState,
    pub reason: String,
    pub at: DateTime<Utc>,
    pub pnl_cents: f64,
    pub pnl_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedPosition {
    pub id: Uuid,
    pub token_id: String,
    /// Sibling outcome token; required before any hedge can be placed.
    pub opposite_token_id: Option<String>,
    pub side: Side,
    pub entry_price_cents: f64,
    pub entry_size_usd: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_bias: BiasDirection,
    pub current_price_cents: f64,
    pub pnl_cents: f64,
    pub pnl_usd: f64,
    pub take_profit_price_cents: f64,
    pub hedge_trigger_price_cents: f64,
    pub hard_exit_price_cents: f64,
    pub hedges: Vec<HedgeLeg>,
    pub total_hedge_ratio: f64,
    pub is_external: bool,
    pub state: PositionState,
    pub transitions: Vec<TransitionRecord>,
    pub last_hedge_at: Option<DateTime<Utc>>,
    /// Worst adverse excursion observed, in cents (≤ 0).
    pub max_adverse_cents_seen: f64,
}

impl ManagedPosition {
    pub fn shares(&self) -> f64 {
        if self.entry_price_cents <= 0.0 {
            return 0.0;
        }
        self.entry_size_usd / (self.entry_price_cents / 100.0)
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_seconds()
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, PositionState::Closed)
    }

    fn pnl_cents_at(&self, price_cents: f64) -> f64 {
        match self.side {
            Side::Long => price_cents - self.entry_price_cents,
            Side::Short => self.entry_price_cents - price_cents,
        }
    }

    fn pnl_usd_from_cents(&self, pnl_cents: f64) -> f64 {
        pnl_cents / 100.0 * self.shares()
    }
}

/// What the owner wants done after a price update.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionAction {
    None,
    Hedge,
    Exit(ExitReason),
}

#[derive(Debug, Clone)]
pub struct PositionConfig {
    pub tp_cents: f64,
    pub hedge_trigger_cents: f64,
    pub max_adverse_cents: f64,
    pub max_hold_seconds: i64,
    pub max_hedge_ratio: f64,
    pub max_open_positions_total: usize,
    pub max_open_positions_per_market: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("position cap reached ({0} open)")]
    TotalCap(usize),
    #[error("per-market cap reached on token {0}")]
    MarketCap(String),
    #[error("unknown position {0}")]
    Unknown(Uuid),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: PositionState,
        to: PositionState,
    },
}

pub struct PositionManager {
    config: PositionConfig,
    positions: RwLock<HashMap<Uuid, ManagedPosition>>,
    transitions_tx: broadcast::Sender<StateTransition>,
    /// Latest EV estimate, stamped onto transition records.
    ev_context: Mutex<Option<f64>>,
}

impl PositionManager {
    pub fn new(config: PositionConfig) -> Self {
        let (transitions_tx, _) = broadcast::channel(256);
        Self {
            config,
            positions: RwLock::new(HashMap::new()),
            transitions_tx,
            ev_context: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions_tx.subscribe()
    }

    /// Stamp the EV estimate that subsequent transitions snapshot.
    pub fn set_ev_context(&self, ev_cents: f64) {
        *self.ev_context.lock() = Some(ev_cents);
    }

    fn record_transition(
        &self,
        pos: &mut ManagedPosition,
        to: PositionState,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        let from = Some(pos.state);
        let record = TransitionRecord {
            at: Utc::now(),
            from,
            to,
            reason: reason.clone(),
            pnl_cents: pos.pnl_cents,
            pnl_usd: pos.pnl_usd,
            ev_cents: *self.ev_context.lock(),
            bias: pos.entry_bias,
        };
        pos.transitions.push(record);
        pos.state = to;

        let _ = self.transitions_tx.send(StateTransition {
            position_id: pos.id,
            token_id: pos.token_id.clone(),
            from,
            to,
            reason,
            at: Utc::now(),
            pnl_cents: pos.pnl_cents,
            pnl_usd: pos.pnl_usd,
        });
    }

    /// Open a position. The cap checks and the insert happen under one
    /// write lock, so parallel entry attempts cannot oversubscribe.
    pub fn open_position(
        &self,
        token_id: &str,
        side: Side,
        entry_price_cents: f64,
        size_usd: f64,
        bias: BiasDirection,
    ) -> Result<ManagedPosition, PositionError> {
        let mut positions = self.positions.write();

        let open_total = positions.values().filter(|p| p.is_open()).count();
        if open_total >= self.config.max_open_positions_total {
            return Err(PositionError::TotalCap(open_total));
        }
        let open_on_token = positions
            .values()
            .filter(|p| p.is_open() && p.token_id == token_id)
            .count();
        if open_on_token >= self.config.max_open_positions_per_market {
            return Err(PositionError::MarketCap(token_id.to_string()));
        }

        let (tp, trigger, hard) = match side {
            Side::Long => (
                entry_price_cents + self.config.tp_cents,
                entry_price_cents - self.config.hedge_trigger_cents,
                entry_price_cents - self.config.max_adverse_cents,
            ),
            Side::Short => (
                entry_price_cents - self.config.tp_cents,
                entry_price_cents + self.config.hedge_trigger_cents,
                entry_price_cents + self.config.max_adverse_cents,
            ),
        };

        let mut pos = ManagedPosition {
            id: Uuid::new_v4(),
            token_id: token_id.to_string(),
            opposite_token_id: None,
            side,
            entry_price_cents,
            entry_size_usd: size_usd,
            entry_time: Utc::now(),
            entry_bias: bias,
            current_price_cents: entry_price_cents,
            pnl_cents: 0.0,
            pnl_usd: 0.0,
            take_profit_price_cents: tp,
            hedge_trigger_price_cents: trigger,
            hard_exit_price_cents: hard,
            hedges: Vec::new(),
            total_hedge_ratio: 0.0,
            is_external: false,
            state: PositionState::Open,
            transitions: Vec::new(),
            last_hedge_at: None,
            max_adverse_cents_seen: 0.0,
        };

        pos.transitions.push(TransitionRecord {
            at: pos.entry_time,
            from: None,
            to: PositionState::Open,
            reason: "ENTRY".to_string(),
            pnl_cents: 0.0,
            pnl_usd: 0.0,
            ev_cents: *self.ev_context.lock(),
            bias,
        });
        let _ = self.transitions_tx.send(StateTransition {
            position_id: pos.id,
            token_id: pos.token_id.clone(),
            from: None,
            to: PositionState::Open,
            reason: "ENTRY".to_string(),
            at: pos.entry_time,
            pnl_cents: 0.0,
            pnl_usd: 0.0,
        });

        info!(
            position_id = %pos.id,
            token_id = %crate::notify::token_prefix(token_id),
            entry_cents = %format!("{:.1}", entry_price_cents),
            size_usd = %format!("{:.2}", size_usd),
            "position opened"
        );

        let clone = pos.clone();
        positions.insert(pos.id, pos);
        Ok(clone)
    }

    /// Adopt a holding reported by the chain that the engine did not open
    /// itself. Side follows the outcome label; caps do not apply, the
    /// exposure already exists.
    pub fn register_external_position(
        &self,
        token_id: &str,
        outcome_label: &str,
        avg_price_cents: f64,
        size_usd: f64,
    ) -> Result<ManagedPosition, PositionError> {
        let side = if outcome_label.eq_ignore_ascii_case("no") {
            Side::Short
        } else {
            Side::Long
        };

        let mut positions = self.positions.write();
        let (tp, trigger, hard) = match side {
            Side::Long => (
                avg_price_cents + self.config.tp_cents,
                avg_price_cents - self.config.hedge_trigger_cents,
                avg_price_cents - self.config.max_adverse_cents,
            ),
            Side::Short => (
                avg_price_cents - self.config.tp_cents,
                avg_price_cents + self.config.hedge_trigger_cents,
                avg_price_cents + self.config.max_adverse_cents,
            ),
        };

        let mut pos = ManagedPosition {
            id: Uuid::new_v4(),
            token_id: token_id.to_string(),
            opposite_token_id: None,
            side,
            entry_price_cents: avg_price_cents,
            entry_size_usd: size_usd,
            entry_time: Utc::now(),
            entry_bias: BiasDirection::None,
            current_price_cents: avg_price_cents,
            pnl_cents: 0.0,
            pnl_usd: 0.0,
            take_profit_price_cents: tp,
            hedge_trigger_price_cents: trigger,
            hard_exit_price_cents: hard,
            hedges: Vec::new(),
            total_hedge_ratio: 0.0,
            is_external: true,
            state: PositionState::Open,
            transitions: Vec::new(),
            last_hedge_at: None,
            max_adverse_cents_seen: 0.0,
        };

        pos.transitions.push(TransitionRecord {
            at: pos.entry_time,
            from: None,
            to: PositionState::Open,
            reason: "EXTERNAL_ADOPTION".to_string(),
            pnl_cents: 0.0,
            pnl_usd: 0.0,
            ev_cents: None,
            bias: BiasDirection::None,
        });
        let _ = self.transitions_tx.send(StateTransition {
            position_id: pos.id,
            token_id: pos.token_id.clone(),
            from: None,
            to: PositionState::Open,
            reason: "EXTERNAL_ADOPTION".to_string(),
            at: pos.entry_time,
            pnl_cents: 0.0,
            pnl_usd: 0.0,
        });

        info!(
            position_id = %pos.id,
            token_id = %crate::notify::token_prefix(token_id),
            outcome = %outcome_label,
            avg_cents = %format!("{:.1}", avg_price_cents),
            size_usd = %format!("{:.2}", size_usd),
            "external position adopted"
        );

        let clone = pos.clone();
        positions.insert(pos.id, pos);
        Ok(clone)
    }

    pub fn set_opposite_token(&self, id: Uuid, opposite_token_id: &str) -> Result<(), PositionError> {
        let mut positions = self.positions.write();
        let pos = positions.get_mut(&id).ok_or(PositionError::Unknown(id))?;
        pos.opposite_token_id = Some(opposite_token_id.to_string());
        Ok(())
    }

    /// Recompute P&L at the new mid and report what should happen next, in
    /// strict order: take-profit, hard exit, time stop, hedge trigger.
    pub fn update_price(&self, id: Uuid, mid_price_cents: f64) -> Result<PositionAction, PositionError> {
        let mut positions = self.positions.write();
        let pos = positions.get_mut(&id).ok_or(PositionError::Unknown(id))?;

        if matches!(pos.state, PositionState::Exiting | PositionState::Closed) {
            return Ok(PositionAction::None);
        }

        pos.current_price_cents = mid_price_cents;
        pos.pnl_cents = pos.pnl_cents_at(mid_price_cents);
        pos.pnl_usd = pos.pnl_usd_from_cents(pos.pnl_cents);
        if pos.pnl_cents < pos.max_adverse_cents_seen {
            pos.max_adverse_cents_seen = pos.pnl_cents;
        }

        if pos.pnl_cents >= self.config.tp_cents {
            return Ok(PositionAction::Exit(ExitReason::TakeProfit));
        }
        if pos.pnl_cents <= -self.config.max_adverse_cents {
            return Ok(PositionAction::Exit(ExitReason::HardExit));
        }
        if pos.age_seconds(Utc::now()) >= self.config.max_hold_seconds {
            return Ok(PositionAction::Exit(ExitReason::TimeStop));
        }
        if pos.pnl_cents <= -self.config.hedge_trigger_cents
            && pos.total_hedge_ratio < self.config.max_hedge_ratio
        {
            return Ok(PositionAction::Hedge);
        }

        Ok(PositionAction::None)
    }

    /// Refresh hedge-leg P&L from the sibling token's mid.
    pub fn update_hedge_prices(&self, id: Uuid, sibling_mid_cents: f64) -> Result<(), PositionError> {
        let mut positions = self.positions.write();
        let pos = positions.get_mut(&id).ok_or(PositionError::Unknown(id))?;
        for leg in &mut pos.hedges {
            leg.current_pnl_cents = sibling_mid_cents - leg.entry_price_cents;
        }
        Ok(())
    }

    pub fn record_hedge(&self, id: Uuid, leg: HedgeLeg) -> Result<(), PositionError> {
        let mut positions = self.positions.write();
        let pos = positions.get_mut(&id).ok_or(PositionError::Unknown(id))?;

        let new_total = pos.total_hedge_ratio + leg.ratio;
        if new_total > self.config.max_hedge_ratio + 1e-9 {
            warn!(
                position_id = %id,
                total = %format!("{:.2}", new_total),
                cap = %format!("{:.2}", self.config.max_hedge_ratio),
                "hedge would breach ratio cap, clamping"
            );
        }
        pos.total_hedge_ratio = new_total.min(self.config.max_hedge_ratio);
        pos.last_hedge_at = Some(leg.entry_time);
        pos.hedges.push(leg);

        if pos.state == PositionState::Open {
            self.record_transition(pos, PositionState::Hedged, "HEDGE_TRIGGER");
        }
        Ok(())
    }

    pub fn begin_exit(&self, id: Uuid, reason: ExitReason) -> Result<(), PositionError> {
        let mut positions = self.positions.write();
        let pos = positions.get_mut(&id).ok_or(PositionError::Unknown(id))?;

        match pos.state {
            PositionState::Open | PositionState::Hedged => {
                self.record_transition(pos, PositionState::Exiting, reason.to_string());
                Ok(())
            }
            from => Err(PositionError::InvalidTransition {
                from,
                to: PositionState::Exiting,
            }),
        }
    }

    /// A fill was observed; the position is done. Closed positions are
    /// never mutated again except by pruning.
    pub fn close_position(
        &self,
        id: Uuid,
        exit_price_cents: f64,
        reason: ExitReason,
    ) -> Result<ManagedPosition, PositionError> {
        let mut positions = self.positions.write();
        let pos = positions.get_mut(&id).ok_or(PositionError::Unknown(id))?;

        if pos.state == PositionState::Closed {
            return Err(PositionError::InvalidTransition {
                from: PositionState::Closed,
                to: PositionState::Closed,
            });
        }

        pos.current_price_cents = exit_price_cents;
        pos.pnl_cents = pos.pnl_cents_at(exit_price_cents);
        pos.pnl_usd = pos.pnl_usd_from_cents(pos.pnl_cents);
        self.record_transition(pos, PositionState::Closed, reason.to_string());

        info!(
            position_id = %id,
            token_id = %crate::notify::token_prefix(&pos.token_id),
            reason = %reason,
            pnl_cents = %format!("{:.1}", pos.pnl_cents),
            pnl_usd = %format!("{:.2}", pos.pnl_usd),
            "position closed"
        );

        Ok(pos.clone())
    }

    pub fn prune_closed_positions(&self, max_age: Duration) {
        let cutoff = Utc::now() - max_age;
        let mut positions = self.positions.write();
        positions.retain(|_, p| {
            p.state != PositionState::Closed
                || p.transitions
                    .last()
                    .map(|t| t.at > cutoff)
                    .unwrap_or(true)
        });
    }

    pub fn get(&self, id: Uuid) -> Option<ManagedPosition> {
        self.positions.read().get(&id).cloned()
    }

    pub fn open_positions(&self) -> Vec<ManagedPosition> {
        self.positions
            .read()
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    pub fn has_open_on_token(&self, token_id: &str) -> bool {
        self.positions
            .read()
            .values()
            .any(|p| p.is_open() && p.token_id == token_id)
    }

    pub fn open_count(&self) -> usize {
        self.positions.read().values().filter(|p| p.is_open()).count()
    }

    pub fn open_count_on_token(&self, token_id: &str) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| p.is_open() && p.token_id == token_id)
            .count()
    }

    pub fn deployed_usd(&self) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.entry_size_usd)
            .sum()
    }

    pub fn hedged_count(&self) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| p.is_open() && !p.hedges.is_empty())
            .count()
    }

    pub fn total_hedge_usd(&self) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.is_open())
            .flat_map(|p| p.hedges.iter())
            .map(|h| h.size_usd)
            .sum()
    }
}

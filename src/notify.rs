//! Best-effort notifier fan-out
//!
//! Downstream consumers of the position transition stream. Notifiers never
//! block the cycle and never feed back into engine logic; a failed delivery
//! is logged and dropped.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::position::{PositionState, StateTransition};

#[derive(Debug, Clone)]
pub enum NotifyEvent {
    BotStart { paper: bool },
    BotStop,
    PositionClosed {
        token_id: String,
        reason: String,
        pnl_cents: f64,
        pnl_usd: f64,
    },
    PositionLiquidated {
        token_id: String,
        pnl_usd: f64,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotifyEvent);
}

/// Notifier that writes to the structured log. External channels (Telegram,
/// GitHub) implement the same trait out of tree.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotifyEvent) {
        match event {
            NotifyEvent::BotStart { paper } => {
                info!(paper = %paper, "notifier: bot started");
            }
            NotifyEvent::BotStop => {
                info!("notifier: bot stopped");
            }
            NotifyEvent::PositionClosed {
                token_id,
                reason,
                pnl_cents,
                pnl_usd,
            } => {
                info!(
                    token_id = %token_prefix(token_id),
                    reason = %reason,
                    pnl_cents = %format!("{:.1}", pnl_cents),
                    pnl_usd = %format!("{:.2}", pnl_usd),
                    "notifier: position closed"
                );
            }
            NotifyEvent::PositionLiquidated { token_id, pnl_usd } => {
                info!(
                    token_id = %token_prefix(token_id),
                    pnl_usd = %format!("{:.2}", pnl_usd),
                    "notifier: position liquidated"
                );
            }
        }
    }
}

pub fn token_prefix(token_id: &str) -> &str {
    &token_id[..token_id.len().min(10)]
}

/// Bridge the position transition broadcast into notifier events. Spawned
/// once at startup; ends when the sender side closes.
pub fn spawn_transition_listener(
    mut rx: broadcast::Receiver<StateTransition>,
    notifiers: Vec<Arc<dyn Notifier>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let transition = match rx.recv().await {
                Ok(t) => t,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = %n, "transition listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if transition.to != PositionState::Closed {
                continue;
            }

            let event = if transition.reason.contains("LIQUIDATION") {
                NotifyEvent::PositionLiquidated {
                    token_id: transition.token_id.clone(),
                    pnl_usd: transition.pnl_usd,
                }
            } else {
                NotifyEvent::PositionClosed {
                    token_id: transition.token_id.clone(),
                    reason: transition.reason.clone(),
                    pnl_cents: transition.pnl_cents,
                    pnl_usd: transition.pnl_usd,
                }
            };

            for notifier in &notifiers {
                notifier.notify(&event).await;
            }
        }
    })
}

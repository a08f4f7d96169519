use crate::models::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Why a ladder was unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Take-profit reached on the active rung.
    TakeProfit,
    /// Equity profit target reached.
    ProfitTarget,
    /// Equity loss limit reached.
    LossLimit,
    /// Broker state stopped matching the ladder (missing position/pending order).
    Desync,
    /// Every rung is active and nothing is left pending.
    Exhausted,
    /// A missing pending rung could not be re-placed.
    PlacementFailed,
    /// Trading session window closed.
    SessionEnd,
    /// A background watcher halted trading.
    Halted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::LossLimit => "loss_limit",
            ExitReason::Desync => "desync",
            ExitReason::Exhausted => "exhausted",
            ExitReason::PlacementFailed => "placement_failed",
            ExitReason::SessionEnd => "session_end",
            ExitReason::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// Ladder lifecycle events emitted by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LadderEvent {
    /// Rung 0 filled and a new ladder cycle started.
    Opened {
        cycle: Uuid,
        side: Side,
        entry_price: Decimal,
        volume: Decimal,
        take_profit: Decimal,
        stop_loss: Option<Decimal>,
        distance: Decimal,
    },
    /// A rung order was accepted by the broker.
    RungPlaced {
        index: usize,
        ticket: Ticket,
        side: Side,
        price: Decimal,
        volume: Decimal,
        /// The rung went in as a market order instead of a stop order.
        at_market: bool,
    },
    /// A pending rung became a position.
    RungActivated { index: usize, ticket: Ticket },
    /// The previous (losing) leg was closed after an activation.
    LegClosed { index: usize, ticket: Ticket },
    /// The active rung's stop-loss was trailed behind the market.
    StopMoved {
        index: usize,
        ticket: Ticket,
        stop_loss: Decimal,
    },
    /// A rung could not be placed after every retry.
    PlacementFailed { index: usize, reason: String },
    /// A desync check found the broker out of step with the ladder.
    DesyncCheck {
        missing_position: bool,
        missing_pending: bool,
        count: u32,
    },
    /// Everything was closed and the ladder returned to flat.
    Unwound {
        cycle: Uuid,
        reason: ExitReason,
        deepest_rung: usize,
        closed_positions: usize,
        cancelled_orders: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_display_matches_serde() {
        for reason in [
            ExitReason::TakeProfit,
            ExitReason::ProfitTarget,
            ExitReason::LossLimit,
            ExitReason::Desync,
            ExitReason::Exhausted,
            ExitReason::PlacementFailed,
            ExitReason::SessionEnd,
            ExitReason::Halted,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason));
        }
    }
}

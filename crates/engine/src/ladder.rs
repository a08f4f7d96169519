use crate::error::EngineError;
use crate::schedule::{capped_seconds, MAX_WAIT_SECS};
use chrono::{DateTime, Utc};
use hedgebot_core::*;
use hedgebot_indicators::{atr_of, AtrSmoothing};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How far from the entry price the hedge rungs sit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HedgeDistance {
    /// A fixed number of symbol points.
    Fixed { points: Decimal },
    /// ATR of the closed candles times `multiplier`.
    Atr {
        period: usize,
        multiplier: Decimal,
        #[serde(default)]
        smoothing: AtrSmoothing,
    },
}

impl HedgeDistance {
    /// Distance in price units, or `None` when there is not enough history for the ATR.
    pub fn resolve(&self, symbol: &SymbolInfo, closed: &[Candle]) -> Option<Decimal> {
        match self {
            HedgeDistance::Fixed { points } => Some(symbol.points_to_price(*points)),
            HedgeDistance::Atr {
                period,
                multiplier,
                smoothing,
            } => {
                let bars = closed.iter().map(|c| (c.high, c.low, c.close));
                atr_of(bars, *period, *smoothing).map(|atr| atr * *multiplier)
            }
        }
    }
}

/// Immutable parameters of the hedging ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LadderConfig {
    /// Volume of each rung; rung 0 is the market entry.
    pub lot_sizes: Vec<Decimal>,
    pub distance: HedgeDistance,
    /// Take-profit of every rung, in points from the rung price.
    pub take_profit_points: Decimal,
    /// Optional stop-loss of every rung, in points from the rung price.
    pub stop_loss_points: Option<Decimal>,
    /// Trail the active rung's stop-loss at `stop_loss_points` behind the market.
    pub trailing_stop: bool,
    /// Close the previous rung's position when the next rung activates.
    pub close_losing_leg: bool,
    /// Consecutive failed checks before the ladder counts as out of sync.
    pub desync_checks: u32,
    /// Minimum spacing between two counted desync checks.
    pub desync_interval_secs: u64,
    /// Maximum slippage in points for market orders.
    pub deviation: u32,
    /// Tag identifying this bot's orders and positions.
    pub magic: u64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            lot_sizes: vec![dec!(0.01), dec!(0.02), dec!(0.03), dec!(0.04), dec!(0.06), dec!(0.1)],
            distance: HedgeDistance::Fixed {
                points: dec!(10000),
            },
            take_profit_points: dec!(20000),
            stop_loss_points: None,
            trailing_stop: false,
            close_losing_leg: true,
            desync_checks: 2,
            desync_interval_secs: 60,
            deviation: 20,
            magic: 10002,
        }
    }
}

impl LadderConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: &str| Err(EngineError::Config(msg.to_string()));
        if self.lot_sizes.len() < 2 {
            return fail("ladder.lot_sizes needs at least an entry and one hedge rung");
        }
        if self.lot_sizes.iter().any(|lot| *lot <= Decimal::ZERO) {
            return fail("ladder.lot_sizes must all be positive");
        }
        if self.take_profit_points <= Decimal::ZERO {
            return fail("ladder.take_profit_points must be positive");
        }
        if matches!(self.stop_loss_points, Some(sl) if sl <= Decimal::ZERO) {
            return fail("ladder.stop_loss_points must be positive");
        }
        if self.trailing_stop && self.stop_loss_points.is_none() {
            return fail("ladder.trailing_stop needs stop_loss_points");
        }
        if self.desync_checks == 0 {
            return fail("ladder.desync_checks must be at least 1");
        }
        if self.desync_interval_secs > MAX_WAIT_SECS {
            return fail("ladder.desync_interval_secs must be at most one week");
        }
        match &self.distance {
            HedgeDistance::Fixed { points } if *points <= Decimal::ZERO => {
                fail("ladder.distance.points must be positive")
            }
            HedgeDistance::Atr { period, multiplier, .. } if *period == 0 || *multiplier <= Decimal::ZERO => {
                fail("ladder.distance needs a positive ATR period and multiplier")
            }
            _ => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.lot_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lot_sizes.is_empty()
    }

    /// Whether `position`/`order` belongs to rung `index` of this bot.
    pub fn is_rung(&self, magic: u64, comment: &str, index: usize) -> bool {
        magic == self.magic && comment.parse::<RungTag>() == Ok(RungTag(index))
    }
}

// ---------------------------------------------------------------------------
// Rung arithmetic
// ---------------------------------------------------------------------------

/// Order comment that ties a broker order or position to a rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RungTag(pub usize);

impl fmt::Display for RungTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rung-{}", self.0)
    }
}

impl FromStr for RungTag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .strip_prefix("rung-")
            .and_then(|n| n.parse().ok())
            .map(RungTag)
            .ok_or(())
    }
}

/// Side and price of rung `index`.
///
/// Odd rungs hedge against the ladder at `entry ∓ distance`; even rungs
/// re-enter the ladder direction at `entry`.
pub fn rung_side_and_price(direction: Side, entry: Decimal, distance: Decimal, index: usize) -> (Side, Decimal) {
    if index % 2 == 1 {
        (direction.opposite(), entry - direction.sign() * distance)
    } else {
        (direction, entry)
    }
}

/// Take-profit and stop-loss for a rung opened on `side` at `price`.
pub fn rung_targets(
    side: Side,
    price: Decimal,
    tp_distance: Decimal,
    sl_distance: Option<Decimal>,
) -> (Decimal, Option<Decimal>) {
    let tp = price + side.sign() * tp_distance;
    let sl = sl_distance.map(|d| price - side.sign() * d);
    (tp, sl)
}

/// A rung ready to be sent to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RungPlan {
    pub index: usize,
    pub side: Side,
    pub price: Decimal,
    pub volume: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Option<Decimal>,
}

impl RungPlan {
    pub fn tag(&self) -> RungTag {
        RungTag(self.index)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the ladder is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "value", rename_all = "snake_case")]
pub enum Phase {
    Flat,
    /// Rung 0 is open; rung 1 has not been placed yet.
    InitialOpen,
    /// Waiting for rung `n` to activate. `n == lot_sizes.len()` once every rung is in.
    Hedging(usize),
    Unwinding(ExitReason),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Flat => write!(f, "FLAT"),
            Phase::InitialOpen => write!(f, "INITIAL_OPEN"),
            Phase::Hedging(i) => write!(f, "HEDGING({})", i),
            Phase::Unwinding(reason) => write!(f, "UNWINDING({})", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRung {
    pub index: usize,
    pub ticket: Ticket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRung {
    pub index: usize,
    pub ticket: Ticket,
}

/// Everything the ladder remembers about the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderState {
    pub cycle: Uuid,
    pub direction: Side,
    pub entry_price: Decimal,
    /// Hedge distance in price units, fixed for the whole cycle.
    pub distance: Decimal,
    /// Rung 0 targets as sent with the entry order.
    pub take_profit: Decimal,
    pub stop_loss: Option<Decimal>,
    pub tp_distance: Decimal,
    pub sl_distance: Option<Decimal>,
    pub digits: u32,
    /// One entry per activated rung, in activation order.
    pub active: Vec<ActiveRung>,
    pub pending: Option<PendingRung>,
    pub missing_position_checks: u32,
    pub missing_pending_checks: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub opened_at: DateTime<Utc>,
    /// Volatility-scaled equity target in points, fixed at open.
    #[serde(default)]
    pub equity_target_points: Option<Decimal>,
}

impl LadderState {
    pub fn active_rung(&self) -> Option<ActiveRung> {
        self.active.last().copied()
    }

    pub fn tickets(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.active.iter().map(|r| r.ticket)
    }

    fn clear_checks(&mut self) {
        self.missing_position_checks = 0;
        self.missing_pending_checks = 0;
        self.last_check = None;
    }
}

/// What an activation asks the controller to do next.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    /// The previous leg, to be closed.
    pub close_leg: Option<ActiveRung>,
    /// The rung to place next, if any remain.
    pub next: Option<RungPlan>,
}

/// Result of one desync check.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Continue,
    /// The pending rung is gone while the active leg is still open.
    ReplacePending(RungPlan),
    Unwind(ExitReason),
}

// ---------------------------------------------------------------------------
// Ladder
// ---------------------------------------------------------------------------

/// The hedging ladder state machine.
///
/// Pure bookkeeping: it plans rungs and records what the broker did, but
/// never talks to the broker itself.
#[derive(Debug, Clone)]
pub struct Ladder {
    config: LadderConfig,
    phase: Phase,
    state: Option<LadderState>,
}

impl Ladder {
    pub fn new(config: LadderConfig) -> Self {
        Self {
            config,
            phase: Phase::Flat,
            state: None,
        }
    }

    pub fn config(&self) -> &LadderConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> Option<&LadderState> {
        self.state.as_ref()
    }

    pub fn is_flat(&self) -> bool {
        self.phase == Phase::Flat
    }

    /// All rungs are active and nothing is left to place.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.phase, Phase::Hedging(i) if i >= self.config.len())
    }

    /// Highest rung index activated in this cycle.
    pub fn deepest_rung(&self) -> usize {
        self.state
            .as_ref()
            .and_then(|s| s.active.iter().map(|r| r.index).max())
            .unwrap_or(0)
    }

    /// Plan the market entry at `quote` for a fresh ladder.
    pub fn plan_entry(&self, direction: Side, quote: Decimal, symbol: &SymbolInfo) -> RungPlan {
        let tp_distance = symbol.points_to_price(self.config.take_profit_points);
        let sl_distance = self.config.stop_loss_points.map(|p| symbol.points_to_price(p));
        let (tp, sl) = rung_targets(direction, quote, tp_distance, sl_distance);
        RungPlan {
            index: 0,
            side: direction,
            price: symbol.normalize_price(quote),
            volume: self.config.lot_sizes[0],
            take_profit: symbol.normalize_price(tp),
            stop_loss: sl.map(|p| symbol.normalize_price(p)),
        }
    }

    /// Start a cycle after the entry order filled.
    pub fn open(
        &mut self,
        entry: &RungPlan,
        fill: &OrderReceipt,
        distance: Decimal,
        symbol: &SymbolInfo,
        now: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        if self.phase != Phase::Flat {
            return Err(EngineError::InvalidTransition(format!(
                "cannot open a ladder while {}",
                self.phase
            )));
        }
        let cycle = Uuid::new_v4();
        self.state = Some(LadderState {
            cycle,
            direction: entry.side,
            entry_price: symbol.normalize_price(fill.price),
            distance,
            take_profit: entry.take_profit,
            stop_loss: entry.stop_loss,
            tp_distance: symbol.points_to_price(self.config.take_profit_points),
            sl_distance: self.config.stop_loss_points.map(|p| symbol.points_to_price(p)),
            digits: symbol.digits,
            active: vec![ActiveRung {
                index: 0,
                ticket: fill.ticket,
            }],
            pending: None,
            missing_position_checks: 0,
            missing_pending_checks: 0,
            last_check: None,
            opened_at: now,
            equity_target_points: None,
        });
        self.phase = Phase::InitialOpen;
        Ok(cycle)
    }

    /// Fix this cycle's equity target in points.
    pub fn set_equity_target(&mut self, points: Option<Decimal>) {
        if let Some(state) = self.state.as_mut() {
            state.equity_target_points = points;
        }
    }

    /// Plan hedge rung `index` (1-based; rung 0 is the entry).
    pub fn plan_rung(&self, index: usize) -> Option<RungPlan> {
        let state = self.state.as_ref()?;
        if index == 0 || index >= self.config.len() {
            return None;
        }
        let (side, price) = rung_side_and_price(state.direction, state.entry_price, state.distance, index);
        let (tp, sl) = rung_targets(side, price, state.tp_distance, state.sl_distance);
        Some(RungPlan {
            index,
            side,
            price: price.round_dp(state.digits),
            volume: self.config.lot_sizes[index],
            take_profit: tp.round_dp(state.digits),
            stop_loss: sl.map(|p| p.round_dp(state.digits)),
        })
    }

    /// Record that rung `index` is working at the broker.
    pub fn rung_placed(&mut self, index: usize, ticket: Ticket) -> Result<(), EngineError> {
        self.expect_next_rung(index)?;
        self.phase = Phase::Hedging(index);
        if let Some(state) = self.state.as_mut() {
            state.pending = Some(PendingRung { index, ticket });
            state.missing_pending_checks = 0;
        }
        Ok(())
    }

    /// Record that rung `index` could not be placed. The ladder keeps waiting
    /// for it so the desync check can try again.
    pub fn placement_failed(&mut self, index: usize) -> Result<(), EngineError> {
        self.expect_next_rung(index)?;
        self.phase = Phase::Hedging(index);
        if let Some(state) = self.state.as_mut() {
            state.pending = None;
        }
        Ok(())
    }

    fn expect_next_rung(&self, index: usize) -> Result<(), EngineError> {
        let ok = match self.phase {
            Phase::InitialOpen => index == 1,
            Phase::Hedging(i) => i == index && index < self.config.len(),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition(format!(
                "rung {} is not the next rung while {}",
                index, self.phase
            )))
        }
    }

    /// Rung `index` became a position. Advances exactly one rung.
    pub fn activate(&mut self, index: usize, ticket: Ticket) -> Result<Activation, EngineError> {
        match self.phase {
            Phase::Hedging(i) if i == index && i < self.config.len() => {}
            phase => {
                return Err(EngineError::InvalidTransition(format!(
                    "rung {} cannot activate while {}",
                    index, phase
                )))
            }
        }
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| EngineError::InvalidTransition("no ladder state".to_string()))?;
        let previous = state.active_rung();
        state.active.push(ActiveRung { index, ticket });
        state.pending = None;
        state.clear_checks();
        self.phase = Phase::Hedging(index + 1);

        Ok(Activation {
            close_leg: previous.filter(|_| self.config.close_losing_leg),
            next: self.plan_rung(index + 1),
        })
    }

    /// Count one desync check. Checks closer together than the configured
    /// interval do not count.
    pub fn observe(&mut self, has_active: bool, has_pending: bool, now: DateTime<Utc>) -> Observation {
        let Phase::Hedging(next) = self.phase else {
            return Observation::Continue;
        };
        let expect_pending = next < self.config.len();
        let limit = self.config.desync_checks;
        let interval = capped_seconds(self.config.desync_interval_secs);
        let Some(state) = self.state.as_mut() else {
            return Observation::Continue;
        };

        let due = state.last_check.map_or(true, |last| now - last >= interval);
        let missing_position = !has_active;
        let missing_pending = expect_pending && !has_pending;

        if missing_position {
            if due {
                state.missing_position_checks += 1;
            }
        } else {
            state.missing_position_checks = 0;
        }
        if missing_pending {
            if due {
                state.missing_pending_checks += 1;
            }
        } else {
            state.missing_pending_checks = 0;
        }
        if missing_position || missing_pending {
            if due {
                state.last_check = Some(now);
            }
        } else {
            state.last_check = None;
        }

        if state.missing_position_checks >= limit {
            return Observation::Unwind(ExitReason::Desync);
        }
        if state.missing_pending_checks >= limit {
            if let Some(plan) = self.plan_rung(next) {
                return Observation::ReplacePending(plan);
            }
        }
        Observation::Continue
    }

    pub fn begin_unwind(&mut self, reason: ExitReason) -> Result<(), EngineError> {
        if self.phase == Phase::Flat {
            return Err(EngineError::InvalidTransition(format!(
                "nothing to unwind ({})",
                reason
            )));
        }
        self.phase = Phase::Unwinding(reason);
        Ok(())
    }

    /// Return to flat. Safe to call any number of times.
    pub fn reset(&mut self) -> Option<LadderState> {
        self.phase = Phase::Flat;
        self.state.take()
    }

    /// Put back a previously saved ladder.
    pub fn restore(&mut self, phase: Phase, state: LadderState) -> Result<(), EngineError> {
        let consistent = match phase {
            Phase::InitialOpen => state.active.len() == 1,
            Phase::Hedging(i) => i >= 1 && i <= self.config.len() && !state.active.is_empty(),
            Phase::Unwinding(_) => true,
            Phase::Flat => false,
        };
        if !consistent {
            return Err(EngineError::State(format!(
                "saved ladder is inconsistent with phase {}",
                phase
            )));
        }
        self.phase = phase;
        self.state = Some(state);
        Ok(())
    }
}

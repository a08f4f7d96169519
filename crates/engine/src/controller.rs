use crate::error::EngineError;
use crate::executor::OrderExecutor;
use crate::ladder::{Ladder, LadderConfig, Observation, Phase, RungPlan};
use crate::schedule::{capped_seconds, MAX_WAIT_SECS};
use crate::state_store::LadderSnapshot;
use chrono::{DateTime, Utc};
use hedgebot_brokers_common::{retry, RetryPolicy};
use hedgebot_core::*;
use hedgebot_risk::{EquityGuard, EquityTargets};
use hedgebot_signals::{closed_candles, GateDecision, SignalConfig, SignalRule, VolatilityGate, VolatilityGateConfig};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything the controller needs to run one ladder on one symbol.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Candles requested per poll, including the forming one.
    pub candle_count: usize,
    pub ladder: LadderConfig,
    pub signal: SignalConfig,
    pub volatility: VolatilityGateConfig,
    pub targets: EquityTargets,
    pub retry: RetryPolicy,
}

impl ControllerConfig {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            candle_count: 50,
            ladder: LadderConfig::default(),
            signal: SignalConfig::default(),
            volatility: VolatilityGateConfig::default(),
            targets: EquityTargets::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Config("symbol must not be empty".to_string()));
        }
        self.ladder.validate()?;
        self.signal.validate().map_err(EngineError::Config)?;
        self.targets.validate().map_err(EngineError::Config)?;
        self.retry.validate().map_err(EngineError::Config)?;

        let lookback = self.signal.build().lookback();
        if self.candle_count <= lookback {
            return Err(EngineError::Config(format!(
                "candle_count {} must exceed the signal lookback {}",
                self.candle_count, lookback
            )));
        }
        if let Some(atr) = &self.targets.profit_points_atr {
            if self.candle_count <= atr.period + 1 {
                return Err(EngineError::Config(format!(
                    "candle_count {} is too small for an equity ATR period of {}",
                    self.candle_count, atr.period
                )));
            }
        }
        if self.volatility.enabled {
            if self.volatility.pause_secs > MAX_WAIT_SECS {
                return Err(EngineError::Config(
                    "volatility.pause_secs must be at most one week".to_string(),
                ));
            }
            if self.volatility.period == 0 || self.volatility.max_atr <= Decimal::ZERO {
                return Err(EngineError::Config(
                    "volatility gate needs a positive period and max_atr".to_string(),
                ));
            }
            if self.candle_count <= self.volatility.period + 1 {
                return Err(EngineError::Config(format!(
                    "candle_count {} is too small for an ATR period of {}",
                    self.candle_count, self.volatility.period
                )));
            }
        }
        Ok(())
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Flat, no signal.
    Idle,
    /// Flat and standing aside after the volatility gate tripped.
    Paused { until: DateTime<Utc> },
    /// A new ladder opened.
    Opened { cycle: Uuid },
    /// Rung `index` activated.
    Advanced { index: usize },
    /// A ladder is open and nothing changed.
    Holding,
    /// The ladder closed out.
    Unwound { reason: ExitReason, deepest_rung: usize },
    /// Flat, and the signal could not be acted on.
    Skipped { reason: String },
}

/// How start-up reconciled the broker with the saved ladder.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    Flat,
    Resumed { cycle: Uuid, phase: Phase },
    ClosedOrphans { closed: usize, cancelled: usize },
}

/// Drives one [`Ladder`] against a broker, one poll at a time.
pub struct LadderController {
    config: ControllerConfig,
    symbol: SymbolInfo,
    ladder: Ladder,
    executor: OrderExecutor,
    signal: Box<dyn SignalRule>,
    gate: VolatilityGate,
    guard: EquityGuard,
    paused_until: Option<DateTime<Utc>>,
    last_signal_candle: Option<DateTime<Utc>>,
    events: Vec<LadderEvent>,
    cycles: usize,
}

impl LadderController {
    pub fn new(config: ControllerConfig, symbol: SymbolInfo, baseline_equity: Decimal) -> Self {
        let executor = OrderExecutor::new(
            config.symbol.clone(),
            config.retry.clone(),
            config.ladder.deviation,
            config.ladder.magic,
        );
        Self {
            ladder: Ladder::new(config.ladder.clone()),
            signal: config.signal.build(),
            gate: VolatilityGate::new(config.volatility.clone()),
            guard: EquityGuard::new(config.targets.clone(), baseline_equity),
            executor,
            symbol,
            config,
            paused_until: None,
            last_signal_candle: None,
            events: Vec::new(),
            cycles: 0,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn ladder(&self) -> &Ladder {
        &self.ladder
    }

    pub fn phase(&self) -> Phase {
        self.ladder.phase()
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    pub fn baseline_equity(&self) -> Decimal {
        self.guard.baseline()
    }

    /// Ladders opened since start-up.
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<LadderEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> LadderSnapshot {
        LadderSnapshot {
            saved_at: now,
            symbol: self.config.symbol.clone(),
            magic: self.config.ladder.magic,
            phase: self.ladder.phase(),
            state: self.ladder.state().cloned(),
        }
    }

    /// Advance the ladder by at most one step.
    pub async fn poll<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, EngineError> {
        match self.ladder.phase() {
            Phase::Flat => self.poll_flat(broker, now).await,
            Phase::InitialOpen => {
                if let Some(plan) = self.ladder.plan_rung(1) {
                    self.place_next(broker, plan).await?;
                }
                Ok(PollOutcome::Holding)
            }
            Phase::Hedging(next) => self.poll_hedging(broker, next, now).await,
            Phase::Unwinding(reason) => self.finish_unwind(broker, reason).await,
        }
    }

    /// Close the open ladder for an outside reason (session end, halt).
    pub async fn unwind<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        reason: ExitReason,
    ) -> Result<PollOutcome, EngineError> {
        match self.ladder.phase() {
            Phase::Flat => Ok(PollOutcome::Idle),
            Phase::Unwinding(pending) => self.finish_unwind(broker, pending).await,
            _ => self.start_unwind(broker, reason).await,
        }
    }

    /// Reconcile the broker with a saved ladder before the first poll.
    ///
    /// A snapshot whose positions are still open is resumed. Anything else
    /// left behind by this bot is closed.
    pub async fn recover<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        snapshot: Option<LadderSnapshot>,
    ) -> Result<RecoveryOutcome, EngineError> {
        let magic = self.config.ladder.magic;
        let positions: Vec<Position> = retry!(self.config.retry, "positions", broker.positions(&self.config.symbol))?
            .into_iter()
            .filter(|p| p.magic == magic)
            .collect();
        let orders: Vec<PendingOrder> =
            retry!(self.config.retry, "pending_orders", broker.pending_orders(&self.config.symbol))?
                .into_iter()
                .filter(|o| o.magic == magic)
                .collect();

        let saved = snapshot
            .filter(|s| s.symbol == self.config.symbol && s.magic == magic && s.phase != Phase::Flat)
            .and_then(|s| s.state.map(|state| (s.phase, state)));

        if let Some((phase, state)) = saved {
            let live = positions.iter().any(|p| state.tickets().any(|t| t == p.ticket));
            if live {
                let cycle = state.cycle;
                self.ladder.restore(phase, state)?;
                info!(%cycle, phase = %phase, "Resumed saved ladder");
                return Ok(RecoveryOutcome::Resumed { cycle, phase });
            }
            info!(phase = %phase, "Saved ladder has no open positions left, discarding it");
        }

        if positions.is_empty() && orders.is_empty() {
            return Ok(RecoveryOutcome::Flat);
        }
        warn!(
            positions = positions.len(),
            orders = orders.len(),
            "Found orders from an unknown ladder, closing them"
        );
        let report = self.executor.close_all(broker).await?;
        Ok(RecoveryOutcome::ClosedOrphans {
            closed: report.closed,
            cancelled: report.cancelled,
        })
    }

    async fn poll_flat<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, EngineError> {
        if let Some(until) = self.paused_until {
            if now < until {
                return Ok(PollOutcome::Paused { until });
            }
            info!("Volatility pause over");
            self.paused_until = None;
        }

        let candles = retry!(
            self.config.retry,
            "candles",
            broker.candles(&self.config.symbol, self.config.timeframe, self.config.candle_count)
        )?;
        let closed = closed_candles(&candles);
        let Some(last) = closed.last() else {
            return Ok(PollOutcome::Skipped {
                reason: "no closed candles".to_string(),
            });
        };
        // one decision per closed candle
        if self.last_signal_candle == Some(last.timestamp) {
            return Ok(PollOutcome::Idle);
        }
        self.last_signal_candle = Some(last.timestamp);

        if let GateDecision::Pause { seconds, .. } = self.gate.check(closed) {
            let until = now + capped_seconds(seconds);
            self.paused_until = Some(until);
            return Ok(PollOutcome::Paused { until });
        }

        let signal = self.signal.evaluate(closed);
        let Some(direction) = signal.side() else {
            debug!(rule = self.signal.name(), candle = %last.timestamp, "No signal");
            return Ok(PollOutcome::Idle);
        };

        let distance = match self.config.ladder.distance.resolve(&self.symbol, closed) {
            Some(d) if d > Decimal::ZERO => self.symbol.normalize_price(d),
            _ => {
                warn!(signal = ?signal, "Hedge distance unavailable, skipping signal");
                return Ok(PollOutcome::Skipped {
                    reason: "hedge distance unavailable".to_string(),
                });
            }
        };
        let equity_target = match &self.config.targets.profit_points_atr {
            None => None,
            Some(atr) => match atr.resolve(closed, self.symbol.point) {
                Some(points) if points > Decimal::ZERO => Some(points),
                _ => {
                    warn!(signal = ?signal, "ATR equity target unavailable, skipping signal");
                    return Ok(PollOutcome::Skipped {
                        reason: "equity target unavailable".to_string(),
                    });
                }
            },
        };
        info!(rule = self.signal.name(), side = %direction, candle = %last.timestamp, "Signal");
        self.open_ladder(broker, direction, distance, equity_target, now).await
    }

    async fn open_ladder<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        direction: Side,
        distance: Decimal,
        equity_target: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, EngineError> {
        let tick = retry!(self.config.retry, "tick", broker.tick(&self.config.symbol))?;
        let entry = self.ladder.plan_entry(direction, tick.entry_price(direction), &self.symbol);
        let fill = self.executor.open_market(broker, &entry).await?;
        let cycle = self.ladder.open(&entry, &fill, distance, &self.symbol, now)?;
        self.ladder.set_equity_target(equity_target);
        if let Some(points) = equity_target {
            info!(%cycle, points = %points.round_dp(1), "Equity target for this ladder");
        }
        self.cycles += 1;
        self.emit(LadderEvent::Opened {
            cycle,
            side: direction,
            entry_price: fill.price,
            volume: fill.volume,
            take_profit: entry.take_profit,
            stop_loss: entry.stop_loss,
            distance,
        });

        if let Some(plan) = self.ladder.plan_rung(1) {
            self.place_next(broker, plan).await?;
        }
        Ok(PollOutcome::Opened { cycle })
    }

    /// Place the next rung. A failure is recorded and left to the desync check.
    async fn place_next<B: Broker + ?Sized>(&mut self, broker: &mut B, plan: RungPlan) -> Result<(), EngineError> {
        match self.executor.place_rung(broker, &plan, &self.symbol).await {
            Ok(placement) => {
                self.ladder.rung_placed(plan.index, placement.receipt.ticket)?;
                self.emit(LadderEvent::RungPlaced {
                    index: plan.index,
                    ticket: placement.receipt.ticket,
                    side: plan.side,
                    price: placement.receipt.price,
                    volume: plan.volume,
                    at_market: placement.at_market,
                });
            }
            Err(err) => {
                self.ladder.placement_failed(plan.index)?;
                self.emit(LadderEvent::PlacementFailed {
                    index: plan.index,
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn poll_hedging<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        next: usize,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, EngineError> {
        let magic = self.config.ladder.magic;
        let positions: Vec<Position> = retry!(self.config.retry, "positions", broker.positions(&self.config.symbol))?
            .into_iter()
            .filter(|p| p.magic == magic)
            .collect();
        let orders: Vec<PendingOrder> =
            retry!(self.config.retry, "pending_orders", broker.pending_orders(&self.config.symbol))?
                .into_iter()
                .filter(|o| o.magic == magic)
                .collect();
        let state = self
            .ladder
            .state()
            .cloned()
            .ok_or_else(|| EngineError::InvalidTransition("hedging without ladder state".to_string()))?;
        let Some(active) = state.active_rung() else {
            return Err(EngineError::InvalidTransition("hedging without an active rung".to_string()));
        };

        // Take-profit first: a won cycle must not advance even if the next rung filled meanwhile.
        let active_position = positions.iter().find(|p| p.ticket == active.ticket);
        match active_position {
            Some(pos) => {
                let tick = retry!(self.config.retry, "tick", broker.tick(&self.config.symbol))?;
                let target = if active.index == 0 {
                    state.take_profit
                } else {
                    pos.open_price + pos.side.sign() * state.tp_distance
                };
                let exit = tick.exit_price(pos.side);
                if (exit - target) * pos.side.sign() >= Decimal::ZERO {
                    info!(rung = active.index, price = %exit, target = %target, "Take-profit reached");
                    return self.start_unwind(broker, ExitReason::TakeProfit).await;
                }
                if self.config.ladder.trailing_stop {
                    self.trail_stop(broker, active.index, pos, &tick, state.sl_distance).await;
                }
            }
            None => {
                for ticket in state.tickets() {
                    let deals = retry!(self.config.retry, "history_deals", broker.history_deals(ticket))?;
                    if let Some(deal) = deals.iter().find(|d| d.is_take_profit_exit()) {
                        info!(ticket, price = %deal.price, profit = %deal.profit, "Position closed at take-profit");
                        return self.start_unwind(broker, ExitReason::TakeProfit).await;
                    }
                }
            }
        }

        // The pending rung filled: by ticket, or by tag if the terminal reissued it.
        if next < self.config.ladder.len() {
            let filled = positions.iter().find(|p| {
                let known = state.tickets().any(|t| t == p.ticket);
                !known
                    && (state.pending.map(|r| r.ticket) == Some(p.ticket)
                        || self.config.ladder.is_rung(p.magic, &p.comment, next))
            });
            if let Some(pos) = filled {
                return self.activate(broker, next, pos.ticket).await;
            }
        }

        if !self.guard.targets().is_empty() {
            let account = retry!(self.config.retry, "account_state", broker.account_state())?;
            if let Some(hit) = self.guard.check(
                account.equity,
                positions.len(),
                self.symbol.point,
                self.config.ladder.lot_sizes[0],
                state.equity_target_points,
            ) {
                info!(?hit, baseline = %self.guard.baseline(), "Equity target hit");
                return self.start_unwind(broker, hit.exit_reason()).await;
            }
        }

        if self.ladder.is_exhausted() && orders.is_empty() {
            info!(deepest_rung = self.ladder.deepest_rung(), "Ladder exhausted");
            return self.start_unwind(broker, ExitReason::Exhausted).await;
        }

        let has_active = active_position.is_some();
        let has_pending = state
            .pending
            .map_or(false, |r| orders.iter().any(|o| o.ticket == r.ticket));
        let observation = self.ladder.observe(has_active, has_pending, now);
        if !has_active || (next < self.config.ladder.len() && !has_pending) {
            let count = self
                .ladder
                .state()
                .map_or(0, |s| s.missing_position_checks.max(s.missing_pending_checks));
            self.emit(LadderEvent::DesyncCheck {
                missing_position: !has_active,
                missing_pending: !has_pending,
                count,
            });
        }

        match observation {
            Observation::Continue => Ok(PollOutcome::Holding),
            Observation::ReplacePending(plan) => {
                match self.executor.place_rung(broker, &plan, &self.symbol).await {
                    Ok(placement) => {
                        self.ladder.rung_placed(plan.index, placement.receipt.ticket)?;
                        self.emit(LadderEvent::RungPlaced {
                            index: plan.index,
                            ticket: placement.receipt.ticket,
                            side: plan.side,
                            price: placement.receipt.price,
                            volume: plan.volume,
                            at_market: placement.at_market,
                        });
                        Ok(PollOutcome::Holding)
                    }
                    Err(err) => {
                        self.emit(LadderEvent::PlacementFailed {
                            index: plan.index,
                            reason: err.to_string(),
                        });
                        self.start_unwind(broker, ExitReason::PlacementFailed).await
                    }
                }
            }
            Observation::Unwind(reason) => self.start_unwind(broker, reason).await,
        }
    }

    /// Ratchet the active rung's stop-loss behind the market once it is in profit.
    /// Failures are logged; the next poll tries again.
    async fn trail_stop<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        index: usize,
        pos: &Position,
        tick: &Tick,
        sl_distance: Option<Decimal>,
    ) {
        let Some(distance) = sl_distance else {
            return;
        };
        let sign = pos.side.sign();
        let exit = tick.exit_price(pos.side);
        if (exit - pos.open_price) * sign <= Decimal::ZERO {
            return;
        }
        let stop_loss = self.symbol.normalize_price(exit - sign * distance);
        if matches!(pos.stop_loss, Some(current) if (stop_loss - current) * sign <= Decimal::ZERO) {
            return;
        }
        match self
            .executor
            .move_stop_loss(broker, pos.ticket, pos.take_profit, stop_loss)
            .await
        {
            Ok(()) => self.emit(LadderEvent::StopMoved {
                index,
                ticket: pos.ticket,
                stop_loss,
            }),
            Err(err) => warn!(rung = index, ticket = pos.ticket, error = %err, "Could not move stop-loss"),
        }
    }

    async fn activate<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        index: usize,
        ticket: Ticket,
    ) -> Result<PollOutcome, EngineError> {
        let activation = self.ladder.activate(index, ticket)?;
        self.emit(LadderEvent::RungActivated { index, ticket });

        if let Some(leg) = activation.close_leg {
            match self.executor.close_position(broker, leg.ticket).await {
                Ok(_) => self.emit(LadderEvent::LegClosed {
                    index: leg.index,
                    ticket: leg.ticket,
                }),
                Err(err) => warn!(rung = leg.index, ticket = leg.ticket, error = %err, "Could not close previous leg"),
            }
        }
        if let Some(plan) = activation.next {
            self.place_next(broker, plan).await?;
        }
        Ok(PollOutcome::Advanced { index })
    }

    async fn start_unwind<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        reason: ExitReason,
    ) -> Result<PollOutcome, EngineError> {
        self.ladder.begin_unwind(reason)?;
        info!(%reason, deepest_rung = self.ladder.deepest_rung(), "Unwinding ladder");
        self.finish_unwind(broker, reason).await
    }

    /// Close everything. On failure the ladder stays in `Unwinding` and the
    /// next poll tries again.
    async fn finish_unwind<B: Broker + ?Sized>(
        &mut self,
        broker: &mut B,
        reason: ExitReason,
    ) -> Result<PollOutcome, EngineError> {
        let report = self.executor.close_all(broker).await?;
        let deepest_rung = self.ladder.deepest_rung();
        let cycle = self.ladder.reset().map(|s| s.cycle).unwrap_or_else(Uuid::nil);

        match retry!(self.config.retry, "account_state", broker.account_state()) {
            Ok(account) => self.guard.rebase(account.equity),
            Err(err) => warn!(error = %err, "Could not refresh equity baseline"),
        }
        self.emit(LadderEvent::Unwound {
            cycle,
            reason,
            deepest_rung,
            closed_positions: report.closed,
            cancelled_orders: report.cancelled,
        });
        Ok(PollOutcome::Unwound { reason, deepest_rung })
    }

    fn emit(&mut self, event: LadderEvent) {
        match &event {
            LadderEvent::Opened {
                cycle,
                side,
                entry_price,
                volume,
                take_profit,
                distance,
                ..
            } => info!(
                %cycle,
                side = %side,
                price = %entry_price,
                volume = %volume,
                take_profit = %take_profit,
                distance = %distance,
                "Ladder opened"
            ),
            LadderEvent::RungPlaced {
                index,
                ticket,
                side,
                price,
                volume,
                at_market,
            } => info!(
                rung = index,
                ticket,
                side = %side,
                price = %price,
                volume = %volume,
                at_market,
                "Rung placed"
            ),
            LadderEvent::RungActivated { index, ticket } => info!(rung = index, ticket, "Rung activated"),
            LadderEvent::LegClosed { index, ticket } => info!(rung = index, ticket, "Previous leg closed"),
            LadderEvent::StopMoved {
                index,
                ticket,
                stop_loss,
            } => info!(rung = index, ticket, stop_loss = %stop_loss, "Stop-loss trailed"),
            LadderEvent::PlacementFailed { index, reason } => error!(rung = index, %reason, "Rung placement failed"),
            LadderEvent::DesyncCheck {
                missing_position,
                missing_pending,
                count,
            } => warn!(missing_position, missing_pending, count, "Broker out of step with ladder"),
            LadderEvent::Unwound {
                cycle,
                reason,
                deepest_rung,
                closed_positions,
                cancelled_orders,
            } => info!(
                %cycle,
                %reason,
                deepest_rung,
                closed_positions,
                cancelled_orders,
                "Ladder unwound"
            ),
        }
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::HedgeDistance;
    use crate::testkit::*;
    use chrono::Duration;
    use hedgebot_brokers_common::PaperBroker;
    use hedgebot_risk::AtrPointsTarget;
    use rust_decimal_macros::dec;

    fn config(lots: Vec<Decimal>) -> ControllerConfig {
        ControllerConfig {
            candle_count: 10,
            ladder: LadderConfig {
                lot_sizes: lots,
                distance: HedgeDistance::Fixed { points: dec!(1000) },
                take_profit_points: dec!(2000),
                ..Default::default()
            },
            retry: fast_retry(),
            ..ControllerConfig::new("XAUUSD", Timeframe::Minute(1))
        }
    }

    /// Two bullish closed candles and a forming one.
    fn bullish() -> Vec<Candle> {
        candles(&[(dec!(98), dec!(99)), (dec!(99), dec!(100)), (dec!(100), dec!(100))])
    }

    async fn opened(lots: Vec<Decimal>) -> (LadderController, PaperBroker) {
        let mut broker = paper(0).await;
        broker.set_candles(bullish());
        let mut controller = LadderController::new(config(lots), symbol(0), dec!(10000));
        let outcome = controller.poll(&mut broker, ts(0)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Opened { .. }));
        (controller, broker)
    }

    fn three_rungs() -> Vec<Decimal> {
        vec![dec!(0.01), dec!(0.02), dec!(0.04)]
    }

    #[tokio::test]
    async fn test_signal_opens_ladder_with_first_hedge() {
        let (mut controller, mut broker) = opened(three_rungs()).await;
        assert_eq!(controller.phase(), Phase::Hedging(1));

        let position = &broker.open_positions()[0];
        assert_eq!((position.side, position.open_price), (Side::Buy, dec!(100)));
        assert_eq!(position.take_profit, Some(dec!(120)));
        let order = &broker.working_orders()[0];
        assert_eq!((order.side, order.price, order.volume), (Side::Sell, dec!(90), dec!(0.02)));
        assert_eq!(order.comment, "rung-1");

        let events = controller.drain_events();
        assert!(matches!(events[0], LadderEvent::Opened { .. }));
        assert!(matches!(events[1], LadderEvent::RungPlaced { index: 1, at_market: false, .. }));
        assert_eq!(controller.poll(&mut broker, ts(0)).await.unwrap(), PollOutcome::Holding);
        assert_eq!(controller.cycles(), 1);
    }

    #[tokio::test]
    async fn test_activation_advances_one_rung() {
        let (mut controller, mut broker) = opened(three_rungs()).await;
        broker.set_quote(ts(1), dec!(89));

        assert_eq!(
            controller.poll(&mut broker, ts(1)).await.unwrap(),
            PollOutcome::Advanced { index: 1 }
        );
        assert_eq!(controller.phase(), Phase::Hedging(2));
        // rung 0 closed, rung 1 open, rung 2 working
        assert_eq!(broker.open_positions().len(), 1);
        assert_eq!(broker.open_positions()[0].side, Side::Sell);
        let order = &broker.working_orders()[0];
        assert_eq!((order.side, order.price, order.volume), (Side::Buy, dec!(100), dec!(0.04)));

        assert_eq!(controller.poll(&mut broker, ts(1)).await.unwrap(), PollOutcome::Holding);
        assert_eq!(controller.phase(), Phase::Hedging(2));
    }

    #[tokio::test]
    async fn test_take_profit_from_deal_history() {
        let (mut controller, mut broker) = opened(three_rungs()).await;
        // the broker closes rung 0 at its take-profit
        broker.set_quote(ts(1), dec!(121));
        assert!(broker.open_positions().is_empty());

        assert_eq!(
            controller.poll(&mut broker, ts(1)).await.unwrap(),
            PollOutcome::Unwound {
                reason: ExitReason::TakeProfit,
                deepest_rung: 0
            }
        );
        assert!(controller.ladder().is_flat());
        assert!(broker.working_orders().is_empty());
        assert_eq!(controller.baseline_equity(), dec!(10020));
        // same closed candle: no second ladder
        assert_eq!(controller.poll(&mut broker, ts(1)).await.unwrap(), PollOutcome::Idle);
    }

    #[tokio::test]
    async fn test_take_profit_from_quote() {
        let (mut controller, mut broker) = opened(three_rungs()).await;
        let ticket = broker.open_positions()[0].ticket;
        broker.modify_position(ticket, None, None).await.unwrap();
        broker.set_quote(ts(1), dec!(120));

        let outcome = controller.poll(&mut broker, ts(1)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Unwound { reason: ExitReason::TakeProfit, .. }));
        assert!(broker.open_positions().is_empty());
        assert_eq!(broker.balance(), dec!(10020));
    }

    #[tokio::test]
    async fn test_take_profit_beats_next_rung_fill() {
        let (mut controller, mut broker) = opened(vec![dec!(0.01), dec!(0.02), dec!(0.04), dec!(0.08)]).await;
        broker.set_quote(ts(1), dec!(89));
        assert_eq!(
            controller.poll(&mut broker, ts(1)).await.unwrap(),
            PollOutcome::Advanced { index: 1 }
        );

        // between polls rung 1 closes at its take-profit and price runs back through rung 2
        broker.set_quote(ts(2), dec!(69));
        broker.set_quote(ts(3), dec!(101));
        assert!(broker.deals().iter().any(|d| d.is_take_profit_exit()));
        assert_eq!(broker.open_positions().len(), 1);

        let outcome = controller.poll(&mut broker, ts(3)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Unwound { reason: ExitReason::TakeProfit, .. }));
        assert!(controller.ladder().is_flat());
        assert!(broker.open_positions().is_empty());
        assert!(broker.working_orders().is_empty());
    }

    #[tokio::test]
    async fn test_trailing_stop_ratchets() {
        let mut broker = paper(0).await;
        broker.set_candles(bullish());
        let mut cfg = config(three_rungs());
        cfg.ladder.stop_loss_points = Some(dec!(1000));
        cfg.ladder.trailing_stop = true;
        let mut controller = LadderController::new(cfg, symbol(0), dec!(10000));
        controller.poll(&mut broker, ts(0)).await.unwrap();
        assert_eq!(broker.open_positions()[0].stop_loss, Some(dec!(90)));
        controller.drain_events();

        // not in profit yet
        broker.set_quote(ts(1), dec!(99));
        assert_eq!(controller.poll(&mut broker, ts(1)).await.unwrap(), PollOutcome::Holding);
        assert_eq!(broker.open_positions()[0].stop_loss, Some(dec!(90)));

        broker.set_quote(ts(2), dec!(105));
        assert_eq!(controller.poll(&mut broker, ts(2)).await.unwrap(), PollOutcome::Holding);
        let position = &broker.open_positions()[0];
        assert_eq!((position.stop_loss, position.take_profit), (Some(dec!(95)), Some(dec!(120))));
        let events = controller.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, LadderEvent::StopMoved { index: 0, stop_loss, .. } if *stop_loss == dec!(95))));

        // never loosened
        broker.set_quote(ts(3), dec!(103));
        controller.poll(&mut broker, ts(3)).await.unwrap();
        assert_eq!(broker.open_positions()[0].stop_loss, Some(dec!(95)));
        assert!(controller.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_atr_equity_target_fixed_at_open() {
        let mut broker = paper(0).await;
        broker.set_candles(bullish());
        let mut cfg = config(three_rungs());
        cfg.targets.profit_points_atr = Some(AtrPointsTarget {
            period: 1,
            multiplier: dec!(10),
            smoothing: Default::default(),
        });
        let mut controller = LadderController::new(cfg, symbol(0), dec!(10000));
        controller.poll(&mut broker, ts(0)).await.unwrap();
        // ATR 2.00 is 200 points, times 10
        assert_eq!(
            controller.ladder().state().unwrap().equity_target_points,
            Some(dec!(2000))
        );

        broker.set_quote(ts(1), dec!(100.1));
        assert_eq!(controller.poll(&mut broker, ts(1)).await.unwrap(), PollOutcome::Holding);
        broker.set_quote(ts(2), dec!(100.3));
        assert_eq!(
            controller.poll(&mut broker, ts(2)).await.unwrap(),
            PollOutcome::Unwound {
                reason: ExitReason::ProfitTarget,
                deepest_rung: 0
            }
        );
    }

    #[tokio::test]
    async fn test_atr_equity_target_needs_history() {
        let mut broker = paper(0).await;
        broker.set_candles(bullish());
        let mut cfg = config(three_rungs());
        cfg.targets.profit_points_atr = Some(AtrPointsTarget {
            period: 5,
            multiplier: dec!(1),
            smoothing: Default::default(),
        });
        let mut controller = LadderController::new(cfg, symbol(0), dec!(10000));
        let outcome = controller.poll(&mut broker, ts(0)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Skipped { .. }));
        assert!(broker.open_positions().is_empty());
    }

    #[tokio::test]
    async fn test_two_failed_checks_close_everything() {
        let (mut controller, mut broker) = opened(three_rungs()).await;
        let position = broker.open_positions()[0].ticket;
        broker.drop_position(position);

        assert_eq!(controller.poll(&mut broker, ts(1)).await.unwrap(), PollOutcome::Holding);
        assert_eq!(controller.poll(&mut broker, ts(1) + Duration::seconds(30)).await.unwrap(), PollOutcome::Holding);
        assert_eq!(
            controller.poll(&mut broker, ts(2)).await.unwrap(),
            PollOutcome::Unwound {
                reason: ExitReason::Desync,
                deepest_rung: 0
            }
        );
        assert!(controller.ladder().is_flat());
        assert!(broker.working_orders().is_empty());
    }

    #[tokio::test]
    async fn test_missing_pending_is_replaced() {
        let (mut controller, mut broker) = opened(three_rungs()).await;
        let order = broker.working_orders()[0].ticket;
        broker.drop_pending(order);

        controller.poll(&mut broker, ts(1)).await.unwrap();
        assert!(broker.working_orders().is_empty());
        assert_eq!(controller.poll(&mut broker, ts(2)).await.unwrap(), PollOutcome::Holding);

        let orders = broker.working_orders();
        assert_eq!(orders.len(), 1);
        assert_ne!(orders[0].ticket, order);
        assert_eq!(orders[0].price, dec!(90));
        assert_eq!(controller.phase(), Phase::Hedging(1));
    }

    #[tokio::test]
    async fn test_loss_limit_unwinds() {
        let mut broker = paper(0).await;
        broker.set_candles(bullish());
        let mut cfg = config(three_rungs());
        cfg.targets.loss = Some(dec!(3));
        let mut controller = LadderController::new(cfg, symbol(0), dec!(10000));
        controller.poll(&mut broker, ts(0)).await.unwrap();

        broker.set_quote(ts(1), dec!(98));
        assert_eq!(controller.poll(&mut broker, ts(1)).await.unwrap(), PollOutcome::Holding);
        broker.set_quote(ts(2), dec!(96));
        assert_eq!(
            controller.poll(&mut broker, ts(2)).await.unwrap(),
            PollOutcome::Unwound {
                reason: ExitReason::LossLimit,
                deepest_rung: 0
            }
        );
        assert_eq!(controller.baseline_equity(), dec!(9996));
    }

    #[tokio::test]
    async fn test_last_rung_exhausts_ladder() {
        let (mut controller, mut broker) = opened(vec![dec!(0.01), dec!(0.02)]).await;
        broker.set_quote(ts(1), dec!(90));
        assert_eq!(
            controller.poll(&mut broker, ts(1)).await.unwrap(),
            PollOutcome::Advanced { index: 1 }
        );
        assert!(controller.ladder().is_exhausted());
        assert_eq!(
            controller.poll(&mut broker, ts(1)).await.unwrap(),
            PollOutcome::Unwound {
                reason: ExitReason::Exhausted,
                deepest_rung: 1
            }
        );
        assert!(broker.open_positions().is_empty());
    }

    #[tokio::test]
    async fn test_outside_unwind() {
        let (mut controller, mut broker) = opened(three_rungs()).await;
        let outcome = controller.unwind(&mut broker, ExitReason::SessionEnd).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Unwound { reason: ExitReason::SessionEnd, .. }));
        assert_eq!(
            controller.unwind(&mut broker, ExitReason::SessionEnd).await.unwrap(),
            PollOutcome::Idle
        );
    }

    #[tokio::test]
    async fn test_recover_resumes_saved_ladder() {
        let (controller, mut broker) = opened(three_rungs()).await;
        let snapshot = controller.snapshot(ts(0));

        let mut restarted = LadderController::new(config(three_rungs()), symbol(0), dec!(10000));
        let outcome = restarted.recover(&mut broker, Some(snapshot)).await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Resumed { phase: Phase::Hedging(1), .. }));

        broker.set_quote(ts(1), dec!(89));
        assert_eq!(
            restarted.poll(&mut broker, ts(1)).await.unwrap(),
            PollOutcome::Advanced { index: 1 }
        );
    }

    #[tokio::test]
    async fn test_recover_closes_orphans() {
        let (_, mut broker) = opened(three_rungs()).await;
        let mut restarted = LadderController::new(config(three_rungs()), symbol(0), dec!(10000));
        assert_eq!(
            restarted.recover(&mut broker, None).await.unwrap(),
            RecoveryOutcome::ClosedOrphans { closed: 1, cancelled: 1 }
        );
        assert_eq!(restarted.recover(&mut broker, None).await.unwrap(), RecoveryOutcome::Flat);
    }

    #[tokio::test]
    async fn test_volatility_gate_pauses() {
        let mut broker = paper(0).await;
        broker.set_candles(bullish());
        let mut cfg = config(three_rungs());
        cfg.volatility = VolatilityGateConfig {
            enabled: true,
            period: 1,
            max_atr: dec!(0.5),
            ..Default::default()
        };
        let mut controller = LadderController::new(cfg, symbol(0), dec!(10000));
        let until = ts(0) + Duration::seconds(600);
        assert_eq!(controller.poll(&mut broker, ts(0)).await.unwrap(), PollOutcome::Paused { until });
        assert_eq!(controller.poll(&mut broker, ts(5)).await.unwrap(), PollOutcome::Paused { until });
        assert!(broker.open_positions().is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(config(three_rungs()).validate().is_ok());
        let tiny = ControllerConfig {
            candle_count: 2,
            ..config(three_rungs())
        };
        assert!(tiny.validate().is_err());

        let mut long_pause = config(three_rungs());
        long_pause.volatility = VolatilityGateConfig {
            enabled: true,
            period: 1,
            pause_secs: u64::MAX,
            ..Default::default()
        };
        assert!(long_pause.validate().is_err());
    }
}

use crate::controller::{ControllerConfig, LadderController, PollOutcome};
use crate::error::EngineError;
use chrono::Duration;
use hedgebot_brokers_common::{PaperBroker, PaperBrokerConfig};
use hedgebot_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

/// Paper account settings for a replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub initial_balance: Decimal,
    /// Price units added to the bid to form the ask.
    pub spread: Decimal,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            spread: Decimal::ZERO,
        }
    }
}

/// Outcome of replaying a candle history.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySummary {
    pub candles: usize,
    pub ladders_opened: usize,
    /// Exit reason of every closed ladder, in order.
    pub exits: Vec<ExitReason>,
    /// Deepest rung any ladder reached.
    pub deepest_rung: usize,
    pub start_balance: Decimal,
    pub final_balance: Decimal,
    pub final_equity: Decimal,
    pub deals: usize,
    /// A ladder was still open on the last candle.
    pub open_at_end: bool,
}

impl ReplaySummary {
    pub fn exits_by(&self, reason: ExitReason) -> usize {
        self.exits.iter().filter(|r| **r == reason).count()
    }

    pub fn net_profit(&self) -> Decimal {
        self.final_balance - self.start_balance
    }
}

/// Quotes a candle is assumed to trade through: open, the nearer extreme, the far extreme, close.
fn price_path(candle: &Candle) -> [Decimal; 4] {
    if candle.is_bullish() {
        [candle.open, candle.low, candle.high, candle.close]
    } else {
        [candle.open, candle.high, candle.low, candle.close]
    }
}

/// Drive a controller over historical candles against the paper broker.
///
/// At each candle the broker serves history up to and including it (the
/// last one counts as forming), then the quote walks the candle's price path
/// with one poll per step.
pub async fn run_replay(
    candles: &[Candle],
    controller_config: ControllerConfig,
    symbol: SymbolInfo,
    config: ReplayConfig,
) -> Result<ReplaySummary, EngineError> {
    if candles.is_empty() {
        return Err(EngineError::Config("no candles to replay".to_string()));
    }
    controller_config.validate()?;

    let period = controller_config.timeframe.as_seconds() as i64;
    let window = controller_config.candle_count;
    let mut broker = PaperBroker::new(PaperBrokerConfig {
        initial_balance: config.initial_balance,
        symbol: symbol.clone(),
        spread: config.spread,
    });
    broker.connect().await?;
    let mut controller = LadderController::new(controller_config, symbol, config.initial_balance);

    info!(
        candles = candles.len(),
        from = %candles[0].timestamp,
        to = %candles[candles.len() - 1].timestamp,
        balance = %config.initial_balance,
        "Starting replay"
    );

    let mut exits = Vec::new();
    let mut deepest_rung = 0;
    for (i, candle) in candles.iter().enumerate() {
        let start = (i + 1).saturating_sub(window);
        broker.set_candles(candles[start..=i].to_vec());

        for (step, price) in price_path(candle).into_iter().enumerate() {
            let at = candle.timestamp + Duration::seconds(period * step as i64 / 4);
            broker.set_quote(at, price);
            match controller.poll(&mut broker, at).await {
                Ok(PollOutcome::Unwound { reason, deepest_rung: depth }) => {
                    exits.push(reason);
                    deepest_rung = deepest_rung.max(depth);
                }
                Ok(_) => {}
                Err(err) => warn!(candle = %candle.timestamp, error = %err, "Replay poll failed"),
            }
            controller.drain_events();
        }
    }

    if !controller.ladder().is_flat() {
        deepest_rung = deepest_rung.max(controller.ladder().deepest_rung());
    }
    let summary = ReplaySummary {
        candles: candles.len(),
        ladders_opened: controller.cycles(),
        exits,
        deepest_rung,
        start_balance: config.initial_balance,
        final_balance: broker.balance(),
        final_equity: broker.equity(),
        deals: broker.deals().len(),
        open_at_end: !controller.ladder().is_flat(),
    };
    info!(
        ladders = summary.ladders_opened,
        closed = summary.exits.len(),
        deepest_rung = summary.deepest_rung,
        net_profit = %summary.net_profit(),
        "Replay finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::{HedgeDistance, LadderConfig};
    use crate::testkit::*;

    fn controller_config() -> ControllerConfig {
        ControllerConfig {
            candle_count: 10,
            ladder: LadderConfig {
                lot_sizes: vec![dec!(0.01), dec!(0.02), dec!(0.04)],
                distance: HedgeDistance::Fixed { points: dec!(1000) },
                take_profit_points: dec!(2000),
                ..Default::default()
            },
            retry: fast_retry(),
            ..ControllerConfig::new("XAUUSD", Timeframe::Minute(1))
        }
    }

    #[test]
    fn test_price_path_order() {
        let bars = candles(&[(dec!(100), dec!(102)), (dec!(102), dec!(101))]);
        assert_eq!(price_path(&bars[0]), [dec!(100), dec!(99.5), dec!(102.5), dec!(102)]);
        assert_eq!(price_path(&bars[1]), [dec!(102), dec!(102.5), dec!(100.5), dec!(101)]);
    }

    #[tokio::test]
    async fn test_trend_reaches_take_profit() {
        let history = candles(&[
            (dec!(98), dec!(99)),
            (dec!(99), dec!(100)),
            (dec!(100), dec!(110)),
            (dec!(110), dec!(125)),
        ]);
        let summary = run_replay(&history, controller_config(), symbol(0), ReplayConfig::default())
            .await
            .unwrap();

        assert_eq!(summary.candles, 4);
        assert_eq!(summary.exits, vec![ExitReason::TakeProfit]);
        assert_eq!(summary.exits_by(ExitReason::TakeProfit), 1);
        assert_eq!(summary.final_balance, dec!(10020));
        assert_eq!(summary.net_profit(), dec!(20));
        // the next closed candle signals again and a second ladder opens
        assert_eq!(summary.ladders_opened, 2);
        assert!(summary.open_at_end);
    }

    #[tokio::test]
    async fn test_empty_history_is_rejected() {
        let err = run_replay(&[], controller_config(), symbol(0), ReplayConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}

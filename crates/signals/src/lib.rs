pub mod breakout;
pub mod consecutive;
pub mod gate;

pub use breakout::Breakout;
pub use consecutive::ConsecutiveCandles;
pub use gate::{GateDecision, VolatilityGate, VolatilityGateConfig};

use hedgebot_core::{Candle, Signal};
use serde::{Deserialize, Serialize};

/// A rule that turns the most recent closed candles into a signal.
///
/// Rules only ever see closed candles; the caller strips the forming one.
pub trait SignalRule: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// How many closed candles the rule looks at.
    fn lookback(&self) -> usize;

    /// Evaluate the rule. Fewer than `lookback()` candles yields `Signal::None`.
    fn evaluate(&self, closed: &[Candle]) -> Signal;
}

/// Which signal rule the bot runs, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SignalConfig {
    /// N closed candles in a row in the same direction.
    Consecutive { count: usize },
    /// Last closed candle breaks the previous one's high or low.
    Breakout,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig::Consecutive { count: 2 }
    }
}

impl SignalConfig {
    pub fn build(&self) -> Box<dyn SignalRule> {
        match self {
            SignalConfig::Consecutive { count } => Box::new(ConsecutiveCandles::new(*count)),
            SignalConfig::Breakout => Box::new(Breakout),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            SignalConfig::Consecutive { count } if *count == 0 => {
                Err("signal.count must be at least 1".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Drop the still-forming candle the broker returns last.
pub fn closed_candles(candles: &[Candle]) -> &[Candle] {
    match candles.split_last() {
        Some((_, closed)) => closed,
        None => candles,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{Duration, TimeZone, Utc};
    use hedgebot_core::Candle;
    use rust_decimal::Decimal;

    /// Build candles from (open, high, low, close) tuples, one minute apart.
    pub fn candles(bars: &[(Decimal, Decimal, Decimal, Decimal)]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        bars.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                timestamp: start + Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume: Decimal::ZERO,
            })
            .collect()
    }
}

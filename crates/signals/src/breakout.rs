use crate::SignalRule;
use hedgebot_core::{Candle, Signal};

/// Compares the last closed candle with the one before it.
///
/// A higher high is a buy; failing that, a lower low is a sell.
#[derive(Debug, Clone, Copy, Default)]
pub struct Breakout;

impl SignalRule for Breakout {
    fn name(&self) -> &str {
        "breakout"
    }

    fn lookback(&self) -> usize {
        2
    }

    fn evaluate(&self, closed: &[Candle]) -> Signal {
        let [.., prev, last] = closed else {
            return Signal::None;
        };
        if last.high > prev.high {
            Signal::Buy
        } else if last.low < prev.low {
            Signal::Sell
        } else {
            Signal::None
        }
    }
}

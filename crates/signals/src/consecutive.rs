use crate::SignalRule;
use hedgebot_core::{Candle, Signal};

/// Signals when the last `count` closed candles all move the same way.
///
/// A doji (close == open) breaks the run.
#[derive(Debug, Clone)]
pub struct ConsecutiveCandles {
    count: usize,
    name: String,
}

impl ConsecutiveCandles {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            name: format!("consecutive_{}", count),
        }
    }
}

impl SignalRule for ConsecutiveCandles {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.count
    }

    fn evaluate(&self, closed: &[Candle]) -> Signal {
        if self.count == 0 || closed.len() < self.count {
            return Signal::None;
        }
        let recent = &closed[closed.len() - self.count..];
        if recent.iter().all(Candle::is_bullish) {
            Signal::Buy
        } else if recent.iter().all(Candle::is_bearish) {
            Signal::Sell
        } else {
            Signal::None
        }
    }
}

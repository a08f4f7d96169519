use crate::Indicator;
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Fixed-window arithmetic mean.
///
/// Produces output only once `period` values have been seen; older values
/// fall out of the window.
#[derive(Debug, Clone)]
pub struct RollingMean {
    len: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl RollingMean {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "rolling window period must be > 0");
        Self {
            len: period,
            window: VecDeque::with_capacity(period + 1),
            sum: Decimal::ZERO,
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        (self.window.len() == self.len).then(|| self.sum / Decimal::from(self.len))
    }

    /// Number of values currently held.
    pub fn filled(&self) -> usize {
        self.window.len()
    }
}

impl Indicator for RollingMean {
    fn next(&mut self, value: Decimal) -> Option<Decimal> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.len {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest;
            }
        }
        self.value()
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = Decimal::ZERO;
    }

    fn period(&self) -> usize {
        self.len
    }

    fn is_ready(&self) -> bool {
        self.window.len() == self.len
    }
}

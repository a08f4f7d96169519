use crate::rolling::RollingMean;
use crate::Indicator;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How true-range values are averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtrSmoothing {
    /// Plain rolling mean of the last `period` true ranges.
    #[default]
    Simple,
    /// Wilder's recursive smoothing, seeded by the first rolling mean.
    Wilder,
}

/// Average True Range (ATR).
///
/// Requires high, low, close data. Feed via `next_hlc()` or use `next()` with close
/// (in which case ATR acts as a moving average of absolute changes, less accurate).
#[derive(Debug, Clone)]
pub struct Atr {
    len: usize,
    smoothing: AtrSmoothing,
    prev_close: Option<Decimal>,
    window: RollingMean,
    seed: VecDeque<Decimal>,
    current_atr: Option<Decimal>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self::with_smoothing(period, AtrSmoothing::Wilder)
    }

    pub fn with_smoothing(period: usize, smoothing: AtrSmoothing) -> Self {
        assert!(period > 0, "ATR period must be > 0");
        Self {
            len: period,
            smoothing,
            prev_close: None,
            window: RollingMean::new(period),
            seed: VecDeque::with_capacity(period),
            current_atr: None,
        }
    }

    /// Feed high, low, close and compute ATR (preferred method).
    pub fn next_hlc(&mut self, high: Decimal, low: Decimal, close: Decimal) -> Option<Decimal> {
        let hl = high - low;
        let tr = match self.prev_close {
            Some(prev_c) => hl.max((high - prev_c).abs()).max((low - prev_c).abs()),
            None => hl,
        };
        self.prev_close = Some(close);
        self.push_true_range(tr)
    }

    pub fn value(&self) -> Option<Decimal> {
        self.current_atr
    }

    fn push_true_range(&mut self, tr: Decimal) -> Option<Decimal> {
        match self.smoothing {
            AtrSmoothing::Simple => {
                self.current_atr = self.window.next(tr);
            }
            AtrSmoothing::Wilder => match self.current_atr {
                None => {
                    self.seed.push_back(tr);
                    if self.seed.len() >= self.len {
                        let sum: Decimal = self.seed.iter().sum();
                        self.current_atr = Some(sum / Decimal::from(self.len));
                    }
                }
                Some(prev_atr) => {
                    let period_dec = Decimal::from(self.len);
                    self.current_atr =
                        Some((prev_atr * (period_dec - Decimal::ONE) + tr) / period_dec);
                }
            },
        }
        self.current_atr
    }
}

impl Indicator for Atr {
    fn next(&mut self, value: Decimal) -> Option<Decimal> {
        // Simplified: treat each value as a "close" and compute TR as abs(change)
        let tr = match self.prev_close {
            Some(prev) => (value - prev).abs(),
            None => {
                self.prev_close = Some(value);
                return None;
            }
        };
        self.prev_close = Some(value);
        self.push_true_range(tr)
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.window.reset();
        self.seed.clear();
        self.current_atr = None;
    }

    fn period(&self) -> usize {
        self.len
    }

    fn is_ready(&self) -> bool {
        self.current_atr.is_some()
    }
}

/// ATR over a finished series of `(high, low, close)` bars.
///
/// The first bar has no previous close, so `period + 1` bars are required
/// before every true range in the window is a full one.
pub fn atr_of<I>(bars: I, period: usize, smoothing: AtrSmoothing) -> Option<Decimal>
where
    I: IntoIterator<Item = (Decimal, Decimal, Decimal)>,
{
    let mut atr = Atr::with_smoothing(period, smoothing);
    let mut count = 0usize;
    for (high, low, close) in bars {
        atr.next_hlc(high, low, close);
        count += 1;
    }
    if count <= period {
        return None;
    }
    atr.value()
}

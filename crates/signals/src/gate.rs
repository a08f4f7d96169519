use hedgebot_core::Candle;
use hedgebot_indicators::{atr_of, AtrSmoothing};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Settings for the ATR volatility gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityGateConfig {
    pub enabled: bool,
    pub period: usize,
    pub smoothing: AtrSmoothing,
    /// ATR (price units) above which signals are suppressed.
    pub max_atr: Decimal,
    /// How long to stand aside after the gate trips.
    pub pause_secs: u64,
}

impl Default for VolatilityGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: 14,
            smoothing: AtrSmoothing::Simple,
            max_atr: Decimal::ZERO,
            pause_secs: 600,
        }
    }
}

/// Result of checking the gate for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Open,
    /// Volatility too high; pause for this many seconds.
    Pause { atr: Decimal, seconds: u64 },
}

/// Blocks new ladders while the market is too volatile.
#[derive(Debug, Clone)]
pub struct VolatilityGate {
    config: VolatilityGateConfig,
}

impl VolatilityGate {
    pub fn new(config: VolatilityGateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VolatilityGateConfig {
        &self.config
    }

    /// Check the gate against closed candles. Too little history keeps it open.
    pub fn check(&self, closed: &[Candle]) -> GateDecision {
        if !self.config.enabled {
            return GateDecision::Open;
        }
        let bars = closed.iter().map(|c| (c.high, c.low, c.close));
        match atr_of(bars, self.config.period, self.config.smoothing) {
            Some(atr) if atr > self.config.max_atr => {
                tracing::warn!(
                    atr = %atr,
                    max_atr = %self.config.max_atr,
                    pause_secs = self.config.pause_secs,
                    "Volatility gate tripped"
                );
                GateDecision::Pause {
                    atr,
                    seconds: self.config.pause_secs,
                }
            }
            _ => GateDecision::Open,
        }
    }
}

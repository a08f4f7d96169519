use hedgebot_core::{Candle, ExitReason};
use hedgebot_indicators::{atr_of, AtrSmoothing};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Equity thresholds that close the whole ladder.
///
/// All amounts are relative to the baseline equity captured at start-up and
/// after each unwind. Unset targets are never hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquityTargets {
    /// Close everything once equity has gained this much (account currency).
    pub profit: Option<Decimal>,
    /// Close everything once equity has lost this much (account currency).
    pub loss: Option<Decimal>,
    /// Profit target in points of the base lot: `gain / (point * lot_sizes[0])`.
    pub profit_points: Option<Decimal>,
    /// Points target scaled by volatility, fixed when each ladder opens.
    pub profit_points_atr: Option<AtrPointsTarget>,
    /// Only evaluate while at least this many ladder positions are open.
    pub min_positions: usize,
}

/// ATR of the closed candles, in points, times `multiplier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrPointsTarget {
    pub period: usize,
    pub multiplier: Decimal,
    #[serde(default)]
    pub smoothing: AtrSmoothing,
}

impl AtrPointsTarget {
    /// The target in points, or `None` while there is not enough history.
    pub fn resolve(&self, closed: &[Candle], point: Decimal) -> Option<Decimal> {
        if point <= Decimal::ZERO {
            return None;
        }
        let bars = closed.iter().map(|c| (c.high, c.low, c.close));
        atr_of(bars, self.period, self.smoothing).map(|atr| atr / point * self.multiplier)
    }
}

impl EquityTargets {
    pub fn is_empty(&self) -> bool {
        self.profit.is_none()
            && self.loss.is_none()
            && self.profit_points.is_none()
            && self.profit_points_atr.is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("profit", self.profit),
            ("loss", self.loss),
            ("profit_points", self.profit_points),
        ] {
            if matches!(value, Some(v) if v <= Decimal::ZERO) {
                return Err(format!("targets.{} must be positive", name));
            }
        }
        if let Some(atr) = &self.profit_points_atr {
            if atr.period == 0 || atr.multiplier <= Decimal::ZERO {
                return Err("targets.profit_points_atr needs a positive period and multiplier".to_string());
            }
        }
        Ok(())
    }
}

/// Which target fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetHit {
    Profit { equity: Decimal, target: Decimal },
    Loss { equity: Decimal, limit: Decimal },
    ProfitPoints { points: Decimal, target: Decimal },
}

impl TargetHit {
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            TargetHit::Profit { .. } | TargetHit::ProfitPoints { .. } => ExitReason::ProfitTarget,
            TargetHit::Loss { .. } => ExitReason::LossLimit,
        }
    }
}

/// Tracks the equity baseline and checks the targets against it.
#[derive(Debug, Clone)]
pub struct EquityGuard {
    targets: EquityTargets,
    baseline: Decimal,
}

impl EquityGuard {
    pub fn new(targets: EquityTargets, baseline: Decimal) -> Self {
        Self { targets, baseline }
    }

    pub fn targets(&self) -> &EquityTargets {
        &self.targets
    }

    pub fn baseline(&self) -> Decimal {
        self.baseline
    }

    /// Start measuring from a new equity level (after an unwind).
    pub fn rebase(&mut self, equity: Decimal) {
        info!(old = %self.baseline, new = %equity, "Equity baseline reset");
        self.baseline = equity;
    }

    /// Check every configured target. `point` and `base_lot` convert the gain
    /// to points for `profit_points` and for `cycle_points`, the ATR target
    /// resolved when the current ladder opened.
    pub fn check(
        &self,
        equity: Decimal,
        open_positions: usize,
        point: Decimal,
        base_lot: Decimal,
        cycle_points: Option<Decimal>,
    ) -> Option<TargetHit> {
        if open_positions < self.targets.min_positions {
            return None;
        }
        let gain = equity - self.baseline;

        if let Some(profit) = self.targets.profit {
            if equity >= self.baseline + profit {
                return Some(TargetHit::Profit {
                    equity,
                    target: self.baseline + profit,
                });
            }
        }
        if let Some(loss) = self.targets.loss {
            if equity <= self.baseline - loss {
                return Some(TargetHit::Loss {
                    equity,
                    limit: self.baseline - loss,
                });
            }
        }
        let unit = point * base_lot;
        if unit.is_zero() {
            return None;
        }
        let points = gain / unit;
        [self.targets.profit_points, cycle_points]
            .into_iter()
            .flatten()
            .find(|target| points >= *target)
            .map(|target| TargetHit::ProfitPoints { points, target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn guard(targets: EquityTargets) -> EquityGuard {
        EquityGuard::new(targets, dec!(1000))
    }

    #[test]
    fn test_profit_and_loss() {
        let g = guard(EquityTargets {
            profit: Some(dec!(50)),
            loss: Some(dec!(100)),
            ..Default::default()
        });
        assert_eq!(g.check(dec!(1049.99), 1, dec!(0.01), dec!(0.01), None), None);
        let hit = g.check(dec!(1050), 1, dec!(0.01), dec!(0.01), None).unwrap();
        assert_eq!(hit.exit_reason(), ExitReason::ProfitTarget);
        let hit = g.check(dec!(900), 1, dec!(0.01), dec!(0.01), None).unwrap();
        assert_eq!(
            hit,
            TargetHit::Loss {
                equity: dec!(900),
                limit: dec!(900)
            }
        );
        assert_eq!(hit.exit_reason(), ExitReason::LossLimit);
    }

    #[test]
    fn test_profit_points() {
        let g = guard(EquityTargets {
            profit_points: Some(dec!(500)),
            min_positions: 2,
            ..Default::default()
        });
        // 5.00 gain / (0.01 * 1.0) = 500 points
        assert_eq!(g.check(dec!(1005), 1, dec!(0.01), dec!(1), None), None);
        assert_eq!(
            g.check(dec!(1005), 2, dec!(0.01), dec!(1), None),
            Some(TargetHit::ProfitPoints {
                points: dec!(500),
                target: dec!(500)
            })
        );
    }

    #[test]
    fn test_cycle_points_target() {
        let g = guard(EquityTargets::default());
        // 0.3 gain on a 0.01 base lot with point 0.01 is 3000 points
        assert_eq!(g.check(dec!(1000.1), 2, dec!(0.01), dec!(0.01), Some(dec!(2000))), None);
        assert_eq!(
            g.check(dec!(1000.3), 2, dec!(0.01), dec!(0.01), Some(dec!(2000))),
            Some(TargetHit::ProfitPoints {
                points: dec!(3000),
                target: dec!(2000)
            })
        );
        assert_eq!(g.check(dec!(1000.3), 2, dec!(0.01), dec!(0.01), None), None);
    }

    #[test]
    fn test_atr_points_target_resolves() {
        let target = AtrPointsTarget {
            period: 2,
            multiplier: dec!(1.1),
            smoothing: AtrSmoothing::Simple,
        };
        let bar = |high, low, close| Candle {
            timestamp: chrono::Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        };
        let closed = vec![
            bar(dec!(101), dec!(99), dec!(100)),
            bar(dec!(102), dec!(100), dec!(101)),
            bar(dec!(103), dec!(101), dec!(102)),
        ];
        // true ranges 2 and 2, ATR 2.00 = 200 points, times 1.1
        assert_eq!(target.resolve(&closed, dec!(0.01)), Some(dec!(220)));
        assert_eq!(target.resolve(&closed[..2], dec!(0.01)), None);
    }

    #[test]
    fn test_rebase_moves_targets() {
        let mut g = guard(EquityTargets {
            profit: Some(dec!(10)),
            ..Default::default()
        });
        assert!(g.check(dec!(1010), 0, dec!(0.01), dec!(0.01), None).is_some());
        g.rebase(dec!(1010));
        assert!(g.check(dec!(1010), 0, dec!(0.01), dec!(0.01), None).is_none());
    }

    #[test]
    fn test_validate() {
        assert!(EquityTargets::default().is_empty());
        let bad = EquityTargets {
            loss: Some(dec!(-5)),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let flat_atr = EquityTargets {
            profit_points_atr: Some(AtrPointsTarget {
                period: 14,
                multiplier: Decimal::ZERO,
                smoothing: AtrSmoothing::Simple,
            }),
            ..Default::default()
        };
        assert!(!flat_atr.is_empty());
        assert!(flat_atr.validate().is_err());
    }
}

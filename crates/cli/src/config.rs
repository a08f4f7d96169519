use anyhow::{bail, Context, Result};
use hedgebot_brokers_common::RetryPolicy;
use hedgebot_brokers_metatrader::MetaTraderConfig;
use hedgebot_core::{SymbolInfo, Timeframe};
use hedgebot_engine::{ControllerConfig, LadderConfig, ReplayConfig, RunnerConfig, WatcherConfig};
use hedgebot_risk::{EquityTargets, TradingSession};
use hedgebot_signals::{SignalConfig, VolatilityGateConfig};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The bot's TOML configuration file. Credentials never live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Poll every N seconds instead of once per candle.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default = "default_candle_count")]
    pub candle_count: usize,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub volatility: VolatilityGateConfig,
    #[serde(default)]
    pub targets: EquityTargets,
    #[serde(default)]
    pub session: Option<TradingSession>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub watchers: WatcherConfig,
    #[serde(default)]
    pub replay: ReplaySection,
}

fn default_candle_count() -> usize {
    50
}

/// Bridge address plus reconnect pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    #[serde(flatten)]
    pub bridge: MetaTraderConfig,
    pub reconnect_backoff_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            bridge: MetaTraderConfig::default(),
            reconnect_backoff_secs: 5,
        }
    }
}

/// Symbol properties and paper account used when replaying without a terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySection {
    pub point: Decimal,
    pub digits: u32,
    pub stops_level: u32,
    pub volume_step: Decimal,
    pub contract_size: Decimal,
    pub balance: Decimal,
    pub spread: Decimal,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            point: dec!(0.01),
            digits: 2,
            stops_level: 0,
            volume_step: dec!(0.01),
            contract_size: dec!(100),
            balance: dec!(10000),
            spread: Decimal::ZERO,
        }
    }
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            candle_count: self.candle_count,
            ladder: self.ladder.clone(),
            signal: self.signal.clone(),
            volatility: self.volatility.clone(),
            targets: self.targets.clone(),
            retry: self.retry.clone(),
        }
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval_secs: self.poll_interval_secs,
            reconnect_backoff_secs: self.broker.reconnect_backoff_secs,
            session: self.session,
            watchers: self.watchers.clone(),
            state_file: self.state_file.clone(),
            ..RunnerConfig::new(self.controller())
        }
    }

    pub fn replay_symbol(&self) -> SymbolInfo {
        SymbolInfo {
            symbol: self.symbol.clone(),
            point: self.replay.point,
            digits: self.replay.digits,
            stops_level: self.replay.stops_level,
            volume_step: self.replay.volume_step,
            contract_size: self.replay.contract_size,
            visible: true,
        }
    }

    pub fn replay_account(&self) -> ReplayConfig {
        ReplayConfig {
            initial_balance: self.replay.balance,
            spread: self.replay.spread,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.controller().validate()?;
        if self.broker.bridge.port == 0 {
            bail!("broker.port must not be 0");
        }
        if self.watchers.session_close && self.session.is_none() {
            bail!("watchers.session_close needs a [session] window");
        }
        for (name, value) in [
            ("watchers.equity_profit", self.watchers.equity_profit),
            ("watchers.equity_loss", self.watchers.equity_loss),
        ] {
            if matches!(value, Some(v) if v <= Decimal::ZERO) {
                bail!("{} must be positive", name);
            }
        }
        if self.replay.point <= Decimal::ZERO || self.replay.contract_size <= Decimal::ZERO {
            bail!("replay.point and replay.contract_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedgebot_engine::HedgeDistance;

    const SAMPLE: &str = include_str!("../../../config/bot.toml");

    #[test]
    fn test_sample_config_is_valid() {
        let config = BotConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.symbol, "XAUUSD");
        assert_eq!(config.ladder.magic, 10002);
        assert_eq!(config.ladder.lot_sizes[0], dec!(0.01));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = BotConfig::from_toml_str("symbol = \"BTCUSD\"\ntimeframe = \"1h\"\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.timeframe, Timeframe::Hour(1));
        assert_eq!(config.candle_count, 50);
        assert_eq!(config.broker.bridge.port, 5556);
        assert_eq!(config.ladder, LadderConfig::default());
        assert_eq!(config.retry.max_attempts, 10);
        assert!(config.session.is_none());
        assert_eq!(config.runner().reconnect_backoff_secs, 5);
    }

    #[test]
    fn test_sections_override_defaults() {
        let raw = r#"
symbol = "XAUUSD"
timeframe = "15m"

[broker]
host = "10.0.0.5"
port = 7000

[ladder]
lot_sizes = [0.1, 0.2]
take_profit_points = 500

[ladder.distance]
mode = "atr"
period = 14
multiplier = 1.5

[signal]
rule = "breakout"

[session]
start = "22:00"
end = "04:00"
"#;
        let config = BotConfig::from_toml_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.bridge.host, "10.0.0.5");
        assert_eq!(config.broker.bridge.timeout_secs, 10);
        assert!(matches!(config.ladder.distance, HedgeDistance::Atr { period: 14, .. }));
        assert_eq!(config.signal, SignalConfig::Breakout);
        assert!(config.session.is_some());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let raw = "symbol = \"XAUUSD\"\ntimeframe = \"1m\"\n[ladder]\nlot_sizes = [0.01]\n";
        assert!(BotConfig::from_toml_str(raw).unwrap().validate().is_err());

        let raw = "symbol = \"XAUUSD\"\ntimeframe = \"1m\"\n[watchers]\nsession_close = true\n";
        assert!(BotConfig::from_toml_str(raw).unwrap().validate().is_err());

        assert!(BotConfig::from_toml_str("symbol = \"XAUUSD\"\ntimeframe = \"7x\"\n").is_err());
    }
}

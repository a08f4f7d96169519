//! Shared fixtures for engine tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use hedgebot_brokers_common::{PaperBroker, PaperBrokerConfig, RetryPolicy};
use hedgebot_core::*;
use hedgebot_risk::TradingSession;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub(crate) const MAGIC: u64 = 10002;

pub(crate) fn symbol(stops_level: u32) -> SymbolInfo {
    SymbolInfo {
        symbol: "XAUUSD".to_string(),
        point: dec!(0.01),
        digits: 2,
        stops_level,
        volume_step: dec!(0.01),
        contract_size: dec!(100),
        visible: true,
    }
}

pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        delay_ms: 1,
        backoff: 1.0,
        max_delay_ms: 1,
    }
}

pub(crate) fn ts(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap() + Duration::minutes(minute)
}

/// Connected paper broker quoting a bid of 100 at `ts(0)`.
pub(crate) async fn paper(stops_level: u32) -> PaperBroker {
    let mut broker = PaperBroker::new(PaperBrokerConfig::new(symbol(stops_level), dec!(10000)));
    broker.connect().await.unwrap();
    broker.set_quote(ts(0), dec!(100));
    broker
}

/// One-minute candles from `(open, close)` pairs starting at `ts(0)`.
pub(crate) fn candles(bars: &[(Decimal, Decimal)]) -> Vec<Candle> {
    bars.iter()
        .enumerate()
        .map(|(i, &(open, close))| Candle {
            timestamp: ts(i as i64),
            open,
            high: open.max(close) + dec!(0.5),
            low: open.min(close) - dec!(0.5),
            close,
            volume: Decimal::ZERO,
        })
        .collect()
}

/// A two-hour window around the current time, or one starting an hour from now.
pub(crate) fn session_around_now(open: bool) -> TradingSession {
    let now = Utc::now().time();
    if open {
        TradingSession::new(now - Duration::hours(1), now + Duration::hours(1))
    } else {
        TradingSession::new(now + Duration::hours(1), now + Duration::hours(2))
    }
}

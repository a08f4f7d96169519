use crate::DataError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use hedgebot_core::Candle;
use rust_decimal::Decimal;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Load candles from a CSV file, oldest first.
///
/// Accepts plain `timestamp,open,high,low,close[,volume]` files as well as
/// MetaTrader history exports (tab separated, `<DATE>`/`<TIME>` columns,
/// `<TICKVOL>` as volume).
pub fn load_candles(path: &Path) -> Result<Vec<Candle>, DataError> {
    if !path.exists() {
        return Err(DataError::NotFound(format!("CSV file not found: {}", path.display())));
    }
    let raw = std::fs::read(path)?;
    let candles = load_candles_from_reader(raw.as_slice())?;
    info!(path = %path.display(), count = candles.len(), "Loaded candles");
    Ok(candles)
}

/// Load candles from any reader. The delimiter is sniffed from the header line.
pub fn load_candles_from_reader<R: Read>(mut reader: R) -> Result<Vec<Candle>, DataError> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    let header_line = text.lines().next().unwrap_or_default();
    let delimiter = if header_line.contains('\t') {
        b'\t'
    } else if header_line.contains(';') {
        b';'
    } else {
        b','
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| DataError::ParseError(format!("Failed to read headers: {}", e)))?
        .clone();
    let cols = resolve_columns(&headers)?;

    let mut candles = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|e| DataError::ParseError(format!("CSV record error: {}", e)))?;
        let field = |idx: usize| record.get(idx).unwrap_or_default();

        let timestamp = match cols.time {
            Some(t) => parse_split_timestamp(field(cols.timestamp), field(t))?,
            None => parse_timestamp(field(cols.timestamp))?,
        };
        let candle = Candle {
            timestamp,
            open: parse_decimal(field(cols.open), "open")?,
            high: parse_decimal(field(cols.high), "high")?,
            low: parse_decimal(field(cols.low), "low")?,
            close: parse_decimal(field(cols.close), "close")?,
            volume: match cols.volume {
                Some(v) => parse_decimal(field(v), "volume")?,
                None => Decimal::ZERO,
            },
        };
        if candle.high < candle.low {
            return Err(DataError::ParseError(format!(
                "row {}: high {} below low {}",
                line + 2,
                candle.high,
                candle.low
            )));
        }
        candles.push(candle);
    }

    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

struct ColumnMap {
    timestamp: usize,
    /// Separate time-of-day column (MetaTrader exports).
    time: Option<usize>,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: Option<usize>,
}

fn resolve_columns(headers: &csv::StringRecord) -> Result<ColumnMap, DataError> {
    let required = |names: &[&str], what: &str| {
        find_column(headers, names).ok_or_else(|| DataError::ParseError(format!("No {} column found", what)))
    };
    let (timestamp, time) = match find_column(headers, &["timestamp", "datetime"]) {
        Some(ts) => (ts, None),
        None => {
            let date = required(&["date", "time"], "timestamp")?;
            let time = find_column(headers, &["time"]).filter(|t| *t != date);
            (date, time)
        }
    };

    Ok(ColumnMap {
        timestamp,
        time,
        open: required(&["open", "o"], "open")?,
        high: required(&["high", "h"], "high")?,
        low: required(&["low", "l"], "low")?,
        close: required(&["close", "c"], "close")?,
        volume: find_column(headers, &["volume", "vol", "tickvol", "v"]),
    })
}

/// Case-insensitive header lookup; `<OPEN>` matches `open`.
fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let h = header
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_lowercase();
        names.iter().any(|name| h == *name)
    })
}

fn parse_decimal(s: &str, field: &str) -> Result<Decimal, DataError> {
    Decimal::from_str(s.trim())
        .map_err(|e| DataError::ParseError(format!("Failed to parse {} '{}': {}", field, s, e)))
}

fn parse_split_timestamp(date: &str, time: &str) -> Result<DateTime<Utc>, DataError> {
    let date = ["%Y.%m.%d", "%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date.trim(), fmt).ok())
        .ok_or_else(|| DataError::ParseError(format!("Unable to parse date: '{}'", date)))?;
    let time = ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(time.trim(), fmt).ok())
        .ok_or_else(|| DataError::ParseError(format!("Unable to parse time: '{}'", time)))?;
    Ok(date.and_time(time).and_utc())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DataError> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Without timezone, assume UTC
    let formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y.%m.%d %H:%M:%S",
        "%Y.%m.%d %H:%M",
    ];
    for fmt in &formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }

    // Unix seconds, as MT5 `copy_rates` returns them
    if let Ok(ts) = s.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(ts, 0) {
            return Ok(dt);
        }
    }

    Err(DataError::ParseError(format!("Unable to parse timestamp: '{}'", s)))
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Broker-assigned identifier for orders, positions, and deals.
pub type Ticket = u64;

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// A single OHLC candle as delivered by the broker feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// True range against the previous candle's close (or plain range for the first candle).
    pub fn true_range(&self, prev_close: Option<Decimal>) -> Decimal {
        let hl = self.high - self.low;
        match prev_close {
            Some(pc) => hl.max((self.high - pc).abs()).max((self.low - pc).abs()),
            None => hl,
        }
    }
}

/// Best bid/ask quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Tick {
    /// Price at which an order on `side` opens.
    pub fn entry_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Price at which a position on `side` closes.
    pub fn exit_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }

    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Candle timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    Minute(u32),
    Hour(u32),
    Daily,
}

impl Timeframe {
    pub fn as_seconds(&self) -> u64 {
        match self {
            Timeframe::Minute(n) => u64::from(*n) * 60,
            Timeframe::Hour(n) => u64::from(*n) * 3600,
            Timeframe::Daily => 86_400,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Minute(n) => write!(f, "{}m", n),
            Timeframe::Hour(n) => write!(f, "{}h", n),
            Timeframe::Daily => write!(f, "1d"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "1d" || s == "d1" || s == "daily" {
            return Ok(Timeframe::Daily);
        }
        let (digits, unit) = s.split_at(s.len().saturating_sub(1));
        let n: u32 = digits
            .parse()
            .map_err(|_| format!("invalid timeframe '{}'", s))?;
        if n == 0 {
            return Err(format!("invalid timeframe '{}'", s));
        }
        match unit {
            "m" => Ok(Timeframe::Minute(n)),
            "h" => Ok(Timeframe::Hour(n)),
            _ => Err(format!("invalid timeframe '{}'", s)),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

/// Trading properties of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Smallest price increment.
    pub point: Decimal,
    /// Price precision in decimal places.
    pub digits: u32,
    /// Minimum distance (in points) between market price and a pending order.
    pub stops_level: u32,
    pub volume_step: Decimal,
    pub contract_size: Decimal,
    pub visible: bool,
}

impl SymbolInfo {
    /// Convert a distance expressed in points to a price distance.
    pub fn points_to_price(&self, points: Decimal) -> Decimal {
        points * self.point
    }

    /// Minimum pending-order distance in price units.
    pub fn stops_distance(&self) -> Decimal {
        Decimal::from(self.stops_level) * self.point
    }

    pub fn normalize_price(&self, price: Decimal) -> Decimal {
        price.round_dp(self.digits)
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Order / position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells; multiplies a favourable price move.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome of a signal rule for one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    None,
    Buy,
    Sell,
}

impl Signal {
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::None => None,
            Signal::Buy => Some(Side::Buy),
            Signal::Sell => Some(Side::Sell),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// The type of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

/// An order request sent to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub volume: Decimal,
    /// Requested price; `None` for market orders at the current quote.
    pub price: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    /// Maximum accepted slippage in points.
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
}

impl OrderRequest {
    /// Create a new market order.
    pub fn market(symbol: &str, side: Side, volume: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            volume,
            price: None,
            take_profit: None,
            stop_loss: None,
            deviation: 20,
            magic: 0,
            comment: String::new(),
        }
    }

    /// Create a new stop order.
    pub fn stop(symbol: &str, side: Side, volume: Decimal, price: Decimal) -> Self {
        Self {
            kind: OrderKind::Stop,
            price: Some(price),
            ..Self::market(symbol, side, volume)
        }
    }

    pub fn with_targets(mut self, take_profit: Option<Decimal>, stop_loss: Option<Decimal>) -> Self {
        self.take_profit = take_profit;
        self.stop_loss = stop_loss;
        self
    }

    pub fn tagged(mut self, magic: u64, comment: impl Into<String>) -> Self {
        self.magic = magic;
        self.comment = comment.into();
        self
    }

    pub fn with_deviation(mut self, deviation: u32) -> Self {
        self.deviation = deviation;
        self
    }
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    /// Order ticket; for market orders this is also the resulting position ticket.
    pub ticket: Ticket,
    pub retcode: u32,
    /// Execution price for market orders, placement price for pending orders.
    pub price: Decimal,
    pub volume: Decimal,
}

/// A working (not yet triggered) order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub volume: Decimal,
    pub price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub magic: u64,
    pub comment: String,
    pub placed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Positions & Deals
// ---------------------------------------------------------------------------

/// Represents a currently open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    /// Floating profit in account currency.
    pub profit: Decimal,
    pub magic: u64,
    pub comment: String,
    pub opened_at: DateTime<Utc>,
}

/// Whether a deal opened or closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealEntry {
    In,
    Out,
}

/// Why a deal was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealReason {
    Client,
    Expert,
    TakeProfit,
    StopLoss,
    StopOut,
}

/// A historical execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub ticket: Ticket,
    /// Position the deal belongs to.
    pub position: Ticket,
    pub symbol: String,
    pub side: Side,
    pub entry: DealEntry,
    pub reason: DealReason,
    pub volume: Decimal,
    pub price: Decimal,
    pub profit: Decimal,
    pub magic: u64,
    pub timestamp: DateTime<Utc>,
}

impl Deal {
    pub fn is_take_profit_exit(&self) -> bool {
        self.entry == DealEntry::Out && self.reason == DealReason::TakeProfit
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Snapshot of the account state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin_free: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
}

impl AccountState {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            balance: starting_balance,
            equity: starting_balance,
            margin_free: starting_balance,
            currency: "USD".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn floating_profit(&self) -> Decimal {
        self.equity - self.balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    #[test]
    fn test_candle_direction() {
        assert!(candle(dec!(10), dec!(12), dec!(9), dec!(11)).is_bullish());
        assert!(candle(dec!(10), dec!(12), dec!(9), dec!(9.5)).is_bearish());
        let doji = candle(dec!(10), dec!(12), dec!(9), dec!(10));
        assert!(!doji.is_bullish() && !doji.is_bearish());
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        let c = candle(dec!(10), dec!(12), dec!(9), dec!(11));
        assert_eq!(c.true_range(None), dec!(3));
        assert_eq!(c.true_range(Some(dec!(15))), dec!(6));
        assert_eq!(c.true_range(Some(dec!(5))), dec!(7));
    }

    #[test]
    fn test_tick_prices_by_side() {
        let tick = Tick {
            timestamp: Utc::now(),
            bid: dec!(99.5),
            ask: dec!(100),
        };
        assert_eq!(tick.entry_price(Side::Buy), dec!(100));
        assert_eq!(tick.entry_price(Side::Sell), dec!(99.5));
        assert_eq!(tick.exit_price(Side::Buy), dec!(99.5));
        assert_eq!(tick.spread(), dec!(0.5));
    }

    #[test]
    fn test_timeframe_parse_and_display() {
        assert_eq!("1m".parse::<Timeframe>(), Ok(Timeframe::Minute(1)));
        assert_eq!("15M".parse::<Timeframe>(), Ok(Timeframe::Minute(15)));
        assert_eq!("4h".parse::<Timeframe>(), Ok(Timeframe::Hour(4)));
        assert_eq!("d1".parse::<Timeframe>(), Ok(Timeframe::Daily));
        assert!("0m".parse::<Timeframe>().is_err());
        assert!("5x".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::Minute(15).to_string(), "15m");
        assert_eq!(Timeframe::Hour(1).as_seconds(), 3600);
    }

    #[test]
    fn test_symbol_point_conversion() {
        let info = SymbolInfo {
            symbol: "BTCUSD".to_string(),
            point: dec!(0.01),
            digits: 2,
            stops_level: 50,
            volume_step: dec!(0.01),
            contract_size: Decimal::ONE,
            visible: true,
        };
        assert_eq!(info.points_to_price(dec!(10000)), dec!(100));
        assert_eq!(info.stops_distance(), dec!(0.5));
        assert_eq!(info.normalize_price(dec!(100.1234)), dec!(100.12));
    }

    #[test]
    fn test_order_builders() {
        let order = OrderRequest::stop("BTCUSD", Side::Sell, dec!(0.02), dec!(90))
            .with_targets(Some(dec!(70)), None)
            .tagged(10002, "rung-1");
        assert_eq!(order.kind, OrderKind::Stop);
        assert_eq!(order.price, Some(dec!(90)));
        assert_eq!(order.magic, 10002);
        assert_eq!(order.comment, "rung-1");
        assert_eq!(Signal::Sell.side(), Some(Side::Sell));
        assert_eq!(Signal::None.side(), None);
    }
}

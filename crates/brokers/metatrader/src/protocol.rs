use hedgebot_core::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A request sent to the bridge. The reply carries the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Commands the bridge understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Attach to the terminal and log in.
    Initialize {
        login: u64,
        password: String,
        server: String,
    },
    SymbolInfo {
        symbol: String,
    },
    /// Last `count` candles, oldest first, the forming one last.
    Rates {
        symbol: String,
        timeframe: String,
        count: usize,
    },
    Tick {
        symbol: String,
    },
    Account,
    OrderSend {
        request: TradeRequest,
    },
    PositionsGet {
        symbol: String,
    },
    OrdersGet {
        symbol: String,
    },
    HistoryDeals {
        position: Ticket,
    },
    Shutdown,
}

/// MT5 trade action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    /// Market execution (open or close).
    Deal,
    /// Place a pending order.
    Pending,
    /// Change SL/TP of a position.
    Sltp,
    /// Delete a pending order.
    Remove,
}

/// MT5 order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Buy,
    Sell,
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
}

impl OrderType {
    pub fn from_parts(side: Side, kind: OrderKind) -> Self {
        match (side, kind) {
            (Side::Buy, OrderKind::Market) => OrderType::Buy,
            (Side::Sell, OrderKind::Market) => OrderType::Sell,
            (Side::Buy, OrderKind::Limit) => OrderType::BuyLimit,
            (Side::Sell, OrderKind::Limit) => OrderType::SellLimit,
            (Side::Buy, OrderKind::Stop) => OrderType::BuyStop,
            (Side::Sell, OrderKind::Stop) => OrderType::SellStop,
        }
    }
}

/// Mirror of MT5's `MqlTradeRequest`; unused fields stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub action: TradeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp: Option<Decimal>,
    #[serde(default)]
    pub deviation: u32,
    #[serde(default)]
    pub magic: u64,
    #[serde(default)]
    pub comment: String,
    /// Position to close or modify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Ticket>,
    /// Pending order to remove.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Ticket>,
}

impl TradeRequest {
    fn bare(action: TradeAction) -> Self {
        Self {
            action,
            symbol: None,
            volume: None,
            order_type: None,
            price: None,
            sl: None,
            tp: None,
            deviation: 0,
            magic: 0,
            comment: String::new(),
            position: None,
            order: None,
        }
    }

    /// Open a market position or place a pending order.
    pub fn open(order: &OrderRequest) -> Self {
        let action = match order.kind {
            OrderKind::Market => TradeAction::Deal,
            OrderKind::Limit | OrderKind::Stop => TradeAction::Pending,
        };
        Self {
            symbol: Some(order.symbol.clone()),
            volume: Some(order.volume),
            order_type: Some(OrderType::from_parts(order.side, order.kind)),
            price: order.price,
            sl: order.stop_loss,
            tp: order.take_profit,
            deviation: order.deviation,
            magic: order.magic,
            comment: order.comment.clone(),
            ..Self::bare(action)
        }
    }

    /// Close `position` with an opposite market deal.
    pub fn close(position: &Position, price: Decimal, deviation: u32) -> Self {
        Self {
            symbol: Some(position.symbol.clone()),
            volume: Some(position.volume),
            order_type: Some(OrderType::from_parts(position.side.opposite(), OrderKind::Market)),
            price: Some(price),
            deviation,
            magic: position.magic,
            comment: position.comment.clone(),
            position: Some(position.ticket),
            ..Self::bare(TradeAction::Deal)
        }
    }

    pub fn modify(ticket: Ticket, take_profit: Option<Decimal>, stop_loss: Option<Decimal>) -> Self {
        Self {
            position: Some(ticket),
            tp: take_profit,
            sl: stop_loss,
            ..Self::bare(TradeAction::Sltp)
        }
    }

    pub fn remove(ticket: Ticket) -> Self {
        Self {
            order: Some(ticket),
            ..Self::bare(TradeAction::Remove)
        }
    }
}

/// A reply from the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(flatten)]
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Symbol { info: SymbolInfo },
    Rates { candles: Vec<Candle> },
    Tick { tick: Tick },
    Account { account: AccountState },
    TradeResult {
        retcode: u32,
        /// Order ticket (also the position ticket for market deals).
        order: Ticket,
        price: Decimal,
        volume: Decimal,
        #[serde(default)]
        comment: String,
    },
    Positions { positions: Vec<Position> },
    Orders { orders: Vec<PendingOrder> },
    Deals { deals: Vec<Deal> },
    Error { message: String },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Ok => "ok",
            Reply::Symbol { .. } => "symbol",
            Reply::Rates { .. } => "rates",
            Reply::Tick { .. } => "tick",
            Reply::Account { .. } => "account",
            Reply::TradeResult { .. } => "trade_result",
            Reply::Positions { .. } => "positions",
            Reply::Orders { .. } => "orders",
            Reply::Deals { .. } => "deals",
            Reply::Error { .. } => "error",
        }
    }
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_frame_prefix() {
        let framed = frame_message(b"{}");
        assert_eq!(framed, vec![0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn test_request_shape() {
        let req = Request {
            id: 7,
            command: Command::Tick {
                symbol: "XAUUSD".into(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"id": 7, "cmd": "tick", "symbol": "XAUUSD"}));

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_sell_stop_trade_request() {
        let order = OrderRequest::stop("XAUUSD", Side::Sell, dec!(0.02), dec!(90))
            .with_targets(Some(dec!(85)), None)
            .tagged(42, "rung-1");
        let req = TradeRequest::open(&order);
        assert_eq!(req.action, TradeAction::Pending);
        assert_eq!(req.order_type, Some(OrderType::SellStop));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "sell_stop");
        assert_eq!(json["comment"], "rung-1");
        assert!(json.get("sl").is_none());
    }

    #[test]
    fn test_reply_parse() {
        let raw = r#"{"id": 3, "type": "trade_result", "retcode": 10009, "order": 555, "price": "1.2345", "volume": "0.01"}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, 3);
        match resp.reply {
            Reply::TradeResult { retcode, order, price, .. } => {
                assert_eq!(retcode, 10009);
                assert_eq!(order, 555);
                assert_eq!(price, dec!(1.2345));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}

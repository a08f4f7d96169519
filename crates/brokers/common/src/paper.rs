use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hedgebot_core::*;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tracing::debug;

/// Retcodes the paper broker answers with (MT5 numbering).
const RETCODE_PLACED: u32 = 10008;
const RETCODE_DONE: u32 = 10009;
const RETCODE_INVALID_PRICE: u32 = 10015;

/// Configuration for the paper broker (replay and tests).
#[derive(Debug, Clone)]
pub struct PaperBrokerConfig {
    pub initial_balance: Decimal,
    pub symbol: SymbolInfo,
    /// Spread in price units added to the bid to form the ask.
    pub spread: Decimal,
}

impl PaperBrokerConfig {
    pub fn new(symbol: SymbolInfo, initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            symbol,
            spread: Decimal::ZERO,
        }
    }
}

/// An in-process broker that fills orders against quotes pushed by the caller.
///
/// Pending stop orders trigger when the quote crosses them, positions close on
/// their take-profit or stop-loss, and every fill is recorded as a deal, so
/// the ladder sees the same shapes it would get from a terminal.
#[derive(Debug)]
pub struct PaperBroker {
    config: PaperBrokerConfig,
    connected: bool,
    balance: Decimal,
    quote: Option<Tick>,
    candles: Vec<Candle>,
    positions: Vec<Position>,
    pending: Vec<PendingOrder>,
    deals: Vec<Deal>,
    placed: Vec<OrderRequest>,
    rejections: VecDeque<(OrderKind, BrokerError)>,
    next_ticket: Ticket,
}

impl PaperBroker {
    pub fn new(config: PaperBrokerConfig) -> Self {
        let balance = config.initial_balance;
        Self {
            config,
            connected: false,
            balance,
            quote: None,
            candles: Vec::new(),
            positions: Vec::new(),
            pending: Vec::new(),
            deals: Vec::new(),
            placed: Vec::new(),
            rejections: VecDeque::new(),
            next_ticket: 1000,
        }
    }

    pub fn symbol(&self) -> &SymbolInfo {
        &self.config.symbol
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn equity(&self) -> Decimal {
        self.balance + self.positions.iter().map(|p| p.profit).sum::<Decimal>()
    }

    /// Every deal executed so far, oldest first.
    pub fn deals(&self) -> &[Deal] {
        &self.deals
    }

    /// Every order request the broker accepted, oldest first.
    pub fn placed_orders(&self) -> &[OrderRequest] {
        &self.placed
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn working_orders(&self) -> &[PendingOrder] {
        &self.pending
    }

    /// Replace the candle history served by `candles()`.
    pub fn set_candles(&mut self, candles: Vec<Candle>) {
        self.candles = candles;
    }

    /// Reject the next order of `kind` with `error`. Queued rejections are
    /// consumed in order.
    pub fn reject_next(&mut self, kind: OrderKind, error: BrokerError) {
        self.rejections.push_back((kind, error));
    }

    /// Move the market to `bid` (ask = bid + spread), then trigger stops,
    /// take-profits and stop-losses that the new quote crosses.
    pub fn set_quote(&mut self, timestamp: DateTime<Utc>, bid: Decimal) {
        let tick = Tick {
            timestamp,
            bid,
            ask: bid + self.config.spread,
        };
        self.quote = Some(tick.clone());
        self.trigger_pending(&tick);
        self.trigger_exits(&tick);
        self.mark_to_market(&tick);
    }

    /// Fill a working order at its own price regardless of the quote.
    pub fn fill_pending(&mut self, ticket: Ticket) -> Result<(), BrokerError> {
        let idx = self
            .pending
            .iter()
            .position(|o| o.ticket == ticket)
            .ok_or(BrokerError::NotFound(ticket))?;
        let order = self.pending.remove(idx);
        let at = self.now();
        self.open_position(order.ticket, &fill_request(&order), order.price, at);
        Ok(())
    }

    /// Drop a position without a closing deal, as if it vanished from the terminal.
    pub fn drop_position(&mut self, ticket: Ticket) -> Option<Position> {
        let idx = self.positions.iter().position(|p| p.ticket == ticket)?;
        Some(self.positions.remove(idx))
    }

    /// Drop a working order without any trace.
    pub fn drop_pending(&mut self, ticket: Ticket) -> Option<PendingOrder> {
        let idx = self.pending.iter().position(|o| o.ticket == ticket)?;
        Some(self.pending.remove(idx))
    }

    fn now(&self) -> DateTime<Utc> {
        self.quote.as_ref().map(|q| q.timestamp).unwrap_or_else(Utc::now)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn current_quote(&self) -> Result<Tick, BrokerError> {
        self.quote
            .clone()
            .ok_or_else(|| BrokerError::MissingData("no quote yet".to_string()))
    }

    fn issue_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn profit(&self, side: Side, open: Decimal, close: Decimal, volume: Decimal) -> Decimal {
        (close - open) * side.sign() * volume * self.config.symbol.contract_size
    }

    fn open_position(&mut self, ticket: Ticket, req: &OrderRequest, price: Decimal, at: DateTime<Utc>) {
        debug!(ticket, side = %req.side, price = %price, volume = %req.volume, "Paper fill");
        self.positions.push(Position {
            ticket,
            symbol: req.symbol.clone(),
            side: req.side,
            volume: req.volume,
            open_price: price,
            take_profit: req.take_profit,
            stop_loss: req.stop_loss,
            profit: Decimal::ZERO,
            magic: req.magic,
            comment: req.comment.clone(),
            opened_at: at,
        });
        self.record_deal(ticket, req.side, DealEntry::In, DealReason::Expert, req.volume, price, Decimal::ZERO, req.magic, at);
    }

    fn close_at(&mut self, idx: usize, price: Decimal, reason: DealReason, at: DateTime<Utc>) -> (Position, Decimal) {
        let pos = self.positions.remove(idx);
        let pnl = self.profit(pos.side, pos.open_price, price, pos.volume);
        self.balance += pnl;
        self.record_deal(pos.ticket, pos.side.opposite(), DealEntry::Out, reason, pos.volume, price, pnl, pos.magic, at);
        debug!(ticket = pos.ticket, price = %price, profit = %pnl, ?reason, "Paper close");
        (pos, pnl)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_deal(
        &mut self,
        position: Ticket,
        side: Side,
        entry: DealEntry,
        reason: DealReason,
        volume: Decimal,
        price: Decimal,
        profit: Decimal,
        magic: u64,
        timestamp: DateTime<Utc>,
    ) {
        let ticket = self.issue_ticket();
        self.deals.push(Deal {
            ticket,
            position,
            symbol: self.config.symbol.symbol.clone(),
            side,
            entry,
            reason,
            volume,
            price,
            profit,
            magic,
            timestamp,
        });
    }

    fn trigger_pending(&mut self, tick: &Tick) {
        let mut triggered = Vec::new();
        self.pending.retain(|order| {
            let hit = match (order.kind, order.side) {
                (OrderKind::Stop, Side::Buy) => tick.ask >= order.price,
                (OrderKind::Stop, Side::Sell) => tick.bid <= order.price,
                (OrderKind::Limit, Side::Buy) => tick.ask <= order.price,
                (OrderKind::Limit, Side::Sell) => tick.bid >= order.price,
                (OrderKind::Market, _) => true,
            };
            if hit {
                triggered.push(order.clone());
            }
            !hit
        });
        for order in triggered {
            // Gaps fill at the quote, never better than the order price.
            let price = match (order.kind, order.side) {
                (OrderKind::Stop, Side::Buy) => order.price.max(tick.ask),
                (OrderKind::Stop, Side::Sell) => order.price.min(tick.bid),
                _ => order.price,
            };
            self.open_position(order.ticket, &fill_request(&order), price, tick.timestamp);
        }
    }

    fn trigger_exits(&mut self, tick: &Tick) {
        let mut idx = 0;
        while idx < self.positions.len() {
            let pos = &self.positions[idx];
            let exit = tick.exit_price(pos.side);
            let favourable = |target: Decimal| (exit - target) * pos.side.sign() >= Decimal::ZERO;
            let hit = match (pos.take_profit, pos.stop_loss) {
                (Some(tp), _) if favourable(tp) => Some((tp, DealReason::TakeProfit)),
                (_, Some(sl)) if !favourable(sl) || exit == sl => Some((sl, DealReason::StopLoss)),
                _ => None,
            };
            match hit {
                Some((price, reason)) => {
                    self.close_at(idx, price, reason, tick.timestamp);
                }
                None => idx += 1,
            }
        }
    }

    fn mark_to_market(&mut self, tick: &Tick) {
        let contract = self.config.symbol.contract_size;
        for pos in &mut self.positions {
            let exit = tick.exit_price(pos.side);
            pos.profit = (exit - pos.open_price) * pos.side.sign() * pos.volume * contract;
        }
    }

    fn validate_pending(&self, req: &OrderRequest, price: Decimal, tick: &Tick) -> Result<(), BrokerError> {
        let market = tick.entry_price(req.side);
        let wrong_side = match (req.kind, req.side) {
            (OrderKind::Stop, Side::Buy) | (OrderKind::Limit, Side::Sell) => price <= market,
            (OrderKind::Stop, Side::Sell) | (OrderKind::Limit, Side::Buy) => price >= market,
            (OrderKind::Market, _) => false,
        };
        let too_close = (price - market).abs() < self.config.symbol.stops_distance();
        if wrong_side || too_close {
            return Err(BrokerError::Rejected {
                retcode: RETCODE_INVALID_PRICE,
                reason: "Invalid price".to_string(),
            });
        }
        Ok(())
    }
}

/// The market request a triggered working order turns into.
fn fill_request(order: &PendingOrder) -> OrderRequest {
    OrderRequest::market(&order.symbol, order.side, order.volume)
        .with_targets(order.take_profit, order.stop_loss)
        .tagged(order.magic, order.comment.clone())
}

#[async_trait]
impl Broker for PaperBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError> {
        self.ensure_connected()?;
        if symbol == self.config.symbol.symbol {
            Ok(self.config.symbol.clone())
        } else {
            Err(BrokerError::MissingData(format!("unknown symbol {}", symbol)))
        }
    }

    async fn candles(
        &mut self,
        _symbol: &str,
        _timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.ensure_connected()?;
        if self.candles.is_empty() {
            return Err(BrokerError::MissingData("no candles loaded".to_string()));
        }
        let start = self.candles.len().saturating_sub(count);
        Ok(self.candles[start..].to_vec())
    }

    async fn tick(&mut self, _symbol: &str) -> Result<Tick, BrokerError> {
        self.ensure_connected()?;
        self.current_quote()
    }

    async fn account_state(&mut self) -> Result<AccountState, BrokerError> {
        self.ensure_connected()?;
        let equity = self.equity();
        Ok(AccountState {
            balance: self.balance,
            equity,
            margin_free: equity,
            currency: "USD".to_string(),
            timestamp: self.now(),
        })
    }

    async fn place_order(&mut self, order: OrderRequest) -> Result<OrderReceipt, BrokerError> {
        self.ensure_connected()?;
        if let Some(pos) = self.rejections.iter().position(|(kind, _)| *kind == order.kind) {
            if let Some((_, err)) = self.rejections.remove(pos) {
                return Err(err);
            }
        }
        let tick = self.current_quote()?;
        let at = tick.timestamp;
        let ticket = self.issue_ticket();

        let receipt = match order.kind {
            OrderKind::Market => {
                let price = tick.entry_price(order.side);
                self.open_position(ticket, &order, price, at);
                OrderReceipt {
                    ticket,
                    retcode: RETCODE_DONE,
                    price,
                    volume: order.volume,
                }
            }
            OrderKind::Stop | OrderKind::Limit => {
                let price = order
                    .price
                    .ok_or_else(|| BrokerError::Other("pending order without price".to_string()))?;
                self.validate_pending(&order, price, &tick)?;
                self.pending.push(PendingOrder {
                    ticket,
                    symbol: order.symbol.clone(),
                    side: order.side,
                    kind: order.kind,
                    volume: order.volume,
                    price,
                    take_profit: order.take_profit,
                    stop_loss: order.stop_loss,
                    magic: order.magic,
                    comment: order.comment.clone(),
                    placed_at: at,
                });
                OrderReceipt {
                    ticket,
                    retcode: RETCODE_PLACED,
                    price,
                    volume: order.volume,
                }
            }
        };
        self.placed.push(order);
        Ok(receipt)
    }

    async fn modify_position(
        &mut self,
        ticket: Ticket,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let pos = self
            .positions
            .iter_mut()
            .find(|p| p.ticket == ticket)
            .ok_or(BrokerError::NotFound(ticket))?;
        pos.take_profit = take_profit;
        pos.stop_loss = stop_loss;
        Ok(())
    }

    async fn cancel_order(&mut self, ticket: Ticket) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.drop_pending(ticket)
            .map(|_| ())
            .ok_or(BrokerError::NotFound(ticket))
    }

    async fn close_position(&mut self, ticket: Ticket, _deviation: u32) -> Result<OrderReceipt, BrokerError> {
        self.ensure_connected()?;
        let tick = self.current_quote()?;
        let idx = self
            .positions
            .iter()
            .position(|p| p.ticket == ticket)
            .ok_or(BrokerError::NotFound(ticket))?;
        let price = tick.exit_price(self.positions[idx].side);
        let (pos, _) = self.close_at(idx, price, DealReason::Expert, tick.timestamp);
        Ok(OrderReceipt {
            ticket: pos.ticket,
            retcode: RETCODE_DONE,
            price,
            volume: pos.volume,
        })
    }

    async fn positions(&mut self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.positions.iter().filter(|p| p.symbol == symbol).cloned().collect())
    }

    async fn pending_orders(&mut self, symbol: &str) -> Result<Vec<PendingOrder>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.pending.iter().filter(|o| o.symbol == symbol).cloned().collect())
    }

    async fn history_deals(&mut self, position: Ticket) -> Result<Vec<Deal>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.deals.iter().filter(|d| d.position == position).cloned().collect())
    }
}

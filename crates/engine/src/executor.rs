use crate::error::EngineError;
use crate::ladder::RungPlan;
use hedgebot_brokers_common::{retry, RetryPolicy};
use hedgebot_core::*;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

/// How a rung reached the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub receipt: OrderReceipt,
    /// Sent as a market order instead of a stop order.
    pub at_market: bool,
}

/// What a close-all pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwindReport {
    pub closed: usize,
    pub cancelled: usize,
}

/// Turns rung plans into broker orders for one symbol and magic number.
#[derive(Debug, Clone)]
pub struct OrderExecutor {
    symbol: String,
    retry: RetryPolicy,
    deviation: u32,
    magic: u64,
}

impl OrderExecutor {
    pub fn new(symbol: impl Into<String>, retry: RetryPolicy, deviation: u32, magic: u64) -> Self {
        Self {
            symbol: symbol.into(),
            retry,
            deviation,
            magic,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn magic(&self) -> u64 {
        self.magic
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn market_request(&self, plan: &RungPlan) -> OrderRequest {
        OrderRequest::market(&self.symbol, plan.side, plan.volume)
            .with_targets(Some(plan.take_profit), plan.stop_loss)
            .tagged(self.magic, plan.tag().to_string())
            .with_deviation(self.deviation)
    }

    fn stop_request(&self, plan: &RungPlan) -> OrderRequest {
        OrderRequest::stop(&self.symbol, plan.side, plan.volume, plan.price)
            .with_targets(Some(plan.take_profit), plan.stop_loss)
            .tagged(self.magic, plan.tag().to_string())
            .with_deviation(self.deviation)
    }

    /// Send `plan` as a market order, retrying under the policy.
    pub async fn open_market<B: Broker + ?Sized>(
        &self,
        broker: &mut B,
        plan: &RungPlan,
    ) -> Result<OrderReceipt, EngineError> {
        let request = self.market_request(plan);
        retry!(self.retry, "open_market", broker.place_order(request.clone()))
            .map_err(|source| EngineError::RungPlacement {
                index: plan.index,
                source,
            })
    }

    /// Place a hedge rung as a stop order.
    ///
    /// A rung whose price is inside the broker's stops level, or already
    /// crossed, goes in at market. A rejected stop order also falls back to
    /// market.
    pub async fn place_rung<B: Broker + ?Sized>(
        &self,
        broker: &mut B,
        plan: &RungPlan,
        symbol: &SymbolInfo,
    ) -> Result<Placement, EngineError> {
        let tick = retry!(self.retry, "tick", broker.tick(&self.symbol)).map_err(|source| {
            EngineError::RungPlacement {
                index: plan.index,
                source,
            }
        })?;
        let market = tick.entry_price(plan.side);
        let crossed = (plan.price - market) * plan.side.sign() <= Decimal::ZERO;
        let too_close = (plan.price - market).abs() <= symbol.stops_distance();

        if crossed || too_close {
            info!(
                rung = plan.index,
                price = %plan.price,
                market = %market,
                stops_level = symbol.stops_level,
                "Rung price too close to market, placing at market"
            );
            return self.rung_at_market(broker, plan, market, symbol).await;
        }

        match broker.place_order(self.stop_request(plan)).await {
            Ok(receipt) => {
                debug!(rung = plan.index, ticket = receipt.ticket, price = %plan.price, "Stop rung placed");
                Ok(Placement {
                    receipt,
                    at_market: false,
                })
            }
            Err(err) => {
                warn!(rung = plan.index, error = %err, "Stop rung rejected, falling back to market");
                self.rung_at_market(broker, plan, market, symbol).await
            }
        }
    }

    async fn rung_at_market<B: Broker + ?Sized>(
        &self,
        broker: &mut B,
        plan: &RungPlan,
        market: Decimal,
        symbol: &SymbolInfo,
    ) -> Result<Placement, EngineError> {
        let shifted = shift_to(plan, market, symbol);
        let receipt = self.open_market(broker, &shifted).await?;
        Ok(Placement {
            receipt,
            at_market: true,
        })
    }

    /// Close one position. A ticket the broker no longer knows counts as closed.
    pub async fn close_position<B: Broker + ?Sized>(
        &self,
        broker: &mut B,
        ticket: Ticket,
    ) -> Result<bool, BrokerError> {
        match retry!(self.retry, "close_position", broker.close_position(ticket, self.deviation)) {
            Ok(receipt) => {
                debug!(ticket, price = %receipt.price, "Position closed");
                Ok(true)
            }
            Err(BrokerError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Replace the stop-loss of an open position, keeping its take-profit.
    pub async fn move_stop_loss<B: Broker + ?Sized>(
        &self,
        broker: &mut B,
        ticket: Ticket,
        take_profit: Option<Decimal>,
        stop_loss: Decimal,
    ) -> Result<(), BrokerError> {
        retry!(
            self.retry,
            "modify_position",
            broker.modify_position(ticket, take_profit, Some(stop_loss))
        )?;
        debug!(ticket, stop_loss = %stop_loss, "Stop-loss moved");
        Ok(())
    }

    /// Cancel one working order. A ticket the broker no longer knows counts as cancelled.
    pub async fn cancel<B: Broker + ?Sized>(&self, broker: &mut B, ticket: Ticket) -> Result<bool, BrokerError> {
        match retry!(self.retry, "cancel_order", broker.cancel_order(ticket)) {
            Ok(()) => Ok(true),
            Err(BrokerError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Close every position and cancel every working order carrying our magic number.
    ///
    /// Keeps going past individual failures and reports the first one at the end.
    pub async fn close_all<B: Broker + ?Sized>(&self, broker: &mut B) -> Result<UnwindReport, EngineError> {
        let positions = retry!(self.retry, "positions", broker.positions(&self.symbol))?;
        let orders = retry!(self.retry, "pending_orders", broker.pending_orders(&self.symbol))?;

        let mut report = UnwindReport::default();
        let mut first_error: Option<BrokerError> = None;

        for pos in positions.iter().filter(|p| p.magic == self.magic) {
            match self.close_position(broker, pos.ticket).await {
                Ok(true) => report.closed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(ticket = pos.ticket, error = %err, "Failed to close position");
                    first_error.get_or_insert(err);
                }
            }
        }
        for order in orders.iter().filter(|o| o.magic == self.magic) {
            match self.cancel(broker, order.ticket).await {
                Ok(true) => report.cancelled += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(ticket = order.ticket, error = %err, "Failed to cancel order");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(report),
        }
    }
}

/// Move a rung to `price`, keeping its take-profit and stop-loss distances.
fn shift_to(plan: &RungPlan, price: Decimal, symbol: &SymbolInfo) -> RungPlan {
    let delta = price - plan.price;
    RungPlan {
        price: symbol.normalize_price(price),
        take_profit: symbol.normalize_price(plan.take_profit + delta),
        stop_loss: plan.stop_loss.map(|sl| symbol.normalize_price(sl + delta)),
        ..plan.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;
    use rust_decimal_macros::dec;

    fn executor() -> OrderExecutor {
        OrderExecutor::new("XAUUSD", fast_retry(), 20, MAGIC)
    }

    fn plan(index: usize, side: Side, price: Decimal) -> RungPlan {
        RungPlan {
            index,
            side,
            price,
            volume: dec!(0.02),
            take_profit: price + side.sign() * dec!(5),
            stop_loss: None,
        }
    }

    #[tokio::test]
    async fn test_rung_goes_in_as_stop() {
        let mut broker = paper(10).await;
        let placement = executor()
            .place_rung(&mut broker, &plan(1, Side::Sell, dec!(90)), &symbol(10))
            .await
            .unwrap();
        assert!(!placement.at_market);
        let orders = broker.working_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].comment, "rung-1");
        assert_eq!(orders[0].magic, MAGIC);
        assert_eq!(orders[0].take_profit, Some(dec!(85)));
    }

    #[tokio::test]
    async fn test_rung_inside_stops_level_goes_to_market() {
        // stops level 50 points = 0.50 around a bid of 100
        let mut broker = paper(50).await;
        let placement = executor()
            .place_rung(&mut broker, &plan(1, Side::Sell, dec!(99.6)), &symbol(50))
            .await
            .unwrap();
        assert!(placement.at_market);
        assert!(broker.working_orders().is_empty());
        let position = &broker.open_positions()[0];
        assert_eq!(position.open_price, dec!(100));
        // targets keep their distance from the fill
        assert_eq!(position.take_profit, Some(dec!(95)));
    }

    #[tokio::test]
    async fn test_crossed_rung_goes_to_market() {
        let mut broker = paper(0).await;
        let placement = executor()
            .place_rung(&mut broker, &plan(2, Side::Buy, dec!(98)), &symbol(0))
            .await
            .unwrap();
        assert!(placement.at_market);
        assert_eq!(broker.open_positions()[0].side, Side::Buy);
    }

    #[tokio::test]
    async fn test_rejected_stop_falls_back_to_market() {
        let mut broker = paper(10).await;
        broker.reject_next(
            OrderKind::Stop,
            BrokerError::Rejected {
                retcode: 10015,
                reason: "Invalid price".into(),
            },
        );
        let placement = executor()
            .place_rung(&mut broker, &plan(1, Side::Sell, dec!(90)), &symbol(10))
            .await
            .unwrap();
        assert!(placement.at_market);
        assert_eq!(broker.open_positions().len(), 1);
    }

    #[tokio::test]
    async fn test_market_failure_reports_rung() {
        let mut broker = paper(10).await;
        for _ in 0..3 {
            broker.reject_next(
                OrderKind::Market,
                BrokerError::Rejected {
                    retcode: 10019,
                    reason: "Not enough money".into(),
                },
            );
        }
        let err = executor()
            .open_market(&mut broker, &plan(0, Side::Buy, dec!(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RungPlacement { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_close_all_only_touches_our_magic() {
        let mut broker = paper(10).await;
        let exec = executor();
        exec.open_market(&mut broker, &plan(0, Side::Buy, dec!(100))).await.unwrap();
        exec.place_rung(&mut broker, &plan(1, Side::Sell, dec!(90)), &symbol(10))
            .await
            .unwrap();
        broker
            .place_order(OrderRequest::market("XAUUSD", Side::Sell, dec!(1)).tagged(7, "manual"))
            .await
            .unwrap();

        let report = exec.close_all(&mut broker).await.unwrap();
        assert_eq!(report, UnwindReport { closed: 1, cancelled: 1 });
        assert_eq!(broker.open_positions().len(), 1);
        assert_eq!(broker.open_positions()[0].magic, 7);
        assert!(broker.working_orders().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ticket_counts_as_gone() {
        let mut broker = paper(10).await;
        assert_eq!(executor().close_position(&mut broker, 4242).await, Ok(false));
        assert_eq!(executor().cancel(&mut broker, 4242).await, Ok(false));
    }
}

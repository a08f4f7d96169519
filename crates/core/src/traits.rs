use crate::models::*;
use async_trait::async_trait;
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Broker Trait
// ---------------------------------------------------------------------------

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Request rejected [{retcode}]: {reason}")]
    Rejected { retcode: u32, reason: String },
    #[error("Ticket not found: {0}")]
    NotFound(Ticket),
    #[error("Market data unavailable: {0}")]
    MissingData(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether repeating the same call may succeed.
    ///
    /// A vanished ticket or a malformed bridge message will not fix itself;
    /// everything else (rejections included) gets the bounded retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::NotFound(_) | BrokerError::Protocol(_))
    }

    pub fn retcode(&self) -> Option<u32> {
        match self {
            BrokerError::Rejected { retcode, .. } => Some(*retcode),
            _ => None,
        }
    }
}

/// A broker terminal: market data, order routing, and account queries for one account.
///
/// Every call is a synchronous request/response against the terminal; callers
/// own retry behaviour.
#[async_trait]
pub trait Broker: Send {
    /// Connect (and log in) to the broker.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Disconnect from the broker.
    async fn disconnect(&mut self) -> Result<(), BrokerError>;

    /// Check if connected.
    fn is_connected(&self) -> bool;

    /// Trading properties of a symbol.
    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError>;

    /// The last `count` candles, oldest first. The final candle is still forming.
    async fn candles(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError>;

    /// Current best bid/ask.
    async fn tick(&mut self, symbol: &str) -> Result<Tick, BrokerError>;

    /// Get the current account state.
    async fn account_state(&mut self) -> Result<AccountState, BrokerError>;

    /// Submit a market or pending order.
    async fn place_order(&mut self, order: OrderRequest) -> Result<OrderReceipt, BrokerError>;

    /// Change take-profit / stop-loss of an open position.
    async fn modify_position(
        &mut self,
        ticket: Ticket,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<(), BrokerError>;

    /// Remove a pending order.
    async fn cancel_order(&mut self, ticket: Ticket) -> Result<(), BrokerError>;

    /// Close an open position at market.
    async fn close_position(&mut self, ticket: Ticket, deviation: u32) -> Result<OrderReceipt, BrokerError>;

    /// All open positions on a symbol.
    async fn positions(&mut self, symbol: &str) -> Result<Vec<Position>, BrokerError>;

    /// All working orders on a symbol.
    async fn pending_orders(&mut self, symbol: &str) -> Result<Vec<PendingOrder>, BrokerError>;

    /// Deal history of a single position.
    async fn history_deals(&mut self, position: Ticket) -> Result<Vec<Deal>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BrokerError::ConnectionFailed("down".into()).is_retryable());
        assert!(BrokerError::Rejected {
            retcode: 10004,
            reason: "Requote".into()
        }
        .is_retryable());
        assert!(!BrokerError::NotFound(7).is_retryable());
        assert!(!BrokerError::Protocol("bad frame".into()).is_retryable());
    }

    #[test]
    fn test_rejection_display() {
        let err = BrokerError::Rejected {
            retcode: 10019,
            reason: "Not enough money to complete the request".into(),
        };
        assert_eq!(err.retcode(), Some(10019));
        assert_eq!(
            err.to_string(),
            "Request rejected [10019]: Not enough money to complete the request"
        );
    }
}

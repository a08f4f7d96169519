use async_trait::async_trait;
use hedgebot_core::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::protocol::*;
use crate::retcode;

/// Where the bridge listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaTraderConfig {
    /// Host address (e.g. "127.0.0.1").
    pub host: String,
    /// Port the bridge script is listening on.
    pub port: u16,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for MetaTraderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5556,
            timeout_secs: 10,
        }
    }
}

/// Trading account login. Always supplied from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub login: u64,
    pub password: String,
    pub server: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .field("server", &self.server)
            .finish()
    }
}

/// MetaTrader 5 broker.
///
/// Every trait call is one request/reply exchange with the bridge. A broken
/// stream drops the connection; the caller reconnects.
pub struct MetaTraderBroker {
    config: MetaTraderConfig,
    credentials: Credentials,
    stream: Option<TcpStream>,
    next_id: u64,
}

impl MetaTraderBroker {
    pub fn new(config: MetaTraderConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            stream: None,
            next_id: 0,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs.max(1))
    }

    /// Send one command and wait for its reply.
    async fn request(&mut self, command: Command) -> Result<Reply, BrokerError> {
        self.next_id += 1;
        let id = self.next_id;
        let body = serde_json::to_vec(&Request { id, command })
            .map_err(|e| BrokerError::Protocol(format!("Serialization error: {}", e)))?;
        let timeout = self.timeout();

        let stream = self.stream.as_mut().ok_or(BrokerError::NotConnected)?;
        let frame = match tokio::time::timeout(timeout, exchange(stream, &body)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(BrokerError::ConnectionFailed(format!("Bridge I/O error: {}", e)));
            }
            Err(_) => {
                self.stream = None;
                return Err(BrokerError::ConnectionFailed(format!(
                    "Bridge did not answer within {:?}",
                    timeout
                )));
            }
        };

        // a reply we cannot pair with this request leaves the stream out of step
        let response: Response = match serde_json::from_slice(&frame) {
            Ok(response) => response,
            Err(e) => {
                self.stream = None;
                return Err(BrokerError::Protocol(format!("Deserialization error: {}", e)));
            }
        };
        if response.id != id {
            warn!(expected = id, got = response.id, "Bridge reply out of sequence, dropping the connection");
            self.stream = None;
            return Err(BrokerError::Protocol(format!(
                "Reply id {} does not match request id {}",
                response.id, id
            )));
        }
        debug!(id, reply = response.reply.kind(), "Bridge reply");
        match response.reply {
            Reply::Error { message } => Err(BrokerError::Other(message)),
            reply => Ok(reply),
        }
    }

    async fn trade(&mut self, request: TradeRequest) -> Result<OrderReceipt, BrokerError> {
        match self.request(Command::OrderSend { request }).await? {
            Reply::TradeResult {
                retcode,
                order,
                price,
                volume,
                comment,
            } => {
                if retcode::is_success(retcode) {
                    Ok(OrderReceipt {
                        ticket: order,
                        retcode,
                        price,
                        volume,
                    })
                } else {
                    let reason = retcode::describe(retcode);
                    warn!(retcode, %reason, %comment, "Trade request rejected");
                    Err(BrokerError::Rejected { retcode, reason })
                }
            }
            other => Err(unexpected("trade_result", &other)),
        }
    }

    async fn find_position(&mut self, ticket: Ticket) -> Result<Position, BrokerError> {
        match self.request(Command::PositionsGet { symbol: String::new() }).await? {
            Reply::Positions { positions } => positions
                .into_iter()
                .find(|p| p.ticket == ticket)
                .ok_or(BrokerError::NotFound(ticket)),
            other => Err(unexpected("positions", &other)),
        }
    }
}

async fn exchange(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(&frame_message(body)).await?;
    read_frame(stream).await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

fn unexpected(expected: &str, got: &Reply) -> BrokerError {
    BrokerError::Protocol(format!("expected '{}' reply, got '{}'", expected, got.kind()))
}

#[async_trait]
impl Broker for MetaTraderBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(%addr, login = self.credentials.login, server = %self.credentials.server, "Connecting to MetaTrader bridge");

        let stream = tokio::time::timeout(self.timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| BrokerError::ConnectionFailed(format!("TCP connect to {} timed out", addr)))?
            .map_err(|e| BrokerError::ConnectionFailed(format!("TCP connect failed: {}", e)))?;
        self.stream = Some(stream);

        let login = Command::Initialize {
            login: self.credentials.login,
            password: self.credentials.password.clone(),
            server: self.credentials.server.clone(),
        };
        match self.request(login).await {
            Ok(Reply::Ok) => {
                info!("Logged in to MetaTrader");
                Ok(())
            }
            Ok(other) => {
                self.stream = None;
                Err(unexpected("ok", &other))
            }
            Err(e) => {
                self.stream = None;
                Err(BrokerError::ConnectionFailed(format!("Login failed: {}", e)))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        if self.stream.is_some() {
            if let Err(e) = self.request(Command::Shutdown).await {
                debug!(error = %e, "Bridge shutdown request failed");
            }
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        info!("Disconnected from MetaTrader");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError> {
        match self.request(Command::SymbolInfo { symbol: symbol.to_string() }).await? {
            Reply::Symbol { info } => Ok(info),
            other => Err(unexpected("symbol", &other)),
        }
    }

    async fn candles(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, BrokerError> {
        let command = Command::Rates {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            count,
        };
        match self.request(command).await? {
            Reply::Rates { candles } if candles.is_empty() => {
                Err(BrokerError::MissingData(format!("no candles for {} {}", symbol, timeframe)))
            }
            Reply::Rates { candles } => Ok(candles),
            other => Err(unexpected("rates", &other)),
        }
    }

    async fn tick(&mut self, symbol: &str) -> Result<Tick, BrokerError> {
        match self.request(Command::Tick { symbol: symbol.to_string() }).await? {
            Reply::Tick { tick } => Ok(tick),
            other => Err(unexpected("tick", &other)),
        }
    }

    async fn account_state(&mut self) -> Result<AccountState, BrokerError> {
        match self.request(Command::Account).await? {
            Reply::Account { account } => Ok(account),
            other => Err(unexpected("account", &other)),
        }
    }

    async fn place_order(&mut self, order: OrderRequest) -> Result<OrderReceipt, BrokerError> {
        self.trade(TradeRequest::open(&order)).await
    }

    async fn modify_position(
        &mut self,
        ticket: Ticket,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        self.trade(TradeRequest::modify(ticket, take_profit, stop_loss))
            .await
            .map(|_| ())
    }

    async fn cancel_order(&mut self, ticket: Ticket) -> Result<(), BrokerError> {
        self.trade(TradeRequest::remove(ticket)).await.map(|_| ())
    }

    async fn close_position(&mut self, ticket: Ticket, deviation: u32) -> Result<OrderReceipt, BrokerError> {
        let position = self.find_position(ticket).await?;
        let quote = self.tick(&position.symbol).await?;
        let price = quote.exit_price(position.side);
        self.trade(TradeRequest::close(&position, price, deviation)).await
    }

    async fn positions(&mut self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        match self.request(Command::PositionsGet { symbol: symbol.to_string() }).await? {
            Reply::Positions { positions } => Ok(positions),
            other => Err(unexpected("positions", &other)),
        }
    }

    async fn pending_orders(&mut self, symbol: &str) -> Result<Vec<PendingOrder>, BrokerError> {
        match self.request(Command::OrdersGet { symbol: symbol.to_string() }).await? {
            Reply::Orders { orders } => Ok(orders),
            other => Err(unexpected("orders", &other)),
        }
    }

    async fn history_deals(&mut self, position: Ticket) -> Result<Vec<Deal>, BrokerError> {
        match self.request(Command::HistoryDeals { position }).await? {
            Reply::Deals { deals } => Ok(deals),
            other => Err(unexpected("deals", &other)),
        }
    }
}

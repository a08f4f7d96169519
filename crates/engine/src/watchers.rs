use crate::executor::OrderExecutor;
use crate::schedule::sleep_or_shutdown;
use chrono::Utc;
use hedgebot_core::{Broker, ExitReason};
use hedgebot_risk::TradingSession;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Set by a watcher after it closed everything; cleared by the main loop.
#[derive(Debug, Clone, Default)]
pub struct HaltFlag(Arc<AtomicBool>);

impl HaltFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the flag was not already raised.
    pub fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Background watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub interval_secs: u64,
    /// Close everything once equity is up this much since start.
    pub equity_profit: Option<Decimal>,
    /// Close everything once equity is down this much since start.
    pub equity_loss: Option<Decimal>,
    /// Shut the bot down after an equity trigger instead of trading on.
    pub stop_on_equity_target: bool,
    /// Close everything as soon as the trading session ends.
    pub session_close: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            equity_profit: None,
            equity_loss: None,
            stop_on_equity_target: true,
            session_close: false,
        }
    }
}

impl WatcherConfig {
    pub fn equity_enabled(&self) -> bool {
        self.equity_profit.is_some() || self.equity_loss.is_some()
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Which equity threshold, if any, `equity` crossed relative to `start`.
pub fn equity_trigger(
    start: Decimal,
    equity: Decimal,
    profit: Option<Decimal>,
    loss: Option<Decimal>,
) -> Option<ExitReason> {
    if matches!(profit, Some(p) if equity - start >= p) {
        return Some(ExitReason::ProfitTarget);
    }
    if matches!(loss, Some(l) if start - equity >= l) {
        return Some(ExitReason::LossLimit);
    }
    None
}

/// Watch account equity against the session start and close everything on a trigger.
///
/// After a trigger the watcher either requests shutdown or starts measuring
/// again from the new equity.
pub fn spawn_equity_watcher<B>(
    broker: Arc<Mutex<B>>,
    executor: OrderExecutor,
    start_equity: Decimal,
    config: WatcherConfig,
    halt: HaltFlag,
    shutdown: Arc<watch::Sender<bool>>,
) -> JoinHandle<()>
where
    B: Broker + 'static,
{
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let mut start = start_equity;
        info!(start_equity = %start, profit = ?config.equity_profit, loss = ?config.equity_loss, "Equity watcher started");
        loop {
            if !sleep_or_shutdown(config.interval(), &mut shutdown_rx).await {
                return;
            }
            let mut broker = broker.lock().await;
            let account = match broker.account_state().await {
                Ok(account) => account,
                Err(err) => {
                    warn!(error = %err, "Equity watcher could not read the account");
                    continue;
                }
            };
            let Some(reason) = equity_trigger(start, account.equity, config.equity_profit, config.equity_loss) else {
                continue;
            };

            warn!(%reason, start_equity = %start, equity = %account.equity, "Equity watcher triggered, closing everything");
            match executor.close_all(&mut *broker).await {
                Ok(report) => info!(closed = report.closed, cancelled = report.cancelled, "Equity watcher closed the ladder"),
                Err(err) => {
                    error!(error = %err, "Equity watcher failed to close everything, retrying");
                    continue;
                }
            }
            halt.raise();

            if config.stop_on_equity_target {
                info!("Equity target reached, stopping the bot");
                let _ = shutdown.send(true);
                return;
            }
            start = match broker.account_state().await {
                Ok(after) => after.equity,
                Err(_) => account.equity,
            };
        }
    })
}

/// Close everything and halt trading when the session window closes.
pub fn spawn_session_watcher<B>(
    broker: Arc<Mutex<B>>,
    executor: OrderExecutor,
    session: TradingSession,
    interval: Duration,
    halt: HaltFlag,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    B: Broker + 'static,
{
    tokio::spawn(async move {
        loop {
            if !sleep_or_shutdown(interval, &mut shutdown).await {
                return;
            }
            if session.is_open(Utc::now()) || halt.is_raised() {
                continue;
            }
            let mut broker = broker.lock().await;
            match executor.close_all(&mut *broker).await {
                Ok(report) if report.closed + report.cancelled > 0 => {
                    info!(
                        closed = report.closed,
                        cancelled = report.cancelled,
                        "Session over, closed the ladder"
                    );
                    halt.raise();
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "Session watcher failed to close everything"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;
    use hedgebot_core::{OrderRequest, Side};
    use rust_decimal_macros::dec;

    #[test]
    fn test_halt_flag() {
        let halt = HaltFlag::new();
        let shared = halt.clone();
        assert!(!halt.is_raised());
        assert!(shared.raise());
        assert!(!shared.raise());
        assert!(halt.is_raised());
        halt.clear();
        assert!(!shared.is_raised());
    }

    #[test]
    fn test_equity_trigger() {
        let start = dec!(10000);
        assert_eq!(equity_trigger(start, dec!(10100), Some(dec!(100)), None), Some(ExitReason::ProfitTarget));
        assert_eq!(equity_trigger(start, dec!(10099), Some(dec!(100)), None), None);
        assert_eq!(equity_trigger(start, dec!(9950), None, Some(dec!(50))), Some(ExitReason::LossLimit));
        assert_eq!(equity_trigger(start, dec!(9950), None, None), None);
    }

    #[tokio::test]
    async fn test_equity_watcher_closes_and_stops() {
        let mut broker = paper(0).await;
        let executor = OrderExecutor::new("XAUUSD", fast_retry(), 20, MAGIC);
        broker
            .place_order(OrderRequest::market("XAUUSD", Side::Buy, dec!(0.1)).tagged(MAGIC, "rung-0"))
            .await
            .unwrap();
        broker.set_quote(ts(1), dec!(95));
        let broker = Arc::new(Mutex::new(broker));

        let (tx, mut rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let halt = HaltFlag::new();
        let config = WatcherConfig {
            interval_secs: 0,
            equity_loss: Some(dec!(40)),
            ..Default::default()
        };
        let handle = spawn_equity_watcher(broker.clone(), executor, dec!(10000), config, halt.clone(), tx.clone());

        tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
        assert!(halt.is_raised());
        assert!(*rx.borrow_and_update());
        assert!(broker.lock().await.open_positions().is_empty());
    }

    async fn with_open_ladder() -> Arc<Mutex<hedgebot_brokers_common::PaperBroker>> {
        let mut broker = paper(0).await;
        broker
            .place_order(OrderRequest::market("XAUUSD", Side::Buy, dec!(0.01)).tagged(MAGIC, "rung-0"))
            .await
            .unwrap();
        broker
            .place_order(OrderRequest::stop("XAUUSD", Side::Sell, dec!(0.02), dec!(90)).tagged(MAGIC, "rung-1"))
            .await
            .unwrap();
        Arc::new(Mutex::new(broker))
    }

    #[tokio::test]
    async fn test_session_watcher_closes_after_hours() {
        let broker = with_open_ladder().await;
        let executor = OrderExecutor::new("XAUUSD", fast_retry(), 20, MAGIC);
        let (tx, rx) = watch::channel(false);
        let halt = HaltFlag::new();
        let handle = spawn_session_watcher(
            broker.clone(),
            executor,
            session_around_now(false),
            Duration::from_millis(10),
            halt.clone(),
            rx,
        );

        tokio::time::timeout(Duration::from_secs(10), async {
            while !halt.is_raised() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        {
            let broker = broker.lock().await;
            assert!(broker.open_positions().is_empty());
            assert!(broker.working_orders().is_empty());
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_watcher_idle_in_session() {
        let broker = with_open_ladder().await;
        let executor = OrderExecutor::new("XAUUSD", fast_retry(), 20, MAGIC);
        let (tx, rx) = watch::channel(false);
        let halt = HaltFlag::new();
        let handle = spawn_session_watcher(
            broker.clone(),
            executor,
            session_around_now(true),
            Duration::from_millis(10),
            halt.clone(),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
        assert!(!halt.is_raised());
        let broker = broker.lock().await;
        assert_eq!((broker.open_positions().len(), broker.working_orders().len()), (1, 1));
    }
}

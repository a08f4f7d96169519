use crate::controller::{ControllerConfig, LadderController, PollOutcome};
use crate::error::EngineError;
use crate::schedule::{sleep_or_shutdown, CandleClock};
use crate::state_store::StateStore;
use crate::watchers::{spawn_equity_watcher, spawn_session_watcher, HaltFlag, WatcherConfig};
use chrono::Utc;
use hedgebot_brokers_common::retry;
use hedgebot_core::{Broker, BrokerError, ExitReason, LadderEvent};
use hedgebot_risk::TradingSession;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Settings for the live loop around a [`LadderController`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub controller: ControllerConfig,
    /// Poll every N seconds instead of once per candle.
    pub poll_interval_secs: Option<u64>,
    pub reconnect_backoff_secs: u64,
    pub session: Option<TradingSession>,
    pub watchers: WatcherConfig,
    pub state_file: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn new(controller: ControllerConfig) -> Self {
        Self {
            controller,
            poll_interval_secs: None,
            reconnect_backoff_secs: 5,
            session: None,
            watchers: WatcherConfig::default(),
            state_file: None,
        }
    }
}

/// Totals reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub polls: usize,
    pub ladders_opened: usize,
    pub ladders_closed: usize,
}

/// The live trading loop.
pub struct Runner<B> {
    config: RunnerConfig,
    broker: Arc<Mutex<B>>,
    halt: HaltFlag,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<B: Broker + 'static> Runner<B> {
    pub fn new(config: RunnerConfig, broker: B) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            broker: Arc::new(Mutex::new(broker)),
            halt: HaltFlag::new(),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn broker(&self) -> Arc<Mutex<B>> {
        self.broker.clone()
    }

    /// The flag watchers raise after closing everything behind the loop's back.
    pub fn halt_flag(&self) -> HaltFlag {
        self.halt.clone()
    }

    /// Send `true` to stop the loop after the current cycle.
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    /// Run until shutdown. Only the initial connection is fatal.
    pub async fn run(self) -> Result<RunSummary, EngineError> {
        let cfg = &self.config;
        let symbol_name = cfg.controller.symbol.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let (symbol, account) = {
            let mut broker = self.broker.lock().await;
            broker.connect().await?;
            let symbol = retry!(cfg.controller.retry, "symbol_info", broker.symbol_info(&symbol_name))?;
            let account = retry!(cfg.controller.retry, "account_state", broker.account_state())?;
            (symbol, account)
        };
        info!(
            symbol = %symbol.symbol,
            point = %symbol.point,
            digits = symbol.digits,
            stops_level = symbol.stops_level,
            balance = %account.balance,
            equity = %account.equity,
            currency = %account.currency,
            "Connected"
        );

        let mut controller = LadderController::new(cfg.controller.clone(), symbol, account.equity);
        let store = cfg.state_file.as_ref().map(StateStore::new);
        let snapshot = match &store {
            Some(store) => store.load().unwrap_or_else(|err| {
                warn!(error = %err, "Ignoring unreadable ladder snapshot");
                None
            }),
            None => None,
        };
        {
            let mut broker = self.broker.lock().await;
            match controller.recover(&mut *broker, snapshot).await {
                Ok(outcome) => info!(?outcome, "Start-up reconciliation done"),
                Err(err) => warn!(error = %err, "Start-up reconciliation failed"),
            }
        }
        let mut summary = RunSummary::default();
        persist(store.as_ref(), &mut controller, &mut summary, true);

        let mut tasks = Vec::new();
        if cfg.watchers.equity_enabled() {
            tasks.push(spawn_equity_watcher(
                self.broker.clone(),
                controller.executor().clone(),
                account.equity,
                cfg.watchers.clone(),
                self.halt.clone(),
                self.shutdown.clone(),
            ));
        }
        if let (true, Some(session)) = (cfg.watchers.session_close, cfg.session) {
            tasks.push(spawn_session_watcher(
                self.broker.clone(),
                controller.executor().clone(),
                session,
                Duration::from_secs(cfg.watchers.interval_secs.max(1)),
                self.halt.clone(),
                self.shutdown.subscribe(),
            ));
        }
        let ctrl_c = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                let _ = ctrl_c.send(true);
            }
        }));

        let clock = CandleClock::new(cfg.controller.timeframe).with_poll_interval(cfg.poll_interval_secs);
        let backoff = Duration::from_secs(cfg.reconnect_backoff_secs.max(1));
        info!(
            symbol = %symbol_name,
            timeframe = %cfg.controller.timeframe,
            period_secs = clock.period_secs(),
            "Trading loop started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let now = Utc::now();
            let mut wait = clock.next_wait(now);

            if self.halt.is_raised() {
                let mut broker = self.broker.lock().await;
                match controller.unwind(&mut *broker, ExitReason::Halted).await {
                    Ok(outcome) => {
                        info!(?outcome, "Halt handled, ladder reset");
                        self.halt.clear();
                    }
                    Err(err) => warn!(error = %err, "Could not reset after halt"),
                }
            } else if let Some(session) = cfg.session.filter(|s| !s.is_open(now)) {
                if !controller.ladder().is_flat() {
                    let mut broker = self.broker.lock().await;
                    if let Err(err) = controller.unwind(&mut *broker, ExitReason::SessionEnd).await {
                        warn!(error = %err, "Could not close the ladder at session end");
                    }
                }
                if controller.ladder().is_flat() {
                    wait = session.until_start(now).to_std().unwrap_or(wait).max(Duration::from_secs(1));
                    info!(session_start = %session.start, wait_secs = wait.as_secs(), "Outside trading session");
                }
            } else {
                let mut broker = self.broker.lock().await;
                if !broker.is_connected() {
                    match broker.connect().await {
                        Ok(()) => info!("Reconnected"),
                        Err(err) => {
                            warn!(error = %err, backoff_secs = backoff.as_secs(), "Reconnect failed");
                            wait = backoff;
                        }
                    }
                }
                if broker.is_connected() {
                    match controller.poll(&mut *broker, now).await {
                        Ok(outcome) => {
                            summary.polls += 1;
                            if outcome != PollOutcome::Idle {
                                debug!(?outcome, phase = %controller.phase(), "Poll");
                            }
                        }
                        Err(EngineError::Broker(err)) if is_connection_error(&err) => {
                            warn!(error = %err, backoff_secs = backoff.as_secs(), "Lost the broker connection");
                            let _ = broker.disconnect().await;
                            wait = backoff;
                        }
                        Err(err) => error!(error = %err, phase = %controller.phase(), "Poll failed"),
                    }
                }
            }

            persist(store.as_ref(), &mut controller, &mut summary, false);
            if !sleep_or_shutdown(wait, &mut shutdown_rx).await {
                break;
            }
        }

        for task in &tasks {
            task.abort();
        }
        persist(store.as_ref(), &mut controller, &mut summary, true);
        if !controller.ladder().is_flat() {
            info!(phase = %controller.phase(), "Stopping with an open ladder; it resumes on the next start");
        }
        let _ = self.broker.lock().await.disconnect().await;
        summary.ladders_opened = controller.cycles();
        info!(
            polls = summary.polls,
            ladders_opened = summary.ladders_opened,
            ladders_closed = summary.ladders_closed,
            "Trading loop stopped"
        );
        Ok(summary)
    }
}

fn is_connection_error(err: &BrokerError) -> bool {
    matches!(err, BrokerError::ConnectionFailed(_) | BrokerError::NotConnected)
}

/// Save the ladder if anything happened since the last save.
fn persist(store: Option<&StateStore>, controller: &mut LadderController, summary: &mut RunSummary, force: bool) {
    let events = controller.drain_events();
    summary.ladders_closed += events
        .iter()
        .filter(|e| matches!(e, LadderEvent::Unwound { .. }))
        .count();
    if events.is_empty() && !force {
        return;
    }
    if let Some(store) = store {
        if let Err(err) = store.save(&controller.snapshot(Utc::now())) {
            warn!(error = %err, path = %store.path().display(), "Could not save ladder snapshot");
        }
    }
}

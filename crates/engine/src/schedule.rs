use chrono::{DateTime, Utc};
use hedgebot_core::Timeframe;
use std::time::Duration;
use tokio::sync::watch;

/// Seconds from `epoch_secs` until the next multiple of `period_secs`.
///
/// Exactly on a boundary waits a full period.
pub fn seconds_to_next_candle(epoch_secs: i64, period_secs: u64) -> u64 {
    if period_secs == 0 {
        return 0;
    }
    let period = period_secs as i64;
    (period - epoch_secs.rem_euclid(period)) as u64
}

/// Longest pause or check interval the engine accepts, in seconds.
pub const MAX_WAIT_SECS: u64 = 7 * 86_400;

/// `secs` as a chrono duration, capped at [`MAX_WAIT_SECS`].
pub fn capped_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WAIT_SECS) as i64)
}

/// Decides how long the live loop sleeps between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleClock {
    period_secs: u64,
    /// Poll on a fixed interval instead of at candle boundaries.
    poll_interval_secs: Option<u64>,
    /// Added after a boundary so the broker has published the closed candle.
    settle_secs: u64,
}

impl CandleClock {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            period_secs: timeframe.as_seconds(),
            poll_interval_secs: None,
            settle_secs: 1,
        }
    }

    pub fn with_poll_interval(mut self, secs: Option<u64>) -> Self {
        self.poll_interval_secs = secs.filter(|s| *s > 0);
        self
    }

    pub fn period_secs(&self) -> u64 {
        self.period_secs
    }

    /// Time to wait from `now` before the next poll.
    pub fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        match self.poll_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                let secs = seconds_to_next_candle(now.timestamp(), self.period_secs);
                Duration::from_secs(secs + self.settle_secs)
            }
        }
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `false` when woken by shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown_requested(shutdown) => false,
    }
}

/// Resolves once the shutdown flag turns true. Never resolves if the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_seconds_to_next_candle() {
        assert_eq!(seconds_to_next_candle(0, 60), 60);
        assert_eq!(seconds_to_next_candle(59, 60), 1);
        assert_eq!(seconds_to_next_candle(61, 60), 59);
        assert_eq!(seconds_to_next_candle(3_601, 900), 899);
        assert_eq!(seconds_to_next_candle(10, 0), 0);
    }

    #[test]
    fn test_clock_aligns_to_timeframe() {
        let clock = CandleClock::new(Timeframe::Minute(15));
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 10, 14, 30).unwrap();
        assert_eq!(clock.next_wait(now), Duration::from_secs(31));
        let fixed = clock.with_poll_interval(Some(5));
        assert_eq!(fixed.next_wait(now), Duration::from_secs(5));
        assert_eq!(clock.with_poll_interval(Some(0)), clock);
    }

    #[test]
    fn test_capped_seconds() {
        assert_eq!(capped_seconds(600), chrono::Duration::seconds(600));
        assert_eq!(capped_seconds(u64::MAX), chrono::Duration::days(7));
    }

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_or_shutdown(Duration::from_millis(1), &mut rx).await);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move { sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await });
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_already_shut_down() {
        let (_tx, mut rx) = watch::channel(true);
        assert!(!sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await);
    }
}

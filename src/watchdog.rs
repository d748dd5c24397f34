/// Inactivity watchdog for a monitoring session.
///
/// The monitor holds the [`Watchdog`] and calls `reset` for every chunk it
/// receives; the paired [`WatchdogTimer`] is raced against the session and
/// completes once a full timeout window passes without a reset.
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub struct Watchdog {
    timeout: Duration,
    deadline: watch::Sender<Instant>,
}

pub struct WatchdogTimer {
    deadline: watch::Receiver<Instant>,
}

impl Watchdog {
    /// Arm a new watchdog; the first deadline is `timeout` from now.
    pub fn new(timeout: Duration) -> (Watchdog, WatchdogTimer) {
        let (tx, rx) = watch::channel(Instant::now() + timeout);
        (
            Watchdog {
                timeout,
                deadline: tx,
            },
            WatchdogTimer { deadline: rx },
        )
    }

    /// Push the deadline out to `timeout` from now.
    pub fn reset(&self) {
        self.deadline.send_replace(Instant::now() + self.timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl WatchdogTimer {
    /// Resolve once the current deadline passes without having been moved.
    ///
    /// Also resolves when the [`Watchdog`] is dropped at its deadline.
    pub async fn expired(&mut self) {
        loop {
            let deadline = *self.deadline.borrow_and_update();
            tokio::time::sleep_until(deadline).await;
            if !self.deadline.has_changed().unwrap_or(false) {
                tracing::debug!("watchdog deadline passed");
                return;
            }
        }
    }
}

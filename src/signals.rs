//! Signal handling for graceful shutdown.
//!
//! Ctrl-C or SIGTERM asks the orchestrator to stop. The running attempt is
//! abandoned and the VM powered off before the run ends as interrupted.
use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    requested: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    requested: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.requested.send_replace(true);
    }
}

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { requested: tx }, Shutdown { requested: rx })
    }

    /// A shutdown that is never requested.
    #[cfg(test)]
    pub fn never() -> Shutdown {
        Self::channel().1
    }

    /// Listen for Ctrl-C and SIGTERM.
    pub fn install() -> Shutdown {
        let (trigger, shutdown) = Self::channel();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::warn!("shutdown requested, stopping after powering off the VM");
            trigger.trigger();
        });
        shutdown
    }

    pub fn requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Resolve once shutdown is requested. Never resolves if it cannot be.
    pub async fn wait(&mut self) {
        if self.requested.wait_for(|&requested| requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

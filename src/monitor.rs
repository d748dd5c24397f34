//! Boot-log monitoring protocol.
//!
//! A [`StreamMonitor`] consumes the guest's serial output chunk by chunk,
//! answers debugger prompts with synthetic key presses and ends with a
//! [`Verdict`]. The whole session is raced against an inactivity
//! [`Watchdog`](crate::watchdog::Watchdog): a silent guest ends the session
//! with `Continue` and the timed-out flag set.
use crate::chunk::ChunkReader;
use crate::input::{self, GuestInput, Injector, Key};
use crate::markers::{self, Marker};
use crate::transcript::Transcript;
use crate::watchdog::Watchdog;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Outcome of one monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The stage checkpoint was printed.
    CheckpointReached,
    /// The attempt did not make progress; boot again.
    Continue,
    /// The guest reported a hard failure; stop the run.
    Abort,
}

/// Verdict plus whether the watchdog ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOutcome {
    pub verdict: Verdict,
    pub timed_out: bool,
}

impl MonitorOutcome {
    pub fn finished(verdict: Verdict) -> Self {
        Self {
            verdict,
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            verdict: Verdict::Continue,
            timed_out: true,
        }
    }
}

/// What to do after observing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Next,
    Inject(&'static [Key]),
    Finish(Verdict),
}

/// Per-session protocol state.
#[derive(Debug, Default)]
pub struct MonitorState {
    last_line: String,
    repeat_count: u32,
    debugger_hits: u32,
    raw_mode: bool,
    verdict: Option<Verdict>,
}

impl MonitorState {
    /// Run one chunk through the protocol.
    ///
    /// Must not be called again once it has returned [`Step::Finish`].
    pub fn observe(&mut self, chunk: &str, checkpoint: &str, duplicate_line_limit: u32) -> Step {
        debug_assert!(self.verdict.is_none(), "chunk observed after verdict");

        if chunk == self.last_line {
            self.repeat_count += 1;
            if self.repeat_count > duplicate_line_limit {
                tracing::warn!(
                    repeats = self.repeat_count,
                    "guest seems stuck in an endless loop, canceling"
                );
                return self.finish(Verdict::Continue);
            }
        } else {
            self.repeat_count = 0;
            self.last_line.clear();
            self.last_line.push_str(chunk);
        }

        match markers::classify(chunk, checkpoint) {
            Some(Marker::RawModeSwitch) => {
                if !self.raw_mode {
                    tracing::debug!("switching to serial debugger input");
                }
                self.raw_mode = true;
                Step::Next
            }
            Some(Marker::DebuggerPrompt) => {
                self.debugger_hits += 1;
                if self.debugger_hits == 1 {
                    tracing::debug!("debugger prompt, requesting backtrace");
                    Step::Inject(input::BACKTRACE)
                } else {
                    tracing::warn!(hits = self.debugger_hits, "debugger entered again");
                    self.finish(Verdict::Continue)
                }
            }
            Some(Marker::PagerPrompt) => Step::Inject(input::NEXT_PAGE),
            Some(Marker::AssertPrompt) => Step::Inject(input::BREAK_ONCE),
            Some(Marker::Failure) => self.finish(Verdict::Abort),
            Some(Marker::Checkpoint) => self.finish(Verdict::CheckpointReached),
            None => Step::Next,
        }
    }

    fn finish(&mut self, verdict: Verdict) -> Step {
        self.verdict = Some(verdict);
        Step::Finish(verdict)
    }

    pub fn raw_mode(&self) -> bool {
        self.raw_mode
    }

    #[cfg(test)]
    pub fn debugger_hits(&self) -> u32 {
        self.debugger_hits
    }

    /// The verdict so far; `Continue` until a terminal marker fires.
    pub fn verdict(&self) -> Verdict {
        self.verdict.unwrap_or(Verdict::Continue)
    }
}

/// Settings for one monitoring session.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub checkpoint: String,
    pub timeout: Duration,
    pub duplicate_line_limit: u32,
    pub chunk_capacity: usize,
    /// Echo each chunk to stdout.
    pub echo: bool,
    pub transcript: Option<PathBuf>,
}

pub struct StreamMonitor {
    settings: MonitorSettings,
}

impl StreamMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self { settings }
    }

    /// Monitor `reader` until a verdict, end of stream, or watchdog expiry.
    pub async fn run<R, S, K>(&self, reader: R, injector: &mut Injector<S, K>) -> MonitorOutcome
    where
        R: AsyncRead + Unpin,
        S: GuestInput,
        K: GuestInput,
    {
        let (watchdog, mut timer) = Watchdog::new(self.settings.timeout);

        tokio::select! {
            biased;
            verdict = self.session(reader, injector, &watchdog) => MonitorOutcome::finished(verdict),
            _ = timer.expired() => {
                tracing::warn!(
                    timeout_secs = watchdog.timeout().as_secs_f64(),
                    "no guest output within timeout"
                );
                MonitorOutcome::timed_out()
            }
        }
    }

    async fn session<R, S, K>(
        &self,
        reader: R,
        injector: &mut Injector<S, K>,
        watchdog: &Watchdog,
    ) -> Verdict
    where
        R: AsyncRead + Unpin,
        S: GuestInput,
        K: GuestInput,
    {
        let mut transcript = self.settings.transcript.as_deref().and_then(|path| {
            Transcript::open(path)
                .map_err(|e| tracing::warn!(error = %e, "transcript disabled for this session"))
                .ok()
        });
        let mut echo = Echo::new(self.settings.echo.then(std::io::stdout));
        let mut chunks = ChunkReader::with_capacity(reader, self.settings.chunk_capacity);
        let mut state = MonitorState::default();

        loop {
            let chunk = match chunks.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    tracing::debug!("serial stream closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read serial stream");
                    break;
                }
            };

            watchdog.reset();
            echo.write(&chunk);
            if let Some(t) = &mut transcript {
                if let Err(e) = t.write(&chunk) {
                    tracing::warn!(error = %e, "transcript disabled for this session");
                    transcript = None;
                }
            }

            match state.observe(
                &chunk,
                &self.settings.checkpoint,
                self.settings.duplicate_line_limit,
            ) {
                Step::Next => {}
                Step::Inject(keys) => {
                    if let Err(e) = injector.send(state.raw_mode(), keys).await {
                        tracing::warn!(error = %e, "failed to send input to guest");
                        break;
                    }
                }
                Step::Finish(verdict) => return verdict,
            }
        }

        state.verdict()
    }
}

/// Guest output mirrored to the console. Switched off after the first write error.
struct Echo<W> {
    out: Option<W>,
}

impl<W: Write> Echo<W> {
    fn new(out: Option<W>) -> Self {
        Self { out }
    }

    fn write(&mut self, chunk: &str) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        if let Err(e) = out.write_all(chunk.as_bytes()).and_then(|()| out.flush()) {
            tracing::debug!(error = %e, "guest echo disabled for this session");
            self.out = None;
        }
    }
}

/// A monitoring session running on its own task.
pub struct MonitorHandle {
    outcome: oneshot::Receiver<MonitorOutcome>,
    task: JoinHandle<()>,
}

/// Start `monitor` on a new task; the outcome is published exactly once.
pub fn spawn<R, S, K>(monitor: StreamMonitor, reader: R, injector: Injector<S, K>) -> MonitorHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    S: GuestInput + 'static,
    K: GuestInput + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut injector = injector;
        let outcome = monitor.run(reader, &mut injector).await;
        let _ = tx.send(outcome);
    });
    MonitorHandle { outcome: rx, task }
}

impl MonitorHandle {
    /// Wait for the session's outcome.
    ///
    /// A session that ended on the watchdog is not joined; its task is aborted.
    pub async fn wait(&mut self) -> MonitorOutcome {
        match (&mut self.outcome).await {
            Ok(outcome) => {
                if outcome.timed_out {
                    self.task.abort();
                } else if let Err(e) = (&mut self.task).await {
                    tracing::warn!(error = %e, "monitor task did not shut down cleanly");
                }
                outcome
            }
            Err(_) => {
                tracing::warn!("monitor task ended without a verdict");
                MonitorOutcome::finished(Verdict::Continue)
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

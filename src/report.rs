//! Per-run record of boot attempts, printed when the run ends.
use crate::monitor::Verdict;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How the whole run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage reached its checkpoint.
    Completed,
    /// The guest reported a failure during `stage` (0-based).
    Aborted { stage: usize },
    /// `stage` used up its attempts without reaching the checkpoint.
    RetriesExhausted { stage: usize },
    /// The VM could not be provisioned or was left running.
    VmFailure { stage: Option<usize>, error: String },
    Interrupted { stage: usize },
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Aborted { .. } => 1,
            RunOutcome::RetriesExhausted { .. } => 2,
            RunOutcome::VmFailure { .. } => 3,
            RunOutcome::Interrupted { .. } => 4,
        }
    }

    pub fn status_line(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "Reached the checkpoint!",
            RunOutcome::RetriesExhausted { .. } => "Failed to reach the checkpoint!!",
            RunOutcome::Aborted { .. } | RunOutcome::VmFailure { .. } => {
                "Testing process aborted!"
            }
            RunOutcome::Interrupted { .. } => "Testing process interrupted!",
        }
    }
}

/// One boot attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 1-based stage number.
    pub stage: usize,
    /// 1-based attempt number within the stage.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub verdict: Option<Verdict>,
    pub timed_out: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub attempts: Vec<AttemptRecord>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            attempts: Vec::new(),
        }
    }

    pub fn record(&mut self, attempt: AttemptRecord) {
        self.attempts.push(attempt);
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }

    /// Number of boot attempts made for a 1-based stage.
    #[cfg(test)]
    pub fn attempts_for(&self, stage: usize) -> usize {
        self.attempts.iter().filter(|a| a.stage == stage).count()
    }

    pub fn exit_code(&self) -> u8 {
        self.outcome
            .as_ref()
            .map(RunOutcome::exit_code)
            .unwrap_or(RunOutcome::Interrupted { stage: 0 }.exit_code())
    }

    /// Human-readable summary, one line per stage plus the final status.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let last_stage = self.attempts.iter().map(|a| a.stage).max().unwrap_or(0);
        for stage in 1..=last_stage {
            let attempts: Vec<&AttemptRecord> =
                self.attempts.iter().filter(|a| a.stage == stage).collect();
            let last = match attempts.last() {
                Some(last) => describe(last),
                None => "not run".to_string(),
            };
            out.push_str(&format!(
                "[SYSREG] Stage {}: {} attempt(s), last: {}\n",
                stage,
                attempts.len(),
                last
            ));
        }
        if let (Some(outcome), Some(finished)) = (&self.outcome, self.finished_at) {
            let elapsed = finished - self.started_at;
            out.push_str(&format!(
                "[SYSREG] Status: {} ({}s)\n",
                outcome.status_line(),
                elapsed.num_seconds()
            ));
        }
        out
    }
}

fn describe(attempt: &AttemptRecord) -> String {
    match (&attempt.error, attempt.verdict) {
        (Some(error), _) => format!("error: {error}"),
        (None, Some(_)) if attempt.timed_out => "timed out".to_string(),
        (None, Some(Verdict::CheckpointReached)) => "checkpoint reached".to_string(),
        (None, Some(Verdict::Continue)) => "no progress".to_string(),
        (None, Some(Verdict::Abort)) => "failure reported".to_string(),
        (None, None) => "interrupted".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(stage: usize, n: u32, verdict: Option<Verdict>) -> AttemptRecord {
        let now = Utc::now();
        AttemptRecord {
            stage,
            attempt: n,
            started_at: now,
            finished_at: now,
            verdict,
            timed_out: false,
            error: None,
        }
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            RunOutcome::Completed.exit_code(),
            RunOutcome::Aborted { stage: 0 }.exit_code(),
            RunOutcome::RetriesExhausted { stage: 0 }.exit_code(),
            RunOutcome::VmFailure {
                stage: None,
                error: String::new(),
            }
            .exit_code(),
            RunOutcome::Interrupted { stage: 0 }.exit_code(),
        ];
        assert_eq!(codes, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_summary_lists_stages() {
        let mut report = RunReport::new();
        report.record(attempt(1, 1, Some(Verdict::CheckpointReached)));
        report.record(attempt(2, 1, Some(Verdict::Continue)));
        let mut failed = attempt(2, 2, None);
        failed.error = Some("launch failed".to_string());
        report.record(failed);
        report.finish(RunOutcome::RetriesExhausted { stage: 1 });

        let summary = report.summary();
        assert!(summary.contains("Stage 1: 1 attempt(s), last: checkpoint reached"));
        assert!(summary.contains("Stage 2: 2 attempt(s), last: error: launch failed"));
        assert!(summary.contains("Failed to reach the checkpoint!!"));
        assert_eq!(report.attempts_for(2), 2);
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn test_json_shape() {
        let mut report = RunReport::new();
        let mut timed_out = attempt(1, 1, Some(Verdict::Continue));
        timed_out.timed_out = true;
        report.record(timed_out);
        report.finish(RunOutcome::Aborted { stage: 0 });

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"]["status"], "aborted");
        assert_eq!(value["outcome"]["stage"], 0);
        assert_eq!(value["attempts"][0]["verdict"], "continue");
        assert_eq!(value["attempts"][0]["timed_out"], true);
    }

    #[test]
    fn test_timed_out_attempt_description() {
        let mut a = attempt(1, 1, Some(Verdict::Continue));
        a.timed_out = true;
        assert_eq!(describe(&a), "timed out");
    }
}

//! Marker set recognized in the guest's debug output.
//!
//! Three of the markers are interactive prompts that the guest prints without
//! a trailing newline; the chunk reader cuts a chunk as soon as one of them
//! shows up so the monitor can answer the prompt instead of waiting forever.

/// Kernel debugger prompt.
pub const DEBUGGER_PROMPT: &str = "kdb:>";
/// Debugger pager prompt ("--- Press q to abort, any other key to continue ---").
pub const PAGER_PROMPT: &str = "--- Press q";
/// Assertion prompt ("Break repeatedly, break Once, Ignore, terminate Process or terminate Thread (boipt)?").
pub const ASSERT_PROMPT: &str = "Break repea";
/// Printed by the guest when its debugger talks over the serial line (KDSERIAL).
pub const RAW_MODE_SWITCH: &str = "KDSERIAL";
/// Printed by the guest's test driver when a test run failed hard.
pub const FAILURE_REPORT: &str = "SYSREG_ROSAUTOTEST_FAILURE";

/// Prompts that end a chunk without a newline.
pub const PROMPTS: [&str; 3] = [DEBUGGER_PROMPT, PAGER_PROMPT, ASSERT_PROMPT];

/// A marker found in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    RawModeSwitch,
    DebuggerPrompt,
    PagerPrompt,
    AssertPrompt,
    Failure,
    Checkpoint,
}

/// Classify a chunk against the marker set, first match wins.
///
/// The order matters: a chunk carrying both the failure report and the stage
/// checkpoint is a failure.
pub fn classify(chunk: &str, checkpoint: &str) -> Option<Marker> {
    if chunk.contains(RAW_MODE_SWITCH) {
        Some(Marker::RawModeSwitch)
    } else if chunk.contains(DEBUGGER_PROMPT) {
        Some(Marker::DebuggerPrompt)
    } else if chunk.contains(PAGER_PROMPT) {
        Some(Marker::PagerPrompt)
    } else if chunk.contains(ASSERT_PROMPT) {
        Some(Marker::AssertPrompt)
    } else if chunk.contains(FAILURE_REPORT) {
        Some(Marker::Failure)
    } else if !checkpoint.is_empty() && chunk.contains(checkpoint) {
        Some(Marker::Checkpoint)
    } else {
        None
    }
}

/// True when `buf` ends with one of the newline-less prompts.
///
/// Checked after every byte, so the first time a prompt appears anywhere in
/// the buffer it is a suffix.
pub fn ends_with_prompt(buf: &[u8]) -> bool {
    PROMPTS.iter().any(|p| buf.ends_with(p.as_bytes()))
}

/// Length of the longest prompt; a chunk buffer must hold at least this much.
pub fn longest_prompt() -> usize {
    PROMPTS.iter().map(|p| p.len()).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKPOINT: &str = "SYSREG_CHECKPOINT:THIRDBOOT_COMPLETE";

    #[test]
    fn test_plain_line_has_no_marker() {
        assert_eq!(classify("(ntoskrnl/ke/main.c:120) booting\n", CHECKPOINT), None);
    }

    #[test]
    fn test_debugger_prompt() {
        assert_eq!(classify("kdb:>", CHECKPOINT), Some(Marker::DebuggerPrompt));
    }

    #[test]
    fn test_pager_and_assert_prompts() {
        assert_eq!(
            classify("--- Press q to abort", CHECKPOINT),
            Some(Marker::PagerPrompt)
        );
        assert_eq!(classify("Break repea", CHECKPOINT), Some(Marker::AssertPrompt));
    }

    #[test]
    fn test_raw_mode_switch_wins_over_prompt() {
        assert_eq!(
            classify("KDSERIAL kdb:>", CHECKPOINT),
            Some(Marker::RawModeSwitch)
        );
    }

    #[test]
    fn test_failure_precedes_checkpoint() {
        let chunk = format!("{FAILURE_REPORT} {CHECKPOINT}\n");
        assert_eq!(classify(&chunk, CHECKPOINT), Some(Marker::Failure));
    }

    #[test]
    fn test_checkpoint() {
        assert_eq!(
            classify("It's the final countdown...\n", "It's the final countdown..."),
            Some(Marker::Checkpoint)
        );
    }

    #[test]
    fn test_empty_checkpoint_never_matches() {
        assert_eq!(classify("anything\n", ""), None);
    }

    #[test]
    fn test_ends_with_prompt() {
        assert!(ends_with_prompt(b"\nkdb:>"));
        assert!(ends_with_prompt(b"--- Press q"));
        assert!(!ends_with_prompt(b"kdb:> "));
        assert!(!ends_with_prompt(b""));
    }

    #[test]
    fn test_longest_prompt() {
        assert_eq!(longest_prompt(), "Break repea".len());
    }
}

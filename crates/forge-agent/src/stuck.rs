//! Stuck detection and recovery.
//!
//! Three patterns are checked in order over the bounded iteration history;
//! the first hit wins. Recovery picks one of four strategies configured per
//! task. Every continue-style recovery forwards a prompt suffix carrying
//! the `STUCK DETECTED` marker so the runtime knows why it is being nudged.

use serde::{Deserialize, Serialize};

use forge_db::models::IterationOutcome;

use crate::state::IterationEntry;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Recovery strategy, selected per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    #[default]
    RetryVariation,
    Simplify,
    Rollback,
    Abort,
}

fn default_same_output() -> usize {
    3
}

fn default_no_progress() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckConfig {
    #[serde(default)]
    pub strategy: RecoveryStrategy,
    #[serde(default = "default_same_output")]
    pub same_output_threshold: usize,
    #[serde(default = "default_no_progress")]
    pub no_progress_threshold: usize,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategy::default(),
            same_output_threshold: default_same_output(),
            no_progress_threshold: default_no_progress(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Which pattern fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StuckPattern {
    SameOutput,
    NoProgress,
    RepeatingError,
}

/// Detector verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckVerdict {
    pub is_stuck: bool,
    pub pattern: Option<StuckPattern>,
    pub reason: String,
}

impl StuckVerdict {
    fn clear() -> Self {
        Self {
            is_stuck: false,
            pattern: None,
            reason: String::new(),
        }
    }

    fn stuck(pattern: StuckPattern, reason: impl Into<String>) -> Self {
        Self {
            is_stuck: true,
            pattern: Some(pattern),
            reason: reason.into(),
        }
    }
}

/// Pass-rate window below which iterations count as "no movement".
const NO_PROGRESS_WINDOW: f64 = 0.05;

/// Run the three patterns in order over the history.
pub fn detect(history: &[IterationEntry], config: &StuckConfig) -> StuckVerdict {
    if let Some(verdict) = same_output(history, config.same_output_threshold) {
        return verdict;
    }
    if let Some(verdict) = no_progress(history, config.no_progress_threshold) {
        return verdict;
    }
    if let Some(verdict) = repeating_error(history) {
        return verdict;
    }
    StuckVerdict::clear()
}

/// The last N summaries, case-folded and trimmed, are identical.
fn same_output(history: &[IterationEntry], threshold: usize) -> Option<StuckVerdict> {
    if threshold == 0 || history.len() < threshold {
        return None;
    }
    let tail = &history[history.len() - threshold..];
    let first = tail[0].summary.trim().to_lowercase();
    if first.is_empty() {
        return None;
    }
    if tail
        .iter()
        .all(|e| e.summary.trim().to_lowercase() == first)
    {
        return Some(StuckVerdict::stuck(
            StuckPattern::SameOutput,
            format!("last {threshold} iterations produced identical output"),
        ));
    }
    None
}

/// The last M pass-rates sit inside a 5% window, the best is short of
/// perfect, and at least one iteration actually ran criteria.
fn no_progress(history: &[IterationEntry], threshold: usize) -> Option<StuckVerdict> {
    if threshold == 0 || history.len() < threshold {
        return None;
    }
    let tail = &history[history.len() - threshold..];
    if !tail.iter().any(|e| e.had_criteria) {
        return None;
    }
    let max = tail.iter().map(|e| e.pass_rate).fold(f64::MIN, f64::max);
    let min = tail.iter().map(|e| e.pass_rate).fold(f64::MAX, f64::min);
    if (max - min) < NO_PROGRESS_WINDOW && max < 1.0 {
        return Some(StuckVerdict::stuck(
            StuckPattern::NoProgress,
            format!(
                "criteria pass rate flat at {:.0}% for {threshold} iterations",
                max * 100.0
            ),
        ));
    }
    None
}

/// The last three error-outcome iterations share one non-unknown message.
fn repeating_error(history: &[IterationEntry]) -> Option<StuckVerdict> {
    let errors: Vec<&IterationEntry> = history
        .iter()
        .filter(|e| e.outcome == IterationOutcome::Error)
        .collect();
    if errors.len() < 3 {
        return None;
    }
    let last_three = &errors[errors.len() - 3..];
    let first = last_three[0].error_message.as_deref().unwrap_or("");
    if first.is_empty() || first.eq_ignore_ascii_case("unknown") {
        return None;
    }
    if last_three
        .iter()
        .all(|e| e.error_message.as_deref() == Some(first))
    {
        return Some(StuckVerdict::stuck(
            StuckPattern::RepeatingError,
            format!("same error three times: {first}"),
        ));
    }
    None
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// What the driver should do about a stuck verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Keep iterating; append the suffix to the next prompt.
    Continue { prompt_suffix: String },
    /// Restore the latest checkpoint first, then continue with the suffix.
    RestoreAndContinue { prompt_suffix: String },
    /// Give up; transition the task to terminal stuck.
    Abort { reason: String },
}

/// Select a recovery action for a stuck verdict.
///
/// `rollback` needs a checkpoint to restore; without one it degrades to the
/// retry-variation instruction.
pub fn recover(
    strategy: RecoveryStrategy,
    verdict: &StuckVerdict,
    has_checkpoint: bool,
) -> RecoveryAction {
    let reason = &verdict.reason;
    match strategy {
        RecoveryStrategy::RetryVariation => RecoveryAction::Continue {
            prompt_suffix: retry_variation_suffix(reason),
        },
        RecoveryStrategy::Simplify => RecoveryAction::Continue {
            prompt_suffix: format!(
                "\n\nSTUCK DETECTED: {reason}. Stop trying to finish everything at \
                 once; pick the smallest piece that moves a criterion and do only \
                 that this iteration."
            ),
        },
        RecoveryStrategy::Rollback => {
            if has_checkpoint {
                RecoveryAction::RestoreAndContinue {
                    prompt_suffix: format!(
                        "\n\nSTUCK DETECTED: {reason}. The working tree has been \
                         rolled back to the last good checkpoint; start fresh from \
                         there."
                    ),
                }
            } else {
                RecoveryAction::Continue {
                    prompt_suffix: retry_variation_suffix(reason),
                }
            }
        }
        RecoveryStrategy::Abort => RecoveryAction::Abort {
            reason: reason.clone(),
        },
    }
}

fn retry_variation_suffix(reason: &str) -> String {
    format!(
        "\n\nSTUCK DETECTED: {reason}. The current approach is not working; try a \
         genuinely different one instead of refining it."
    )
}

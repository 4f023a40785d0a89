//! Criteria evaluator.
//!
//! A criterion is a named, weighted predicate deciding whether the task is
//! done. Configs are a tagged sum; the evaluator dispatches on the tag,
//! runs the whole batch concurrently, and folds the results under the
//! selected aggregation mode. A criterion that blows up yields a failed
//! result carrying the error string -- it never aborts the batch.

pub mod parsers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// The tagged criterion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CriterionConfig {
    /// The transcript's `<promise>` marker equals the configured text.
    Promise { text: String },
    /// An external command exits with the expected code (default 0).
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        expected_exit_code: i32,
    },
    /// A path exists on disk.
    FileExists { path: String },
    /// A file contains a substring or matches a regex.
    FileContains {
        path: String,
        #[serde(default)]
        substring: Option<String>,
        #[serde(default)]
        pattern: Option<String>,
    },
    /// The package test runner exits successfully.
    TestPass {
        #[serde(default)]
        command: Option<String>,
    },
    /// The linter reports at most `max_errors` errors.
    LintClean {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        max_errors: u64,
    },
    /// Coverage output reports at least `min` percent.
    Coverage {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        min: f64,
    },
    /// An arbitrary script exits successfully.
    CustomScript {
        script: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    120
}

/// A named, weighted predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub name: String,
    #[serde(flatten)]
    pub config: CriterionConfig,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// How individual criterion results fold into a completion decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationMode {
    #[default]
    All,
    Any,
    Weighted,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of an evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationOutcome {
    pub results: Vec<CriterionResult>,
    /// 0..=1 under every mode.
    pub score: f64,
    pub is_complete: bool,
}

impl EvaluationOutcome {
    /// Fraction of criteria that passed (not the mode-weighted score).
    pub fn pass_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        let passed = self.results.iter().filter(|r| r.passed).count();
        passed as f64 / self.results.len() as f64
    }
}

/// Inputs the evaluator reads besides the filesystem.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Working directory for commands and relative paths.
    pub workdir: PathBuf,
    /// The `<promise>` text extracted from the latest transcript, if any.
    pub promise: Option<String>,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate every criterion concurrently and aggregate under `mode`.
///
/// Completion requires every `required` criterion to pass, and then the
/// mode's own bar: `all` needs a perfect score, `any` needs any pass,
/// `weighted` needs `score >= required_score`.
pub async fn evaluate(
    criteria: &[Criterion],
    mode: AggregationMode,
    required_score: f64,
    ctx: &EvalContext,
) -> EvaluationOutcome {
    let futures = criteria.iter().map(|c| evaluate_one(c, ctx));
    let results = join_all(futures).await;

    let total_weight: u64 = criteria.iter().map(|c| u64::from(c.weight)).sum();
    let passed_weight: u64 = criteria
        .iter()
        .zip(&results)
        .filter(|(_, r)| r.passed)
        .map(|(c, _)| u64::from(c.weight))
        .sum();
    let any_passed = results.iter().any(|r| r.passed);
    let all_passed = !results.is_empty() && results.iter().all(|r| r.passed);

    let score = match mode {
        AggregationMode::All => {
            if all_passed {
                1.0
            } else {
                0.0
            }
        }
        AggregationMode::Any => {
            if any_passed {
                1.0
            } else {
                0.0
            }
        }
        AggregationMode::Weighted => {
            if total_weight == 0 {
                0.0
            } else {
                passed_weight as f64 / total_weight as f64
            }
        }
    };

    let required_ok = criteria
        .iter()
        .zip(&results)
        .filter(|(c, _)| c.required)
        .all(|(_, r)| r.passed);

    let mode_ok = match mode {
        AggregationMode::All => (score - 1.0).abs() < f64::EPSILON,
        AggregationMode::Any => score > 0.0,
        AggregationMode::Weighted => score >= required_score,
    };

    EvaluationOutcome {
        results,
        score,
        is_complete: !criteria.is_empty() && required_ok && mode_ok,
    }
}

async fn evaluate_one(criterion: &Criterion, ctx: &EvalContext) -> CriterionResult {
    let outcome = match &criterion.config {
        CriterionConfig::Promise { text } => check_promise(text, ctx),
        CriterionConfig::FileExists { path } => check_file_exists(path, ctx),
        CriterionConfig::FileContains {
            path,
            substring,
            pattern,
        } => check_file_contains(path, substring.as_deref(), pattern.as_deref(), ctx),
        CriterionConfig::Command {
            command,
            args,
            expected_exit_code,
        } => {
            run_command_criterion(
                command,
                args,
                *expected_exit_code,
                criterion.timeout_secs,
                ctx,
            )
            .await
        }
        CriterionConfig::TestPass { command } => {
            let command = command.clone().unwrap_or_else(|| "cargo test".to_owned());
            run_shell_criterion(&command, 0, criterion.timeout_secs, ctx).await
        }
        CriterionConfig::CustomScript { script, args } => {
            run_command_criterion(script, args, 0, criterion.timeout_secs, ctx).await
        }
        CriterionConfig::LintClean {
            command,
            args,
            max_errors,
        } => {
            lint_clean(command, args, *max_errors, criterion.timeout_secs, ctx).await
        }
        CriterionConfig::Coverage { command, args, min } => {
            coverage(command, args, *min, criterion.timeout_secs, ctx).await
        }
    };

    match outcome {
        Ok((passed, detail)) => CriterionResult {
            name: criterion.name.clone(),
            passed,
            detail,
            error: None,
        },
        Err(error) => CriterionResult {
            name: criterion.name.clone(),
            passed: false,
            detail: None,
            error: Some(error),
        },
    }
}

type CheckOutcome = Result<(bool, Option<String>), String>;

fn check_promise(text: &str, ctx: &EvalContext) -> CheckOutcome {
    match &ctx.promise {
        Some(promise) => {
            let passed = promise.trim() == text.trim();
            Ok((passed, Some(format!("promise: {promise:?}"))))
        }
        None => Ok((false, Some("no promise marker in transcript".to_owned()))),
    }
}

fn check_file_exists(path: &str, ctx: &EvalContext) -> CheckOutcome {
    let resolved = resolve_path(path, ctx);
    Ok((resolved.exists(), Some(resolved.display().to_string())))
}

fn check_file_contains(
    path: &str,
    substring: Option<&str>,
    pattern: Option<&str>,
    ctx: &EvalContext,
) -> CheckOutcome {
    let resolved = resolve_path(path, ctx);
    let body = std::fs::read_to_string(&resolved)
        .map_err(|e| format!("failed to read {}: {e}", resolved.display()))?;

    if let Some(needle) = substring {
        return Ok((body.contains(needle), None));
    }
    if let Some(pattern) = pattern {
        let re = regex::Regex::new(pattern)
            .map_err(|e| format!("invalid pattern {pattern:?}: {e}"))?;
        return Ok((re.is_match(&body), None));
    }
    Err("file-contains needs a substring or a pattern".to_owned())
}

fn resolve_path(path: &str, ctx: &EvalContext) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        ctx.workdir.join(p)
    }
}

/// Spawn a command, capture output, compare the exit code.
async fn run_command(
    program: &str,
    args: &[String],
    timeout_secs: u64,
    ctx: &EvalContext,
) -> Result<(Option<i32>, String), String> {
    let timeout = Duration::from_secs(timeout_secs.max(1));

    let mut child = Command::new(program)
        .args(args)
        .current_dir(&ctx.workdir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn {program}: {e}"))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    match tokio::time::timeout(timeout, async {
        let (status, stdout, stderr) =
            tokio::join!(child.wait(), read_stdout, read_stderr);
        (status, stdout, stderr)
    })
    .await
    {
        Ok((Ok(status), stdout, stderr)) => {
            let mut output = stdout;
            output.push_str(&stderr);
            Ok((status.code(), output))
        }
        Ok((Err(e), _, _)) => Err(format!("failed to wait on {program}: {e}")),
        Err(_) => {
            let _ = child.kill().await;
            Err(format!("{program} timed out after {timeout_secs}s"))
        }
    }
}

async fn run_command_criterion(
    program: &str,
    args: &[String],
    expected_exit_code: i32,
    timeout_secs: u64,
    ctx: &EvalContext,
) -> CheckOutcome {
    let (code, output) = run_command(program, args, timeout_secs, ctx).await?;
    let passed = code == Some(expected_exit_code);
    Ok((passed, Some(tail(&output, 240))))
}

/// Run a full shell line (`sh -c`), used where configs supply one string.
async fn run_shell_criterion(
    command_line: &str,
    expected_exit_code: i32,
    timeout_secs: u64,
    ctx: &EvalContext,
) -> CheckOutcome {
    let args = vec!["-c".to_owned(), command_line.to_owned()];
    run_command_criterion("sh", &args, expected_exit_code, timeout_secs, ctx).await
}

async fn lint_clean(
    command: &str,
    args: &[String],
    max_errors: u64,
    timeout_secs: u64,
    ctx: &EvalContext,
) -> CheckOutcome {
    let (code, output) = run_command(command, args, timeout_secs, ctx).await?;
    // A clean exit is a clean lint regardless of what the output says.
    if code == Some(0) {
        return Ok((true, Some("exit 0".to_owned())));
    }
    match parsers::parse_lint_error_count(&output) {
        Some(count) => Ok((
            count <= max_errors,
            Some(format!("{count} errors (max {max_errors})")),
        )),
        None => Ok((false, Some(tail(&output, 240)))),
    }
}

async fn coverage(
    command: &str,
    args: &[String],
    min: f64,
    timeout_secs: u64,
    ctx: &EvalContext,
) -> CheckOutcome {
    let (_code, output) = run_command(command, args, timeout_secs, ctx).await?;
    match parsers::parse_coverage_percent(&output) {
        Some(percent) => Ok((
            percent >= min,
            Some(format!("{percent:.1}% (min {min:.1}%)")),
        )),
        None => Err("no coverage percentage found in output".to_owned()),
    }
}

/// Last `max` bytes of a string on a char boundary.
fn tail(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        return trimmed.to_owned();
    }
    let mut start = trimmed.len() - max;
    while start < trimmed.len() && !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx_in(dir: &TempDir) -> EvalContext {
        EvalContext {
            workdir: dir.path().to_path_buf(),
            promise: None,
        }
    }

    fn criterion(name: &str, config: CriterionConfig) -> Criterion {
        Criterion {
            name: name.to_owned(),
            config,
            weight: 1,
            required: false,
            timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn file_exists_pass_and_fail() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("OUT.txt"), "ok").unwrap();

        let criteria = vec![
            criterion(
                "present",
                CriterionConfig::FileExists {
                    path: "OUT.txt".into(),
                },
            ),
            criterion(
                "absent",
                CriterionConfig::FileExists {
                    path: "MISSING.txt".into(),
                },
            ),
        ];
        let outcome = evaluate(&criteria, AggregationMode::Any, 0.0, &ctx_in(&dir)).await;
        assert!(outcome.results[0].passed);
        assert!(!outcome.results[1].passed);
        assert!(outcome.is_complete, "any mode with one pass completes");
    }

    #[tokio::test]
    async fn required_criterion_gates_completion() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("OUT.txt"), "ok").unwrap();

        let mut gate = criterion(
            "gate",
            CriterionConfig::FileExists {
                path: "MISSING.txt".into(),
            },
        );
        gate.required = true;
        let criteria = vec![
            criterion(
                "present",
                CriterionConfig::FileExists {
                    path: "OUT.txt".into(),
                },
            ),
            gate,
        ];
        let outcome = evaluate(&criteria, AggregationMode::Any, 0.0, &ctx_in(&dir)).await;
        assert!(outcome.score > 0.0);
        assert!(!outcome.is_complete, "failed required criterion blocks");
    }

    #[tokio::test]
    async fn all_mode_scores_binary() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), "").unwrap();

        let both = vec![
            criterion("a", CriterionConfig::FileExists { path: "a".into() }),
            criterion("b", CriterionConfig::FileExists { path: "b".into() }),
        ];
        let outcome = evaluate(&both, AggregationMode::All, 0.0, &ctx_in(&dir)).await;
        assert_eq!(outcome.score, 0.0);
        assert!(!outcome.is_complete);

        std::fs::write(dir.path().join("b"), "").unwrap();
        let outcome = evaluate(&both, AggregationMode::All, 0.0, &ctx_in(&dir)).await;
        assert_eq!(outcome.score, 1.0);
        assert!(outcome.is_complete);
    }

    #[tokio::test]
    async fn weighted_mode_uses_weights() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("heavy"), "").unwrap();

        let mut heavy =
            criterion("heavy", CriterionConfig::FileExists { path: "heavy".into() });
        heavy.weight = 3;
        let light =
            criterion("light", CriterionConfig::FileExists { path: "light".into() });

        let criteria = vec![heavy, light];
        let outcome =
            evaluate(&criteria, AggregationMode::Weighted, 0.7, &ctx_in(&dir)).await;
        assert!((outcome.score - 0.75).abs() < 1e-9);
        assert!(outcome.is_complete);

        let outcome =
            evaluate(&criteria, AggregationMode::Weighted, 0.8, &ctx_in(&dir)).await;
        assert!(!outcome.is_complete);
    }

    #[tokio::test]
    async fn promise_criterion_compares_text() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx_in(&dir);
        ctx.promise = Some("ALL DONE".to_owned());

        let criteria = vec![criterion(
            "promise",
            CriterionConfig::Promise {
                text: "ALL DONE".into(),
            },
        )];
        let outcome = evaluate(&criteria, AggregationMode::All, 0.0, &ctx).await;
        assert!(outcome.is_complete);

        ctx.promise = Some("NOT YET".to_owned());
        let outcome = evaluate(&criteria, AggregationMode::All, 0.0, &ctx).await;
        assert!(!outcome.is_complete);
    }

    #[tokio::test]
    async fn command_criterion_checks_exit_code() {
        let dir = TempDir::new().unwrap();
        let criteria = vec![
            criterion(
                "true",
                CriterionConfig::Command {
                    command: "true".into(),
                    args: vec![],
                    expected_exit_code: 0,
                },
            ),
            criterion(
                "false-expected-1",
                CriterionConfig::Command {
                    command: "false".into(),
                    args: vec![],
                    expected_exit_code: 1,
                },
            ),
        ];
        let outcome = evaluate(&criteria, AggregationMode::All, 0.0, &ctx_in(&dir)).await;
        assert!(outcome.results.iter().all(|r| r.passed), "{outcome:?}");
    }

    #[tokio::test]
    async fn failing_criterion_reports_error_without_aborting_batch() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok"), "").unwrap();

        let criteria = vec![
            criterion(
                "boom",
                CriterionConfig::Command {
                    command: "this_command_does_not_exist_forge_test".into(),
                    args: vec![],
                    expected_exit_code: 0,
                },
            ),
            criterion("ok", CriterionConfig::FileExists { path: "ok".into() }),
        ];
        let outcome = evaluate(&criteria, AggregationMode::Any, 0.0, &ctx_in(&dir)).await;
        assert!(!outcome.results[0].passed);
        assert!(outcome.results[0].error.is_some());
        assert!(outcome.results[1].passed);
        assert!(outcome.is_complete);
    }

    #[tokio::test]
    async fn file_contains_substring_and_pattern() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("log.txt"), "build finished in 3.2s\n").unwrap();

        let criteria = vec![
            criterion(
                "substring",
                CriterionConfig::FileContains {
                    path: "log.txt".into(),
                    substring: Some("finished".into()),
                    pattern: None,
                },
            ),
            criterion(
                "pattern",
                CriterionConfig::FileContains {
                    path: "log.txt".into(),
                    substring: None,
                    pattern: Some(r"in \d+\.\d+s".into()),
                },
            ),
        ];
        let outcome = evaluate(&criteria, AggregationMode::All, 0.0, &ctx_in(&dir)).await;
        assert!(outcome.is_complete, "{outcome:?}");
    }

    #[tokio::test]
    async fn empty_criteria_never_complete() {
        let dir = TempDir::new().unwrap();
        let outcome = evaluate(&[], AggregationMode::All, 0.0, &ctx_in(&dir)).await;
        assert!(!outcome.is_complete);
        assert_eq!(outcome.pass_rate(), 0.0);
    }

    #[test]
    fn config_wire_format_is_kebab_tagged() {
        let json = serde_json::json!({
            "name": "out",
            "type": "file-exists",
            "path": "OUT.txt",
            "required": true
        });
        let criterion: Criterion = serde_json::from_value(json).expect("parse");
        assert_eq!(
            criterion.config,
            CriterionConfig::FileExists {
                path: "OUT.txt".into()
            }
        );
        assert!(criterion.required);
        assert_eq!(criterion.weight, 1);
    }

    #[test]
    fn lint_clean_config_parses() {
        let json = serde_json::json!({
            "name": "lint",
            "type": "lint-clean",
            "command": "cargo",
            "args": ["clippy"],
            "maxErrors": 2
        });
        let criterion: Criterion = serde_json::from_value(json).expect("parse");
        match criterion.config {
            CriterionConfig::LintClean { max_errors, .. } => assert_eq!(max_errors, 2),
            other => panic!("unexpected config: {other:?}"),
        }
    }
}

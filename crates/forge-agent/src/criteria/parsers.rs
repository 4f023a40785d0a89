//! Output parsers for lint and coverage criteria.
//!
//! Tool output formats vary, so each parser tries an ordered list of
//! patterns and takes the first hit. The coverage parser additionally falls
//! back to the last percentage anywhere in the output.

use std::sync::OnceLock;

use regex::Regex;

fn lint_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // eslint: "10 problems (7 errors, 3 warnings)"
            r"\((\d+) errors?",
            // "error: aborting due to 3 previous errors" (rustc)
            r"aborting due to (\d+) previous errors?",
            // "found 4 errors" (tsc), "Found 4 errors."
            r"(?i)found (\d+) errors?",
            // generic "7 errors" / "1 error"
            r"(?m)^\s*(\d+) errors?\b",
            // "errors: 5"
            r"(?i)errors?:\s*(\d+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("lint pattern should compile"))
        .collect()
    })
}

/// Extract the error count from linter output, trying patterns in order.
pub fn parse_lint_error_count(output: &str) -> Option<u64> {
    for pattern in lint_patterns() {
        if let Some(captures) = pattern.captures(output) {
            if let Some(count) = captures.get(1) {
                if let Ok(n) = count.as_str().parse() {
                    return Some(n);
                }
            }
        }
    }
    None
}

fn coverage_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // istanbul/nyc table: "All files  |  92.31 |"
            r"All files[^|]*\|\s*([\d.]+)",
            // "TOTAL ... 87%"  (coverage.py)
            r"(?m)^TOTAL.*?([\d.]+)%",
            // "total coverage: 81.2%"
            r"(?i)total coverage:?\s*([\d.]+)%",
            // "coverage: 75.0% of statements" (go test -cover)
            r"(?i)coverage:?\s*([\d.]+)%",
            // "Lines: 88.4%" (lcov summaries)
            r"(?i)lines[.\s]*:?\s*([\d.]+)%",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("coverage pattern should compile"))
        .collect()
    })
}

fn any_percent() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([\d.]+)%").expect("should compile"))
}

/// Extract a coverage percentage, trying known formats in order and falling
/// back to the last percentage anywhere in the output.
pub fn parse_coverage_percent(output: &str) -> Option<f64> {
    for pattern in coverage_patterns() {
        if let Some(captures) = pattern.captures(output) {
            if let Some(percent) = captures.get(1) {
                if let Ok(value) = percent.as_str().parse::<f64>() {
                    return Some(value);
                }
            }
        }
    }
    // Fallback: the last percentage in the output.
    any_percent()
        .captures_iter(output)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

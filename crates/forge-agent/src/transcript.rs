//! Transcript ingestion.
//!
//! The parent runtime's transcript is opaque to the core: either a plain
//! text file or a JSON-lines log whose entries carry a `text` or `content`
//! field. The driver only needs the last text the runtime produced, an
//! optional `<promise>` marker, and a token estimate.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

/// What one turn's transcript boils down to.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptDigest {
    /// The last text the runtime produced.
    pub last_text: String,
    /// The `<promise>` marker, if present in the last text.
    pub promise: Option<String>,
    /// `ceil(characters / 4)`.
    pub token_estimate: i64,
}

/// Read a transcript file and digest it.
pub fn ingest(path: &Path) -> Result<TranscriptDigest> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    Ok(digest(&body))
}

/// Digest raw transcript content.
pub fn digest(body: &str) -> TranscriptDigest {
    let last_text = extract_last_text(body);
    let promise = extract_promise(&last_text);
    let token_estimate = estimate_tokens(&last_text);
    TranscriptDigest {
        last_text,
        promise,
        token_estimate,
    }
}

/// The last text entry of a JSON-lines transcript, or the whole body when
/// it is not JSON lines.
fn extract_last_text(body: &str) -> String {
    let mut last: Option<String> = None;
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            // One unparsable line means this is not a JSON-lines log.
            return body.trim().to_owned();
        };
        let text = value
            .get("text")
            .or_else(|| value.get("content"))
            .and_then(|v| v.as_str());
        if let Some(text) = text {
            last = Some(text.to_owned());
        }
    }
    last.unwrap_or_else(|| body.trim().to_owned())
}

fn promise_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<promise>(.*?)</promise>").expect("should compile")
    })
}

/// The content of the last `<promise>...</promise>` marker, trimmed.
pub fn extract_promise(text: &str) -> Option<String> {
    promise_pattern()
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_owned())
}

/// `ceil(characters / 4)`, the crude token estimate the metrics track.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count();
    chars.div_ceil(4) as i64
}

//! Response repair
//!
//! Models asked for "strictly JSON" still wrap it in code fences or prose.
//! [`repair`] tries, in order:
//!
//! 1. strip code-fence markers and parse the whole text,
//! 2. parse each balanced `{...}` span (string-literal aware) and keep the
//!    first that yields a decision,
//! 3. give up with an `unparseable` record carrying the error and raw text.
//!
//! Repair never fails.

use serde_json::Value;

use super::record::DecisionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTier {
    Direct,
    BraceMatched,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Repaired {
    pub record: DecisionRecord,
    pub tier: RepairTier,
}

/// A line holding only a fence and an optional language tag
fn is_fence_line(line: &str) -> bool {
    line.trim()
        .strip_prefix("```")
        .map(|tag| tag.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(false)
}

/// Remove markdown fence lines (```` ```json ````, ```` ``` ````).
pub fn strip_code_fences(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !is_fence_line(line))
        .collect();
    kept.join("\n")
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}

/// Every balanced `{...}` span, ordered by start position (outer before
/// inner). Braces inside JSON string literals are ignored.
pub fn balanced_json_spans(text: &str) -> Vec<&str> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut starts: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            // Quotes only open strings inside an object
            '"' if !starts.is_empty() => in_string = true,
            '{' => starts.push(i),
            '}' => {
                if let Some(start) = starts.pop() {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }

    spans.sort_by_key(|(start, _)| *start);
    spans.into_iter().map(|(s, e)| &text[s..e]).collect()
}

fn parse_record(candidate: &str) -> Result<DecisionRecord, String> {
    let value: Value = serde_json::from_str(candidate).map_err(|e| format!("invalid JSON: {}", e))?;
    DecisionRecord::from_value(&value).map_err(|e| e.to_string())
}

/// Turn raw model output into a decision record.
pub fn repair(raw: &str) -> Repaired {
    let cleaned = strip_code_fences(raw);

    let mut last_error = match parse_record(&cleaned) {
        Ok(record) => {
            return Repaired {
                record,
                tier: RepairTier::Direct,
            }
        }
        Err(e) => e,
    };

    for span in balanced_json_spans(&cleaned) {
        match parse_record(span) {
            Ok(record) => {
                return Repaired {
                    record,
                    tier: RepairTier::BraceMatched,
                }
            }
            Err(e) => last_error = e,
        }
    }

    Repaired {
        record: DecisionRecord::unparseable(last_error, raw),
        tier: RepairTier::Fallback,
    }
}

/// [`repair`] without the tier.
pub fn parse_decision(raw: &str) -> DecisionRecord {
    repair(raw).record
}

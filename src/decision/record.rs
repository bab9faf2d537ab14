//! Decision Record
//!
//! The structured answer to a query. Field names match the JSON keys the
//! model is asked to emit (`Decision`, `Amount`, `Justification`, `Clauses`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Justification attached when retrieval finds nothing.
pub const NO_CONTEXT_JUSTIFICATION: &str =
    "No relevant context was found in the indexed documents for this query.";

/// Justification attached when the model output cannot be repaired.
pub const UNPARSEABLE_JUSTIFICATION: &str =
    "The model response could not be parsed into a decision.";

/// Amount strings meaning "no amount"
const NULL_AMOUNTS: &[&str] = &["", "null", "none", "n/a", "na", "nil", "-"];

/// Currency markers stripped before parsing an amount
const CURRENCY_MARKERS: &[&str] = &[
    "rs.", "rs", "inr", "usd", "eur", "gbp", "₹", "$", "€", "£",
];

#[derive(Error, Debug, PartialEq)]
pub enum RecordError {
    #[error("Expected a JSON object")]
    NotAnObject,
    #[error("Missing required key '{0}'")]
    MissingField(&'static str),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    /// Case-insensitive parse of `approved` / `rejected`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "approved" => Some(Decision::Approved),
            "rejected" => Some(Decision::Rejected),
            _ => None,
        }
    }
}

/// Monetary value: a number when one can be read, otherwise the model's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Number(f64),
    Text(String),
}

impl Amount {
    /// Normalize a raw JSON value. Null-like values become `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(n) => n.as_f64().map(Amount::Number),
            Value::String(s) => Self::from_text(s),
            other => Some(Amount::Text(other.to_string())),
        }
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if NULL_AMOUNTS.contains(&trimmed.to_lowercase().as_str()) {
            return None;
        }
        match parse_money(trimmed) {
            Some(n) => Some(Amount::Number(n)),
            None => Some(Amount::Text(trimmed.to_string())),
        }
    }
}

/// Parse "₹50,000", "Rs. 1,20,000/-", "$ 1,250.50", "50000 INR".
fn parse_money(text: &str) -> Option<f64> {
    let mut s = text.to_lowercase();
    if let Some(stripped) = s.strip_suffix("/-") {
        s = stripped.to_string();
    }
    let mut s = s.trim();
    for marker in CURRENCY_MARKERS {
        if let Some(rest) = s.strip_prefix(marker) {
            s = rest.trim_start();
            break;
        }
    }
    for marker in CURRENCY_MARKERS {
        if let Some(rest) = s.strip_suffix(marker) {
            s = rest.trim_end();
            break;
        }
    }

    let digits: String = s
        .chars()
        .filter(|c| *c != ',' && *c != '_' && !c.is_whitespace())
        .collect();
    if digits.is_empty() || !digits.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<f64>().ok().filter(|n| n.is_finite())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    #[default]
    Decided,
    NoRelevantContext,
    Unparseable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(rename = "Decision")]
    pub decision: Decision,
    #[serde(rename = "Amount", default)]
    pub amount: Option<Amount>,
    #[serde(rename = "Justification")]
    pub justification: String,
    #[serde(rename = "Clauses", default)]
    pub clauses: Vec<String>,
    #[serde(rename = "Status", default)]
    pub status: DecisionStatus,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "Raw", default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl DecisionRecord {
    /// Returned without calling the model when retrieval is empty.
    pub fn no_relevant_context() -> Self {
        Self {
            decision: Decision::Rejected,
            amount: None,
            justification: NO_CONTEXT_JUSTIFICATION.to_string(),
            clauses: Vec::new(),
            status: DecisionStatus::NoRelevantContext,
            error: None,
            raw: None,
        }
    }

    /// Fallback when every repair tier failed.
    pub fn unparseable(error: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            decision: Decision::Rejected,
            amount: None,
            justification: UNPARSEABLE_JUSTIFICATION.to_string(),
            clauses: Vec::new(),
            status: DecisionStatus::Unparseable,
            error: Some(error.into()),
            raw: Some(raw.into()),
        }
    }

    /// Build a decided record from model JSON.
    ///
    /// Keys are matched case-insensitively. `Decision` and `Justification`
    /// are required; `Amount` and `Clauses` default to null and empty.
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        let object = value.as_object().ok_or(RecordError::NotAnObject)?;

        let decision = match field(object, "Decision") {
            Some(Value::String(s)) => Decision::parse(s).ok_or_else(|| RecordError::InvalidField {
                field: "Decision",
                reason: format!("expected 'approved' or 'rejected', got '{}'", s),
            })?,
            Some(other) => {
                return Err(RecordError::InvalidField {
                    field: "Decision",
                    reason: format!("expected a string, got {}", other),
                })
            }
            None => return Err(RecordError::MissingField("Decision")),
        };

        let justification = match field(object, "Justification") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => return Err(RecordError::MissingField("Justification")),
            Some(other) => other.to_string(),
        };

        let amount = field(object, "Amount").and_then(Amount::from_value);

        let clauses = match field(object, "Clauses") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
            _ => Vec::new(),
        };

        Ok(Self {
            decision,
            amount,
            justification,
            clauses,
            status: DecisionStatus::Decided,
            error: None,
            raw: None,
        })
    }
}

fn field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object
        .get(key)
        .or_else(|| object.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v))
}

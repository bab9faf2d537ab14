//! Context Budget
//!
//! Fits retrieved chunks into the prompt's context window. Chunks arrive most
//! relevant first and are taken whole, in order, until the next one would
//! overflow the budget.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tokens::count_tokens;

/// Default token budget for the context block
pub const DEFAULT_MAX_CONTEXT_TOKENS: u32 = 6_000;

/// Separator placed between chunks in the context block
pub const CHUNK_SEPARATOR: &str = "\n\n";

/// Token usage of an assembled context block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBudget {
    pub max_tokens: u32,
    pub used_tokens: u32,
    pub included: usize,
    pub dropped: usize,
}

impl ContextBudget {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            used_tokens: 0,
            included: 0,
            dropped: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_tokens.saturating_sub(self.used_tokens)
    }

    pub fn usage_percent(&self) -> u8 {
        if self.max_tokens == 0 {
            return 100;
        }
        ((self.used_tokens as f64 / self.max_tokens as f64) * 100.0).min(100.0) as u8
    }
}

/// Context block plus the budget it consumed
#[derive(Debug, Clone)]
pub struct BudgetedContext {
    pub text: String,
    pub budget: ContextBudget,
}

/// Join chunks in order, keeping whole chunks within `max_tokens`.
///
/// The most relevant chunk is always kept, even when it alone exceeds the
/// budget, so a non-empty retrieval never yields an empty context.
pub fn fit_chunks(chunks: &[String], max_tokens: u32) -> BudgetedContext {
    let mut budget = ContextBudget::new(max_tokens);
    let separator_tokens = count_tokens(CHUNK_SEPARATOR);
    let mut kept: Vec<&str> = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let cost = count_tokens(chunk) + if kept.is_empty() { 0 } else { separator_tokens };
        if !kept.is_empty() && budget.used_tokens + cost > max_tokens {
            break;
        }
        budget.used_tokens += cost;
        kept.push(chunk);
    }

    budget.included = kept.len();
    budget.dropped = chunks.len() - kept.len();
    if budget.dropped > 0 {
        debug!(
            included = budget.included,
            dropped = budget.dropped,
            used_tokens = budget.used_tokens,
            "Context trimmed to token budget"
        );
    }

    BudgetedContext {
        text: kept.join(CHUNK_SEPARATOR),
        budget,
    }
}

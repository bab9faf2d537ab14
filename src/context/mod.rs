//! Context Management Module
//!
//! Turns retrieved chunks into the prompt sent to the generative model,
//! within a token budget.

pub mod budget;
pub mod prompt;
pub mod tokens;

// Re-export public types for external use
pub use budget::{fit_chunks, BudgetedContext, ContextBudget, DEFAULT_MAX_CONTEXT_TOKENS};
pub use prompt::build_decision_prompt;
pub use tokens::{count_tokens, estimate_tokens_quick};

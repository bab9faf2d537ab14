//! Decision Synthesizer Module
//!
//! Prompt assembly, a single generative-model call, and repair of the
//! model's output into a [`DecisionRecord`].

pub mod model;
pub mod record;
pub mod repair;
pub mod synthesizer;

pub use model::{GenerativeModel, ModelError};
pub use record::{Amount, Decision, DecisionRecord, DecisionStatus, RecordError};
pub use repair::{
    balanced_json_spans, parse_decision, repair, strip_code_fences, RepairTier, Repaired,
};
pub use synthesizer::DecisionSynthesizer;

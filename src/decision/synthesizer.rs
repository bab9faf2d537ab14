//! Decision Synthesizer
//!
//! Retrieved chunks plus a query in, one [`DecisionRecord`] out. The model is
//! called at most once; its output always goes through [`repair`].

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::model::{GenerativeModel, ModelError};
use super::record::DecisionRecord;
use super::repair::{repair, RepairTier};
use crate::context::{build_decision_prompt, fit_chunks, DEFAULT_MAX_CONTEXT_TOKENS};

pub struct DecisionSynthesizer {
    model: Arc<dyn GenerativeModel>,
    max_context_tokens: u32,
}

impl DecisionSynthesizer {
    pub fn new(model: Arc<dyn GenerativeModel>) -> Self {
        Self::with_context_budget(model, DEFAULT_MAX_CONTEXT_TOKENS)
    }

    pub fn with_context_budget(model: Arc<dyn GenerativeModel>, max_context_tokens: u32) -> Self {
        Self {
            model,
            max_context_tokens,
        }
    }

    /// Decide a query against retrieved chunks (most relevant first).
    ///
    /// Empty `chunks` short-circuits to a `no_relevant_context` record
    /// without calling the model. Model failures propagate; malformed
    /// output never does.
    pub async fn decide(
        &self,
        query: &str,
        chunks: &[String],
    ) -> Result<DecisionRecord, ModelError> {
        if chunks.iter().all(|c| c.trim().is_empty()) {
            info!("No retrieved context, skipping model call");
            return Ok(DecisionRecord::no_relevant_context());
        }

        let context = fit_chunks(chunks, self.max_context_tokens);
        let prompt = build_decision_prompt(query, &context.text);
        debug!(
            chunks = context.budget.included,
            context_tokens = context.budget.used_tokens,
            prompt_chars = prompt.len(),
            "Invoking generative model"
        );

        let raw = self.model.generate(&prompt).await?;
        let repaired = repair(&raw);
        match repaired.tier {
            RepairTier::Direct => {}
            RepairTier::BraceMatched => debug!("Recovered decision from surrounding text"),
            RepairTier::Fallback => warn!(
                error = repaired.record.error.as_deref().unwrap_or_default(),
                "Unparseable model output"
            ),
        }
        Ok(repaired.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::record::{Decision, DecisionStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Returns a fixed reply and records every prompt it sees.
    struct ScriptedModel {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(message.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().len()
        }
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
            self.prompts.lock().push(prompt.to_string());
            self.reply.clone().map_err(ModelError::Provider)
        }
    }

    fn chunks(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_context_skips_model() {
        let model = ScriptedModel::replying("{}");
        let synthesizer = DecisionSynthesizer::new(model.clone());

        let record = synthesizer.decide("knee surgery?", &[]).await.unwrap();
        assert_eq!(record.status, DecisionStatus::NoRelevantContext);
        assert_eq!(record.decision, Decision::Rejected);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_call_with_context_in_order() {
        let model = ScriptedModel::replying(
            "```json\n{\"Decision\": \"approved\", \"Amount\": null, \
             \"Justification\": \"Covered.\", \"Clauses\": [\"Clause 4\"]}\n```",
        );
        let synthesizer = DecisionSynthesizer::new(model.clone());

        let record = synthesizer
            .decide(
                "knee surgery?",
                &chunks(&["Clause 4: surgery covered.", "Clause 9: exclusions."]),
            )
            .await
            .unwrap();

        assert_eq!(record.decision, Decision::Approved);
        assert_eq!(model.calls(), 1);
        let prompt = model.prompts.lock()[0].clone();
        let first = prompt.find("Clause 4: surgery covered.").unwrap();
        let second = prompt.find("Clause 9: exclusions.").unwrap();
        assert!(first < second);
        assert!(prompt.contains("Query: knee surgery?"));
    }

    #[tokio::test]
    async fn test_unparseable_output_is_not_an_error() {
        let model = ScriptedModel::replying("The claim looks fine to me.");
        let synthesizer = DecisionSynthesizer::new(model);

        let record = synthesizer.decide("q", &chunks(&["context"])).await.unwrap();
        assert_eq!(record.status, DecisionStatus::Unparseable);
        assert_eq!(record.raw.as_deref(), Some("The claim looks fine to me."));
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let synthesizer = DecisionSynthesizer::new(ScriptedModel::failing("quota exceeded"));
        let err = synthesizer.decide("q", &chunks(&["context"])).await.unwrap_err();
        assert!(matches!(err, ModelError::Provider(ref m) if m == "quota exceeded"));
    }

    #[tokio::test]
    async fn test_context_budget_drops_trailing_chunks() {
        let model = ScriptedModel::replying(r#"{"Decision": "rejected", "Justification": "n/a"}"#);
        let synthesizer = DecisionSynthesizer::with_context_budget(model.clone(), 20);
        let filler = "exclusion ".repeat(100);

        synthesizer
            .decide("q", &chunks(&["most relevant clause", &filler]))
            .await
            .unwrap();
        let prompt = model.prompts.lock()[0].clone();
        assert!(prompt.contains("most relevant clause"));
        assert!(!prompt.contains(&filler));
    }
}

//! Decision prompt assembly.

/// Instruction block preceding the context
const PREAMBLE: &str = "You are an insurance expert. \
    Use ONLY the following context to answer the question. \
    If the context does not support approving the claim, reject it.";

/// Output contract appended after the query
const RESPONSE_FORMAT: &str = r#"Respond strictly in JSON format, with no other text:
{
  "Decision": "approved" or "rejected",
  "Amount": <approved amount or null>,
  "Justification": "<short reason>",
  "Clauses": ["<clause quoted from the context>", "..."]
}"#;

/// Build the prompt for one query. Same inputs, same prompt.
pub fn build_decision_prompt(query: &str, context: &str) -> String {
    format!(
        "{PREAMBLE}\n\nContext:\n{context}\n\nQuery: {query}\n\n{RESPONSE_FORMAT}\n",
        context = context.trim(),
        query = query.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_is_deterministic() {
        let a = build_decision_prompt("knee surgery?", "Clause 4: surgery covered.");
        let b = build_decision_prompt("knee surgery?", "Clause 4: surgery covered.");
        assert_eq!(a, b);
    }

    #[test]
    fn test_prompt_layout() {
        let prompt =
            build_decision_prompt("  46M, knee surgery, Pune  ", "Clause 4: surgery covered.");
        let context_at = prompt.find("Context:\nClause 4: surgery covered.").unwrap();
        let query_at = prompt.find("Query: 46M, knee surgery, Pune\n").unwrap();
        let format_at = prompt.find("\"Decision\"").unwrap();
        assert!(prompt.starts_with("You are an insurance expert."));
        assert!(context_at < query_at && query_at < format_at);
    }
}

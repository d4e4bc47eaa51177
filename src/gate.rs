//! Relevance gate between retrieval and generation.
//!
//! Before the retrieved context is handed to answer generation, a cheap
//! LLM call rates how relevant the context is to the question on a 1-5
//! scale, returned as strict JSON. Low ratings (and replies that fail to
//! parse) deflect the question with a fixed guidance message instead of
//! generating an answer from irrelevant context. Single shot, no retries.

use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;

use crate::llm::ChatModel;
use crate::models::Message;

/// Ratings at or above this proceed to generation.
const MIN_RATING: u8 = 2;
const MAX_RATING: u8 = 5;

/// Returned to the user when the gate deflects.
pub const DEFLECTION_MESSAGE: &str = "I could not find information relevant to your question \
in the uploaded documents. Check the file list to see whether the collection covers the topic, \
and either upload the missing material or rephrase the question.";

const GATE_SYSTEM_PROMPT: &str = "You judge whether a context passage is relevant to a question. \
Rate the relevance on a scale from 1 (completely irrelevant) to 5 (directly answers the question). \
Reply with strict JSON only, no prose: {\"rating\": <1-5>, \"remarks\": \"<one sentence>\"}";

/// The model's parsed verdict.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Judgment {
    pub rating: Option<u8>,
    #[serde(default)]
    pub remarks: Option<String>,
}

/// The gate's decision on a retrieved context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Context is relevant enough; generate an answer.
    Proceed,
    /// Context is irrelevant or the judgment could not be read; answer
    /// with [`DEFLECTION_MESSAGE`].
    Deflect,
}

pub struct RelevanceGate {
    model: Arc<dyn ChatModel>,
}

impl RelevanceGate {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub async fn assess(&self, question: &str, context: &str) -> Result<GateDecision> {
        let messages = vec![
            Message::system(GATE_SYSTEM_PROMPT),
            Message::user(format!(
                "Question:\n{}\n\nContext:\n{}",
                question, context
            )),
        ];

        let reply = self.model.complete(&messages).await?;
        let judgment = parse_judgment(&reply);
        let decision = decide(&judgment);
        tracing::debug!(rating = ?judgment.rating, ?decision, "relevance gate");
        Ok(decision)
    }
}

/// Map a judgment to a decision. Missing or out-of-range ratings deflect.
pub fn decide(judgment: &Judgment) -> GateDecision {
    match judgment.rating {
        Some(rating) if (MIN_RATING..=MAX_RATING).contains(&rating) => GateDecision::Proceed,
        _ => GateDecision::Deflect,
    }
}

/// Parse the model reply into a judgment, tolerating markdown code
/// fences. Anything unparseable becomes an empty judgment (no rating).
pub fn parse_judgment(reply: &str) -> Judgment {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed).unwrap_or_default()
}

use std::sync::Arc;

use tracing::debug;

use crag_core::config::ModelConfig;
use crag_core::error::Result;
use crag_core::traits::LlmClient;
use crag_core::types::{ChatMessage, Passage};

use crate::judge::join_passages;

const SYSTEM_PROMPT: &str = "You are an assistant for question-answering tasks. \
Use the following pieces of retrieved context to answer the question. \
If you don't know the answer, just say that you don't know. \
Keep the answer concise.";

/// Writes an answer from the question and the current evidence.
pub struct AnswerGenerator {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl AnswerGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self { llm, config }
    }

    /// One model call, no retry. Errors are returned to the engine as-is.
    pub async fn generate(&self, question: &str, evidence: &[Passage]) -> Result<String> {
        let context = join_passages(evidence);
        debug!(passages = evidence.len(), context_chars = context.len(), "Generating answer");

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Question: {}\n\nContext:\n{}\n\nAnswer:",
                question, context
            )),
        ];
        let answer = crag_llm::complete(self.llm.as_ref(), &self.config, messages).await?;
        Ok(answer.trim().to_string())
    }
}

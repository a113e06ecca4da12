//! LLM provider implementations.
//!
//! - **[`DisabledLlm`]**: fails every call.
//! - **[`OpenAIChat`]**: OpenAI chat completions.
//! - **[`ExtractiveLlm`]**: local; answers with the context sentences that
//!   share the most words with the question.
//!
//! Like the embedding providers, each call is a single attempt and the
//! query engine applies the retry policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rag_lifecycle_core::error::ProviderError;
use rag_lifecycle_core::llm::LlmProvider;

use crate::config::LlmConfig;
use crate::embedding::read_json_response;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const EXTRACTIVE_MAX_SENTENCES: usize = 3;

pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

/// Chat-completions client. Requires `OPENAI_API_KEY`.
pub struct OpenAIChat {
    model: String,
    max_tokens: u32,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            max_tokens: config.max_tokens,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .client
            .post(OPENAI_CHAT_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let json = read_json_response("OpenAI chat", response).await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| ProviderError::Fatal("Invalid OpenAI response: missing content".into()))
    }
}

/// Offline answerer for prompts built by
/// [`build_prompt`](rag_lifecycle_core::llm::build_prompt).
pub struct ExtractiveLlm;

impl ExtractiveLlm {
    /// Split a prompt back into its question and numbered passages.
    fn parse_prompt(prompt: &str) -> (String, Vec<String>) {
        let mut question = String::new();
        let mut passages = Vec::new();
        for line in prompt.lines() {
            if let Some(q) = line.strip_prefix("Question: ") {
                question = q.to_string();
            } else if let Some(rest) = line.strip_prefix('[') {
                if let Some((num, text)) = rest.split_once("] ") {
                    if num.chars().all(|c| c.is_ascii_digit()) {
                        passages.push(text.to_string());
                    }
                }
            }
        }
        (question, passages)
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl LlmProvider for ExtractiveLlm {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let (question, passages) = Self::parse_prompt(prompt);
        let q_words = words(&question);

        let mut scored: Vec<(usize, usize, String)> = Vec::new();
        for (p, passage) in passages.iter().enumerate() {
            for sentence in passage.split_inclusive(|c: char| matches!(c, '.' | '!' | '?')) {
                let sentence = sentence.trim();
                if sentence.is_empty() {
                    continue;
                }
                let overlap = words(sentence).intersection(&q_words).count();
                if overlap > 0 {
                    scored.push((overlap, p, format!("{} [{}]", sentence, p + 1)));
                }
            }
        }
        if scored.is_empty() {
            return Ok("The provided context does not answer the question.".to_string());
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let answer: Vec<String> = scored
            .into_iter()
            .take(EXTRACTIVE_MAX_SENTENCES)
            .map(|(_, _, s)| s)
            .collect();
        Ok(answer.join(" "))
    }
}

/// Create an LLM provider from configuration.
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "extractive" => Ok(Arc::new(ExtractiveLlm)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

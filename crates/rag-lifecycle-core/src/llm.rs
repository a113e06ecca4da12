//! LLM provider trait and prompt assembly.

use async_trait::async_trait;

use crate::error::ProviderError;

/// Trait for text-completion providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the model identifier.
    fn model_name(&self) -> &str;
    /// Complete a prompt.
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Build the retrieval-augmented prompt sent to the LLM.
///
/// Context passages are numbered from 1 in retrieval order so answers
/// can cite them as `[n]`.
pub fn build_prompt(question: &str, passages: &[&str]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the context below. \
         Cite passages by their number.\n\nContext:\n",
    );
    for (i, passage) in passages.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n", i + 1, passage.trim()));
    }
    prompt.push_str(&format!("\nQuestion: {}\nAnswer:", question.trim()));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt_numbers_passages() {
        let prompt = build_prompt("What is it?", &["first passage", "  second  "]);
        assert!(prompt.contains("[1] first passage\n"));
        assert!(prompt.contains("[2] second\n"));
        assert!(prompt.ends_with("Question: What is it?\nAnswer:"));
    }

    #[test]
    fn test_build_prompt_without_context() {
        let prompt = build_prompt("Why?", &[]);
        assert!(prompt.contains("Context:\n\nQuestion: Why?"));
    }
}

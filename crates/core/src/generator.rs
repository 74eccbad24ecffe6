use crate::chunking::{SentenceSplitter, UnicodeSentenceSplitter};
use crate::traits::AnswerGenerator;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const UNKNOWN_ANSWER: &str = "I don't know based on the provided materials.";

const NON_ANSWERS: [&str; 3] = ["i don't know", "no", "yes"];
const STOPWORDS: [&str; 14] = [
    "the", "and", "for", "are", "was", "what", "when", "where", "which", "who", "how", "does",
    "with", "from",
];

/// Maps empty or evasive model output to [`UNKNOWN_ANSWER`].
pub fn normalize_answer(raw: &str) -> String {
    let answer = raw.trim();
    let folded = answer
        .trim_end_matches(|ch: char| ch == '.' || ch == '!')
        .to_lowercase();
    if answer.is_empty() || NON_ANSWERS.contains(&folded.as_str()) {
        UNKNOWN_ANSWER.to_string()
    } else {
        answer.to_string()
    }
}

fn question_terms(question: &str) -> HashSet<String> {
    question
        .split_whitespace()
        .map(|token| {
            token
                .trim_matches(|ch: char| !ch.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| token.chars().count() > 2 && !STOPWORDS.contains(&token.as_str()))
        .collect()
}

// Context blocks end in "(Source: file, page N)", which the sentence splitter
// glues onto the start of the next block.
fn strip_source_tag(sentence: &str) -> Option<&str> {
    let text = match sentence.strip_prefix("(Source:") {
        Some(rest) => rest.split_once(')').map(|(_, tail)| tail.trim())?,
        None => sentence,
    };
    (!text.is_empty()).then_some(text)
}

/// Offline generator that answers with the context sentences sharing the
/// most terms with the question.
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveGenerator {
    pub max_sentences: usize,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self { max_sentences: 3 }
    }
}

#[async_trait]
impl AnswerGenerator for ExtractiveGenerator {
    async fn generate(&self, question: &str, context: &str) -> Result<String, SearchError> {
        if context.trim().is_empty() {
            warn!("no context provided to generator");
            return Ok(UNKNOWN_ANSWER.to_string());
        }

        let terms = question_terms(question);
        // Overlapping chunks repeat sentences; keep the first occurrence.
        let mut seen = HashSet::new();
        let sentences = UnicodeSentenceSplitter
            .split_sentences(context)
            .into_iter()
            .filter_map(|sentence| strip_source_tag(&sentence).map(str::to_string))
            .filter(|sentence| seen.insert(sentence.clone()))
            .collect::<Vec<_>>();

        let mut scored = sentences
            .iter()
            .enumerate()
            .filter_map(|(position, sentence)| {
                let words = question_terms(sentence);
                let overlap = terms.intersection(&words).count();
                (overlap > 0).then_some((position, overlap))
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.1.cmp(&left.1));
        scored.truncate(self.max_sentences.max(1));
        scored.sort_by_key(|(position, _)| *position);

        if scored.is_empty() {
            debug!(question, "no context sentence overlaps the question");
            return Ok(UNKNOWN_ANSWER.to_string());
        }

        Ok(scored
            .iter()
            .map(|(position, _)| sentences[*position].as_str())
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Client for any OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct ChatCompletionsGenerator {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    max_tokens: usize,
    temperature: f32,
}

impl ChatCompletionsGenerator {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, SearchError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            endpoint: chat_endpoint(base_url)?,
            model: model.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            max_tokens: 256,
            temperature: 0.0,
        })
    }
}

fn chat_endpoint(base_url: &str) -> Result<Url, SearchError> {
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?.join("v1/chat/completions")?)
}

#[async_trait]
impl AnswerGenerator for ChatCompletionsGenerator {
    async fn generate(&self, question: &str, context: &str) -> Result<String, SearchError> {
        if context.trim().is_empty() {
            warn!("no context provided to generator");
            return Ok(UNKNOWN_ANSWER.to_string());
        }

        let prompt = format!(
            "Context:\n{context}\n\nQuestion: {question}\n\nAnswer using only the context above. \
             If the context does not contain the answer, reply exactly: I don't know."
        );
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You answer questions about uploaded documents strictly from the provided context.",
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.trim());
        }

        info!(model = %self.model, context_chars = context.len(), "requesting answer");
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let details = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(SearchError::BackendResponse {
                backend: "chat-completions".to_string(),
                details: format!("{status}: {details}"),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let answer = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(normalize_answer(&answer))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evasive_answers_become_the_sentinel() {
        assert_eq!(normalize_answer("  "), UNKNOWN_ANSWER);
        assert_eq!(normalize_answer("I don't know."), UNKNOWN_ANSWER);
        assert_eq!(normalize_answer("Yes"), UNKNOWN_ANSWER);
        assert_eq!(normalize_answer(" March 1. "), "March 1.");
    }

    #[test]
    fn endpoint_is_joined_under_the_base_path() -> Result<(), SearchError> {
        assert_eq!(
            chat_endpoint("http://localhost:11434")?.as_str(),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://gateway.example.com/openai/")?.as_str(),
            "https://gateway.example.com/openai/v1/chat/completions"
        );
        assert!(chat_endpoint("not a url").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn empty_context_short_circuits_without_a_request() -> Result<(), SearchError> {
        // Nothing listens on port 9; a request would fail.
        let generator = ChatCompletionsGenerator::new("http://127.0.0.1:9", "any-model", None)?;
        assert_eq!(generator.generate("Anything?", "  ").await?, UNKNOWN_ANSWER);
        Ok(())
    }

    #[tokio::test]
    async fn extractive_answer_uses_overlapping_sentences() -> Result<(), SearchError> {
        let context = "Invoice #100. Payment due March 1. (Source: statement.pdf, page 1)\n\n\
                       Total: $500. (Source: statement.pdf, page 2)";

        let answer = ExtractiveGenerator::default()
            .generate("When is the payment due?", context)
            .await?;

        assert_eq!(answer, "Payment due March 1.");
        Ok(())
    }

    #[tokio::test]
    async fn extractive_without_overlap_or_context_is_unknown() -> Result<(), SearchError> {
        let generator = ExtractiveGenerator::default();
        assert_eq!(generator.generate("Who won?", "").await?, UNKNOWN_ANSWER);
        assert_eq!(
            generator.generate("Who won the match?", "Invoice #100.").await?,
            UNKNOWN_ANSWER
        );
        Ok(())
    }
}

//! Summarization collaborators
//!
//! The engine hands a block of messages, oldest first, to a [`Summarizer`] and
//! gets back the summary text plus knowledge candidates.
use crate::config::MemoryConfig;
use crate::memory_db::{Message, Role};
use crate::utils::{TextUtils, TopicExtractor};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

lazy_static! {
    static ref FACT_LINE_REGEX: Regex =
        Regex::new(r"(?im)^\s*(fact|note|decision|remember)\s*[:\-]\s*(.+?)\s*$").unwrap();
}

/// A knowledge entry proposed by a summarizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedKnowledge {
    pub category: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryDraft {
    pub text: String,
    pub knowledge: Vec<ExtractedKnowledge>,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarizes `messages`, given in conversation order.
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<SummaryDraft>;

    fn name(&self) -> &'static str;
}

/// Picks the summarizer matching the configuration.
pub fn from_config(config: &MemoryConfig) -> Arc<dyn Summarizer> {
    match &config.summarizer_backend_url {
        Some(url) => Arc::new(LlmSummarizer::new(url.clone(), config.summarizer_timeout())),
        None => Arc::new(ExtractiveSummarizer::default()),
    }
}

/// Offline summarizer built from keywords and leading sentences. Lines of the
/// form `fact: ...`, `note: ...`, `decision: ...` or `remember: ...` become
/// knowledge candidates.
pub struct ExtractiveSummarizer {
    max_summary_bytes: usize,
    max_lines: usize,
    topics: TopicExtractor,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_summary_bytes: 2_048,
            max_lines: 8,
            topics: TopicExtractor::new(6, 4),
        }
    }
}

impl ExtractiveSummarizer {
    pub fn new(max_summary_bytes: usize, max_lines: usize) -> Self {
        Self {
            max_summary_bytes,
            max_lines,
            ..Self::default()
        }
    }

    fn extract_knowledge(&self, messages: &[Message]) -> Vec<ExtractedKnowledge> {
        let mut seen = HashSet::new();
        let mut extracted = Vec::new();
        for message in messages {
            for caps in FACT_LINE_REGEX.captures_iter(&message.content) {
                let kind = caps[1].to_lowercase();
                let content = caps[2].to_string();
                let title = TextUtils::truncate_with_ellipsis(TextUtils::first_sentence(&content), 120).into_owned();
                if !seen.insert(TextUtils::normalize_phrase(&title)) {
                    continue;
                }
                let tags = self.topics.keywords([content.as_str()]).into_iter().take(3).collect();
                extracted.push(ExtractedKnowledge {
                    category: match kind.as_str() {
                        "decision" => "decisions".to_string(),
                        "note" => "notes".to_string(),
                        _ => "facts".to_string(),
                    },
                    title,
                    content,
                    tags,
                });
            }
        }
        extracted
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<SummaryDraft> {
        if messages.is_empty() {
            anyhow::bail!("nothing to summarize");
        }

        let keywords = self.topics.keywords(messages.iter().map(|m| m.content.as_str()));
        let mut text = format!("{} messages", messages.len());
        if !keywords.is_empty() {
            text.push_str(&format!(" about {}", keywords.join(", ")));
        }
        text.push('.');

        // Spread the sampled lines evenly across the block.
        let step = (messages.len() as f64 / self.max_lines.max(1) as f64).max(1.0);
        let mut index = 0.0f64;
        while (index as usize) < messages.len() {
            let message = &messages[index as usize];
            let sentence = TextUtils::normalize_whitespace(TextUtils::first_sentence(&message.content)).into_owned();
            if !sentence.is_empty() {
                text.push_str(&format!("\n{}: {}", message.role, sentence));
            }
            index += step;
        }

        let text = TextUtils::truncate_with_ellipsis(&text, self.max_summary_bytes).into_owned();
        let knowledge = self.extract_knowledge(messages);
        debug!(
            "Extractive summary of {} messages: {} bytes, {} facts",
            messages.len(),
            text.len(),
            knowledge.len()
        );
        Ok(SummaryDraft { text, knowledge })
    }

    fn name(&self) -> &'static str {
        "extractive"
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct SummaryReply {
    summary: String,
    #[serde(default)]
    facts: Vec<FactReply>,
}

#[derive(Debug, Deserialize)]
struct FactReply {
    #[serde(default = "default_fact_category")]
    category: String,
    title: String,
    content: String,
    #[serde(default)]
    tags: BTreeSet<String>,
}

fn default_fact_category() -> String {
    "facts".to_string()
}

const SUMMARY_PROMPT: &str = "Summarize the conversation excerpt below for long-term memory. \
Reply with JSON only, shaped as {\"summary\": string, \"facts\": [{\"category\": string, \
\"title\": string, \"content\": string, \"tags\": [string]}]}. Facts must be durable, \
self-contained statements worth remembering beyond this conversation.";

/// Summarizer backed by an OpenAI-compatible chat completion endpoint.
pub struct LlmSummarizer {
    backend_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl LlmSummarizer {
    pub fn new(backend_url: String, timeout: Duration) -> Self {
        info!("LLM summarizer initialized with backend: {}", backend_url);
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            model: "local-llm".to_string(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn transcript(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| format!("[{}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<SummaryDraft> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: Role::System.as_str().to_string(),
                    content: SUMMARY_PROMPT.to_string(),
                },
                ChatMessage {
                    role: Role::User.as_str().to_string(),
                    content: Self::transcript(messages),
                },
            ],
            max_tokens: 1024,
            temperature: 0.2,
            stream: false,
        };
        let response = self
            .http_client
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Summarizer request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Summarizer backend returned {}: {}", status, body));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse summarizer response: {}", e))?;
        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            anyhow::bail!("Summarizer returned an empty reply");
        }
        Ok(parse_reply(&content))
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

/// Reads the JSON reply, tolerating surrounding prose or code fences. A reply
/// that is not JSON becomes the summary text with no facts.
fn parse_reply(content: &str) -> SummaryDraft {
    let json = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => content,
    };
    match serde_json::from_str::<SummaryReply>(json) {
        Ok(reply) => SummaryDraft {
            text: reply.summary.trim().to_string(),
            knowledge: reply
                .facts
                .into_iter()
                .filter(|f| !f.title.trim().is_empty() && !f.content.trim().is_empty())
                .map(|f| ExtractedKnowledge {
                    category: f.category,
                    title: f.title,
                    content: f.content,
                    tags: f.tags,
                })
                .collect(),
        },
        Err(e) => {
            warn!("Summarizer reply is not the expected JSON ({}); using it verbatim", e);
            SummaryDraft {
                text: content.to_string(),
                knowledge: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{now, Metadata};

    fn message(id: i64, role: Role, content: &str) -> Message {
        Message {
            id,
            conversation_id: "c".into(),
            role,
            content: content.into(),
            metadata: Metadata::new(),
            summarized: false,
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn test_extractive_summary_mentions_keywords_and_facts() {
        let summarizer = ExtractiveSummarizer::default();
        let messages = vec![
            message(1, Role::User, "The invoice service keeps timing out. Can you look?"),
            message(2, Role::Agent, "The invoice service pool is too small.\nfact: The invoice service uses a pool of 4 connections"),
            message(3, Role::User, "decision: Raise the invoice pool to 16"),
        ];
        let draft = summarizer.summarize(&messages).await.unwrap();
        assert!(draft.text.starts_with("3 messages about invoice"));
        assert!(draft.text.contains("user: The invoice service keeps timing out."));
        assert_eq!(draft.knowledge.len(), 2);
        assert_eq!(draft.knowledge[0].category, "facts");
        assert_eq!(draft.knowledge[1].category, "decisions");
        assert!(draft.knowledge[1].tags.contains("invoice"));
    }

    #[tokio::test]
    async fn test_extractive_summary_is_bounded() {
        let summarizer = ExtractiveSummarizer::new(200, 4);
        let messages: Vec<Message> = (0..50)
            .map(|i| message(i, Role::User, &"lorem ipsum dolor sit amet ".repeat(20)))
            .collect();
        let draft = summarizer.summarize(&messages).await.unwrap();
        assert!(draft.text.len() <= 200);
    }

    #[tokio::test]
    async fn test_empty_block_fails() {
        assert!(ExtractiveSummarizer::default().summarize(&[]).await.is_err());
    }

    #[test]
    fn test_parse_reply_with_fences() {
        let draft = parse_reply(
            "```json\n{\"summary\": \"Discussed pools.\", \"facts\": [{\"title\": \"Pool size\", \"content\": \"16\"}]}\n```",
        );
        assert_eq!(draft.text, "Discussed pools.");
        assert_eq!(draft.knowledge.len(), 1);
        assert_eq!(draft.knowledge[0].category, "facts");
    }

    #[tokio::test]
    async fn test_llm_summarizer_reads_completion() {
        let mut server = mockito::Server::new_async().await;
        let reply = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "{\"summary\": \"Pool resized.\", \"facts\": [{\"category\": \"decisions\", \"title\": \"Invoice pool\", \"content\": \"16 connections\"}]}"
                }
            }]
        });
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(reply.to_string())
            .create_async()
            .await;

        let summarizer = LlmSummarizer::new(format!("{}/", server.url()), Duration::from_secs(5));
        let draft = summarizer
            .summarize(&[message(1, Role::User, "decision: Raise the invoice pool to 16")])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(draft.text, "Pool resized.");
        assert_eq!(draft.knowledge[0].category, "decisions");
    }

    #[tokio::test]
    async fn test_llm_summarizer_backend_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let summarizer = LlmSummarizer::new(server.url(), Duration::from_secs(5));
        let err = summarizer
            .summarize(&[message(1, Role::User, "hello")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_parse_reply_plain_text_fallback() {
        let draft = parse_reply("Just a plain summary.");
        assert_eq!(draft.text, "Just a plain summary.");
        assert!(draft.knowledge.is_empty());
    }
}

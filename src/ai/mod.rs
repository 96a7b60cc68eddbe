//! Chat completion backend used by the AI rewriting stage.
//!
//! The pipeline only needs `complete(prompt) -> text`; [`OpenAiBackend`]
//! talks to any OpenAI-compatible `/chat/completions` endpoint.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::AiConfig;

/// System prompt sent with every request
pub const SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant that processes course transcriptions.";

/// Single-prompt text completion
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiBackend {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let api_key = config
            .api_key()
            .with_context(|| format!("{} not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl AiBackend for OpenAiBackend {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
        });

        tracing::debug!("POST {}", self.endpoint);

        // One request per call; the conversation resubmits failed parts
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("Chat API returned invalid JSON")?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content` from a chat completion response
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))?;

    if let Some(reason) = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
    {
        if reason == "length" {
            tracing::warn!("Chat response was cut off by max_tokens");
        }
    }

    Ok(content.to_string())
}

/// Tidy assembled model output for Markdown consumers: drop a code fence
/// wrapping the whole document and demote level-1 headings.
pub fn clean_output(text: &str) -> String {
    let trimmed = text.trim();

    let unfenced = match (trimmed.strip_prefix("```"), trimmed.ends_with("```")) {
        (Some(rest), true) if trimmed.len() >= 6 => {
            let inner = &rest[..rest.len() - 3];
            // Drop a language tag on the opening fence
            match inner.split_once('\n') {
                Some((tag, body)) if !tag.contains(' ') => body,
                _ => inner,
            }
        }
        _ => trimmed,
    };

    let mut out = unfenced
        .trim()
        .lines()
        .map(|line| match line.strip_prefix("# ") {
            Some(heading) => format!("## {}", heading),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationSession, ConversationSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hello" }, "finish_reason": "stop" }]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "Hello");

        let bad = serde_json::json!({ "choices": [] });
        assert!(parse_chat_response(&bad).is_err());
    }

    #[test]
    fn test_clean_output_strips_whole_fence() {
        let text = "```markdown\n# Title\n\nBody\n```";
        assert_eq!(clean_output(text), "## Title\n\nBody\n");
    }

    #[test]
    fn test_clean_output_keeps_inner_code_blocks() {
        let text = "## Intro\n\n```rust\nfn main() {}\n```\n\nDone.";
        assert_eq!(clean_output(text), format!("{}\n", text));
    }

    #[test]
    fn test_clean_output_demotes_only_level_one() {
        let text = "# A\n## B\n### C";
        assert_eq!(clean_output(text), "## A\n## B\n### C\n");
    }

    /// Local endpoint that answers every request with `503`
    async fn unavailable_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request_complete(&request) {
                        break;
                    }
                }
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    /// Headers received and the body as long as `content-length` says
    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    #[tokio::test]
    async fn test_failed_part_is_sent_once_per_retry() {
        let (base_url, hits) = unavailable_server().await;
        std::env::set_var("PODCASTER_TEST_HTTP_KEY", "test-key");
        let config = AiConfig {
            base_url,
            api_key_env: "PODCASTER_TEST_HTTP_KEY".to_string(),
            request_retries: 1,
            retry_backoff_ms: 0,
            timeout_secs: 5,
            ..AiConfig::default()
        };
        let backend = OpenAiBackend::new(&config).unwrap();

        let mut session = ConversationSession::new(
            "A short lesson.",
            config.chunk_max_chars(),
            ConversationSettings::from_config(&config, "Rewrite this.".to_string()),
        );
        let err = session
            .run(&backend, config.request_retries, config.retry_backoff_ms)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("503"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backend_requires_api_key() {
        let config = AiConfig {
            api_key_env: "PODCASTER_TEST_UNSET_KEY".to_string(),
            ..AiConfig::default()
        };
        assert!(OpenAiBackend::new(&config).is_err());
    }
}

//! Multi-part AI conversations over text larger than one request.
//!
//! A [`ConversationSession`] sends the chunks of a source document one at a
//! time. The first prompt carries the instructions and explains the
//! continuation marker; every later prompt repeats the tail of the previous
//! reply so the backend keeps writing one coherent document. A reply that
//! ends with the marker says "more input expected". The marker is only
//! honoured at the very end of a reply and is never part of the assembled
//! output.

pub mod chunk;

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::ai::AiBackend;
use crate::config::AiConfig;
use crate::utils::tail_chars;

pub use chunk::{split_by_tokens, split_text, CHARS_PER_TOKEN};

/// Instructions used when no prompt file is configured
pub const DEFAULT_INSTRUCTIONS: &str = "Rewrite the following course lesson transcription as a \
clear, well structured Markdown article in the same language as the transcription. Keep every \
technical detail, remove filler words and repetitions, and use headings for the main topics.";

/// Replace `{{NAME}}` placeholders of a prompt template. Unknown
/// placeholders are kept as written.
pub fn fill_template(template: &str, variables: &[(&str, &str)]) -> String {
    variables
        .iter()
        .fold(template.to_string(), |text, (name, value)| {
            text.replace(&format!("{{{{{}}}}}", name), value)
        })
}

/// Knobs of the continuation protocol
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub instructions: String,
    pub marker: String,
    pub context_chars: usize,
}

impl ConversationSettings {
    pub fn from_config(config: &AiConfig, instructions: String) -> Self {
        Self {
            instructions,
            marker: config.continuation_marker.clone(),
            context_chars: config.context_chars,
        }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            marker: "[CONTINUA]".to_string(),
            context_chars: 500,
        }
    }
}

/// One request/response pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub sent: String,
    pub received: String,
}

#[derive(Debug)]
pub struct ConversationSession {
    chunks: Vec<String>,
    cursor: usize,
    transcript: Vec<Exchange>,
    continuation_pending: bool,
    settings: ConversationSettings,
}

impl ConversationSession {
    /// Split `text` into chunks of at most `max_chars` characters
    pub fn new(text: &str, max_chars: usize, settings: ConversationSettings) -> Self {
        Self::from_chunks(split_text(text, max_chars), settings)
    }

    pub fn from_chunks(chunks: Vec<String>, settings: ConversationSettings) -> Self {
        Self {
            chunks,
            cursor: 0,
            transcript: Vec::new(),
            continuation_pending: false,
            settings,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Index of the next unsent chunk
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn transcript(&self) -> &[Exchange] {
        &self.transcript
    }

    pub fn continuation_pending(&self) -> bool {
        self.continuation_pending
    }

    pub fn is_complete(&self) -> bool {
        self.cursor == self.chunks.len() && !self.continuation_pending
    }

    /// Prompt for the chunk under the cursor
    pub fn build_prompt(&self) -> Option<String> {
        let chunk = self.chunks.get(self.cursor)?;
        let total = self.chunks.len();
        let part = self.cursor + 1;
        let marker = &self.settings.marker;

        let mut prompt = String::new();
        match self.transcript.last() {
            None => {
                prompt.push_str(self.settings.instructions.trim());
                prompt.push_str("\n\n");
                if total > 1 {
                    prompt.push_str(&format!(
                        "The source is sent in {total} parts. Process each part as it arrives. \
                         While more parts are expected, end your reply with {marker} and nothing after it. \
                         Never write {marker} anywhere else.\n\n"
                    ));
                }
            }
            Some(previous) => {
                let stripped = strip_marker(&previous.received, marker);
                let context = tail_chars(stripped.trim_end(), self.settings.context_chars);
                prompt.push_str(
                    "Continue the same document from where your previous reply stopped. \
                     Do not repeat what you already wrote.\n\n",
                );
                prompt.push_str("Your previous reply ended with:\n<previous>\n");
                prompt.push_str(context);
                prompt.push_str("\n</previous>\n\n");
                if part < total {
                    prompt.push_str(&format!(
                        "More parts follow; end your reply with {marker}.\n\n"
                    ));
                } else {
                    prompt.push_str("This is the last part; do not end with the marker.\n\n");
                }
            }
        }

        prompt.push_str(&format!("Part {part}/{total}\n<source>\n{chunk}\n</source>\n"));
        Some(prompt)
    }

    /// Send the chunk under the cursor. On failure the session is unchanged
    /// and the same chunk is sent again by the next call.
    pub async fn submit_next(&mut self, backend: &dyn AiBackend) -> Result<()> {
        let Some(prompt) = self.build_prompt() else {
            // Marker on the final reply: nothing left to send
            self.continuation_pending = false;
            return Ok(());
        };

        tracing::debug!(
            "Sending part {}/{} ({} chars)",
            self.cursor + 1,
            self.chunks.len(),
            prompt.len()
        );
        let received = backend.complete(&prompt).await?;

        let wants_more = ends_with_marker(&received, &self.settings.marker);
        self.transcript.push(Exchange {
            sent: prompt,
            received,
        });
        self.cursor += 1;

        let remaining = self.chunks.len() - self.cursor;
        match (wants_more, remaining) {
            (true, 0) => {
                tracing::warn!(
                    "Backend asked to continue after the last of {} part(s); treating the conversation as complete",
                    self.chunks.len()
                );
                self.continuation_pending = false;
            }
            (true, _) => self.continuation_pending = true,
            (false, 0) => self.continuation_pending = false,
            (false, _) => {
                tracing::debug!(
                    "Reply to part {} had no continuation marker, {} part(s) still to send",
                    self.cursor,
                    remaining
                );
                self.continuation_pending = false;
            }
        }

        Ok(())
    }

    /// Drive the session to completion, resubmitting a failed chunk up to
    /// `retries` times with exponential backoff.
    pub async fn run(
        &mut self,
        backend: &dyn AiBackend,
        retries: u32,
        backoff_ms: u64,
    ) -> Result<()> {
        while !self.is_complete() {
            let mut attempt = 0;
            loop {
                match self.submit_next(backend).await {
                    Ok(()) => break,
                    Err(e) if attempt < retries => {
                        attempt += 1;
                        let delay = backoff_ms.saturating_mul(1 << (attempt - 1).min(10));
                        tracing::warn!(
                            "Part {}/{} failed (attempt {}/{}): {:#}",
                            self.cursor + 1,
                            self.chunks.len(),
                            attempt,
                            retries + 1,
                            e
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Part {}/{} failed", self.cursor + 1, self.chunks.len())
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// Concatenate the replies in order with every marker removed
    pub fn assemble(&self) -> Result<String> {
        if !self.is_complete() {
            bail!(
                "Conversation incomplete: {}/{} part(s) answered",
                self.cursor,
                self.chunks.len()
            );
        }

        Ok(self
            .transcript
            .iter()
            .map(|exchange| strip_marker(&exchange.received, &self.settings.marker))
            .collect())
    }
}

/// Whether the reply ends with the marker, ignoring trailing whitespace
pub fn ends_with_marker(reply: &str, marker: &str) -> bool {
    !marker.is_empty() && reply.trim_end().ends_with(marker)
}

/// Reply text with every copy of the marker removed. Only a trailing
/// marker signals continuation, but none reaches the assembled output.
pub fn strip_marker(reply: &str, marker: &str) -> String {
    if marker.is_empty() {
        return reply.to_string();
    }
    let body = if ends_with_marker(reply, marker) {
        let trimmed = reply.trim_end();
        &trimmed[..trimmed.len() - marker.len()]
    } else {
        reply
    };
    body.replace(marker, "")
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::TtsConfig;
use crate::utils::split_front_matter;

/// Voice selection passed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceOptions {
    pub voice: String,
    pub rate: String,
    pub volume: String,
    pub pitch: String,
}

impl From<&TtsConfig> for VoiceOptions {
    fn from(config: &TtsConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            rate: config.rate.clone(),
            volume: config.volume.clone(),
            pitch: config.pitch.clone(),
        }
    }
}

/// Text to speech
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceOptions, output: &Path) -> Result<PathBuf>;
}

/// Narration through the `edge-tts` command line tool
pub struct EdgeTts {
    command: String,
}

impl EdgeTts {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TtsEngine for EdgeTts {
    async fn synthesize(&self, text: &str, voice: &VoiceOptions, output: &Path) -> Result<PathBuf> {
        if text.trim().is_empty() {
            anyhow::bail!("Nothing to narrate");
        }
        if let Some(parent) = output.parent() {
            fs_err::create_dir_all(parent)?;
        }

        // Long texts go through a file rather than the command line
        let mut input = tempfile::Builder::new()
            .prefix(".podcaster-tts-")
            .suffix(".txt")
            .tempfile()
            .context("Failed to create narration input file")?;
        input.write_all(text.as_bytes())?;
        input.flush()?;

        tracing::debug!(
            "{} --voice {} -> {}",
            self.command,
            voice.voice,
            output.display()
        );

        let result = Command::new(&self.command)
            .arg("--voice")
            .arg(&voice.voice)
            .arg(format!("--rate={}", voice.rate))
            .arg(format!("--volume={}", voice.volume))
            .arg(format!("--pitch={}", voice.pitch))
            .arg("--file")
            .arg(input.path())
            .arg("--write-media")
            .arg(output)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.command))?;

        if !result.status.success() {
            let error = String::from_utf8_lossy(&result.stderr);
            anyhow::bail!("{} exited with {}: {}", self.command, result.status, error.trim());
        }

        let size = fs_err::metadata(output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            anyhow::bail!("{} produced no audio at {}", self.command, output.display());
        }

        Ok(output.to_path_buf())
    }
}

/// Turns Markdown into plain text that reads well aloud: front matter and
/// code blocks are dropped, headings and list items become sentences and
/// inline formatting is removed.
pub struct SpeechCleaner {
    code_block: Regex,
    image: Regex,
    link: Regex,
    html: Regex,
    bold: Regex,
    bold_underscore: Regex,
    italic: Regex,
    italic_underscore: Regex,
    strike: Regex,
    inline_code: Regex,
    heading: Regex,
    bullet: Regex,
    numbered: Regex,
    quote: Regex,
    spaces: Regex,
    dots: Regex,
    punct_dot: Regex,
}

impl SpeechCleaner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            code_block: Regex::new(r"(?s)```.*?```")?,
            image: Regex::new(r"!\[([^\]]*)\]\([^)]*\)")?,
            link: Regex::new(r"\[([^\]]*)\]\([^)]*\)")?,
            html: Regex::new(r"<[^>\n]+>")?,
            bold: Regex::new(r"\*\*(.*?)\*\*")?,
            bold_underscore: Regex::new(r"__(.*?)__")?,
            italic: Regex::new(r"\*([^*\n]+)\*")?,
            italic_underscore: Regex::new(r"(^|[^\w])_([^_\n]+)_([^\w]|$)")?,
            strike: Regex::new(r"~~(.*?)~~")?,
            inline_code: Regex::new(r"`([^`\n]*)`")?,
            heading: Regex::new(r"(?m)^#{1,6}[ \t]+(.*?)[ \t]*$")?,
            bullet: Regex::new(r"(?m)^[ \t]*[-*+][ \t]+(.*?)[ \t]*$")?,
            numbered: Regex::new(r"(?m)^[ \t]*\d+\.[ \t]+(.*?)[ \t]*$")?,
            quote: Regex::new(r"(?m)^>[ \t]?")?,
            spaces: Regex::new(r"[ \t]+")?,
            dots: Regex::new(r"\.{2,}")?,
            punct_dot: Regex::new(r"([!?:;,])\.")?,
        })
    }

    pub fn clean(&self, markdown: &str) -> String {
        let (_, body) = split_front_matter(markdown);

        let text = self.code_block.replace_all(body, "");
        let text = self.image.replace_all(&text, "${1}");
        let text = self.link.replace_all(&text, "${1}");
        let text = self.html.replace_all(&text, "");
        let text = self.bold.replace_all(&text, "${1}");
        let text = self.bold_underscore.replace_all(&text, "${1}");
        let text = self.heading.replace_all(&text, "${1}.");
        let text = self.bullet.replace_all(&text, "${1}.");
        let text = self.numbered.replace_all(&text, "${1}.");
        let text = self.italic.replace_all(&text, "${1}");
        let text = self.italic_underscore.replace_all(&text, "${1}${2}${3}");
        let text = self.strike.replace_all(&text, "${1}");
        let text = self.inline_code.replace_all(&text, "${1}");
        let text = self.quote.replace_all(&text, "");

        let paragraphs: Vec<String> = text
            .split("\n\n")
            .map(|p| {
                let joined = p.lines().map(str::trim).collect::<Vec<_>>().join(" ");
                let joined = self.spaces.replace_all(&joined, " ");
                let joined = self.dots.replace_all(&joined, ".");
                self.punct_dot.replace_all(&joined, "${1}").trim().to_string()
            })
            .filter(|p| !p.is_empty())
            .collect();

        paragraphs.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_markdown() {
        let cleaner = SpeechCleaner::new().unwrap();
        let markdown = "---\ntitle: x\n---\n## Ownership\n\nRust uses **ownership** and *borrowing*.\nSee [the book](https://doc.rust-lang.org).\n\n```rust\nfn main() {}\n```\n\n- first item\n- second item\n";
        let spoken = cleaner.clean(markdown);
        assert_eq!(
            spoken,
            "Ownership.\n\nRust uses ownership and borrowing. See the book.\n\nfirst item. second item."
        );
    }

    #[test]
    fn test_clean_keeps_snake_case_words() {
        let cleaner = SpeechCleaner::new().unwrap();
        assert_eq!(
            cleaner.clean("Call read_to_string and _really_ mean it."),
            "Call read_to_string and really mean it."
        );
    }

    #[test]
    fn test_heading_with_punctuation_is_not_doubled() {
        let cleaner = SpeechCleaner::new().unwrap();
        assert_eq!(cleaner.clean("# Why?\n\nBecause."), "Why?\n\nBecause.");
    }

    #[test]
    fn test_voice_options_from_config() {
        let voice = VoiceOptions::from(&TtsConfig::default());
        assert_eq!(voice.voice, "pt-BR-FranciscaNeural");
        assert_eq!(voice.rate, "+0%");
    }

    #[tokio::test]
    async fn test_synthesize_rejects_empty_text() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = EdgeTts::new("edge-tts");
        let voice = VoiceOptions::from(&TtsConfig::default());
        assert!(engine
            .synthesize("  ", &voice, &dir.path().join("out.mp3"))
            .await
            .is_err());
    }
}

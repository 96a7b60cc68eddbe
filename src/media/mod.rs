use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::transcribe::TranscriptSegment;
use crate::utils::{format_timestamp, split_front_matter, title_from_stem, truncate_text};

/// Options for audio extraction
#[derive(Debug, Clone)]
pub struct AudioOptions {
    /// Where the MP3 is written
    pub output: PathBuf,

    /// ffmpeg bitrate, e.g. `128k`
    pub bitrate: String,

    pub sample_rate: u32,
}

/// Pulls the audio track out of a lesson video
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    async fn extract(&self, video: &Path, options: &AudioOptions) -> Result<PathBuf>;
}

/// Builds a chapter list for a set of audio files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimestampGenerator: Send + Sync {
    async fn generate(&self, audio_paths: &[PathBuf], course: &str) -> Result<String>;
}

pub struct FfmpegExtractor;

impl FfmpegExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Check if the file exists and is accessible
    async fn validate_file(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            anyhow::bail!("File does not exist: {}", path.display());
        }

        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Cannot access file {}", path.display()))?;
        if metadata.len() == 0 {
            anyhow::bail!("File is empty: {}", path.display());
        }

        Ok(())
    }
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioExtractor for FfmpegExtractor {
    async fn extract(&self, video: &Path, options: &AudioOptions) -> Result<PathBuf> {
        self.validate_file(video).await?;

        if let Some(parent) = options.output.parent() {
            fs_err::create_dir_all(parent)?;
        }

        tracing::debug!(
            "ffmpeg -i {} -> {}",
            video.display(),
            options.output.display()
        );

        let sample_rate = options.sample_rate.to_string();
        let output = Command::new("ffmpeg")
            .args([
                "-i",
                &video.to_string_lossy(),
                "-vn", // No video
                "-acodec",
                "libmp3lame",
                "-ab",
                &options.bitrate,
                "-ar",
                &sample_rate,
                "-y", // Overwrite output file
                &options.output.to_string_lossy(),
            ])
            .output()
            .await
            .context("Failed to run ffmpeg")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                last_lines(&error, 5)
            );
        }

        if !options.output.is_file() {
            anyhow::bail!("ffmpeg produced no output at {}", options.output.display());
        }

        Ok(options.output.clone())
    }
}

/// Chapter list from ffprobe durations: each file starts where the previous
/// one ended.
pub struct FfprobeTimestamps {
    heading: String,
}

impl FfprobeTimestamps {
    pub fn new(heading: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
        }
    }

    /// Duration in seconds reported by ffprobe
    async fn duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                &path.to_string_lossy(),
            ])
            .output()
            .await
            .context("Failed to run ffprobe")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to analyze file with ffprobe: {}", error);
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        info["format"]["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .with_context(|| format!("ffprobe reported no duration for {}", path.display()))
    }
}

#[async_trait]
impl TimestampGenerator for FfprobeTimestamps {
    async fn generate(&self, audio_paths: &[PathBuf], course: &str) -> Result<String> {
        let mut chapters = Vec::with_capacity(audio_paths.len());
        for path in audio_paths {
            let duration = self.duration(path).await?;
            let title = path
                .file_stem()
                .map(|s| title_from_stem(&s.to_string_lossy()))
                .unwrap_or_default();
            chapters.push((title, duration));
        }

        Ok(render_chapters(&self.heading, course, &chapters))
    }
}

/// Markdown chapter list with cumulative `HH:MM:SS` offsets
pub fn render_chapters(heading: &str, course: &str, chapters: &[(String, f64)]) -> String {
    let mut doc = format!("## {} - {}\n\n", heading, course);
    let mut offset = 0.0;
    for (title, duration) in chapters {
        doc.push_str(&format!("- {} {}\n", format_timestamp(offset), title));
        offset += duration;
    }
    doc.push_str(&format!("\nTotal: {}\n", format_timestamp(offset)));
    doc
}

/// A timed passage of a lesson transcript
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    /// Offset in seconds
    pub start: f64,
    pub end: Option<f64>,
    pub text: String,
}

#[derive(Deserialize)]
struct SegmentFile {
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

/// Timed passages of a transcript. The `<stem>.json` segments written next to
/// the Markdown transcript are preferred; otherwise paragraphs starting with
/// `[HH:MM:SS]` or `[MM:SS]` are used. Empty when the transcript has no timing.
pub fn transcript_chapters(transcript: &Path) -> Result<Vec<Chapter>> {
    let segments_path = transcript.with_extension("json");
    if segments_path.is_file() {
        let json = fs_err::read_to_string(&segments_path)?;
        let file: SegmentFile = serde_json::from_str(&json)
            .with_context(|| format!("Invalid segment file {}", segments_path.display()))?;
        let chapters: Vec<Chapter> = file
            .segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| Chapter {
                start: s.start_time,
                end: Some(s.end_time),
                text: s.text.trim().to_string(),
            })
            .collect();
        if !chapters.is_empty() {
            return Ok(chapters);
        }
    }

    let content = fs_err::read_to_string(transcript)?;
    let (_, body) = split_front_matter(&content);
    markdown_chapters(body)
}

/// `[HH:MM:SS] text` lines; each passage ends where the next one starts
fn markdown_chapters(body: &str) -> Result<Vec<Chapter>> {
    let line_re = Regex::new(r"^\[(\d{1,2}:\d{2}(?::\d{2})?)\]\s*(.+)$")?;

    let mut chapters: Vec<Chapter> = Vec::new();
    for line in body.lines() {
        let Some(caps) = line_re.captures(line.trim()) else {
            continue;
        };
        let Some(start) = parse_timestamp(&caps[1]) else {
            continue;
        };
        if let Some(previous) = chapters.last_mut() {
            previous.end = Some(start);
        }
        chapters.push(Chapter {
            start,
            end: None,
            text: caps[2].trim().to_string(),
        });
    }
    Ok(chapters)
}

/// Seconds in `HH:MM:SS` or `MM:SS`
pub fn parse_timestamp(text: &str) -> Option<f64> {
    let parts = text
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let seconds = match parts.as_slice() {
        [h, m, s] => h * 3600 + m * 60 + s,
        [m, s] => m * 60 + s,
        _ => return None,
    };
    Some(seconds as f64)
}

/// Markdown list of a lesson's timed passages
pub fn render_transcript_chapters(
    heading: &str,
    course: &str,
    lesson: &str,
    chapters: &[Chapter],
) -> String {
    let mut doc = format!("## {} - {}\n\n### {}\n\n", heading, course, lesson);
    for chapter in chapters {
        doc.push_str(&format!(
            "- {} {}\n",
            format_timestamp(chapter.start),
            truncate_text(&chapter.text, 100)
        ));
    }
    if let Some(end) = chapters.last().and_then(|c| c.end) {
        doc.push_str(&format!("\nTotal: {}\n", format_timestamp(end)));
    }
    doc
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

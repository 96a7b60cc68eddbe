use anyhow::{Context, Result};
use aws_sdk_transcribe::types::{TranscriptionJob, TranscriptionJobStatus};
use aws_sdk_transcribe::Client as TranscribeClient;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use super::{TranscriptSegment, TranscriptionMetadata};

/// Processed transcription result from AWS
#[derive(Debug, Clone)]
pub struct ProcessedTranscription {
    pub transcript: String,
    pub segments: Vec<TranscriptSegment>,
    pub metadata: TranscriptionMetadata,
}

/// AWS Transcribe transcript format
#[derive(Debug, Deserialize)]
struct AwsTranscript {
    results: TranscriptResults,
}

#[derive(Debug, Deserialize)]
struct TranscriptResults {
    transcripts: Vec<TranscriptText>,
    items: Vec<TranscriptItem>,
}

#[derive(Debug, Deserialize)]
struct TranscriptText {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptItem {
    start_time: Option<String>,
    end_time: Option<String>,
    #[serde(rename = "type")]
    item_type: String,
    alternatives: Vec<Alternative>,
    speaker_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    confidence: Option<String>,
    content: String,
}

/// Polls one transcription job until it finishes
pub struct TranscriptionProcessor {
    client: TranscribeClient,
    job_id: String,
    max_segment_length: f64,
    max_wait: Duration,
}

impl TranscriptionProcessor {
    pub fn new(
        client: TranscribeClient,
        job_id: String,
        max_segment_length: f64,
        max_wait: Duration,
    ) -> Self {
        Self {
            client,
            job_id,
            max_segment_length,
            max_wait,
        }
    }

    /// Wait for transcription job completion, backing off between checks
    pub async fn wait_for_completion(&self) -> Result<ProcessedTranscription> {
        let start_time = Instant::now();
        let mut check_count: u64 = 0;

        loop {
            check_count += 1;

            let job = self.get_transcription_job().await?;

            match job.transcription_job_status() {
                Some(TranscriptionJobStatus::InProgress) | Some(TranscriptionJobStatus::Queued) => {
                    if start_time.elapsed() > self.max_wait {
                        anyhow::bail!(
                            "Transcription job {} still running after {}s",
                            self.job_id,
                            self.max_wait.as_secs()
                        );
                    }
                    tracing::debug!(
                        "Transcribing... ({}s elapsed, check #{})",
                        start_time.elapsed().as_secs(),
                        check_count
                    );

                    // Wait before next check (backoff up to 30 seconds)
                    let wait_time = std::cmp::min(5 + (check_count - 1) * 2, 30);
                    sleep(Duration::from_secs(wait_time)).await;
                }
                Some(TranscriptionJobStatus::Completed) => {
                    tracing::info!(
                        "Transcription job {} completed in {}s",
                        self.job_id,
                        start_time.elapsed().as_secs()
                    );
                    return self.process_transcription_result(job, start_time.elapsed()).await;
                }
                Some(TranscriptionJobStatus::Failed) => {
                    let failure_reason = job.failure_reason().unwrap_or("Unknown error");
                    anyhow::bail!("Transcription job failed: {}", failure_reason);
                }
                other => {
                    anyhow::bail!("Unexpected transcription job status: {:?}", other);
                }
            }
        }
    }

    /// Get transcription job details
    async fn get_transcription_job(&self) -> Result<TranscriptionJob> {
        let response = self
            .client
            .get_transcription_job()
            .transcription_job_name(&self.job_id)
            .send()
            .await
            .context("Failed to get transcription job status")?;

        response
            .transcription_job()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Transcription job not found"))
    }

    async fn process_transcription_result(
        &self,
        job: TranscriptionJob,
        processing_duration: Duration,
    ) -> Result<ProcessedTranscription> {
        let transcript_uri = job
            .transcript()
            .and_then(|t| t.transcript_file_uri())
            .ok_or_else(|| anyhow::anyhow!("No transcript URI found"))?;

        let transcript_json = download_transcript(transcript_uri).await?;
        let (transcript, segments) = parse_transcript(&transcript_json, self.max_segment_length)?;

        let metadata = TranscriptionMetadata {
            job_id: self.job_id.clone(),
            language: job
                .language_code()
                .map(|lc| lc.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            processing_duration: Some(processing_duration.as_secs_f64()),
            audio_duration: segments.last().map(|s| s.end_time),
            confidence: average_confidence(
                &segments.iter().filter_map(|s| s.confidence).collect::<Vec<_>>(),
            ),
            completed_at: chrono::Utc::now(),
        };

        Ok(ProcessedTranscription {
            transcript,
            segments,
            metadata,
        })
    }
}

/// Download transcript JSON from the pre-signed URI
async fn download_transcript(uri: &str) -> Result<String> {
    let response = reqwest::get(uri)
        .await
        .context("Failed to download transcript")?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to download transcript: HTTP {}", response.status());
    }

    response
        .text()
        .await
        .context("Failed to read transcript content")
}

/// Full text plus timed segments from an AWS transcript document
pub fn parse_transcript(
    json: &str,
    max_segment_length: f64,
) -> Result<(String, Vec<TranscriptSegment>)> {
    let aws_transcript: AwsTranscript =
        serde_json::from_str(json).context("Failed to parse transcript JSON")?;

    let transcript = aws_transcript
        .results
        .transcripts
        .first()
        .map(|t| t.transcript.clone())
        .unwrap_or_default();

    let segments = group_segments(&aws_transcript.results.items, max_segment_length);
    Ok((transcript, segments))
}

/// Group pronunciation items into segments, splitting on speaker changes,
/// pauses over a second, overlong segments and sentence ends past half the
/// maximum length.
fn group_segments(items: &[TranscriptItem], max_segment_length: f64) -> Vec<TranscriptSegment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut seg_start: Option<f64> = None;
    let mut seg_end: Option<f64> = None;
    let mut confidences = Vec::new();
    let mut speaker: Option<String> = None;

    let mut flush = |text: &mut String,
                     start: Option<f64>,
                     end: Option<f64>,
                     confidences: &[f64],
                     speaker: Option<String>| {
        if let (false, Some(start), Some(end)) = (text.trim().is_empty(), start, end) {
            segments.push(TranscriptSegment {
                start_time: start,
                end_time: end,
                text: text.trim().to_string(),
                confidence: average_confidence(confidences),
                speaker_id: speaker,
            });
        }
        text.clear();
    };

    for item in items {
        let Some(alt) = item.alternatives.first() else {
            continue;
        };

        if item.item_type == "punctuation" {
            text.push_str(&alt.content);
            continue;
        }
        if item.item_type != "pronunciation" {
            continue;
        }

        let start = item.start_time.as_deref().and_then(|s| s.parse::<f64>().ok());
        let end = item.end_time.as_deref().and_then(|s| s.parse::<f64>().ok());
        let confidence = alt.confidence.as_deref().and_then(|c| c.parse::<f64>().ok());

        let elapsed = seg_start.zip(start).map(|(s, now)| now - s);
        let speaker_changed = speaker.as_ref() != item.speaker_label.as_ref();
        let pause = start
            .zip(seg_end)
            .map(|(now, prev_end)| now - prev_end > 1.0)
            .unwrap_or(false);
        let too_long = elapsed.map(|e| e > max_segment_length).unwrap_or(false);
        let sentence_break = text.trim_end().ends_with(['.', '!', '?'])
            && elapsed.map(|e| e > max_segment_length / 2.0).unwrap_or(false);

        if text.is_empty() || speaker_changed || pause || too_long || sentence_break {
            flush(&mut text, seg_start, seg_end, &confidences, speaker.take());
            text.push_str(&alt.content);
            seg_start = start;
            seg_end = end;
            confidences = confidence.into_iter().collect();
            speaker = item.speaker_label.clone();
        } else {
            text.push(' ');
            text.push_str(&alt.content);
            seg_end = end.or(seg_end);
            confidences.extend(confidence);
        }
    }

    flush(&mut text, seg_start, seg_end, &confidences, speaker);
    segments
}

fn average_confidence(confidences: &[f64]) -> Option<f64> {
    if confidences.is_empty() {
        None
    } else {
        Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
    }
}

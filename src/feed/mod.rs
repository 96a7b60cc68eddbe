//! RSS 2.0 podcast feed with the iTunes namespace.
//!
//! The feed file is the source of truth for episodes: adding an episode reads
//! the existing items, replaces any item with the same GUID and rewrites the
//! whole document atomically.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::path::Path;

use crate::config::FeedConfig;
use crate::utils::write_atomic;

const ITUNES_NS: &str = "http://www.itunes.com/dtds/podcast-1.0.dtd";

/// One podcast episode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpisodeMetadata {
    /// Stable identifier; re-adding the same GUID replaces the episode
    pub guid: String,
    pub title: String,
    pub description: String,
    pub audio_url: String,
    /// Enclosure size in bytes
    pub length: u64,
    /// RFC 2822 publication date
    pub pub_date: String,
    /// `HH:MM:SS`, when known
    pub duration: Option<String>,
}

/// Adds episodes to a feed document
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedPublisher: Send + Sync {
    async fn add_episode(&self, feed_path: &Path, episode: &EpisodeMetadata) -> Result<()>;
}

pub struct RssFeed {
    channel: FeedConfig,
}

impl RssFeed {
    pub fn new(channel: FeedConfig) -> Self {
        Self { channel }
    }

    /// Render the full feed document
    pub fn render(&self, episodes: &[EpisodeMetadata]) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(
            BytesStart::new("rss").with_attributes([("version", "2.0"), ("xmlns:itunes", ITUNES_NS)]),
        ))?;
        writer.write_event(Event::Start(BytesStart::new("channel")))?;

        text_element(&mut writer, "title", &self.channel.title)?;
        text_element(&mut writer, "link", &self.channel.link)?;
        text_element(&mut writer, "description", &self.channel.description)?;
        text_element(&mut writer, "language", &self.channel.language)?;
        text_element(&mut writer, "lastBuildDate", &chrono::Utc::now().to_rfc2822())?;
        text_element(&mut writer, "itunes:author", &self.channel.author)?;
        text_element(&mut writer, "itunes:explicit", "no")?;
        if let Some(image) = &self.channel.image_url {
            writer.write_event(Event::Empty(
                BytesStart::new("itunes:image").with_attributes([("href", image.as_str())]),
            ))?;
        }

        for episode in episodes {
            writer.write_event(Event::Start(BytesStart::new("item")))?;
            text_element(&mut writer, "title", &episode.title)?;
            text_element(&mut writer, "description", &episode.description)?;
            writer.write_event(Event::Empty(BytesStart::new("enclosure").with_attributes([
                ("url", episode.audio_url.as_str()),
                ("length", episode.length.to_string().as_str()),
                ("type", "audio/mpeg"),
            ])))?;
            writer.write_event(Event::Start(
                BytesStart::new("guid").with_attributes([("isPermaLink", "false")]),
            ))?;
            writer.write_event(Event::Text(BytesText::new(&episode.guid)))?;
            writer.write_event(Event::End(BytesEnd::new("guid")))?;
            text_element(&mut writer, "pubDate", &episode.pub_date)?;
            text_element(&mut writer, "itunes:author", &self.channel.author)?;
            if let Some(duration) = &episode.duration {
                text_element(&mut writer, "itunes:duration", duration)?;
            }
            writer.write_event(Event::End(BytesEnd::new("item")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("channel")))?;
        writer.write_event(Event::End(BytesEnd::new("rss")))?;

        let mut xml = String::from_utf8(writer.into_inner()).context("Feed is not valid UTF-8")?;
        xml.push('\n');
        Ok(xml)
    }
}

#[async_trait]
impl FeedPublisher for RssFeed {
    async fn add_episode(&self, feed_path: &Path, episode: &EpisodeMetadata) -> Result<()> {
        let mut episodes = if feed_path.exists() {
            let xml = fs_err::read_to_string(feed_path)?;
            parse_episodes(&xml)
                .with_context(|| format!("Failed to parse feed {}", feed_path.display()))?
        } else {
            Vec::new()
        };

        match episodes.iter_mut().find(|e| e.guid == episode.guid) {
            Some(existing) => {
                tracing::debug!("Replacing episode {} in {}", episode.guid, feed_path.display());
                *existing = episode.clone();
            }
            None => episodes.insert(0, episode.clone()),
        }

        let xml = self.render(&episodes)?;
        write_atomic(feed_path, xml.as_bytes())
            .with_context(|| format!("Failed to write feed {}", feed_path.display()))?;

        tracing::info!(
            "Feed {} now has {} episode(s)",
            feed_path.display(),
            episodes.len()
        );
        Ok(())
    }
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Episodes of an existing feed, in document order
pub fn parse_episodes(xml: &str) -> Result<Vec<EpisodeMetadata>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut episodes = Vec::new();
    let mut current: Option<EpisodeMetadata> = None;
    let mut field: Option<Vec<u8>> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if name == b"item" {
                    current = Some(EpisodeMetadata::default());
                } else if current.is_some() {
                    field = Some(name);
                }
            }
            Event::Empty(e) => {
                if let (Some(episode), b"enclosure") = (current.as_mut(), e.name().as_ref()) {
                    for attr in e.attributes() {
                        let attr = attr?;
                        let value = attr.unescape_value()?.into_owned();
                        match attr.key.as_ref() {
                            b"url" => episode.audio_url = value,
                            b"length" => episode.length = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                }
            }
            Event::Text(t) => {
                if let (Some(episode), Some(name)) = (current.as_mut(), field.as_deref()) {
                    let text = t.unescape()?;
                    set_field(episode, name, &text);
                }
            }
            Event::CData(c) => {
                if let (Some(episode), Some(name)) = (current.as_mut(), field.as_deref()) {
                    let text = String::from_utf8_lossy(&c.into_inner()).to_string();
                    set_field(episode, name, &text);
                }
            }
            Event::End(e) => {
                if e.name().as_ref() == b"item" {
                    if let Some(episode) = current.take() {
                        episodes.push(episode);
                    }
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(episodes)
}

fn set_field(episode: &mut EpisodeMetadata, name: &[u8], text: &str) {
    match name {
        b"title" => episode.title.push_str(text),
        b"description" => episode.description.push_str(text),
        b"guid" => episode.guid.push_str(text),
        b"pubDate" => episode.pub_date.push_str(text),
        b"itunes:duration" => episode.duration = Some(text.to_string()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn episode(guid: &str, title: &str) -> EpisodeMetadata {
        EpisodeMetadata {
            guid: guid.to_string(),
            title: title.to_string(),
            description: "Borrowing & lifetimes <explained>".to_string(),
            audio_url: format!("https://cdn.example.com/{}.mp3", guid.replace('/', "_")),
            length: 1234,
            pub_date: "Mon, 19 Oct 2026 10:00:00 +0000".to_string(),
            duration: Some("00:12:30".to_string()),
        }
    }

    #[test]
    fn test_render_contains_itunes_namespace_and_enclosure() {
        let feed = RssFeed::new(FeedConfig::default());
        let xml = feed.render(&[episode("rust/01", "Intro")]).unwrap();
        assert!(xml.contains("xmlns:itunes=\"http://www.itunes.com/dtds/podcast-1.0.dtd\""));
        assert!(xml.contains("type=\"audio/mpeg\""));
        assert!(xml.contains("<guid isPermaLink=\"false\">rust/01</guid>"));
        assert!(xml.contains("Borrowing &amp; lifetimes &lt;explained&gt;"));
    }

    #[test]
    fn test_parse_reads_back_rendered_episodes() {
        let feed = RssFeed::new(FeedConfig::default());
        let episodes = vec![episode("rust/02", "Second"), episode("rust/01", "First")];
        let parsed = parse_episodes(&feed.render(&episodes).unwrap()).unwrap();
        assert_eq!(parsed, episodes);
    }

    #[tokio::test]
    async fn test_add_episode_dedupes_by_guid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("podcast").join("feed.xml");
        let feed = RssFeed::new(FeedConfig::default());

        feed.add_episode(&path, &episode("rust/01", "Intro")).await.unwrap();
        feed.add_episode(&path, &episode("rust/02", "Ownership")).await.unwrap();
        feed.add_episode(&path, &episode("rust/01", "Intro (revised)")).await.unwrap();

        let parsed = parse_episodes(&fs_err::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].guid, "rust/02");
        assert_eq!(parsed[1].title, "Intro (revised)");
    }
}

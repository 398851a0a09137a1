//! RSS 2.0, RDF and Atom news feeds.
//!
//! Entries are read from `<item>` or `<entry>` elements:
//!
//! | Field | Elements, first match wins |
//! |-------|----------------------------|
//! | title | `title` |
//! | link | `link` text, or `link href=".."` (Atom, `rel` absent or `alternate`) |
//! | description | `description`, `summary`, `content:encoded`, `content` |
//! | published | `pubDate` (RFC 2822), `dc:date`, `published` (RFC 3339) |
//! | updated | `updated` (RFC 3339), used only when no publication time is given |
//!
//! Entries without a parseable publication time are skipped, as are entries
//! older than the configured lookback window.

use chrono::{DateTime, Duration, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use reqwest::Client;
use tracing::{debug, info, instrument};

use super::get_text;
use crate::config::{FeedConfig, FeedTopic, FetchConfig};
use crate::error::FetchError;
use crate::models::{Payload, RawNews, SourceRecord};
use crate::utils::{strip_html, truncate_chars};

/// Descriptions longer than this are cut and suffixed with `...`.
pub const MAX_DESCRIPTION_CHARS: usize = 300;

/// Source id for a feed, e.g. `feed:crypto:CoinPost`.
pub fn source_id(feed: &FeedConfig) -> String {
    let topic = match feed.topic {
        FeedTopic::Stock => "stock",
        FeedTopic::Crypto => "crypto",
    };
    format!("feed:{topic}:{}", feed.name)
}

/// One feed entry as it appears in the XML, before any filtering.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: Option<DateTime<Utc>>,
    /// Atom `<updated>`, the last edit rather than the first publication.
    pub updated: Option<DateTime<Utc>>,
}

impl FeedEntry {
    /// Publication time, falling back to the last-updated time.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published.or(self.updated)
    }
}

/// Fetch one feed and keep the entries published within the lookback window.
#[instrument(level = "info", skip_all, fields(feed = %feed.name))]
pub async fn fetch(
    client: &Client,
    feed: &FeedConfig,
    fetch: &FetchConfig,
    now: DateTime<Utc>,
) -> Result<Vec<SourceRecord>, FetchError> {
    let body = get_text(client, &feed.url, fetch.max_retries).await?;
    let entries = parse_feed(&body)?;
    let total = entries.len();
    let records = to_records(entries, feed, now - Duration::hours(fetch.lookback_hours), now);
    info!(total, kept = records.len(), "Parsed feed");
    Ok(records)
}

/// Turn parsed entries into news records, dropping undated and stale ones.
pub(crate) fn to_records(
    entries: Vec<FeedEntry>,
    feed: &FeedConfig,
    cutoff: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
) -> Vec<SourceRecord> {
    let id = source_id(feed);
    entries
        .into_iter()
        .filter_map(|entry| {
            let Some(published_at) = entry.published_at() else {
                debug!(title = %entry.title, "Skipping entry without publication time");
                return None;
            };
            if published_at < cutoff {
                return None;
            }
            let description = truncate_chars(&strip_html(&entry.description), MAX_DESCRIPTION_CHARS);
            Some(SourceRecord {
                source_id: id.clone(),
                fetched_at,
                raw_text: entry.description,
                payload: Payload::News(RawNews {
                    title: strip_html(&entry.title),
                    url: entry.link.trim().to_string(),
                    source_name: feed.name.clone(),
                    published_at,
                    locale: feed.locale,
                    description,
                }),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Title,
    Link,
    Description,
    Published,
    Updated,
}

fn field_for(name: &[u8]) -> Option<Field> {
    match name {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"description" | b"summary" | b"content:encoded" | b"content" => Some(Field::Description),
        b"pubDate" | b"dc:date" | b"published" => Some(Field::Published),
        b"updated" => Some(Field::Updated),
        _ => None,
    }
}

/// Parse an RSS/RDF/Atom document into entries.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    // (field, element name, accumulated text) of the element being read
    let mut open: Option<(Field, Vec<u8>, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                if name == b"item" || name == b"entry" {
                    current = Some(FeedEntry::default());
                    open = None;
                } else if let Some(entry) = current.as_mut() {
                    if open.is_some() {
                        // markup nested inside a field; its text is collected by the outer field
                        continue;
                    }
                    if name == b"link" {
                        take_href(&e, entry);
                    }
                    if let Some(field) = field_for(&name) {
                        open = Some((field, name, String::new()));
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    if e.name().as_ref() == b"link" {
                        take_href(&e, entry);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some((_, _, buf)) = open.as_mut() {
                    let text = e.unescape().unwrap_or_default();
                    push_text(buf, &text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some((_, _, buf)) = open.as_mut() {
                    push_text(buf, &String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let name = name.as_ref();
                if name == b"item" || name == b"entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    open = None;
                } else if let Some(entry) = current.as_mut() {
                    let closes_open = open
                        .as_ref()
                        .is_some_and(|(_, open_name, _)| open_name.as_slice() == name);
                    if closes_open {
                        if let Some((field, _, text)) = open.take() {
                            assign(entry, field, text);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Xml(e)),
            _ => {}
        }
    }

    Ok(entries)
}

fn push_text(buf: &mut String, text: &str) {
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(text);
}

/// Fill `field` unless an earlier element already did.
fn assign(entry: &mut FeedEntry, field: Field, text: String) {
    let text = text.trim().to_string();
    if text.is_empty() {
        return;
    }
    match field {
        Field::Title if entry.title.is_empty() => entry.title = text,
        Field::Link if entry.link.is_empty() => entry.link = text,
        Field::Description if entry.description.is_empty() => entry.description = text,
        Field::Published if entry.published.is_none() => entry.published = parse_date(&text),
        Field::Updated if entry.updated.is_none() => entry.updated = parse_date(&text),
        _ => {}
    }
}

/// Atom `<link href=".." rel="alternate"/>`.
fn take_href(e: &BytesStart<'_>, entry: &mut FeedEntry) {
    if !entry.link.is_empty() {
        return;
    }
    let rel = e
        .try_get_attribute("rel")
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
    if rel.as_deref().is_some_and(|r| r != "alternate") {
        return;
    }
    if let Some(href) = e
        .try_get_attribute("href")
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
    {
        entry.link = href.trim().to_string();
    }
}

/// Parse RFC 2822 (`pubDate`) or RFC 3339 (`dc:date`, Atom) timestamps.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

//! Data models shared by every pipeline stage.
//!
//! This module defines the core data structures used throughout the application:
//! - [`SourceRecord`]: One raw record as returned by a fetcher
//! - [`NewsItem`]: A headline from an RSS/Atom feed, later categorized by the LLM
//! - [`MarketSnapshot`]: Index and crypto quotes for the day
//! - [`DailyDocument`]: The aggregate root for one calendar day
//! - [`Archive`]: The date-ordered index of every persisted document

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The kind of data a [`SourceRecord`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Weather,
    Index,
    News,
    Price,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordKind::Weather => "weather",
            RecordKind::Index => "index",
            RecordKind::News => "news",
            RecordKind::Price => "price",
        };
        f.write_str(s)
    }
}

/// One raw record as produced by a fetcher. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Identifier of the source that produced the record (e.g. `weather`, `feed:CoinPost`).
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: Payload,
    /// The slice of the upstream response this record was parsed from.
    pub raw_text: String,
}

impl SourceRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }
}

/// Kind-specific record contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Weather(WeatherReading),
    Index { id: String, quote: Quote },
    News(RawNews),
    Price { symbol: String, quote: Quote },
}

impl Payload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Payload::Weather(_) => RecordKind::Weather,
            Payload::Index { .. } => RecordKind::Index,
            Payload::News(_) => RecordKind::News,
            Payload::Price { .. } => RecordKind::Price,
        }
    }
}

/// A feed entry before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNews {
    pub title: String,
    pub url: String,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub locale: Locale,
    pub description: String,
}

/// Whether a news feed covers the home market or the rest of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    Domestic,
    International,
}

/// The closed set of categories the LLM may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    MarketTrend,
    RegulationPolicy,
    ProjectTechnology,
    ExchangeService,
    Other,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::MarketTrend,
        Category::RegulationPolicy,
        Category::ProjectTechnology,
        Category::ExchangeService,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::MarketTrend => "market-trend",
            Category::RegulationPolicy => "regulation-policy",
            Category::ProjectTechnology => "project-technology",
            Category::ExchangeService => "exchange-service",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized headline.
///
/// `category`, `summary` and `price_impact` are empty until the classifier
/// has run; `url` is the unique key within a day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    /// 1-based position used to address the item in the LLM exchange.
    pub id: usize,
    pub title: String,
    pub url: String,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub locale: Locale,
    pub description: String,
    pub category: Option<Category>,
    /// One-line digest written by the LLM.
    pub summary: String,
    pub price_impact: Option<String>,
}

/// A value with its percentage change against the previous close (or 24h ago).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub value: f64,
    pub change_pct: f64,
}

/// Current conditions and today's forecast for one configured location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature_c: f64,
    pub temperature_max_c: f64,
    pub temperature_min_c: f64,
    pub precipitation_probability_pct: f64,
    pub wind_speed_kmh: f64,
    /// WMO weather interpretation code.
    pub condition_code: u32,
    pub condition: String,
}

/// Index and crypto quotes for the day. Maps are ordered so output is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub as_of: Option<DateTime<Utc>>,
    pub indices: BTreeMap<String, Quote>,
    pub crypto_prices: BTreeMap<String, Quote>,
}

/// Outcome of one fetch attempt, kept in the document so gaps stay visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub kind: RecordKind,
    pub ok: bool,
    pub records: usize,
    pub error: Option<String>,
}

/// Everything published for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDocument {
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub weather: Vec<WeatherReading>,
    pub market: MarketSnapshot,
    /// Market-wide summary written by the LLM.
    pub summary: String,
    /// Note correlating news sentiment with the day's price moves.
    pub price_impact: String,
    pub news_domestic: Vec<NewsItem>,
    pub news_international: Vec<NewsItem>,
    pub sources: Vec<SourceStatus>,
}

impl DailyDocument {
    /// All news items, domestic first, in id order.
    pub fn news(&self) -> impl Iterator<Item = &NewsItem> {
        self.news_domestic.iter().chain(self.news_international.iter())
    }

    pub fn news_mut(&mut self) -> impl Iterator<Item = &mut NewsItem> {
        self.news_domestic
            .iter_mut()
            .chain(self.news_international.iter_mut())
    }

    pub fn news_count(&self) -> usize {
        self.news_domestic.len() + self.news_international.len()
    }

    /// Items grouped by category, for consumers that render per-category sections.
    pub fn news_by_category(&self) -> BTreeMap<Category, Vec<&NewsItem>> {
        let mut grouped: BTreeMap<Category, Vec<&NewsItem>> = BTreeMap::new();
        for item in self.news() {
            grouped
                .entry(item.category.unwrap_or(Category::Other))
                .or_default()
                .push(item);
        }
        grouped
    }
}

/// One line of the archive index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub date: NaiveDate,
    /// Path of the day's document, relative to the archive root.
    pub path: String,
    /// First sentence of the day's summary.
    pub headline: String,
    pub news_count: usize,
}

/// Date-ordered index of every persisted [`DailyDocument`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub entries: Vec<ArchiveEntry>,
}

impl Archive {
    pub fn get(&self, date: NaiveDate) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.date == date)
    }

    pub fn latest(&self) -> Option<&ArchiveEntry> {
        self.entries.last()
    }

    #[cfg(test)]
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.entries.iter().map(|e| e.date).collect()
    }
}

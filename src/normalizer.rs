//! Merge fetcher output into the day's document.
//!
//! - Weather and quote records are validated; malformed ones are dropped and logged.
//! - News is deduplicated by URL, then by normalized title within each locale,
//!   keeping the earliest publication in both cases.
//! - Each locale group is sorted newest first and items get ids `1..=N`,
//!   domestic before international.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::ValidationError;
use crate::fetchers::FetchReport;
use crate::models::{
    DailyDocument, Locale, MarketSnapshot, NewsItem, Payload, Quote, RawNews, SourceRecord,
    WeatherReading,
};
use crate::utils::title_key;

/// Build the unclassified document for `date` from everything that was fetched.
#[instrument(level = "info", skip_all, fields(%date))]
pub fn normalize(date: NaiveDate, generated_at: DateTime<Utc>, report: FetchReport) -> DailyDocument {
    let FetchReport { records, statuses } = report;

    let mut weather = Vec::new();
    let mut market = MarketSnapshot::default();
    let mut news = Vec::new();
    let mut dropped = 0usize;

    for record in records {
        let kind = record.kind();
        let SourceRecord {
            source_id,
            fetched_at,
            payload,
            ..
        } = record;
        let outcome = match payload {
            Payload::Weather(reading) => validate_weather(&reading).map(|()| weather.push(reading)),
            Payload::Index { id, quote } => validate_quote(&quote).map(|()| {
                market.indices.insert(id, quote);
                bump_as_of(&mut market, fetched_at);
            }),
            Payload::Price { symbol, quote } => validate_quote(&quote).map(|()| {
                market.crypto_prices.insert(symbol, quote);
                bump_as_of(&mut market, fetched_at);
            }),
            Payload::News(raw) => validate_news(raw).map(|raw| news.push(raw)),
        };
        if let Err(e) = outcome {
            dropped += 1;
            warn!(%source_id, %kind, error = %e, "Dropping malformed record");
        }
    }

    let news = dedupe_news(news);
    let (mut domestic, mut international): (Vec<RawNews>, Vec<RawNews>) = news
        .into_iter()
        .partition(|n| n.locale == Locale::Domestic);
    sort_newest_first(&mut domestic);
    sort_newest_first(&mut international);

    let mut next_id = 0usize;
    let mut to_items = |group: Vec<RawNews>| -> Vec<NewsItem> {
        group
            .into_iter()
            .map(|raw| {
                next_id += 1;
                NewsItem {
                    id: next_id,
                    title: raw.title,
                    url: raw.url,
                    source_name: raw.source_name,
                    published_at: raw.published_at,
                    locale: raw.locale,
                    description: raw.description,
                    category: None,
                    summary: String::new(),
                    price_impact: None,
                }
            })
            .collect()
    };
    let news_domestic = to_items(domestic);
    let news_international = to_items(international);

    info!(
        weather = weather.len(),
        indices = market.indices.len(),
        crypto = market.crypto_prices.len(),
        domestic = news_domestic.len(),
        international = news_international.len(),
        dropped,
        "Normalized records"
    );

    DailyDocument {
        date,
        generated_at,
        weather,
        market,
        summary: String::new(),
        price_impact: String::new(),
        news_domestic,
        news_international,
        sources: statuses,
    }
}

fn bump_as_of(market: &mut MarketSnapshot, fetched_at: DateTime<Utc>) {
    if market.as_of.is_none_or(|t| t < fetched_at) {
        market.as_of = Some(fetched_at);
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFinite { field })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    finite(field, value)?;
    if value < 0.0 {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

/// A price or index value must be finite and non-negative; its change only finite.
pub fn validate_quote(quote: &Quote) -> Result<(), ValidationError> {
    non_negative("value", quote.value)?;
    finite("change_pct", quote.change_pct)
}

/// Temperatures may be negative; wind and precipitation may not.
pub fn validate_weather(reading: &WeatherReading) -> Result<(), ValidationError> {
    finite("temperature_c", reading.temperature_c)?;
    finite("temperature_max_c", reading.temperature_max_c)?;
    finite("temperature_min_c", reading.temperature_min_c)?;
    non_negative("precipitation_probability_pct", reading.precipitation_probability_pct)?;
    non_negative("wind_speed_kmh", reading.wind_speed_kmh)
}

/// Require a title and an absolute http(s) URL; the URL is canonicalized without its fragment.
pub fn validate_news(mut raw: RawNews) -> Result<RawNews, ValidationError> {
    if raw.title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    let mut url = Url::parse(raw.url.trim()).map_err(|_| ValidationError::BadUrl(raw.url.clone()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::BadUrl(raw.url));
    }
    url.set_fragment(None);
    raw.url = url.to_string();
    raw.title = raw.title.trim().to_string();
    Ok(raw)
}

/// Collapse duplicates by URL, then by title within a locale, keeping the earliest item.
///
/// The surviving items keep the order in which they were first seen.
pub fn dedupe_news(items: Vec<RawNews>) -> Vec<RawNews> {
    let before = items.len();
    let by_url = keep_earliest(items, |n| n.url.clone());
    let by_title = keep_earliest(by_url, |n| (n.locale, title_key(&n.title)));
    if by_title.len() != before {
        debug!(before, after = by_title.len(), "Collapsed duplicate news items");
    }
    by_title
}

fn keep_earliest<K, F>(items: Vec<RawNews>, key: F) -> Vec<RawNews>
where
    K: std::hash::Hash + Eq,
    F: Fn(&RawNews) -> K,
{
    let mut slots: Vec<RawNews> = Vec::with_capacity(items.len());
    let mut index: HashMap<K, usize> = HashMap::new();
    for item in items {
        match index.entry(key(&item)) {
            Entry::Occupied(slot) => {
                let kept = &mut slots[*slot.get()];
                if item.published_at < kept.published_at {
                    *kept = item;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(slots.len());
                slots.push(item);
            }
        }
    }
    slots
}

fn sort_newest_first(items: &mut [RawNews]) {
    items.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.url.cmp(&b.url))
    });
    debug_assert!(items.iter().map(|n| &n.url).all_unique());
}

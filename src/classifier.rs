//! Categorize and summarize the day's news with one LLM call.
//!
//! The model receives every news item with its id plus the market snapshot
//! and must answer with a single JSON object:
//!
//! ```json
//! {
//!   "summary": "3-5 sentence market overview",
//!   "price_impact": "how the news lines up with today's price moves",
//!   "items": [
//!     {"id": 1, "category": "market-trend", "digest": "one line", "price_impact": "optional"}
//!   ]
//! }
//! ```
//!
//! The reply is validated before anything is applied: one entry per
//! submitted id, categories from the closed set, non-empty summary and
//! price-impact note. Any violation is a [`ClassificationError`]; there is
//! no partially classified document.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::api::{AskAsync, Prompt};
use crate::error::ClassificationError;
use crate::models::{Category, DailyDocument};
use crate::utils::{looks_truncated, truncate_for_log};

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("valid fence regex"));

const SYSTEM_PROMPT: &str = "You are a financial news editor. You read the day's crypto, stock and \
weather headlines and answer with a single JSON object and nothing else.";

/// The validated model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub summary: String,
    pub price_impact: String,
    pub items: HashMap<usize, ItemClassification>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemClassification {
    pub category: Category,
    pub digest: String,
    pub price_impact: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReply {
    summary: Option<String>,
    price_impact: Option<String>,
    items: Option<Vec<RawItem>>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    id: usize,
    category: String,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    price_impact: Option<String>,
}

/// Send the document to the LLM and return it with categories and summaries filled in.
#[instrument(level = "info", skip_all, fields(date = %doc.date, items = doc.news_count()))]
pub async fn classify<A: AskAsync>(
    llm: &A,
    mut doc: DailyDocument,
) -> Result<DailyDocument, ClassificationError> {
    let prompt = build_prompt(&doc);
    let reply = llm.ask(&prompt).await?;
    let expected: Vec<usize> = doc.news().map(|n| n.id).collect();

    let classification = parse_reply(&reply, &expected).inspect_err(|e| {
        warn!(
            error = %e,
            response_preview = %truncate_for_log(&reply, 300),
            "Model reply rejected"
        );
    })?;
    apply(&mut doc, classification);

    let per_category: Vec<String> = doc
        .news_by_category()
        .iter()
        .map(|(category, items)| format!("{category}={}", items.len()))
        .collect();
    info!(categories = %per_category.join(","), "Classified news");
    Ok(doc)
}

/// Render the instruction, the numbered news list and the market snapshot.
pub fn build_prompt(doc: &DailyDocument) -> Prompt {
    let mut user = String::new();

    let _ = writeln!(user, "Date: {}", doc.date);
    let _ = writeln!(user, "\n## Market snapshot");
    if doc.market.indices.is_empty() && doc.market.crypto_prices.is_empty() {
        let _ = writeln!(user, "(no market data available today)");
    }
    for (id, quote) in &doc.market.indices {
        let _ = writeln!(user, "- index {id}: {:.2} ({:+.2}%)", quote.value, quote.change_pct);
    }
    for (symbol, quote) in &doc.market.crypto_prices {
        let _ = writeln!(user, "- crypto {symbol}: {:.2} ({:+.2}% 24h)", quote.value, quote.change_pct);
    }

    let _ = writeln!(user, "\n## News items");
    if doc.news_count() == 0 {
        let _ = writeln!(user, "(no news items today)");
    }
    for item in doc.news() {
        let _ = writeln!(user, "{}. [{}] {}", item.id, item.source_name, item.title);
        let _ = writeln!(user, "   URL: {}", item.url);
        if !item.description.is_empty() {
            let _ = writeln!(user, "   Description: {}", item.description);
        }
    }

    let categories = Category::ALL.iter().map(|c| c.as_str()).join(", ");
    let _ = write!(
        user,
        r#"
---

Answer with this JSON object and nothing else:

{{
  "summary": "3-5 sentence overview of the whole market",
  "price_impact": "how today's news sentiment relates to the price changes above",
  "items": [
    {{"id": <item number>, "category": "<category>", "digest": "one-line summary", "price_impact": "optional note"}}
  ]
}}

Rules:
- "items" must contain exactly one entry for every news item number above ({count} in total), and no others.
- "category" must be one of: {categories}.
- "summary" and "price_impact" must not be empty.
"#,
        count = doc.news_count(),
    );

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Strip an optional ```json fence around the reply.
fn extract_json(reply: &str) -> &str {
    FENCED_JSON
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(reply)
        .trim()
}

/// Parse and validate a reply against the ids that were submitted.
pub fn parse_reply(reply: &str, expected_ids: &[usize]) -> Result<Classification, ClassificationError> {
    let raw: RawReply = serde_json::from_str(extract_json(reply)).map_err(|e| {
        if looks_truncated(&e) {
            ClassificationError::Truncated
        } else {
            ClassificationError::MalformedJson(e)
        }
    })?;

    let schema = |msg: String| ClassificationError::Schema(msg);

    let summary = raw
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| schema("summary is missing or empty".into()))?;
    let price_impact = raw
        .price_impact
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| schema("price_impact is missing or empty".into()))?;
    let items = raw.items.ok_or_else(|| schema("items is missing".into()))?;

    if items.len() != expected_ids.len() {
        return Err(schema(format!(
            "expected {} items, got {}",
            expected_ids.len(),
            items.len()
        )));
    }
    let duplicates: Vec<usize> = items.iter().map(|i| i.id).duplicates().collect();
    if !duplicates.is_empty() {
        return Err(schema(format!("duplicate item ids {duplicates:?}")));
    }
    let expected: HashSet<usize> = expected_ids.iter().copied().collect();
    if let Some(unknown) = items.iter().find(|i| !expected.contains(&i.id)) {
        return Err(schema(format!("unknown item id {}", unknown.id)));
    }

    let mut classified = HashMap::with_capacity(items.len());
    for item in items {
        let category = parse_category(&item.category)
            .ok_or_else(|| schema(format!("item {} has unknown category {:?}", item.id, item.category)))?;
        classified.insert(
            item.id,
            ItemClassification {
                category,
                digest: item.digest.trim().to_string(),
                price_impact: item
                    .price_impact
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty()),
            },
        );
    }

    Ok(Classification {
        summary,
        price_impact,
        items: classified,
    })
}

fn parse_category(raw: &str) -> Option<Category> {
    let raw = raw.trim();
    Category::ALL
        .into_iter()
        .find(|c| c.as_str().eq_ignore_ascii_case(raw))
}

/// Copy a validated classification into the document.
pub fn apply(doc: &mut DailyDocument, mut classification: Classification) {
    doc.summary = classification.summary;
    doc.price_impact = classification.price_impact;
    for item in doc.news_mut() {
        if let Some(c) = classification.items.remove(&item.id) {
            item.category = Some(c.category);
            item.summary = c.digest;
            item.price_impact = c.price_impact;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Locale, MarketSnapshot, NewsItem, Quote};
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::Mutex;

    /// Replays a canned reply and remembers the prompt it was given.
    pub(crate) struct CannedLlm {
        pub reply: Result<String, u16>,
        pub seen: Mutex<Option<Prompt>>,
    }

    impl CannedLlm {
        pub(crate) fn ok(reply: impl Into<String>) -> Self {
            Self {
                reply: Ok(reply.into()),
                seen: Mutex::new(None),
            }
        }

        pub(crate) fn failing(status: u16) -> Self {
            Self {
                reply: Err(status),
                seen: Mutex::new(None),
            }
        }
    }

    impl AskAsync for CannedLlm {
        async fn ask(&self, prompt: &Prompt) -> Result<String, ClassificationError> {
            *self.seen.lock().unwrap() = Some(prompt.clone());
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(status) => Err(ClassificationError::Status {
                    status: *status,
                    body: "unavailable".into(),
                }),
            }
        }
    }

    fn item(id: usize, title: &str, locale: Locale) -> NewsItem {
        NewsItem {
            id,
            title: title.into(),
            url: format!("https://example.com/{id}"),
            source_name: "CoinPost".into(),
            published_at: Utc.with_ymd_and_hms(2025, 5, 6, 0, 0, 0).unwrap(),
            locale,
            description: "desc".into(),
            category: None,
            summary: String::new(),
            price_impact: None,
        }
    }

    pub(crate) fn partial_doc() -> DailyDocument {
        let mut market = MarketSnapshot::default();
        market.crypto_prices.insert(
            "bitcoin".into(),
            Quote {
                value: 9_500_000.0,
                change_pct: 2.5,
            },
        );
        DailyDocument {
            date: NaiveDate::from_ymd_opt(2025, 5, 6).unwrap(),
            generated_at: Utc.with_ymd_and_hms(2025, 5, 6, 0, 0, 0).unwrap(),
            weather: vec![],
            market,
            summary: String::new(),
            price_impact: String::new(),
            news_domestic: vec![item(1, "BTC tops 10M yen", Locale::Domestic)],
            news_international: vec![item(2, "SEC delays ETF", Locale::International)],
            sources: vec![],
        }
    }

    pub(crate) const GOOD_REPLY: &str = r#"{
        "summary": "Bitcoin rallied while regulators stalled.",
        "price_impact": "Positive domestic news matched the 2.5% BTC gain.",
        "items": [
            {"id": 2, "category": "regulation-policy", "digest": "SEC pushed back its ETF decision."},
            {"id": 1, "category": "market-trend", "digest": "BTC crossed 10M yen.", "price_impact": "bullish"}
        ]
    }"#;

    #[tokio::test]
    async fn classify_applies_categories_and_summaries() {
        let llm = CannedLlm::ok(GOOD_REPLY);
        let doc = classify(&llm, partial_doc()).await.unwrap();

        assert_eq!(doc.summary, "Bitcoin rallied while regulators stalled.");
        assert!(doc.price_impact.contains("2.5%"));
        let btc = &doc.news_domestic[0];
        assert_eq!(btc.category, Some(Category::MarketTrend));
        assert_eq!(btc.summary, "BTC crossed 10M yen.");
        assert_eq!(btc.price_impact.as_deref(), Some("bullish"));
        let sec = &doc.news_international[0];
        assert_eq!(sec.category, Some(Category::RegulationPolicy));
        assert_eq!(sec.price_impact, None);
    }

    #[tokio::test]
    async fn prompt_lists_items_and_market_data() {
        let llm = CannedLlm::ok(GOOD_REPLY);
        classify(&llm, partial_doc()).await.unwrap();
        let prompt = llm.seen.lock().unwrap().clone().unwrap();
        assert!(prompt.user.contains("1. [CoinPost] BTC tops 10M yen"));
        assert!(prompt.user.contains("2. [CoinPost] SEC delays ETF"));
        assert!(prompt.user.contains("crypto bitcoin: 9500000.00 (+2.50% 24h)"));
        assert!(prompt.user.contains("market-trend, regulation-policy, project-technology, exchange-service, other"));
        assert!(prompt.user.contains("(2 in total)"));
    }

    #[tokio::test]
    async fn llm_failure_is_fatal() {
        let llm = CannedLlm::failing(503);
        let err = classify(&llm, partial_doc()).await.unwrap_err();
        assert!(matches!(err, ClassificationError::Status { status: 503, .. }));
    }

    #[test]
    fn fenced_reply_is_unwrapped() {
        let reply = format!("Here you go:\n```json\n{GOOD_REPLY}\n```\n");
        let parsed = parse_reply(&reply, &[1, 2]).unwrap();
        assert_eq!(parsed.items.len(), 2);
    }

    #[test]
    fn item_count_mismatch_is_a_schema_error() {
        let err = parse_reply(GOOD_REPLY, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ClassificationError::Schema(ref m) if m.contains("expected 3 items, got 2")));
    }

    #[test]
    fn unknown_category_is_a_schema_error() {
        let reply = GOOD_REPLY.replace("market-trend", "gossip");
        let err = parse_reply(&reply, &[1, 2]).unwrap_err();
        assert!(matches!(err, ClassificationError::Schema(ref m) if m.contains("gossip")));
    }

    #[test]
    fn category_match_ignores_case_and_padding() {
        let reply = GOOD_REPLY.replace("\"market-trend\"", "\" Market-Trend \"");
        let parsed = parse_reply(&reply, &[1, 2]).unwrap();
        assert_eq!(parsed.items[&1].category, Category::MarketTrend);
    }

    #[test]
    fn duplicate_ids_are_a_schema_error() {
        let reply = GOOD_REPLY.replace("\"id\": 2", "\"id\": 1");
        let err = parse_reply(&reply, &[1, 2]).unwrap_err();
        assert!(matches!(err, ClassificationError::Schema(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn unknown_ids_are_a_schema_error() {
        let err = parse_reply(GOOD_REPLY, &[1, 3]).unwrap_err();
        assert!(matches!(err, ClassificationError::Schema(ref m) if m.contains("unknown item id 2")));
    }

    #[test]
    fn empty_summary_is_a_schema_error() {
        let reply = GOOD_REPLY.replace("Bitcoin rallied while regulators stalled.", "  ");
        let err = parse_reply(&reply, &[1, 2]).unwrap_err();
        assert!(matches!(err, ClassificationError::Schema(ref m) if m.contains("summary")));
    }

    #[test]
    fn truncated_json_is_reported_as_truncation() {
        let cut = &GOOD_REPLY[..60];
        assert!(matches!(parse_reply(cut, &[1, 2]), Err(ClassificationError::Truncated)));
    }

    #[test]
    fn prose_reply_is_malformed_json() {
        assert!(matches!(
            parse_reply("I cannot help with that.", &[1]),
            Err(ClassificationError::MalformedJson(_))
        ));
    }

    #[test]
    fn empty_day_needs_an_empty_item_list() {
        let reply = r#"{"summary": "Nothing happened.", "price_impact": "Flat.", "items": []}"#;
        let parsed = parse_reply(reply, &[]).unwrap();
        assert!(parsed.items.is_empty());
    }
}

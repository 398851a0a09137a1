//! Stock index quotes from a Yahoo-chart compatible API.

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, instrument};

use super::{PER_SOURCE_CONCURRENCY, get_text};
use crate::config::{Config, IndexSymbol};
use crate::error::FetchError;
use crate::models::{Payload, Quote, SourceRecord};

pub const SOURCE_ID: &str = "indices";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    regular_market_price: Option<f64>,
    chart_previous_close: Option<f64>,
    previous_close: Option<f64>,
}

/// Fetch the latest value of every configured index.
#[instrument(level = "info", skip_all)]
pub async fn fetch(client: &Client, config: &Config) -> Result<Vec<SourceRecord>, FetchError> {
    let base = config.endpoints.stock_base_url.trim_end_matches('/');
    let max_retries = config.fetch.max_retries;

    let records: Vec<SourceRecord> = stream::iter(config.indices.iter())
        .map(|index| fetch_index(client, base, index, max_retries))
        .buffered(PER_SOURCE_CONCURRENCY)
        .try_collect()
        .await?;

    info!(count = records.len(), "Fetched index quotes");
    Ok(records)
}

async fn fetch_index(
    client: &Client,
    base: &str,
    index: &IndexSymbol,
    max_retries: usize,
) -> Result<SourceRecord, FetchError> {
    let url = format!(
        "{base}/v8/finance/chart/{}?range=5d&interval=1d",
        urlencoding::encode(&index.symbol)
    );
    let body = get_text(client, &url, max_retries).await?;
    let quote = parse_chart(&body, &index.symbol)?;
    Ok(SourceRecord {
        source_id: SOURCE_ID.to_string(),
        fetched_at: Utc::now(),
        payload: Payload::Index {
            id: index.id.clone(),
            quote,
        },
        raw_text: body,
    })
}

/// Extract the last price and its change against the previous close.
///
/// A missing previous close yields a NaN change, which validation drops.
pub(crate) fn parse_chart(body: &str, symbol: &str) -> Result<Quote, FetchError> {
    let response: ChartResponse = serde_json::from_str(body)?;
    if let Some(error) = response.chart.error.filter(|e| !e.is_null()) {
        return Err(FetchError::Shape(format!("chart error for {symbol}: {error}")));
    }
    let meta = response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .map(|r| r.meta)
        .ok_or_else(|| FetchError::Shape(format!("no chart result for {symbol}")))?;

    let value = meta
        .regular_market_price
        .ok_or_else(|| FetchError::Shape(format!("no market price for {symbol}")))?;
    let change_pct = match meta.chart_previous_close.or(meta.previous_close) {
        Some(prev) if prev > 0.0 => (value - prev) / prev * 100.0,
        _ => f64::NAN,
    };
    Ok(Quote { value, change_pct })
}

//! Crypto asset prices from a CoinGecko compatible `simple/price` endpoint.
//!
//! All configured ids are requested in one call. Ids missing from the reply,
//! or present without a price in the quote currency, are logged and skipped;
//! a reply with no usable price is a shape error.

use std::collections::HashMap;

use chrono::Utc;
use reqwest::Client;
use tracing::{info, instrument, warn};

use super::get_text;
use crate::config::Config;
use crate::error::FetchError;
use crate::models::{Payload, Quote, SourceRecord};

pub const SOURCE_ID: &str = "crypto";

type PriceResponse = HashMap<String, HashMap<String, Option<f64>>>;

/// Fetch the price and 24h change of every configured asset.
#[instrument(level = "info", skip_all)]
pub async fn fetch(client: &Client, config: &Config) -> Result<Vec<SourceRecord>, FetchError> {
    let base = config.endpoints.crypto_base_url.trim_end_matches('/');
    let ids = config.crypto.ids.join(",");
    let url = format!(
        "{base}/api/v3/simple/price?ids={}&vs_currencies={}&include_24hr_change=true",
        urlencoding::encode(&ids),
        urlencoding::encode(&config.crypto.vs_currency)
    );

    let body = get_text(client, &url, config.fetch.max_retries).await?;
    let records = parse_prices(&body, &config.crypto.ids, &config.crypto.vs_currency)?;
    info!(count = records.len(), "Fetched crypto prices");
    Ok(records)
}

pub(crate) fn parse_prices(
    body: &str,
    ids: &[String],
    vs_currency: &str,
) -> Result<Vec<SourceRecord>, FetchError> {
    let response: PriceResponse = serde_json::from_str(body)?;
    let vs_currency = vs_currency.to_ascii_lowercase();
    let change_key = format!("{vs_currency}_24h_change");
    let fetched_at = Utc::now();

    let mut records = Vec::new();
    for id in ids {
        let Some(fields) = response.get(id) else {
            warn!(%id, "Asset missing from price response");
            continue;
        };
        let Some(value) = fields.get(&vs_currency).copied().flatten() else {
            warn!(%id, %vs_currency, "Asset has no price in the quote currency");
            continue;
        };
        let change_pct = fields.get(&change_key).copied().flatten().unwrap_or(f64::NAN);
        records.push(SourceRecord {
            source_id: SOURCE_ID.to_string(),
            fetched_at,
            payload: Payload::Price {
                symbol: id.clone(),
                quote: Quote { value, change_pct },
            },
            raw_text: serde_json::to_string(fields)?,
        });
    }

    if records.is_empty() {
        return Err(FetchError::Shape(format!(
            "no {vs_currency} price for any requested asset ({})",
            ids.join(",")
        )));
    }
    Ok(records)
}

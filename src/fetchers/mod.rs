//! Source fetchers for weather, index quotes, crypto prices and news feeds.
//!
//! Each fetcher turns one external source into a list of [`SourceRecord`]s or
//! a [`FetchError`]. [`fetch_all`] runs every source concurrently and settles
//! them into a [`FetchReport`]: a failing source is logged and recorded as a
//! gap, it never aborts the run.
//!
//! # Sources
//!
//! | Source id | Module | Upstream |
//! |-----------|--------|----------|
//! | `weather` | [`weather`] | Open-Meteo forecast API, one call per location |
//! | `indices` | [`stocks`] | Yahoo chart API, one call per symbol |
//! | `crypto` | [`crypto`] | CoinGecko simple price API, one call |
//! | `feed:<name>` | [`rss`] | RSS 2.0 / RDF / Atom feed |

pub mod crypto;
mod retry;
pub mod rss;
pub mod stocks;
pub mod weather;

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, FetchConfig};
use crate::error::FetchError;
use crate::models::{RecordKind, SourceRecord, SourceStatus};
use retry::{BASE_DELAY, with_retry};

/// Maximum concurrent requests issued by one source.
pub(crate) const PER_SOURCE_CONCURRENCY: usize = 4;

/// Everything the fetch stage produced, successful or not.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub records: Vec<SourceRecord>,
    pub statuses: Vec<SourceStatus>,
}

impl FetchReport {
    pub fn failed_sources(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|s| !s.ok)
            .map(|s| s.source_id.as_str())
            .collect()
    }
}

/// Build the HTTP client shared by all fetchers. The timeout bounds every request.
pub fn build_client(fetch: &FetchConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(fetch.user_agent.clone())
        .connect_timeout(Duration::from_secs(fetch.timeout_secs.min(10)))
        .timeout(Duration::from_secs(fetch.timeout_secs))
        .build()
}

/// GET `url` and return the body, retrying transient failures.
#[instrument(level = "debug", skip(client))]
pub(crate) async fn get_text(
    client: &Client,
    url: &str,
    max_retries: usize,
) -> Result<String, FetchError> {
    with_retry(url, max_retries, BASE_DELAY, || async {
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    })
    .await
}

/// Fetch every configured source concurrently and wait for all of them to settle.
#[instrument(level = "info", skip_all)]
pub async fn fetch_all(
    client: &Client,
    config: &Config,
    now: chrono::DateTime<chrono::Utc>,
) -> FetchReport {
    let t0 = std::time::Instant::now();

    let feeds = join_all(config.feeds.iter().map(|feed| {
        settle(
            rss::source_id(feed),
            RecordKind::News,
            rss::fetch(client, feed, &config.fetch, now),
        )
    }));

    let (weather, indices, crypto, feeds) = futures::join!(
        settle(
            weather::SOURCE_ID.to_string(),
            RecordKind::Weather,
            weather::fetch(client, config),
        ),
        settle(
            stocks::SOURCE_ID.to_string(),
            RecordKind::Index,
            stocks::fetch(client, config),
        ),
        settle(
            crypto::SOURCE_ID.to_string(),
            RecordKind::Price,
            crypto::fetch(client, config),
        ),
        feeds,
    );

    let mut report = FetchReport::default();
    for (status, records) in [weather, indices, crypto].into_iter().chain(feeds) {
        report.statuses.push(status);
        report.records.extend(records);
    }

    info!(
        records = report.records.len(),
        sources = report.statuses.len(),
        failed = ?report.failed_sources(),
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "All sources settled"
    );
    report
}

/// Await one source and turn its result into a status plus records.
async fn settle<F>(source_id: String, kind: RecordKind, fut: F) -> (SourceStatus, Vec<SourceRecord>)
where
    F: Future<Output = Result<Vec<SourceRecord>, FetchError>>,
{
    match fut.await {
        Ok(records) => {
            debug!(%source_id, count = records.len(), "Source fetched");
            let status = SourceStatus {
                source_id,
                kind,
                ok: true,
                records: records.len(),
                error: None,
            };
            (status, records)
        }
        Err(e) => {
            warn!(%source_id, %kind, error = %e, "Source failed; continuing without it");
            let status = SourceStatus {
                source_id,
                kind,
                ok: false,
                records: 0,
                error: Some(e.to_string()),
            };
            (status, Vec::new())
        }
    }
}

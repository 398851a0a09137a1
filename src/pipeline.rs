//! One end-to-end digest run: fetch, normalize, classify, archive.

use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use tracing::{info, instrument, warn};

use crate::api::AskAsync;
use crate::archive::{self, ArchiveStore};
use crate::classifier;
use crate::config::Config;
use crate::error::RunError;
use crate::fetchers;
use crate::models::{Archive, DailyDocument};
use crate::normalizer;

/// Per-run parameters that do not belong in the config file.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Calendar day the digest is filed under.
    pub date: NaiveDate,
    pub now: DateTime<Utc>,
    /// Stop after classification; nothing is written.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub date: NaiveDate,
    pub news_count: usize,
    pub failed_sources: Vec<String>,
    /// Number of index entries after the commit, `None` on a dry run.
    pub archive_entries: Option<usize>,
}

/// Run the pipeline once.
///
/// Source failures are absorbed into the document's `sources` list.
/// Classification and persistence failures abort the run, and nothing is
/// written unless classification succeeded. An output directory created
/// by a run that then fails is removed again.
///
/// Sources are always read as of `opts.now`. Outside a dry run, a date
/// other than the current day is only accepted while it has no archive
/// entry yet, so an archived day is never refiled with later news.
#[instrument(level = "info", skip_all, fields(date = %opts.date, dry_run = opts.dry_run))]
pub async fn run<A: AskAsync>(
    config: &Config,
    client: &Client,
    llm: &A,
    store: &ArchiveStore,
    opts: RunOptions,
) -> Result<(DailyDocument, RunSummary), RunError> {
    let created_root = if opts.dry_run {
        false
    } else {
        store.prepare().await?
    };

    let result = run_stages(config, client, llm, store, opts).await;
    if result.is_err() && created_root {
        store.discard_if_empty().await;
    }
    result
}

async fn run_stages<A: AskAsync>(
    config: &Config,
    client: &Client,
    llm: &A,
    store: &ArchiveStore,
    opts: RunOptions,
) -> Result<(DailyDocument, RunSummary), RunError> {
    let t0 = Instant::now();

    let index = if opts.dry_run {
        None
    } else {
        let index = store.load_index().await?;
        check_date(config, &index, opts)?;
        Some(index)
    };

    let report = fetchers::fetch_all(client, config, opts.now).await;
    let failed_sources: Vec<String> = report
        .failed_sources()
        .into_iter()
        .map(str::to_string)
        .collect();

    let doc = normalizer::normalize(opts.date, opts.now, report);
    info!(
        weather = doc.weather.len(),
        indices = doc.market.indices.len(),
        crypto = doc.market.crypto_prices.len(),
        news = doc.news_count(),
        "Normalized sources"
    );

    let doc = classifier::classify(llm, doc).await?;

    let archive_entries = match index {
        None => {
            info!("Dry run, skipping archive write");
            None
        }
        Some(index) => {
            let merged = archive::merge(&index, &doc);
            store.commit(&merged, &doc).await?;
            Some(merged.entries.len())
        }
    };

    let summary = RunSummary {
        date: doc.date,
        news_count: doc.news_count(),
        failed_sources,
        archive_entries,
    };
    info!(
        news = summary.news_count,
        failed = ?summary.failed_sources,
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "Run finished"
    );
    Ok((doc, summary))
}

/// Refuse to file today's sources under a future day or an archived past day.
fn check_date(config: &Config, index: &Archive, opts: RunOptions) -> Result<(), RunError> {
    let today = config.today(opts.now);
    let date = opts.date;
    if date > today {
        return Err(RunError::FutureDate { date, today });
    }
    if date < today {
        if index.get(date).is_some() {
            return Err(RunError::AlreadyArchived { date, today });
        }
        warn!(%date, %today, "Filing current sources under a past day with no archive entry");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::CannedLlm;
    use crate::config::tests::SAMPLE;
    use crate::error::ClassificationError;
    use crate::fetchers::{crypto, rss, stocks, weather};
    use crate::models::Category;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REPLY: &str = r#"{
        "summary": "Bitcoin crossed 10 million yen. Regulators met exchanges.",
        "price_impact": "Bullish headlines matched the BTC gain.",
        "items": [
            {"id": 1, "category": "market-trend", "digest": "BTC above 10M yen."},
            {"id": 2, "category": "regulation-policy", "digest": "FSA reviews exchange rules."}
        ]
    }"#;

    struct Fixture {
        _server: MockServer,
        config: Config,
        root: PathBuf,
    }

    impl Fixture {
        async fn start(weather_ok: bool) -> Self {
            let server = MockServer::start().await;
            let weather_response = if weather_ok {
                ResponseTemplate::new(200).set_body_string(weather::tests::FORECAST)
            } else {
                ResponseTemplate::new(500)
            };
            Mock::given(method("GET"))
                .and(path("/v1/forecast"))
                .respond_with(weather_response)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path_regex(r"^/v8/finance/chart/"))
                .respond_with(ResponseTemplate::new(200).set_body_string(stocks::tests::CHART))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/v3/simple/price"))
                .respond_with(ResponseTemplate::new(200).set_body_string(crypto::tests::PRICES))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/feed"))
                .respond_with(ResponseTemplate::new(200).set_body_string(rss::tests::RSS))
                .mount(&server)
                .await;

            let mut config = Config::from_yaml(SAMPLE).unwrap();
            config.fetch.max_retries = 0;
            config.endpoints.weather_base_url = server.uri();
            config.endpoints.stock_base_url = server.uri();
            config.endpoints.crypto_base_url = server.uri();
            config.feeds.truncate(1);
            config.feeds[0].url = format!("{}/feed", server.uri());

            let root = std::env::temp_dir().join(format!("digest-pipeline-{}", rand::random::<u64>()));
            Self {
                _server: server,
                config,
                root,
            }
        }

        fn options(&self, dry_run: bool) -> RunOptions {
            self.options_for(6, dry_run)
        }

        /// Run in May 2025 at 10:00 JST on the 6th, filed under `day`.
        fn options_for(&self, day: u32, dry_run: bool) -> RunOptions {
            RunOptions {
                date: NaiveDate::from_ymd_opt(2025, 5, day).unwrap(),
                now: Utc.with_ymd_and_hms(2025, 5, 6, 1, 0, 0).unwrap(),
                dry_run,
            }
        }

        fn store(&self) -> ArchiveStore {
            ArchiveStore::new(&self.root)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn full_run_archives_the_classified_document() {
        let fx = Fixture::start(true).await;
        let llm = CannedLlm::ok(REPLY);
        let (doc, summary) = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(false))
            .await
            .unwrap();

        assert_eq!(summary.news_count, 2);
        assert!(summary.failed_sources.is_empty());
        assert_eq!(summary.archive_entries, Some(1));
        assert_eq!(doc.weather.len(), 1);
        assert!(doc.market.indices.contains_key("nikkei225"));
        assert_eq!(doc.market.crypto_prices.len(), 2);
        assert_eq!(doc.news_domestic[0].category, Some(Category::MarketTrend));

        let stored = fx.store().load_document(doc.date).await.unwrap().unwrap();
        assert_eq!(stored.summary, doc.summary);
        assert_eq!(stored.news_domestic[1].summary, "FSA reviews exchange rules.");
        let index = fx.store().load_index().await.unwrap();
        assert_eq!(index.entries[0].headline, "Bitcoin crossed 10 million yen.");
        assert_eq!(index.entries[0].news_count, 2);
    }

    #[tokio::test]
    async fn weather_outage_leaves_a_gap_but_the_run_completes() {
        let fx = Fixture::start(false).await;
        let llm = CannedLlm::ok(REPLY);
        let (doc, summary) = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(false))
            .await
            .unwrap();

        assert!(doc.weather.is_empty());
        assert_eq!(summary.failed_sources, vec!["weather".to_string()]);
        let status = doc.sources.iter().find(|s| s.source_id == "weather").unwrap();
        assert!(!status.ok);
        assert!(status.error.as_deref().unwrap().contains("500"));
        assert!(!doc.market.indices.is_empty());
        assert!(!doc.market.crypto_prices.is_empty());
        assert_eq!(doc.news_count(), 2);
        assert!(fx.store().document_path(doc.date).exists());
    }

    #[tokio::test]
    async fn schema_violation_writes_nothing() {
        let fx = Fixture::start(true).await;
        let bad = REPLY.replace("regulation-policy", "rumours");
        let llm = CannedLlm::ok(bad);
        let err = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(false))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Classification(ClassificationError::Schema(_))));
        // the run created the output directory and removed it again
        assert!(!fx.root.exists());
    }

    #[tokio::test]
    async fn failed_run_keeps_an_existing_output_dir() {
        let fx = Fixture::start(true).await;
        std::fs::create_dir_all(&fx.root).unwrap();
        let llm = CannedLlm::failing(503);
        run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(false))
            .await
            .unwrap_err();
        assert!(fx.root.is_dir());
        assert!(!fx.store().index_path().exists());
    }

    #[tokio::test]
    async fn archived_past_day_is_not_refiled() {
        let fx = Fixture::start(true).await;
        let past = archive::tests::doc(1, "Day one.");
        let store = fx.store();
        store.commit(&archive::merge(&Archive::default(), &past), &past).await.unwrap();
        let before = std::fs::read(store.document_path(past.date)).unwrap();

        let llm = CannedLlm::ok(REPLY);
        let err = run(&fx.config, &Client::new(), &llm, &store, fx.options_for(1, false))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::AlreadyArchived { date, .. } if date == past.date));
        assert_eq!(std::fs::read(store.document_path(past.date)).unwrap(), before);
        assert!(llm.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn archived_past_day_can_still_be_previewed() {
        let fx = Fixture::start(true).await;
        let past = archive::tests::doc(1, "Day one.");
        let store = fx.store();
        store.commit(&archive::merge(&Archive::default(), &past), &past).await.unwrap();

        let llm = CannedLlm::ok(REPLY);
        let (doc, summary) = run(&fx.config, &Client::new(), &llm, &store, fx.options_for(1, true))
            .await
            .unwrap();
        assert_eq!(doc.date, past.date);
        assert_eq!(summary.archive_entries, None);
        assert_eq!(store.load_document(past.date).await.unwrap().unwrap().summary, "Day one.");
    }

    #[tokio::test]
    async fn missed_past_day_is_filed_once() {
        let fx = Fixture::start(true).await;
        let llm = CannedLlm::ok(REPLY);
        let (_, summary) = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options_for(5, false))
            .await
            .unwrap();
        assert_eq!(summary.archive_entries, Some(1));

        let err = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options_for(5, false))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::AlreadyArchived { .. }));
    }

    #[tokio::test]
    async fn future_day_is_rejected() {
        let fx = Fixture::start(true).await;
        let llm = CannedLlm::ok(REPLY);
        let err = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options_for(7, false))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::FutureDate { .. }));
        assert!(!fx.root.exists());
    }

    #[tokio::test]
    async fn llm_outage_aborts_the_run() {
        let fx = Fixture::start(true).await;
        let llm = CannedLlm::failing(503);
        let err = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(false))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Classification(ClassificationError::Status { .. })));
        assert!(!fx.root.exists());
    }

    #[tokio::test]
    async fn rerun_for_the_same_date_replaces_the_entry() {
        let fx = Fixture::start(true).await;
        let llm = CannedLlm::ok(REPLY);
        run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(false))
            .await
            .unwrap();
        let (_, summary) = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(false))
            .await
            .unwrap();

        assert_eq!(summary.archive_entries, Some(1));
        assert_eq!(fx.store().load_index().await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_skips_persistence() {
        let fx = Fixture::start(true).await;
        let llm = CannedLlm::ok(REPLY);
        let (doc, summary) = run(&fx.config, &Client::new(), &llm, &fx.store(), fx.options(true))
            .await
            .unwrap();
        assert_eq!(summary.archive_entries, None);
        assert!(!doc.summary.is_empty());
        assert!(!fx.root.exists());
    }
}

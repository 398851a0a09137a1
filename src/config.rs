//! Run configuration loaded from a YAML file.
//!
//! The whole file deserializes into one immutable [`Config`] that is passed
//! by reference to every stage. Secrets never live in the file: the LLM key is
//! read from the environment variable named by [`LlmConfig::api_key_env`].
//!
//! ```yaml
//! timezone_offset_hours: 9
//! locations:
//!   - { name: Tokyo, latitude: 35.68, longitude: 139.69 }
//! indices:
//!   - { id: nikkei225, symbol: "^N225" }
//! crypto:
//!   vs_currency: jpy
//!   ids: [bitcoin, ethereum]
//! feeds:
//!   - { name: CoinPost, url: "https://coinpost.jp/?feed=rss2", locale: domestic, topic: crypto }
//! llm:
//!   endpoint: https://api.openai.com/v1
//!   model: gpt-4o-mini
//! ```

use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Deserializer};
use tracing::{info, instrument};

use crate::error::ConfigError;
use crate::models::Locale;

/// Upper bound for `fetch.lookback_hours` (one year).
pub const MAX_LOOKBACK_HOURS: i64 = 24 * 365;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Offset used to decide which calendar day a run belongs to.
    #[serde(default = "default_offset_hours")]
    pub timezone_offset_hours: i32,
    pub locations: Vec<Location>,
    pub indices: Vec<IndexSymbol>,
    pub crypto: CryptoConfig,
    pub feeds: Vec<FeedConfig>,
    pub llm: LlmConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub endpoints: Endpoints,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexSymbol {
    /// Key used in the market snapshot (e.g. `nikkei225`).
    pub id: String,
    /// Upstream ticker (e.g. `^N225`).
    pub symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// Quote currency. Stored lowercase, the form price APIs key their replies by.
    #[serde(default = "default_vs_currency", deserialize_with = "lowercase")]
    pub vs_currency: String,
    pub ids: Vec<String>,
}

/// What a feed is about. Only used for logging and source ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedTopic {
    Stock,
    Crypto,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    pub locale: Locale,
    pub topic: FeedTopic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API; `/chat/completions` is appended.
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Extra attempts after a transport failure. Schema errors are never retried.
    #[serde(default)]
    pub max_retries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: usize,
    /// Feed items older than this are ignored.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_retries: default_fetch_retries(),
            lookback_hours: default_lookback_hours(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoints {
    #[serde(default = "default_weather_base")]
    pub weather_base_url: String,
    #[serde(default = "default_stock_base")]
    pub stock_base_url: String,
    #[serde(default = "default_crypto_base")]
    pub crypto_base_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            weather_base_url: default_weather_base(),
            stock_base_url: default_stock_base(),
            crypto_base_url: default_crypto_base(),
        }
    }
}

fn default_offset_hours() -> i32 {
    9
}
fn lowercase<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    String::deserialize(deserializer).map(|s| s.trim().to_ascii_lowercase())
}

fn default_vs_currency() -> String {
    "jpy".to_string()
}
fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.2
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_fetch_timeout() -> u64 {
    15
}
fn default_fetch_retries() -> usize {
    1
}
fn default_lookback_hours() -> i64 {
    24
}
fn default_user_agent() -> String {
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_weather_base() -> String {
    "https://api.open-meteo.com".to_string()
}
fn default_stock_base() -> String {
    "https://query1.finance.yahoo.com".to_string()
}
fn default_crypto_base() -> String {
    "https://api.coingecko.com".to_string()
}

impl Config {
    /// Read, parse and validate a YAML config file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        info!(
            locations = config.locations.len(),
            indices = config.indices.len(),
            crypto = config.crypto.ids.len(),
            feeds = config.feeds.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every required field is present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.locations.is_empty() {
            return invalid("at least one location is required".into());
        }
        for loc in &self.locations {
            if loc.name.trim().is_empty() {
                return invalid("location name must not be empty".into());
            }
            if !(-90.0..=90.0).contains(&loc.latitude) || !(-180.0..=180.0).contains(&loc.longitude)
            {
                return invalid(format!("location {} has out-of-range coordinates", loc.name));
            }
        }
        if self.indices.is_empty() {
            return invalid("at least one index symbol is required".into());
        }
        if self.indices.iter().any(|i| i.id.trim().is_empty() || i.symbol.trim().is_empty()) {
            return invalid("index id and symbol must not be empty".into());
        }
        if self.crypto.ids.is_empty() {
            return invalid("at least one crypto id is required".into());
        }
        if self.feeds.is_empty() {
            return invalid("at least one feed is required".into());
        }
        for feed in &self.feeds {
            check_http_url(&feed.url, &format!("feed {}", feed.name))?;
        }
        check_http_url(&self.llm.endpoint, "llm.endpoint")?;
        check_http_url(&self.endpoints.weather_base_url, "endpoints.weather_base_url")?;
        check_http_url(&self.endpoints.stock_base_url, "endpoints.stock_base_url")?;
        check_http_url(&self.endpoints.crypto_base_url, "endpoints.crypto_base_url")?;
        if self.llm.model.trim().is_empty() {
            return invalid("llm.model must not be empty".into());
        }
        if self.llm.timeout_secs == 0 || self.fetch.timeout_secs == 0 {
            return invalid("timeouts must be greater than zero".into());
        }
        if !(1..=MAX_LOOKBACK_HOURS).contains(&self.fetch.lookback_hours) {
            return invalid(format!(
                "fetch.lookback_hours must be within 1..={MAX_LOOKBACK_HOURS}"
            ));
        }
        if self.crypto.vs_currency.trim().is_empty() {
            return invalid("crypto.vs_currency must not be empty".into());
        }
        if !(-14..=14).contains(&self.timezone_offset_hours) {
            return invalid("timezone_offset_hours must be within -14..=14".into());
        }
        Ok(())
    }

    /// The fixed offset that decides the digest date.
    pub fn timezone(&self) -> FixedOffset {
        // validate() keeps the offset within ±14h, which FixedOffset always accepts.
        FixedOffset::east_opt(self.timezone_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Calendar day `now` falls on in the configured timezone.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone()).date_naive()
    }
}

fn check_http_url(raw: &str, what: &str) -> Result<(), ConfigError> {
    match url::Url::parse(raw) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(()),
        _ => Err(ConfigError::Invalid(format!("{what} is not an http(s) URL: {raw}"))),
    }
}

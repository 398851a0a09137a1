//! Current conditions and today's forecast from an Open-Meteo compatible API.
//!
//! One request per configured location. Any location failing fails the
//! whole weather source so the day's document shows a single, visible gap
//! instead of a partially filled weather section.

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, instrument};

use super::{PER_SOURCE_CONCURRENCY, get_text};
use crate::config::{Config, Location};
use crate::error::FetchError;
use crate::models::{Payload, SourceRecord, WeatherReading};

pub const SOURCE_ID: &str = "weather";

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: Current,
    daily: Daily,
}

#[derive(Debug, Deserialize)]
struct Current {
    temperature_2m: Option<f64>,
    weather_code: Option<u32>,
    wind_speed_10m: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Daily {
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_probability_max: Vec<Option<f64>>,
}

/// Fetch a reading for every configured location.
#[instrument(level = "info", skip_all)]
pub async fn fetch(client: &Client, config: &Config) -> Result<Vec<SourceRecord>, FetchError> {
    let base = config.endpoints.weather_base_url.trim_end_matches('/');
    let max_retries = config.fetch.max_retries;

    let records: Vec<SourceRecord> = stream::iter(config.locations.iter())
        .map(|location| fetch_location(client, base, location, max_retries))
        .buffered(PER_SOURCE_CONCURRENCY)
        .try_collect()
        .await?;

    info!(count = records.len(), "Fetched weather readings");
    Ok(records)
}

async fn fetch_location(
    client: &Client,
    base: &str,
    location: &Location,
    max_retries: usize,
) -> Result<SourceRecord, FetchError> {
    let url = format!(
        "{base}/v1/forecast?latitude={}&longitude={}\
         &current=temperature_2m,weather_code,wind_speed_10m\
         &daily=temperature_2m_max,temperature_2m_min,precipitation_probability_max\
         &timezone=auto&forecast_days=1",
        location.latitude, location.longitude
    );
    let body = get_text(client, &url, max_retries).await?;
    let reading = parse_forecast(&body, location)?;
    Ok(SourceRecord {
        source_id: SOURCE_ID.to_string(),
        fetched_at: Utc::now(),
        payload: Payload::Weather(reading),
        raw_text: body,
    })
}

/// Parse one forecast response. Missing numbers become NaN so validation drops them.
pub(crate) fn parse_forecast(body: &str, location: &Location) -> Result<WeatherReading, FetchError> {
    let response: ForecastResponse = serde_json::from_str(body)?;
    let first = |values: &[Option<f64>]| values.first().copied().flatten().unwrap_or(f64::NAN);

    let code = response
        .current
        .weather_code
        .ok_or_else(|| FetchError::Shape("current.weather_code missing".into()))?;

    Ok(WeatherReading {
        location: location.name.clone(),
        latitude: location.latitude,
        longitude: location.longitude,
        temperature_c: response.current.temperature_2m.unwrap_or(f64::NAN),
        temperature_max_c: first(&response.daily.temperature_2m_max),
        temperature_min_c: first(&response.daily.temperature_2m_min),
        precipitation_probability_pct: first(&response.daily.precipitation_probability_max),
        wind_speed_kmh: response.current.wind_speed_10m.unwrap_or(f64::NAN),
        condition_code: code,
        condition: describe_weather_code(code).to_string(),
    })
}

/// Short text for a WMO weather interpretation code.
pub fn describe_weather_code(code: u32) -> &'static str {
    match code {
        0 => "clear sky",
        1 => "mainly clear",
        2 => "partly cloudy",
        3 => "overcast",
        45 | 48 => "fog",
        51 | 53 | 55 => "drizzle",
        56 | 57 => "freezing drizzle",
        61 | 63 | 65 => "rain",
        66 | 67 => "freezing rain",
        71 | 73 | 75 | 77 => "snow",
        80..=82 => "rain showers",
        85 | 86 => "snow showers",
        95 => "thunderstorm",
        96 | 99 => "thunderstorm with hail",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) const FORECAST: &str = r#"{
        "latitude": 35.7,
        "longitude": 139.7,
        "current": {"time": "2025-05-06T09:00", "temperature_2m": 18.3, "weather_code": 3, "wind_speed_10m": 11.2},
        "daily": {
            "time": ["2025-05-06"],
            "temperature_2m_max": [22.1],
            "temperature_2m_min": [14.0],
            "precipitation_probability_max": [40]
        }
    }"#;

    fn tokyo() -> Location {
        Location {
            name: "Tokyo".into(),
            latitude: 35.68,
            longitude: 139.69,
        }
    }

    #[test]
    fn parses_current_and_daily_blocks() {
        let reading = parse_forecast(FORECAST, &tokyo()).unwrap();
        assert_eq!(reading.location, "Tokyo");
        assert_eq!(reading.temperature_c, 18.3);
        assert_eq!(reading.temperature_max_c, 22.1);
        assert_eq!(reading.temperature_min_c, 14.0);
        assert_eq!(reading.precipitation_probability_pct, 40.0);
        assert_eq!(reading.condition, "overcast");
    }

    #[test]
    fn null_values_become_nan() {
        let body = FORECAST.replace("\"temperature_2m\": 18.3", "\"temperature_2m\": null");
        let reading = parse_forecast(&body, &tokyo()).unwrap();
        assert!(reading.temperature_c.is_nan());
    }

    #[test]
    fn missing_current_block_is_a_decode_error() {
        let err = parse_forecast(r#"{"daily": {}}"#, &tokyo()).unwrap_err();
        assert!(matches!(err, FetchError::Json(_)));
    }

    #[test]
    fn weather_codes_have_descriptions() {
        assert_eq!(describe_weather_code(0), "clear sky");
        assert_eq!(describe_weather_code(81), "rain showers");
        assert_eq!(describe_weather_code(1234), "unknown");
    }

    #[tokio::test]
    async fn fetch_queries_each_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("latitude", "35.68"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FORECAST))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = Config::from_yaml(SAMPLE).unwrap();
        config.endpoints.weather_base_url = server.uri();

        let records = fetch(&Client::new(), &config).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_id, SOURCE_ID);
        assert!(matches!(&records[0].payload, Payload::Weather(w) if w.location == "Tokyo"));
    }
}

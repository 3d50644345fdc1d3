//! Forecast fetch capability and its Open-Meteo implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use crate::error::FetchError;
use crate::types::{
    CurrentConditions, DayForecast, ForecastDocument, HourlyForecast, TemperatureUnit,
    WeatherCondition,
};

pub const OPEN_METEO_URL: &str = "https://api.open-meteo.com";
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_FORECAST_DAYS: u8 = 7;
const USER_AGENT: &str = concat!("Nimbus/", env!("CARGO_PKG_VERSION"));
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Anything that can produce a forecast for a coordinate pair.
#[async_trait]
pub trait ForecastFetcher: Send + Sync {
    async fn fetch_forecast(
        &self,
        locale: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<ForecastDocument, FetchError>;
}

/// Open-Meteo forecast client.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    client: Client,
    base_url: String,
    unit: TemperatureUnit,
    forecast_days: u8,
}

impl OpenMeteoProvider {
    pub fn new(unit: TemperatureUnit) -> Result<Self, FetchError> {
        Self::with_options(OPEN_METEO_URL, unit, DEFAULT_FETCH_TIMEOUT, DEFAULT_FORECAST_DAYS)
    }

    pub fn with_options(
        base_url: &str,
        unit: TemperatureUnit,
        timeout: Duration,
        forecast_days: u8,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            unit,
            forecast_days,
        })
    }

    fn forecast_url(&self, unit: TemperatureUnit, latitude: f64, longitude: f64) -> String {
        format!(
            "{}/v1/forecast?latitude={}&longitude={}\
             &current=temperature_2m,relative_humidity_2m,apparent_temperature,is_day,weather_code,wind_speed_10m\
             &hourly=temperature_2m,weather_code,precipitation_probability\
             &daily=weather_code,temperature_2m_max,temperature_2m_min,precipitation_probability_max,sunrise,sunset\
             &timezone=auto&forecast_days={}&temperature_unit={}",
            self.base_url,
            latitude,
            longitude,
            self.forecast_days,
            unit.api_value()
        )
    }
}

#[async_trait]
impl ForecastFetcher for OpenMeteoProvider {
    #[instrument(skip(self), level = "info")]
    async fn fetch_forecast(
        &self,
        locale: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<ForecastDocument, FetchError> {
        let unit = self.unit.resolve(locale);
        let url = self.forecast_url(unit, latitude, longitude);

        let response = self
            .client
            .get(&url)
            .header("Accept-Language", locale)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            tracing::warn!("Forecast request returned status {}", status);
            return Err(FetchError::from_status(status, retry_after));
        }

        let body: ApiForecast = response.json().await?;
        body.into_document(locale, unit)
    }
}

#[derive(Debug, Deserialize)]
struct ApiForecast {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    timezone: String,
    current: ApiCurrent,
    hourly: ApiHourly,
    daily: ApiDaily,
}

#[derive(Debug, Deserialize)]
struct ApiCurrent {
    time: String,
    temperature_2m: f64,
    #[serde(default)]
    relative_humidity_2m: Option<f64>,
    #[serde(default)]
    apparent_temperature: Option<f64>,
    #[serde(default)]
    is_day: Option<u8>,
    #[serde(default)]
    weather_code: Option<i32>,
    #[serde(default)]
    wind_speed_10m: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiHourly {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    weather_code: Vec<Option<i32>>,
    #[serde(default)]
    precipitation_probability: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct ApiDaily {
    time: Vec<String>,
    weather_code: Vec<Option<i32>>,
    temperature_2m_max: Vec<Option<f64>>,
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_probability_max: Vec<Option<f64>>,
    #[serde(default)]
    sunrise: Vec<Option<String>>,
    #[serde(default)]
    sunset: Vec<Option<String>>,
}

fn parse_time(value: &str) -> Result<NaiveDateTime, FetchError> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|e| FetchError::InvalidResponse(format!("bad time '{}': {}", value, e)))
}

fn percent(value: Option<&Option<f64>>) -> u8 {
    value
        .copied()
        .flatten()
        .map(|v| v.clamp(0.0, 100.0).round() as u8)
        .unwrap_or(0)
}

fn clock_time(value: Option<&Option<String>>) -> Option<NaiveTime> {
    value
        .and_then(|v| v.as_deref())
        .and_then(|v| NaiveDateTime::parse_from_str(v, TIME_FORMAT).ok())
        .map(|dt| dt.time())
}

impl ApiForecast {
    fn into_document(self, locale: &str, unit: TemperatureUnit) -> Result<ForecastDocument, FetchError> {
        let current = CurrentConditions {
            temperature: self.current.temperature_2m,
            feels_like: self.current.apparent_temperature.unwrap_or(self.current.temperature_2m),
            humidity: self
                .current
                .relative_humidity_2m
                .map(|h| h.clamp(0.0, 100.0).round() as u8)
                .unwrap_or(0),
            wind_speed: self.current.wind_speed_10m.unwrap_or(0.0),
            condition: WeatherCondition::from_wmo_code(self.current.weather_code.unwrap_or(0)),
            is_day: self.current.is_day.map(|d| d != 0).unwrap_or(true),
            observed_at: parse_time(&self.current.time)?,
        };

        let mut hourly = Vec::with_capacity(self.hourly.time.len());
        for (i, time) in self.hourly.time.iter().enumerate() {
            // Open-Meteo pads the tail of some series with nulls.
            let Some(Some(temperature)) = self.hourly.temperature_2m.get(i) else {
                continue;
            };
            hourly.push(HourlyForecast {
                time: parse_time(time)?,
                temperature: *temperature,
                condition: WeatherCondition::from_wmo_code(
                    self.hourly.weather_code.get(i).copied().flatten().unwrap_or(0),
                ),
                precipitation_chance: percent(self.hourly.precipitation_probability.get(i)),
            });
        }

        let mut daily = Vec::with_capacity(self.daily.time.len());
        for (i, date) in self.daily.time.iter().enumerate() {
            let (Some(Some(high)), Some(Some(low))) = (
                self.daily.temperature_2m_max.get(i),
                self.daily.temperature_2m_min.get(i),
            ) else {
                continue;
            };
            daily.push(DayForecast {
                date: NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|e| {
                    FetchError::InvalidResponse(format!("bad date '{}': {}", date, e))
                })?,
                high: *high,
                low: *low,
                condition: WeatherCondition::from_wmo_code(
                    self.daily.weather_code.get(i).copied().flatten().unwrap_or(0),
                ),
                precipitation_chance: percent(self.daily.precipitation_probability_max.get(i)),
                sunrise: clock_time(self.daily.sunrise.get(i)),
                sunset: clock_time(self.daily.sunset.get(i)),
            });
        }

        Ok(ForecastDocument {
            latitude: self.latitude,
            longitude: self.longitude,
            timezone: self.timezone,
            locale: locale.to_string(),
            units: unit,
            current,
            hourly,
            daily,
            fetched_at: Utc::now(),
        })
    }
}

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Location id reserved for the device's live GPS-derived position.
///
/// Never assigned to a user-added location.
pub const CURRENT_LOCATION_ID: &str = "current-location";

/// Temperature unit preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Auto,
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Resolve `Auto` against a locale tag such as `en-US` or `fr_FR`.
    pub fn resolve(self, locale: &str) -> Self {
        match self {
            Self::Auto => {
                let region = locale
                    .split(['-', '_'])
                    .nth(1)
                    .map(|r| r.to_ascii_uppercase());
                match region.as_deref() {
                    Some("US") | Some("LR") | Some("MM") => Self::Fahrenheit,
                    _ => Self::Celsius,
                }
            }
            unit => unit,
        }
    }

    /// Query value understood by Open-Meteo.
    pub fn api_value(self) -> &'static str {
        match self {
            Self::Fahrenheit => "fahrenheit",
            _ => "celsius",
        }
    }
}

/// Weather condition categories mapped from WMO codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    #[default]
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    HeavyRain,
    Snow,
    Sleet,
    Thunderstorm,
}

impl WeatherCondition {
    /// Convert WMO weather code to WeatherCondition
    /// See: https://open-meteo.com/en/docs#weathervariables
    pub fn from_wmo_code(code: i32) -> Self {
        match code {
            0 => Self::Clear,
            1..=2 => Self::PartlyCloudy,
            3 => Self::Cloudy,
            45 | 48 => Self::Fog,
            51 | 53 | 55 => Self::Drizzle,
            56 | 57 => Self::Sleet, // Freezing drizzle
            61 | 63 | 80 => Self::Rain,
            65 | 81 | 82 => Self::HeavyRain,
            66 | 67 => Self::Sleet, // Freezing rain
            71 | 73 | 75 | 77 | 85 | 86 => Self::Snow,
            95 | 96 | 99 => Self::Thunderstorm,
            _ => Self::Clear,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Fog => "Fog",
            Self::Drizzle => "Drizzle",
            Self::Rain => "Rain",
            Self::HeavyRain => "Heavy Rain",
            Self::Snow => "Snow",
            Self::Sleet => "Sleet",
            Self::Thunderstorm => "Thunderstorm",
        }
    }

    pub fn icon_name(&self) -> &'static str {
        match self {
            Self::Clear => "sun",
            Self::PartlyCloudy => "cloud_sun",
            Self::Cloudy => "cloud",
            Self::Fog => "cloud_fog",
            Self::Drizzle | Self::Rain | Self::HeavyRain => "cloud_rain",
            Self::Snow | Self::Sleet => "cloud_snow",
            Self::Thunderstorm => "cloud_lightning",
        }
    }
}

/// A resolved coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A location the user tracks weather for.
///
/// `coordinates` is `None` when the upstream location source could not resolve
/// a position (e.g. GPS permission denied for [`CURRENT_LOCATION_ID`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedLocation {
    pub id: String,
    pub name: String,
    pub coordinates: Option<Coordinates>,
}

impl SavedLocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            coordinates: Some(coordinates),
        }
    }

    /// The device GPS location.
    pub fn current(name: impl Into<String>, coordinates: Option<Coordinates>) -> Self {
        Self {
            id: CURRENT_LOCATION_ID.to_string(),
            name: name.into(),
            coordinates,
        }
    }

    pub fn is_current(&self) -> bool {
        self.id == CURRENT_LOCATION_ID
    }

    /// Check an id chosen for a user-added location.
    pub fn validate_id(id: &str) -> Result<(), String> {
        if id.trim().is_empty() {
            return Err("Location id cannot be empty".to_string());
        }
        if id == CURRENT_LOCATION_ID {
            return Err(format!("Location id '{}' is reserved", CURRENT_LOCATION_ID));
        }
        Ok(())
    }
}

/// Current weather conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub temperature: f64,
    pub feels_like: f64,
    pub humidity: u8,
    pub wind_speed: f64,
    pub condition: WeatherCondition,
    pub is_day: bool,
    pub observed_at: NaiveDateTime,
}

/// Hourly forecast entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub time: NaiveDateTime,
    pub temperature: f64,
    pub condition: WeatherCondition,
    pub precipitation_chance: u8,
}

/// Daily forecast entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayForecast {
    pub date: NaiveDate,
    pub high: f64,
    pub low: f64,
    pub condition: WeatherCondition,
    pub precipitation_chance: u8,
    pub sunrise: Option<NaiveTime>,
    pub sunset: Option<NaiveTime>,
}

/// Complete forecast for one coordinate pair.
///
/// Immutable once fetched; a refresh replaces the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDocument {
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    pub locale: String,
    pub units: TemperatureUnit,
    pub current: CurrentConditions,
    pub hourly: Vec<HourlyForecast>,
    pub daily: Vec<DayForecast>,
    pub fetched_at: DateTime<Utc>,
}

impl ForecastDocument {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    pub fn has_current_data(&self) -> bool {
        self.current.temperature.is_finite()
    }

    pub fn has_full_forecast(&self) -> bool {
        !self.hourly.is_empty() && !self.daily.is_empty()
    }
}

/// One persisted row of the forecast cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub location_id: String,
    pub forecast: ForecastDocument,
    /// Fetch completion time, epoch millis.
    pub last_updated: i64,
    pub locale: String,
    pub latitude: f64,
    pub longitude: f64,
    /// First time this location was cached, epoch millis.
    pub created_at: i64,
}

impl CacheEntry {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Short "data age" label for display.
    pub fn age_display(&self, now_ms: i64) -> String {
        crate::freshness::age_display(self.last_updated, now_ms)
    }
}

/// Aggregate diagnostics over the cache table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: u64,
    pub fresh: u64,
    /// Oldest `last_updated`, epoch millis.
    pub oldest: Option<i64>,
    /// Newest `last_updated`, epoch millis.
    pub newest: Option<i64>,
}


#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_wmo_code_clear() {
        assert_eq!(WeatherCondition::from_wmo_code(0), WeatherCondition::Clear);
    }

    #[test]
    fn test_wmo_code_partly_cloudy() {
        assert_eq!(WeatherCondition::from_wmo_code(1), WeatherCondition::PartlyCloudy);
        assert_eq!(WeatherCondition::from_wmo_code(2), WeatherCondition::PartlyCloudy);
    }

    #[test]
    fn test_wmo_code_precipitation() {
        assert_eq!(WeatherCondition::from_wmo_code(53), WeatherCondition::Drizzle);
        assert_eq!(WeatherCondition::from_wmo_code(80), WeatherCondition::Rain);
        assert_eq!(WeatherCondition::from_wmo_code(82), WeatherCondition::HeavyRain);
        assert_eq!(WeatherCondition::from_wmo_code(66), WeatherCondition::Sleet);
        assert_eq!(WeatherCondition::from_wmo_code(86), WeatherCondition::Snow);
        assert_eq!(WeatherCondition::from_wmo_code(99), WeatherCondition::Thunderstorm);
    }

    #[test]
    fn test_wmo_code_unknown_defaults_to_clear() {
        assert_eq!(WeatherCondition::from_wmo_code(999), WeatherCondition::Clear);
        assert_eq!(WeatherCondition::from_wmo_code(-1), WeatherCondition::Clear);
    }

    #[test]
    fn test_condition_icon_name() {
        assert_eq!(WeatherCondition::Clear.icon_name(), "sun");
        assert_eq!(WeatherCondition::Rain.icon_name(), "cloud_rain");
    }

    #[test]
    fn test_unit_resolves_from_locale() {
        assert_eq!(TemperatureUnit::Auto.resolve("en-US"), TemperatureUnit::Fahrenheit);
        assert_eq!(TemperatureUnit::Auto.resolve("en_us"), TemperatureUnit::Fahrenheit);
        assert_eq!(TemperatureUnit::Auto.resolve("fr-FR"), TemperatureUnit::Celsius);
        assert_eq!(TemperatureUnit::Auto.resolve("he"), TemperatureUnit::Celsius);
        assert_eq!(TemperatureUnit::Celsius.resolve("en-US"), TemperatureUnit::Celsius);
    }

    #[test]
    fn test_reserved_location_id_rejected() {
        assert!(SavedLocation::validate_id(CURRENT_LOCATION_ID).is_err());
        assert!(SavedLocation::validate_id("  ").is_err());
        assert!(SavedLocation::validate_id("paris").is_ok());
        assert!(SavedLocation::current("Here", None).is_current());
    }

    #[test]
    fn test_coordinates_validity() {
        assert!(Coordinates::new(40.0, -74.0).is_valid());
        assert!(!Coordinates::new(91.0, 0.0).is_valid());
        assert!(!Coordinates::new(0.0, 181.0).is_valid());
    }

    #[test]
    fn test_forecast_completeness() {
        let mut doc = fixtures::forecast(40.0, -74.0, 70.0);
        assert!(doc.has_current_data());
        assert!(doc.has_full_forecast());
        doc.hourly.clear();
        assert!(!doc.has_full_forecast());
    }

    #[test]
    fn test_entry_age_display() {
        let entry = CacheEntry {
            location_id: "loc-1".to_string(),
            forecast: fixtures::forecast(40.0, -74.0, 70.0),
            last_updated: 0,
            locale: "en".to_string(),
            latitude: 40.0,
            longitude: -74.0,
            created_at: 0,
        };
        assert_eq!(entry.age_display(30_000), "just now");
        assert_eq!(entry.age_display(5 * 60_000), "5m ago");
        assert_eq!(entry.age_display(3 * 3_600_000), "3h ago");
        assert_eq!(entry.age_display(50 * 3_600_000), "2d ago");
        // written "in the future" by another process
        assert_eq!(entry.age_display(-10_000), "just now");
        assert_eq!(entry.age_display(i64::MIN), "just now");
    }
}

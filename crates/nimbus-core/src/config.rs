use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use nimbus_weather::provider::{DEFAULT_FETCH_TIMEOUT, DEFAULT_FORECAST_DAYS, OPEN_METEO_URL};
use nimbus_weather::{
    Coordinates, FreshnessPolicy, RetryConfig, SavedLocation, TemperatureUnit,
    CURRENT_LOCATION_ID,
};

const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "weather_cache.db";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the config file and the weather cache
    pub config_dir: PathBuf,

    #[serde(default)]
    pub weather: WeatherConfig,

    /// Saved locations, in display order
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default)]
    pub temperature_unit: TemperatureUnit,

    /// Locale tag used for fetches, e.g. `en-US`
    #[serde(default = "default_locale")]
    pub locale: String,

    /// Cached data younger than this is shown without a network call
    #[serde(default = "default_serve_threshold_minutes")]
    pub serve_threshold_minutes: u64,

    /// Cached data this old is evicted on startup
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_forecast_days")]
    pub forecast_days: u8,

    /// Retries for non-active locations
    #[serde(default = "default_background_max_retries")]
    pub background_max_retries: u32,
}

fn default_api_base_url() -> String {
    OPEN_METEO_URL.to_string()
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_serve_threshold_minutes() -> u64 {
    30
}

fn default_retention_hours() -> u64 {
    24
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT.as_secs()
}

fn default_forecast_days() -> u8 {
    DEFAULT_FORECAST_DAYS
}

fn default_background_max_retries() -> u32 {
    1
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            temperature_unit: TemperatureUnit::Auto,
            locale: default_locale(),
            serve_threshold_minutes: default_serve_threshold_minutes(),
            retention_hours: default_retention_hours(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            forecast_days: default_forecast_days(),
            background_max_retries: default_background_max_retries(),
        }
    }
}

/// A saved location as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&LocationConfig> for SavedLocation {
    fn from(location: &LocationConfig) -> Self {
        SavedLocation::new(
            location.id.clone(),
            location.name.clone(),
            Coordinates::new(location.latitude, location.longitude),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nimbus");

        Self::with_dir(config_dir)
    }
}

impl Config {
    /// Default configuration rooted at `config_dir`.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            weather: WeatherConfig::default(),
            locations: Vec::new(),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    /// Load from an explicit path, writing defaults there if it is missing.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let config = Self::with_dir(dir);
            config.save_to(path)?;
            tracing::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Warnings are logged; errors fail the load.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let weather = &self.weather;

        self.validate_url(&weather.api_base_url, "weather.api_base_url", &mut result);

        if weather.locale.trim().is_empty() {
            result.add_error("weather.locale", "Locale cannot be empty");
        }

        if weather.serve_threshold_minutes == 0 {
            result.add_error(
                "weather.serve_threshold_minutes",
                "Serve threshold must be greater than 0",
            );
        }
        if weather.retention_hours == 0 {
            result.add_error("weather.retention_hours", "Retention must be greater than 0");
        } else if weather.serve_threshold_minutes >= weather.retention_hours.saturating_mul(60) {
            result.add_error(
                "weather.serve_threshold_minutes",
                "Serve threshold must be shorter than retention",
            );
        }

        if weather.fetch_timeout_secs == 0 {
            result.add_error(
                "weather.fetch_timeout_secs",
                "Fetch timeout must be greater than 0",
            );
        } else if weather.fetch_timeout_secs > 60 {
            result.add_warning(
                "weather.fetch_timeout_secs",
                "Fetch timeout is unusually long (>60s)",
            );
        }

        if !(1..=16).contains(&weather.forecast_days) {
            result.add_error(
                "weather.forecast_days",
                format!("Forecast days must be 1-16, got {}", weather.forecast_days),
            );
        }

        if weather.background_max_retries > 3 {
            result.add_warning(
                "weather.background_max_retries",
                "More than 3 background retries per location",
            );
        }

        if self.locations.is_empty() {
            result.add_warning("locations", "No saved locations configured");
        }

        let mut seen = HashSet::new();
        for (i, location) in self.locations.iter().enumerate() {
            let field = format!("locations[{}]", i);
            if let Err(message) = SavedLocation::validate_id(&location.id) {
                result.add_error(format!("{}.id", field), message);
            }
            if !seen.insert(location.id.as_str()) {
                result.add_error(
                    format!("{}.id", field),
                    format!("Duplicate location id '{}'", location.id),
                );
            }
            if !Coordinates::new(location.latitude, location.longitude).is_valid() {
                result.add_error(
                    field,
                    format!(
                        "Coordinates out of range: {}, {}",
                        location.latitude, location.longitude
                    ),
                );
            }
        }

        result
    }

    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path()?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// SQLite file shared by the app and the widget.
    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join(DATABASE_FILE)
    }

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(
            Duration::from_secs(self.weather.serve_threshold_minutes * 60),
            Duration::from_secs(self.weather.retention_hours * 3600),
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.weather.fetch_timeout_secs)
    }

    pub fn background_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.weather.background_max_retries,
            ..RetryConfig::default()
        }
    }

    pub fn saved_locations(&self) -> Vec<SavedLocation> {
        self.locations.iter().map(SavedLocation::from).collect()
    }

    /// Id of the first saved location, or the device location if none.
    pub fn default_active_id(&self) -> String {
        self.locations
            .first()
            .map(|l| l.id.clone())
            .unwrap_or_else(|| CURRENT_LOCATION_ID.to_string())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("nimbus");

        Ok(config_dir.join(CONFIG_FILE))
    }
}

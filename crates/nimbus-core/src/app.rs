use std::sync::Arc;

use nimbus_weather::{
    ForecastFetcher, OpenMeteoProvider, RefreshMode, RefreshOrchestrator, StorageError,
    WeatherCoordinator, WeatherError, WeatherState, WeatherStore,
};

use crate::error::{AppError, ConfigError};
use crate::Config;

/// Main application state and lifecycle manager
///
/// Every component is built here and passed down explicitly.
pub struct App {
    config: Arc<Config>,
    store: Arc<WeatherStore>,
    coordinator: WeatherCoordinator,
    evicted_at_startup: usize,
}

impl App {
    /// Create the application with the Open-Meteo provider.
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let provider = OpenMeteoProvider::with_options(
            &config.weather.api_base_url,
            config.weather.temperature_unit,
            config.fetch_timeout(),
            config.weather.forecast_days,
        )
        .map_err(WeatherError::from)?;

        Self::with_fetcher(config, Arc::new(provider)).await
    }

    /// Create the application with any forecast source.
    pub async fn with_fetcher(
        config: Config,
        fetcher: Arc<dyn ForecastFetcher>,
    ) -> Result<Self, AppError> {
        let validation = config.validate();
        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()).into());
        }
        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        let path = config.database_path();
        tracing::info!("Opening weather cache at {}", path.display());
        let store = tokio::task::spawn_blocking(move || WeatherStore::open(path))
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!("store open task failed: {}", e)))??;
        let store = Arc::new(store);

        let policy = config.freshness_policy();
        let evicted_at_startup = match evict(&store, &config).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Cache eviction failed: {}", e);
                0
            }
        };

        let orchestrator = Arc::new(RefreshOrchestrator::with_timeout(
            Arc::clone(&store),
            fetcher,
            config.fetch_timeout(),
        ));
        let coordinator = WeatherCoordinator::new(
            orchestrator,
            policy,
            config.background_retry(),
            config.weather.locale.clone(),
        );

        if let Err(e) = coordinator.warm_start().await {
            tracing::warn!("Warm start failed: {}", e);
        }

        tracing::info!("Application initialized successfully");
        Ok(Self {
            config: Arc::new(config),
            store,
            coordinator,
            evicted_at_startup,
        })
    }

    /// Load the active location, then the rest in the background.
    pub async fn sync(&self, active_id: Option<&str>, force: bool) -> WeatherState {
        let active = active_id
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_active_id());
        let mode = if force {
            RefreshMode::Force
        } else {
            RefreshMode::IfStale
        };

        self.coordinator
            .sync(self.config.saved_locations(), &active, mode)
            .await
    }

    /// Delete entries older than the retention threshold.
    pub async fn evict_expired(&self) -> Result<usize, AppError> {
        Ok(evict(&self.store, &self.config).await?)
    }

    /// Entries removed by the opportunistic eviction during startup.
    pub fn evicted_at_startup(&self) -> usize {
        self.evicted_at_startup
    }

    /// Wait for outstanding background refreshes.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down application");
        self.coordinator.wait_for_background().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<WeatherStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &WeatherCoordinator {
        &self.coordinator
    }
}

async fn evict(store: &Arc<WeatherStore>, config: &Config) -> Result<usize, StorageError> {
    let retention = config.freshness_policy().retention_threshold;
    let evicted = store.blocking(move |s| s.evict_older_than(retention)).await?;
    if evicted > 0 {
        tracing::info!("Evicted {} expired forecasts", evicted);
    }
    Ok(evicted)
}

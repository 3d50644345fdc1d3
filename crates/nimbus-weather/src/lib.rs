//! Weather cache and sync engine for Nimbus
//!
//! Persists forecasts in a SQLite file shared by the foreground app and the
//! background widget, collapses duplicate refreshes, and loads the active
//! location ahead of the rest.

pub mod coordinator;
pub mod error;
pub mod freshness;
pub mod provider;
pub mod refresh;
pub mod retry;
pub mod store;
pub mod types;
pub mod widget;

pub use coordinator::{
    FailedLoad, LoadStatus, LocationLoadingState, PendingSync, RefreshMode, RetryRequest,
    WeatherCoordinator, WeatherState,
};
pub use error::{FetchError, StorageError, WeatherError};
pub use freshness::FreshnessPolicy;
pub use provider::{ForecastFetcher, OpenMeteoProvider};
pub use refresh::{RefreshEvent, RefreshOrchestrator, RefreshSource, Refreshed};
pub use retry::RetryConfig;
pub use store::WeatherStore;
pub use types::*;
pub use widget::{render_widget, RenderSource, WidgetRender, WidgetRequest};

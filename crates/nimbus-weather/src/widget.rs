//! One render pass of the background widget.
//!
//! Runs with nothing but the database file: no coordinator and no state left
//! over from the foreground process. Fresh cache renders without touching the
//! network; anything else costs exactly one refresh.

use std::sync::Arc;

use serde::Serialize;

use crate::error::WeatherError;
use crate::freshness::{age_display, now_ms, FreshnessPolicy};
use crate::refresh::RefreshOrchestrator;
use crate::store::WeatherStore;
use crate::types::{CacheEntry, Coordinates, ForecastDocument, CURRENT_LOCATION_ID};

pub const UNAVAILABLE_MESSAGE: &str = "Weather data unavailable. Tap to retry.";

/// Which location to render and how.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetRequest {
    pub location_id: String,
    pub locale: String,
    /// Latest known position; falls back to the cached entry's coordinates.
    pub coordinates: Option<Coordinates>,
}

impl WidgetRequest {
    /// Request for the device location.
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            location_id: CURRENT_LOCATION_ID.to_string(),
            locale: locale.into(),
            coordinates: None,
        }
    }

    pub fn with_location_id(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = location_id.into();
        self
    }

    pub fn with_coordinates(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = Some(coordinates);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderSource {
    Cache,
    Network,
}

/// Result of a render pass, printed as JSON by the widget binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WidgetRender {
    Ready {
        location_id: String,
        forecast: ForecastDocument,
        last_updated: i64,
        age: String,
        source: RenderSource,
    },
    Unavailable {
        location_id: String,
        message: String,
        error: Option<String>,
    },
}

impl WidgetRender {
    pub fn unavailable(location_id: &str, error: Option<&WeatherError>) -> Self {
        Self::Unavailable {
            location_id: location_id.to_string(),
            message: UNAVAILABLE_MESSAGE.to_string(),
            error: error.map(WeatherError::user_message),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Render the widget for `request` from the shared store.
pub async fn render_widget(
    store: &Arc<WeatherStore>,
    orchestrator: &RefreshOrchestrator,
    request: &WidgetRequest,
    policy: &FreshnessPolicy,
) -> WidgetRender {
    let id = request.location_id.clone();

    if let Err(e) = store.blocking(|s| s.initialize()).await {
        tracing::error!("Widget could not open weather cache: {}", e);
        return WidgetRender::unavailable(&id, Some(&WeatherError::Storage(e)));
    }

    let lookup_id = id.clone();
    let cached = store
        .blocking(move |s| Ok(s.get(&lookup_id)))
        .await
        .ok()
        .flatten();

    if let Some(entry) = servable(cached.as_ref(), &request.locale, policy, now_ms()) {
        tracing::debug!("Widget serving fresh cache for {}", id);
        return ready(entry.forecast.clone(), entry.last_updated, &id, RenderSource::Cache);
    }

    let Some(coordinates) = request
        .coordinates
        .or_else(|| cached.as_ref().map(CacheEntry::coordinates))
    else {
        let error = WeatherError::LocationUnavailable(id.clone());
        tracing::warn!("Widget has no coordinates for {}", id);
        return WidgetRender::unavailable(&id, Some(&error));
    };

    match orchestrator
        .refresh(&id, &request.locale, coordinates.latitude, coordinates.longitude)
        .await
    {
        Ok(refreshed) => ready(
            refreshed.document.as_ref().clone(),
            refreshed.last_updated,
            &id,
            RenderSource::Network,
        ),
        Err(e) => {
            tracing::warn!("Widget refresh for {} failed: {}", id, e);
            WidgetRender::unavailable(&id, Some(&e))
        }
    }
}

/// The entry to render without a refresh, judged on the row that was read.
fn servable<'a>(
    cached: Option<&'a CacheEntry>,
    locale: &str,
    policy: &FreshnessPolicy,
    now_ms: i64,
) -> Option<&'a CacheEntry> {
    cached.filter(|e| e.locale == locale && policy.is_fresh(e.last_updated, now_ms))
}

fn ready(forecast: ForecastDocument, last_updated: i64, id: &str, source: RenderSource) -> WidgetRender {
    WidgetRender::Ready {
        location_id: id.to_string(),
        forecast,
        last_updated,
        age: age_display(last_updated, now_ms()),
        source,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::error::FetchError;
    use crate::provider::ForecastFetcher;
    use crate::types::fixtures::forecast;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FakeFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeFetcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ForecastFetcher for FakeFetcher {
        async fn fetch_forecast(
            &self,
            _locale: &str,
            latitude: f64,
            longitude: f64,
        ) -> Result<ForecastDocument, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(FetchError::Network("offline".to_string()))
            } else {
                Ok(forecast(latitude, longitude, 55.0))
            }
        }
    }

    fn setup(fetcher: Arc<FakeFetcher>) -> (Arc<WeatherStore>, RefreshOrchestrator) {
        let store = Arc::new(WeatherStore::in_memory().unwrap());
        let orchestrator = RefreshOrchestrator::new(store.clone(), fetcher);
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_fresh_cache_renders_without_network() {
        let fetcher = FakeFetcher::new(false);
        let (store, orch) = setup(fetcher.clone());
        store
            .upsert(CURRENT_LOCATION_ID, &forecast(40.0, -74.0, 20.0), "en", 40.0, -74.0, now_ms())
            .unwrap();

        let render = render_widget(&store, &orch, &WidgetRequest::new("en"), &FreshnessPolicy::default()).await;

        match render {
            WidgetRender::Ready { forecast, source, age, .. } => {
                assert_eq!(forecast.current.temperature, 20.0);
                assert_eq!(source, RenderSource::Cache);
                assert_eq!(age, "just now");
            }
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_refreshes_once_with_cached_coordinates() {
        let fetcher = FakeFetcher::new(false);
        let (store, orch) = setup(fetcher.clone());
        store
            .upsert(CURRENT_LOCATION_ID, &forecast(40.0, -74.0, 20.0), "en", 40.0, -74.0, 1000)
            .unwrap();

        let render = render_widget(&store, &orch, &WidgetRequest::new("en"), &FreshnessPolicy::default()).await;

        match render {
            WidgetRender::Ready { forecast, source, .. } => {
                assert_eq!(source, RenderSource::Network);
                assert_eq!(forecast.latitude, 40.0);
                assert_eq!(forecast.current.temperature, 55.0);
            }
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(fetcher.calls(), 1);
        assert!(store.is_fresh(CURRENT_LOCATION_ID, FreshnessPolicy::default().serve_threshold));
    }

    #[tokio::test]
    async fn test_other_locale_triggers_refresh() {
        let fetcher = FakeFetcher::new(false);
        let (store, orch) = setup(fetcher.clone());
        store
            .upsert(CURRENT_LOCATION_ID, &forecast(40.0, -74.0, 20.0), "de", 40.0, -74.0, now_ms())
            .unwrap();

        let render = render_widget(&store, &orch, &WidgetRequest::new("en"), &FreshnessPolicy::default()).await;

        assert!(render.is_ready());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_renders_unavailable() {
        let fetcher = FakeFetcher::new(true);
        let (store, orch) = setup(fetcher.clone());
        let request = WidgetRequest::new("en").with_coordinates(Coordinates::new(51.5, -0.1));

        let render = render_widget(&store, &orch, &request, &FreshnessPolicy::default()).await;

        assert_eq!(
            render,
            WidgetRender::Unavailable {
                location_id: CURRENT_LOCATION_ID.to_string(),
                message: UNAVAILABLE_MESSAGE.to_string(),
                error: Some("Network error. Check your connection.".to_string()),
            }
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_coordinates_renders_unavailable_without_fetch() {
        let fetcher = FakeFetcher::new(false);
        let (store, orch) = setup(fetcher.clone());

        let render = render_widget(&store, &orch, &WidgetRequest::new("en"), &FreshnessPolicy::default()).await;

        assert!(!render.is_ready());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_reads_what_another_process_wrote() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weather_cache.db");
        {
            let foreground = WeatherStore::open(&path).unwrap();
            foreground
                .upsert("home", &forecast(48.8, 2.3, 18.0), "fr", 48.8, 2.3, now_ms())
                .unwrap();
        }

        let fetcher = FakeFetcher::new(false);
        let store = Arc::new(WeatherStore::open(&path).unwrap());
        let orch = RefreshOrchestrator::new(store.clone(), fetcher.clone());
        let request = WidgetRequest::new("fr").with_location_id("home");

        let render = render_widget(&store, &orch, &request, &FreshnessPolicy::default()).await;

        match render {
            WidgetRender::Ready { location_id, forecast, source, .. } => {
                assert_eq!(location_id, "home");
                assert_eq!(forecast.current.temperature, 18.0);
                assert_eq!(source, RenderSource::Cache);
            }
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn test_freshness_judged_on_the_row_read() {
        let policy = FreshnessPolicy::default();
        let threshold = policy.serve_threshold.as_millis() as i64;
        let entry = CacheEntry {
            location_id: CURRENT_LOCATION_ID.to_string(),
            forecast: forecast(40.0, -74.0, 20.0),
            last_updated: 10_000,
            locale: "en".to_string(),
            latitude: 40.0,
            longitude: -74.0,
            created_at: 10_000,
        };

        let just_inside = 10_000 + threshold - 1;
        assert_eq!(
            servable(Some(&entry), "en", &policy, just_inside).map(|e| e.last_updated),
            Some(10_000)
        );
        // A newer row written elsewhere after the read does not make this one fresh.
        assert!(servable(Some(&entry), "en", &policy, 10_000 + threshold).is_none());
        assert!(servable(Some(&entry), "de", &policy, just_inside).is_none());
        assert!(servable(None, "en", &policy, just_inside).is_none());
    }

    #[test]
    fn test_render_serializes_with_status_tag() {
        let render = WidgetRender::unavailable("home", None);
        let json = serde_json::to_value(&render).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["message"], UNAVAILABLE_MESSAGE);
        assert!(json["error"].is_null());
    }
}

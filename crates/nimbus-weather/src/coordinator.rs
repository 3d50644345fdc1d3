//! Foreground coordination across saved locations.
//!
//! The active location is refreshed first, with the cached entry shown as a
//! placeholder meanwhile. Once it succeeds, every other saved location is
//! refreshed in the background, each on its own task with its own failure.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{FetchError, WeatherError};
use crate::freshness::{now_ms, FreshnessPolicy};
use crate::refresh::{RefreshOrchestrator, RefreshSource};
use crate::retry::{with_retry, RetryConfig};
use crate::types::{CacheEntry, ForecastDocument, SavedLocation};

/// Load status of one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    Errored,
}

/// UI-facing view of one location's loading progress.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationLoadingState {
    pub status: LoadStatus,
    pub has_current_data: bool,
    pub has_full_forecast: bool,
    /// Fetching with nothing to show yet.
    pub is_loading: bool,
    /// A network fetch is running.
    pub is_fetching: bool,
    pub last_error: Option<WeatherError>,
    /// Epoch millis of the data currently held.
    pub last_updated: Option<i64>,
}

/// Everything needed to replay a failed load exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRequest {
    pub location: SavedLocation,
    pub locale: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedLoad {
    pub error: WeatherError,
    pub retry: RetryRequest,
}

/// What the UI should render for a location.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherState {
    /// Read from the store; may be stale.
    Cached {
        document: Arc<ForecastDocument>,
        last_updated: i64,
    },
    /// Fetched from the network during this session.
    Fresh {
        document: Arc<ForecastDocument>,
        last_updated: i64,
    },
    Loading,
    Error(FailedLoad),
}

impl WeatherState {
    pub fn document(&self) -> Option<&Arc<ForecastDocument>> {
        match self {
            Self::Cached { document, .. } | Self::Fresh { document, .. } => Some(document),
            Self::Loading | Self::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Whether a load may be satisfied by a fresh cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    #[default]
    IfStale,
    Force,
}

/// A sync that has started: the placeholder to show now and the running task.
#[derive(Debug)]
pub struct PendingSync {
    pub placeholder: WeatherState,
    handle: JoinHandle<WeatherState>,
    retry: RetryRequest,
}

impl PendingSync {
    /// Wait for the primary location to finish loading.
    pub async fn wait(self) -> WeatherState {
        match self.handle.await {
            Ok(state) => state,
            Err(e) => WeatherState::Error(FailedLoad {
                error: WeatherError::Fetch(FetchError::Network(format!("sync task failed: {}", e))),
                retry: self.retry,
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct SlotData {
    document: Arc<ForecastDocument>,
    last_updated: i64,
    locale: String,
    from_network: bool,
}

impl SlotData {
    fn from_entry(entry: CacheEntry) -> Self {
        Self {
            document: Arc::new(entry.forecast),
            last_updated: entry.last_updated,
            locale: entry.locale,
            from_network: false,
        }
    }

    fn state(&self, locale: &str) -> WeatherState {
        if self.from_network && self.locale == locale {
            WeatherState::Fresh {
                document: Arc::clone(&self.document),
                last_updated: self.last_updated,
            }
        } else {
            WeatherState::Cached {
                document: Arc::clone(&self.document),
                last_updated: self.last_updated,
            }
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    status: LoadStatus,
    data: Option<SlotData>,
    failure: Option<FailedLoad>,
}

impl Slot {
    fn loading_state(&self) -> LocationLoadingState {
        let fetching = self.status == LoadStatus::Loading;
        LocationLoadingState {
            status: self.status,
            has_current_data: self.data.as_ref().is_some_and(|d| d.document.has_current_data()),
            has_full_forecast: self.data.as_ref().is_some_and(|d| d.document.has_full_forecast()),
            is_loading: fetching && self.data.is_none(),
            is_fetching: fetching,
            last_error: self.failure.as_ref().map(|f| f.error.clone()),
            last_updated: self.data.as_ref().map(|d| d.last_updated),
        }
    }

    fn weather(&self, locale: &str) -> WeatherState {
        if self.status == LoadStatus::Errored {
            if let Some(failure) = &self.failure {
                return WeatherState::Error(failure.clone());
            }
        }
        self.data
            .as_ref()
            .map_or(WeatherState::Loading, |d| d.state(locale))
    }
}

#[derive(Debug, Default)]
struct State {
    locale: String,
    active: Option<String>,
    last_updated: Option<i64>,
    /// Locations of the latest request, replayed into the background after a retry.
    saved: Vec<SavedLocation>,
    slots: HashMap<String, Slot>,
}

struct Inner {
    orchestrator: Arc<RefreshOrchestrator>,
    policy: FreshnessPolicy,
    background_retry: RetryConfig,
    state: Mutex<State>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives loading for the foreground app. Cheap to clone.
#[derive(Clone)]
pub struct WeatherCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WeatherCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherCoordinator")
            .field("state", &*self.inner.state.lock())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl WeatherCoordinator {
    pub fn new(
        orchestrator: Arc<RefreshOrchestrator>,
        policy: FreshnessPolicy,
        background_retry: RetryConfig,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                policy,
                background_retry,
                state: Mutex::new(State {
                    locale: locale.into(),
                    ..State::default()
                }),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<RefreshOrchestrator> {
        &self.inner.orchestrator
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.inner.policy
    }

    pub fn locale(&self) -> String {
        self.inner.state.lock().locale.clone()
    }

    /// Entries fetched under a different locale are never served as fresh.
    pub fn set_locale(&self, locale: impl Into<String>) {
        self.inner.state.lock().locale = locale.into();
    }

    pub fn active(&self) -> Option<String> {
        self.inner.state.lock().active.clone()
    }

    /// Change which location is primary. Running background loads continue.
    pub fn set_active(&self, location_id: &str) {
        let mut state = self.inner.state.lock();
        if state.active.as_deref() != Some(location_id) {
            tracing::debug!("Active location is now {}", location_id);
            state.active = Some(location_id.to_string());
            state.last_updated = state
                .slots
                .get(location_id)
                .and_then(|slot| slot.data.as_ref())
                .map(|d| d.last_updated);
        }
    }

    /// Timestamp of the active location's data, for "data age" display.
    pub fn last_updated(&self) -> Option<i64> {
        self.inner.state.lock().last_updated
    }

    pub fn loading_state(&self, location_id: &str) -> LocationLoadingState {
        self.inner
            .state
            .lock()
            .slots
            .get(location_id)
            .map(Slot::loading_state)
            .unwrap_or_default()
    }

    /// Loading state of every known location, sorted by id.
    pub fn loading_states(&self) -> Vec<(String, LocationLoadingState)> {
        let state = self.inner.state.lock();
        let mut states: Vec<_> = state
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.loading_state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn weather_for(&self, location_id: &str) -> WeatherState {
        let state = self.inner.state.lock();
        state
            .slots
            .get(location_id)
            .map_or(WeatherState::Loading, |slot| slot.weather(&state.locale))
    }

    pub fn active_weather(&self) -> WeatherState {
        match self.active() {
            Some(id) => self.weather_for(&id),
            None => WeatherState::Loading,
        }
    }

    /// Seed slots from every fresh entry in the store.
    pub async fn warm_start(&self) -> Result<usize, WeatherError> {
        let threshold = self.inner.policy.serve_threshold;
        let entries = self
            .inner
            .orchestrator
            .store()
            .blocking(move |s| s.get_all_fresh(threshold))
            .await?;

        let mut state = self.inner.state.lock();
        let locale = state.locale.clone();
        let mut loaded = 0;
        for (id, entry) in entries {
            if entry.locale != locale {
                continue;
            }
            let slot = state.slots.entry(id).or_default();
            if slot.data.is_none() {
                slot.status = LoadStatus::Loaded;
                slot.data = Some(SlotData::from_entry(entry));
                loaded += 1;
            }
        }
        tracing::info!("Warm start loaded {} cached locations", loaded);
        Ok(loaded)
    }

    /// Start loading `saved` with `active_id` first.
    ///
    /// Returns at once with the cached placeholder for the active location.
    pub async fn request(
        &self,
        saved: Vec<SavedLocation>,
        active_id: &str,
        mode: RefreshMode,
    ) -> PendingSync {
        let locale = self.locale();
        self.set_active(active_id);
        self.inner.state.lock().saved = saved.clone();

        let location = saved
            .iter()
            .find(|l| l.id == active_id)
            .cloned()
            .unwrap_or_else(|| SavedLocation {
                id: active_id.to_string(),
                name: active_id.to_string(),
                coordinates: None,
            });
        let retry = RetryRequest {
            location: location.clone(),
            locale: locale.clone(),
        };
        let placeholder = self.load_placeholder(&location.id, &locale).await;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let state = this.refresh_primary(&location, &locale, mode).await;
            if !state.is_error() {
                this.schedule_background(saved, &location.id, &locale);
            }
            state
        });

        PendingSync {
            placeholder,
            handle,
            retry,
        }
    }

    /// Load the active location and schedule the rest; returns the active state.
    pub async fn sync(
        &self,
        saved: Vec<SavedLocation>,
        active_id: &str,
        mode: RefreshMode,
    ) -> WeatherState {
        self.request(saved, active_id, mode).await.wait().await
    }

    /// Replay a failed load with its original location and locale.
    ///
    /// A successful replay of the active location schedules the other saved
    /// locations, as the original request would have.
    pub async fn retry(&self, request: RetryRequest) -> PendingSync {
        let placeholder = self
            .load_placeholder(&request.location.id, &request.locale)
            .await;

        let this = self.clone();
        let RetryRequest { location, locale } = request.clone();
        let handle = tokio::spawn(async move {
            let state = this
                .refresh_primary(&location, &locale, RefreshMode::Force)
                .await;
            if !state.is_error() {
                let saved = {
                    let state = this.inner.state.lock();
                    (state.active.as_deref() == Some(location.id.as_str()))
                        .then(|| state.saved.clone())
                };
                if let Some(saved) = saved {
                    this.schedule_background(saved, &location.id, &locale);
                }
            }
            state
        });

        PendingSync {
            placeholder,
            handle,
            retry: request,
        }
    }

    /// Forget a deleted location, including its cache entry.
    pub async fn remove_location(&self, location_id: &str) -> Result<bool, WeatherError> {
        let id = location_id.to_string();
        let removed = self
            .inner
            .orchestrator
            .store()
            .blocking(move |s| s.delete(&id))
            .await?;

        let mut state = self.inner.state.lock();
        state.slots.remove(location_id);
        state.saved.retain(|l| l.id != location_id);
        if state.active.as_deref() == Some(location_id) {
            state.active = None;
            state.last_updated = None;
        }
        Ok(removed)
    }

    /// Wait for every scheduled background load to finish.
    pub async fn wait_for_background(&self) {
        loop {
            let handles = std::mem::take(&mut *self.inner.background.lock());
            if handles.is_empty() {
                return;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    tracing::warn!("Background refresh task failed: {}", e);
                }
            }
        }
    }

    async fn load_placeholder(&self, location_id: &str, locale: &str) -> WeatherState {
        let id = location_id.to_string();
        let entry = self
            .inner
            .orchestrator
            .store()
            .blocking(move |s| Ok(s.get(&id)))
            .await
            .ok()
            .flatten();

        let mut state = self.inner.state.lock();
        let slot = state.slots.entry(location_id.to_string()).or_default();
        if let Some(entry) = entry {
            let newer = slot
                .data
                .as_ref()
                .map_or(true, |d| d.last_updated < entry.last_updated);
            if newer {
                slot.data = Some(SlotData::from_entry(entry));
            }
        }
        slot.data
            .as_ref()
            .map_or(WeatherState::Loading, |d| d.state(locale))
    }

    async fn refresh_primary(
        &self,
        location: &SavedLocation,
        locale: &str,
        mode: RefreshMode,
    ) -> WeatherState {
        match self
            .load_location(location, locale, mode, &RetryConfig::none())
            .await
        {
            Ok(data) => data.state(locale),
            Err(error) => {
                tracing::error!("Weather for {} unavailable: {}", location.id, error);
                WeatherState::Error(FailedLoad {
                    error,
                    retry: RetryRequest {
                        location: location.clone(),
                        locale: locale.to_string(),
                    },
                })
            }
        }
    }

    fn schedule_background(&self, saved: Vec<SavedLocation>, active_id: &str, locale: &str) {
        let mut handles = Vec::new();
        for location in saved.into_iter().filter(|l| l.id != active_id) {
            let this = self.clone();
            let locale = locale.to_string();
            handles.push(tokio::spawn(async move {
                let retry = this.inner.background_retry.clone();
                if let Err(e) = this
                    .load_location(&location, &locale, RefreshMode::IfStale, &retry)
                    .await
                {
                    tracing::warn!("Background refresh for {} failed: {}", location.id, e);
                }
            }));
        }
        if !handles.is_empty() {
            tracing::debug!("Scheduled {} background refreshes", handles.len());
            let mut background = self.inner.background.lock();
            background.retain(|h| !h.is_finished());
            background.extend(handles);
        }
    }

    async fn load_location(
        &self,
        location: &SavedLocation,
        locale: &str,
        mode: RefreshMode,
        retry: &RetryConfig,
    ) -> Result<SlotData, WeatherError> {
        let Some(coordinates) = location.coordinates else {
            let error = WeatherError::LocationUnavailable(location.name.clone());
            self.record_failure(location, locale, error.clone());
            return Err(error);
        };

        if mode == RefreshMode::IfStale {
            if let Some(data) = self.servable_cache(&location.id, locale).await {
                tracing::debug!("Serving fresh cache for {}", location.id);
                self.record_success(&location.id, data.clone());
                return Ok(data);
            }
        }

        self.mark_loading(&location.id);
        let orchestrator = &self.inner.orchestrator;
        let id = location.id.as_str();
        let result = with_retry(retry, move || {
            orchestrator.refresh(id, locale, coordinates.latitude, coordinates.longitude)
        })
        .await;

        match result {
            Ok(refreshed) => {
                let data = SlotData {
                    document: refreshed.document,
                    last_updated: refreshed.last_updated,
                    locale: locale.to_string(),
                    from_network: refreshed.source != RefreshSource::Cached,
                };
                self.record_success(&location.id, data.clone());
                Ok(data)
            }
            Err(error) => {
                self.record_failure(location, locale, error.clone());
                Err(error)
            }
        }
    }

    async fn servable_cache(&self, location_id: &str, locale: &str) -> Option<SlotData> {
        let id = location_id.to_string();
        let entry = self
            .inner
            .orchestrator
            .store()
            .blocking(move |s| Ok(s.get(&id)))
            .await
            .ok()
            .flatten()?;

        (entry.locale == locale && self.inner.policy.is_fresh(entry.last_updated, now_ms()))
            .then(|| SlotData::from_entry(entry))
    }

    fn mark_loading(&self, location_id: &str) {
        let mut state = self.inner.state.lock();
        state.slots.entry(location_id.to_string()).or_default().status = LoadStatus::Loading;
    }

    fn record_success(&self, location_id: &str, data: SlotData) {
        let mut state = self.inner.state.lock();
        if state.active.as_deref() == Some(location_id) {
            state.last_updated = Some(data.last_updated);
        }
        let slot = state.slots.entry(location_id.to_string()).or_default();
        slot.status = LoadStatus::Loaded;
        slot.data = Some(data);
        slot.failure = None;
    }

    fn record_failure(&self, location: &SavedLocation, locale: &str, error: WeatherError) {
        let mut state = self.inner.state.lock();
        let slot = state.slots.entry(location.id.clone()).or_default();
        slot.status = LoadStatus::Errored;
        slot.failure = Some(FailedLoad {
            error,
            retry: RetryRequest {
                location: location.clone(),
                locale: locale.to_string(),
            },
        });
    }
}

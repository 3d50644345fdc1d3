//! Refresh orchestration: at most one network fetch per location at a time.
//!
//! The in-flight table lives only in this process and starts empty. When a
//! second caller asks for a location that is already being fetched, it gets the
//! cached entry if one exists, otherwise it waits on the running fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{FetchError, WeatherError};
use crate::freshness::now_ms;
use crate::provider::{ForecastFetcher, DEFAULT_FETCH_TIMEOUT};
use crate::store::WeatherStore;
use crate::types::ForecastDocument;

const EVENT_CAPACITY: usize = 64;

/// Result of one completed network fetch, shared by every waiter.
#[derive(Debug, Clone)]
struct Fetched {
    document: Arc<ForecastDocument>,
    fetched_at_ms: i64,
}

type InFlight = Shared<BoxFuture<'static, Result<Fetched, FetchError>>>;
type InFlightTable = Arc<Mutex<HashMap<String, InFlight>>>;

/// Where a refresh result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSource {
    /// This call performed the fetch.
    Network,
    /// Another caller's fetch was awaited.
    Joined,
    /// A fetch was already running; the cached entry was returned instead.
    Cached,
}

#[derive(Debug, Clone)]
pub struct Refreshed {
    pub location_id: String,
    pub document: Arc<ForecastDocument>,
    /// Epoch millis the document was fetched (or cached) at.
    pub last_updated: i64,
    pub source: RefreshSource,
}

/// Broadcast to observers after every fetch completes.
#[derive(Debug, Clone)]
pub enum RefreshEvent {
    Updated {
        location_id: String,
        document: Arc<ForecastDocument>,
    },
    Failed {
        location_id: String,
        error: FetchError,
    },
}

/// Removes the in-flight token when the fetch task ends, even by panic.
struct TokenGuard {
    table: InFlightTable,
    location_id: String,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.location_id);
    }
}

pub struct RefreshOrchestrator {
    store: Arc<WeatherStore>,
    fetcher: Arc<dyn ForecastFetcher>,
    in_flight: InFlightTable,
    events: broadcast::Sender<RefreshEvent>,
    fetch_timeout: Duration,
}

impl std::fmt::Debug for RefreshOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshOrchestrator")
            .field("store", &self.store)
            .field("in_flight", &self.in_flight_count())
            .field("fetch_timeout", &self.fetch_timeout)
            .finish()
    }
}

impl RefreshOrchestrator {
    pub fn new(store: Arc<WeatherStore>, fetcher: Arc<dyn ForecastFetcher>) -> Self {
        Self::with_timeout(store, fetcher, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(
        store: Arc<WeatherStore>,
        fetcher: Arc<dyn ForecastFetcher>,
        fetch_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            fetcher,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            events,
            fetch_timeout,
        }
    }

    pub fn store(&self) -> &Arc<WeatherStore> {
        &self.store
    }

    /// Observe completed fetches.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, location_id: &str) -> bool {
        self.in_flight.lock().contains_key(location_id)
    }

    /// Fetch and persist the forecast for `location_id`, collapsing duplicates.
    ///
    /// # Errors
    /// Returns `WeatherError::Fetch` when the fetch fails or times out. A failed
    /// write to the store is logged and does not fail the refresh.
    pub async fn refresh(
        &self,
        location_id: &str,
        locale: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<Refreshed, WeatherError> {
        let (pending, started) = {
            let mut table = self.in_flight.lock();
            match table.get(location_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let pending = self.start_fetch(location_id, locale, latitude, longitude);
                    table.insert(location_id.to_string(), pending.clone());
                    (pending, true)
                }
            }
        };

        if !started {
            let id = location_id.to_string();
            let cached = self.store.blocking(move |s| Ok(s.get(&id))).await.ok().flatten();
            if let Some(entry) = cached {
                tracing::debug!("Refresh for {} already running; serving cached entry", location_id);
                return Ok(Refreshed {
                    location_id: entry.location_id,
                    document: Arc::new(entry.forecast),
                    last_updated: entry.last_updated,
                    source: RefreshSource::Cached,
                });
            }
            tracing::debug!("Refresh for {} already running; joining it", location_id);
        }

        let fetched = pending.await?;
        Ok(Refreshed {
            location_id: location_id.to_string(),
            document: fetched.document,
            last_updated: fetched.fetched_at_ms,
            source: if started {
                RefreshSource::Network
            } else {
                RefreshSource::Joined
            },
        })
    }

    /// Spawn the fetch-and-persist task. Must be called with the table locked.
    fn start_fetch(&self, location_id: &str, locale: &str, latitude: f64, longitude: f64) -> InFlight {
        let guard = TokenGuard {
            table: Arc::clone(&self.in_flight),
            location_id: location_id.to_string(),
        };
        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        let timeout = self.fetch_timeout;
        let location_id = location_id.to_string();
        let locale = locale.to_string();

        let task = tokio::spawn(async move {
            let _guard = guard;
            tracing::info!("Fetching forecast for {}", location_id);

            let result = match tokio::time::timeout(
                timeout,
                fetcher.fetch_forecast(&locale, latitude, longitude),
            )
            .await
            {
                Ok(Ok(document)) => Ok(Arc::new(document)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(FetchError::Timeout),
            };

            match result {
                Ok(document) => {
                    let fetched_at_ms = now_ms();
                    let doc = Arc::clone(&document);
                    let id = location_id.clone();
                    let persisted = store
                        .blocking(move |s| {
                            s.upsert(&id, &doc, &locale, latitude, longitude, fetched_at_ms)
                        })
                        .await;
                    if let Err(e) = persisted {
                        tracing::warn!("Could not persist forecast for {}: {}", location_id, e);
                    }

                    let _ = events.send(RefreshEvent::Updated {
                        location_id,
                        document: Arc::clone(&document),
                    });
                    Ok(Fetched {
                        document,
                        fetched_at_ms,
                    })
                }
                Err(e) => {
                    tracing::warn!("Forecast fetch for {} failed: {}", location_id, e);
                    let _ = events.send(RefreshEvent::Failed {
                        location_id,
                        error: e.clone(),
                    });
                    Err(e)
                }
            }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Network(format!("refresh task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }
}

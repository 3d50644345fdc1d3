//! Two independently opened store handles on one file stand in for the
//! foreground app and a cold-started widget process.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nimbus_weather::freshness::{now_ms, DEFAULT_SERVE_THRESHOLD};
use nimbus_weather::provider::DEFAULT_FORECAST_DAYS;
use nimbus_weather::{
    render_widget, CurrentConditions, ForecastDocument, FreshnessPolicy, OpenMeteoProvider,
    RefreshOrchestrator, RenderSource, TemperatureUnit, WeatherCondition, WeatherStore,
    WidgetRender, WidgetRequest,
};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn document(temperature: f64) -> ForecastDocument {
    ForecastDocument {
        latitude: 40.0,
        longitude: -74.0,
        timezone: "America/New_York".to_string(),
        locale: "en".to_string(),
        units: TemperatureUnit::Fahrenheit,
        current: CurrentConditions {
            temperature,
            feels_like: temperature,
            humidity: 50,
            wind_speed: 3.0,
            condition: WeatherCondition::Clear,
            is_day: true,
            observed_at: Utc::now().naive_utc(),
        },
        hourly: Vec::new(),
        daily: Vec::new(),
        fetched_at: Utc::now(),
    }
}

fn open_meteo_body() -> serde_json::Value {
    serde_json::json!({
        "latitude": 40.0,
        "longitude": -74.0,
        "timezone": "America/New_York",
        "current": {
            "time": "2026-10-19T09:00",
            "temperature_2m": 48.0,
            "relative_humidity_2m": 70,
            "apparent_temperature": 45.5,
            "is_day": 1,
            "weather_code": 0,
            "wind_speed_10m": 5.1
        },
        "hourly": {
            "time": ["2026-10-19T09:00"],
            "temperature_2m": [48.0],
            "weather_code": [0],
            "precipitation_probability": [0]
        },
        "daily": {
            "time": ["2026-10-19"],
            "weather_code": [0],
            "temperature_2m_max": [58.0],
            "temperature_2m_min": [41.0],
            "precipitation_probability_max": [0],
            "sunrise": ["2026-10-19T07:12"],
            "sunset": ["2026-10-19T18:14"]
        }
    })
}

#[test]
fn second_process_reads_first_process_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weather_cache.db");

    let foreground = WeatherStore::open(&path).unwrap();
    let widget = WeatherStore::open(&path).unwrap();

    let written = document(72.0);
    foreground
        .upsert("loc-1", &written, "en", 40.0, -74.0, 1000)
        .unwrap();

    let seen = widget.get("loc-1").unwrap();
    assert_eq!(seen.forecast, written);
    assert!(widget.is_fresh_at("loc-1", Duration::from_millis(1_800_000), 2000));
    assert!(!widget.is_fresh_at("loc-1", Duration::from_millis(1_800_000), 1_802_001));
    // Still readable once stale.
    assert_eq!(widget.get("loc-1").unwrap().forecast, written);
}

#[test]
fn reopening_does_not_wipe_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weather_cache.db");

    let first = WeatherStore::open(&path).unwrap();
    first
        .upsert("loc-1", &document(60.0), "en", 40.0, -74.0, now_ms())
        .unwrap();

    for _ in 0..3 {
        let again = WeatherStore::open(&path).unwrap();
        again.initialize().unwrap();
        assert!(again.get("loc-1").is_some());
    }
    assert_eq!(first.list_location_ids().unwrap(), vec!["loc-1".to_string()]);
}

#[test]
fn concurrent_writers_on_separate_handles() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weather_cache.db");
    WeatherStore::open(&path).unwrap();

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let path = path.clone();
            std::thread::spawn(move || {
                let store = WeatherStore::open(&path).unwrap();
                for i in 0..25 {
                    let id = format!("w{}-{}", w, i);
                    store
                        .upsert(&id, &document(i as f64), "en", 40.0, -74.0, now_ms())
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let reader = WeatherStore::open(&path).unwrap();
    let stats = reader.stats(DEFAULT_SERVE_THRESHOLD).unwrap();
    assert_eq!(stats.total, 50);
    assert_eq!(reader.get_all_fresh(DEFAULT_SERVE_THRESHOLD).unwrap().len(), 50);
}

#[tokio::test]
async fn widget_fetches_once_then_serves_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let db = dir.path().join("weather_cache.db");
    let request = WidgetRequest::new("en-US").with_coordinates(nimbus_weather::Coordinates::new(40.0, -74.0));
    let policy = FreshnessPolicy::default();

    // Each pass builds everything from scratch, as a new process would.
    let mut sources = Vec::new();
    for _ in 0..2 {
        let store = Arc::new(WeatherStore::open(&db).unwrap());
        let provider = OpenMeteoProvider::with_options(
            &server.uri(),
            TemperatureUnit::Auto,
            Duration::from_secs(5),
            DEFAULT_FORECAST_DAYS,
        )
        .unwrap();
        let orchestrator = RefreshOrchestrator::new(Arc::clone(&store), Arc::new(provider));

        match render_widget(&store, &orchestrator, &request, &policy).await {
            WidgetRender::Ready { forecast, source, .. } => {
                assert_eq!(forecast.current.temperature, 48.0);
                sources.push(source);
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    assert_eq!(sources, vec![RenderSource::Network, RenderSource::Cache]);
}

#[tokio::test]
async fn widget_renders_unavailable_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let store = Arc::new(WeatherStore::open(dir.path().join("weather_cache.db")).unwrap());
    let provider = OpenMeteoProvider::with_options(
        &server.uri(),
        TemperatureUnit::Celsius,
        Duration::from_secs(5),
        DEFAULT_FORECAST_DAYS,
    )
    .unwrap();
    let orchestrator = RefreshOrchestrator::new(Arc::clone(&store), Arc::new(provider));
    let request = WidgetRequest::new("en").with_coordinates(nimbus_weather::Coordinates::new(40.0, -74.0));

    let render = render_widget(&store, &orchestrator, &request, &FreshnessPolicy::default()).await;

    let json = serde_json::to_value(&render).unwrap();
    assert_eq!(json["status"], "unavailable");
    assert_eq!(json["message"], "Weather data unavailable. Tap to retry.");
    assert!(store.get(nimbus_weather::CURRENT_LOCATION_ID).is_none());
}

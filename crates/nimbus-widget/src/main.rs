//! Background widget renderer.
//!
//! Starts cold, shares nothing with the foreground app but the cache file, and
//! always prints one JSON render on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use nimbus_core::Config;
use nimbus_weather::{
    render_widget, Coordinates, OpenMeteoProvider, RefreshOrchestrator, WeatherError,
    WeatherStore, WidgetRender, WidgetRequest, CURRENT_LOCATION_ID,
};

#[derive(Parser)]
#[command(name = "nimbus-widget", about = "Render the weather widget from the shared cache")]
struct Cli {
    /// Location to render.
    #[arg(long, default_value = CURRENT_LOCATION_ID)]
    location_id: String,

    /// Latest known latitude, used when a refresh is needed.
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,

    /// Latest known longitude, used when a refresh is needed.
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,

    /// Locale tag; defaults to the configured locale.
    #[arg(long)]
    locale: Option<String>,

    /// Config file to use instead of the platform default.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    nimbus_core::init()?;
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = loaded.unwrap_or_else(|e| {
        tracing::warn!("Using default config: {:#}", e);
        Config::default()
    });

    let render = render(&cli, &config).await;
    println!("{}", serde_json::to_string(&render)?);
    Ok(())
}

async fn render(cli: &Cli, config: &Config) -> WidgetRender {
    let mut request = WidgetRequest::new(
        cli.locale
            .clone()
            .unwrap_or_else(|| config.weather.locale.clone()),
    )
    .with_location_id(cli.location_id.clone());
    if let (Some(lat), Some(lon)) = (cli.lat, cli.lon) {
        request = request.with_coordinates(Coordinates::new(lat, lon));
    }

    let path = config.database_path();
    let store = match tokio::task::spawn_blocking(move || WeatherStore::open(path)).await {
        Ok(Ok(store)) => Arc::new(store),
        Ok(Err(e)) => {
            tracing::error!("Widget could not open weather cache: {}", e);
            return WidgetRender::unavailable(&request.location_id, Some(&WeatherError::Storage(e)));
        }
        Err(e) => {
            tracing::error!("Widget store task failed: {}", e);
            return WidgetRender::unavailable(&request.location_id, None);
        }
    };

    let provider = match OpenMeteoProvider::with_options(
        &config.weather.api_base_url,
        config.weather.temperature_unit,
        config.fetch_timeout(),
        config.weather.forecast_days,
    ) {
        Ok(provider) => provider,
        Err(e) => {
            return WidgetRender::unavailable(&request.location_id, Some(&WeatherError::Fetch(e)));
        }
    };

    let orchestrator =
        RefreshOrchestrator::with_timeout(Arc::clone(&store), Arc::new(provider), config.fetch_timeout());

    render_widget(&store, &orchestrator, &request, &config.freshness_policy()).await
}

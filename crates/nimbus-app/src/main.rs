//! Foreground entry point: loads the active location first, then keeps the
//! rest of the saved locations warm.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};

use nimbus_core::{App, Config};
use nimbus_weather::freshness::{age_display, now_ms};
use nimbus_weather::{LocationLoadingState, RefreshMode, WeatherState};

/// Nimbus weather
#[derive(Parser)]
#[command(name = "nimbus", about = "Multi-location weather with a shared offline cache")]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the active location, then refresh the other saved locations.
    Sync {
        /// Location to treat as active (defaults to the first saved location).
        #[arg(long)]
        active: Option<String>,

        /// Fetch even when the cache is fresh.
        #[arg(long)]
        force: bool,
    },
    /// Show cache statistics.
    Stats,
    /// Drop a removed location's cached forecast.
    Remove { id: String },
    /// Delete entries older than the retention threshold.
    Evict,
}

#[tokio::main]
async fn main() -> Result<()> {
    nimbus_core::init()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let app = App::new(config).await?;

    match cli.command {
        Command::Sync { active, force } => sync(&app, active.as_deref(), force).await,
        Command::Stats => stats(&app).await?,
        Command::Remove { id } => {
            if app.coordinator().remove_location(&id).await? {
                println!("Removed cached forecast for {}", id);
            } else {
                println!("No cached forecast for {}", id);
            }
        }
        Command::Evict => {
            let evicted = app.evicted_at_startup() + app.evict_expired().await?;
            println!("Evicted {} expired forecasts", evicted);
        }
    }

    app.shutdown().await;
    Ok(())
}

async fn sync(app: &App, active: Option<&str>, force: bool) {
    let active = active
        .map(str::to_string)
        .unwrap_or_else(|| app.config().default_active_id());
    let mode = if force {
        RefreshMode::Force
    } else {
        RefreshMode::IfStale
    };

    let pending = app
        .coordinator()
        .request(app.config().saved_locations(), &active, mode)
        .await;
    println!("Showing: {}", describe(&pending.placeholder));

    let state = pending.wait().await;
    println!("Active:  {}", describe(&state));
    if let Some(updated) = app.coordinator().last_updated() {
        println!("Updated: {}", age_display(updated, now_ms()));
    }

    app.coordinator().wait_for_background().await;

    println!("\nLocations:");
    for (id, loading) in app.coordinator().loading_states() {
        println!("  {:<20} {}", id, describe_loading(&loading));
    }
}

async fn stats(app: &App) -> Result<()> {
    let threshold = app.config().freshness_policy().serve_threshold;
    let stats = app.store().blocking(move |s| s.stats(threshold)).await?;

    println!("Cache: {}", app.config().database_path().display());
    println!("  Entries: {} ({} fresh)", stats.total, stats.fresh);
    if let Some(oldest) = stats.oldest {
        println!("  Oldest:  {}", timestamp(oldest));
    }
    if let Some(newest) = stats.newest {
        println!("  Newest:  {}", timestamp(newest));
    }
    Ok(())
}

fn describe(state: &WeatherState) -> String {
    match state {
        WeatherState::Fresh { document, .. } => format!(
            "{:.0}° {} (live)",
            document.current.temperature,
            document.current.condition.description()
        ),
        WeatherState::Cached {
            document,
            last_updated,
        } => format!(
            "{:.0}° {} (cached {})",
            document.current.temperature,
            document.current.condition.description(),
            age_display(*last_updated, now_ms())
        ),
        WeatherState::Loading => "loading...".to_string(),
        WeatherState::Error(failed) => format!(
            "{} (retry: nimbus sync --active {} --force)",
            failed.error.user_message(),
            failed.retry.location.id
        ),
    }
}

fn describe_loading(state: &LocationLoadingState) -> String {
    let mut parts = vec![format!("{:?}", state.status).to_lowercase()];
    if state.has_full_forecast {
        parts.push("full forecast".to_string());
    } else if state.has_current_data {
        parts.push("current only".to_string());
    }
    if let Some(updated) = state.last_updated {
        parts.push(age_display(updated, now_ms()));
    }
    if let Some(error) = &state.last_error {
        parts.push(format!("error: {}", error.user_message()));
    }
    parts.join(", ")
}

fn timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| format!("{} ({})", t.to_rfc3339(), age_display(ms, now_ms())))
        .unwrap_or_else(|| ms.to_string())
}

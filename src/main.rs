use std::sync::Arc;

use anyhow::Context;
use bike_radar::{
    AutoBookingController, Coordinate, NextbikeClient, RadarScheduler, Settings, SnapshotCache,
};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SESSION_ID: &str = "cli";

/// Keeps the nearest bookable bike reserved around a point.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Nextbike account phone number
    #[arg(long)]
    phone: String,

    /// Nextbike account PIN
    #[arg(long, env = "NEXTBIKE_PIN", hide_env_values = true)]
    pin: String,

    /// City name as listed by Nextbike, e.g. "Berlin"
    #[arg(long)]
    city: String,

    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    #[arg(long, allow_hyphen_values = true)]
    lon: f64,

    /// Search radius in meters
    #[arg(long)]
    radius: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bike_radar=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let settings = Settings::from_env().context("loading settings")?;
    info!(client = ?settings.client, "starting bike radar");

    let client = Arc::new(NextbikeClient::new(settings.client.clone())?);
    let cache = Arc::new(SnapshotCache::new(settings.cache.clone()));
    cache
        .refresh(client.as_ref())
        .await
        .context("loading the first location snapshot")?;
    let refresher = cache.clone().spawn_refresher(client.clone());

    let controller = Arc::new(AutoBookingController::new(
        client.clone(),
        cache.clone(),
        settings.radar.clone(),
    ));

    let session = controller.select_city(&args.city)?;
    let mut session = controller.login(&session, &args.phone, &args.pin).await?;
    session.set_center(Coordinate::new(args.lat, args.lon));
    if let Some(radius) = args.radius {
        session.set_radius(radius, controller.config())?;
    }

    let scheduler = RadarScheduler::new(controller);
    let mut reports = scheduler.start(SESSION_ID, session).await;
    scheduler.enable(SESSION_ID).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            changed = reports.changed() => {
                if changed.is_err() {
                    warn!("session task ended");
                    break;
                }
                let report = reports.borrow_and_update().clone();
                info!(state = ?report.state, "{}", report.status);
            }
        }
    }

    scheduler.shutdown().await;
    refresher.abort();
    Ok(())
}

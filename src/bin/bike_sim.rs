//! ==============================================================================
//! bike_sim.rs - telemetry simulator
//! ==============================================================================
//!
//! purpose:
//!     stands in for the on-bike trackers. each simulated bike rides a
//!     circle around the base point and posts a report to the hub every
//!     tick. every third bike rides a wider circle so that it crosses a
//!     typical fence radius and exercises the breach alerts.
//!
//! usage:
//!     bike-sim --url http://localhost:3001 --bikes 5 --interval-ms 1000
//!
//! ==============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// kilometres per degree of latitude
const KM_PER_DEG: f64 = 111.32;

#[derive(Parser, Debug)]
#[clap(name = "bike-sim", about = "Posts simulated Smart-Cycle telemetry to a hub")]
struct Opts {
    /// hub base url
    #[clap(short = 'u', long, default_value = "http://localhost:3001")]
    url: String,
    /// number of simulated bikes
    #[clap(short = 'n', long, default_value_t = 3)]
    bikes: usize,
    /// delay between rounds
    #[clap(short = 'i', long, default_value_t = 2000)]
    interval_ms: u64,
    /// stop after this many rounds, 0 runs forever
    #[clap(short = 'r', long, default_value_t = 0)]
    rounds: u64,
    #[clap(long, default_value_t = 19.0760, allow_negative_numbers = true)]
    base_lat: f64,
    #[clap(long, default_value_t = 72.8777, allow_negative_numbers = true)]
    base_lng: f64,
    /// track radius in km for the well-behaved bikes
    #[clap(long, default_value_t = 0.6)]
    track_km: f64,
}

struct SimBike {
    id: String,
    track_km: f64,
    phase: f64,
    cruise: f64,
    battery: f64,
}

impl SimBike {
    fn new(index: usize, opts: &Opts) -> Self {
        let wanders = index % 3 == 2;
        Self {
            id: format!("BIKE{:03}", index + 1),
            track_km: if wanders { opts.track_km * 3.0 } else { opts.track_km },
            phase: index as f64 * 0.7,
            cruise: 12.0 + (index % 4) as f64 * 6.0,
            battery: 100.0 - (index * 7 % 30) as f64,
        }
    }

    /// position and speed at a given round
    fn report(&mut self, round: u64, base_lat: f64, base_lng: f64) -> Value {
        let angle = self.phase + round as f64 * 0.05;
        let lat = base_lat + (self.track_km / KM_PER_DEG) * angle.sin();
        let lng = base_lng + (self.track_km / (KM_PER_DEG * base_lat.to_radians().cos())) * angle.cos();

        let speed = (self.cruise + 8.0 * (angle * 3.0).sin()).max(0.0);
        self.battery = (self.battery - 0.05).max(5.0);

        json!({
            "bikeId": self.id,
            "data": {
                "avgSpeed": (speed * 10.0).round() / 10.0,
                "location": { "lat": lat, "lng": lng },
                "battery": self.battery.round(),
                "heading": (angle.to_degrees() + 90.0).rem_euclid(360.0).round(),
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Opts::parse();
    let endpoint = format!("{}/api/bike/data", opts.url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build http client")?;

    let mut fleet: Vec<SimBike> = (0..opts.bikes).map(|i| SimBike::new(i, &opts)).collect();
    info!("Simulating {} bikes against {endpoint}", fleet.len());

    let mut ticker = tokio::time::interval(Duration::from_millis(opts.interval_ms.max(100)));
    let mut round = 0u64;
    loop {
        ticker.tick().await;
        for bike in fleet.iter_mut() {
            let report = bike.report(round, opts.base_lat, opts.base_lng);
            match client.post(&endpoint).json(&report).send().await {
                Ok(res) if res.status().is_success() => {
                    info!("{} -> {}", bike.id, report["data"]["avgSpeed"]);
                }
                Ok(res) => {
                    let status = res.status();
                    let body = res.text().await.unwrap_or_default();
                    warn!("{} rejected ({status}): {body}", bike.id);
                }
                Err(e) => warn!("{} send failed: {e}", bike.id),
            }
        }

        round += 1;
        if opts.rounds > 0 && round >= opts.rounds {
            info!("Finished {round} rounds");
            return Ok(());
        }
    }
}

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::info;

use crate::bike::BikeService;
use crate::config::HubConfig;
use crate::geofence::{GeofencingService, ALERTS_FILE, GEOFENCES_FILE};
use crate::hub::Hub;
use crate::speed_limit::SpeedLimitService;
use crate::store::JsonStore;

/// everything a handler or a socket session can reach
///
/// the services lock internally, so the state itself is shared read-only.
pub struct AppState {
    pub config: HubConfig,
    pub hub: Arc<Hub>,
    pub geofencing: Arc<GeofencingService>,
    pub speed_limits: Arc<SpeedLimitService>,
    pub bikes: Arc<BikeService>,
    pub started: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// create the data layout on disk, then load the services from it
    pub async fn init(config: HubConfig) -> anyhow::Result<SharedState> {
        let store = Arc::new(JsonStore::new());
        let hub = Arc::new(Hub::new(config.websocket.channel_capacity));
        let storage = &config.storage;

        store
            .ensure_dir(&storage.data_dir)
            .await
            .context("Failed to create data directory")?;
        store
            .ensure_file(&storage.file(GEOFENCES_FILE), &Vec::<()>::new())
            .await
            .context("Failed to create geofences file")?;
        store
            .ensure_file(&storage.file(ALERTS_FILE), &Vec::<()>::new())
            .await
            .context("Failed to create alerts file")?;

        let speed_limits = Arc::new(SpeedLimitService::new(
            store.clone(),
            hub.clone(),
            storage,
            config.speed_limit.clone(),
        ));
        speed_limits
            .init_files()
            .await
            .context("Failed to create speed limit files")?;

        let geofencing = Arc::new(
            GeofencingService::load(store.clone(), storage, config.geofence.clone())
                .await
                .context("Failed to load geofencing data")?,
        );

        let bikes = Arc::new(BikeService::new(
            store.clone(),
            hub.clone(),
            geofencing.clone(),
            speed_limits.clone(),
            storage,
            &config.logging,
        ));
        bikes.init_files().await.context("Failed to create bike data files")?;

        info!("Data directory ready at {}", storage.data_dir.display());

        Ok(Arc::new(Self {
            config,
            hub,
            geofencing,
            speed_limits,
            bikes,
            started: Instant::now(),
        }))
    }
}

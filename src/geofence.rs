//! ==============================================================================
//! geofence.rs - circular geofences and breach alerts
//! ==============================================================================
//!
//! purpose:
//!     keeps the fence list and the breach alert list in memory, mirrored to
//!     geofences.json and alerts.json.
//!
//! rules:
//!     - at most one fence is active; setting a fence deactivates the rest
//!     - a bike is outside when haversine(centre, bike) > radius (strict)
//!     - one breach alert per bike per dedup window, newest alerts first,
//!       list capped at max_alerts
//!
//! ==============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{GeofenceConfig, StorageConfig};
use crate::domain::{round2, Alert, AlertKind, Geofence, GeofenceCheck, Location, Status};
use crate::error::{ApiResult, AppError};
use crate::store::{self, JsonStore};

pub const GEOFENCES_FILE: &str = "geofences.json";
pub const ALERTS_FILE: &str = "alerts.json";

/// mean earth radius in kilometres
const EARTH_RADIUS_KM: f64 = 6371.0;

/// great-circle distance in kilometres
pub fn haversine_km(a: &Location, b: &Location) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// test a position against a fence; no fence or no position counts as inside
pub fn check_against(fence: Option<&Geofence>, location: Option<&Location>) -> GeofenceCheck {
    let (Some(fence), Some(location)) = (fence, location) else {
        return GeofenceCheck::default();
    };

    let distance = haversine_km(&fence.base_location, location);
    GeofenceCheck {
        is_outside_fence: distance > fence.radius,
        distance_from_base: distance,
        geofence_id: Some(fence.id.clone()),
    }
}

/// body of a set-geofence request, from REST or the websocket
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_location: Option<Location>,
    #[serde(default)]
    pub radius: Option<f64>,
}

impl GeofenceInput {
    fn validate(&self) -> ApiResult<(Location, f64)> {
        let base = self
            .base_location
            .filter(Location::is_valid)
            .ok_or_else(|| AppError::validation("Base location with lat and lng is required"))?;

        let radius = self
            .radius
            .filter(|r| r.is_finite() && *r > 0.0)
            .ok_or_else(|| AppError::validation("Valid radius (> 0) is required"))?;

        Ok((base, radius))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertFilter {
    pub bike_id: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

/// what one telemetry report did to the fence state
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FenceUpdate {
    pub geofence_result: GeofenceCheck,
    pub alert: Option<Alert>,
}

#[derive(Default)]
struct FenceState {
    geofences: Vec<Geofence>,
    alerts: Vec<Alert>,
}

pub struct GeofencingService {
    store: Arc<JsonStore>,
    geofences_path: PathBuf,
    alerts_path: PathBuf,
    settings: GeofenceConfig,
    state: RwLock<FenceState>,
}

impl GeofencingService {
    /// load fences and alerts from disk
    pub async fn load(
        store: Arc<JsonStore>,
        storage: &StorageConfig,
        settings: GeofenceConfig,
    ) -> store::Result<Self> {
        let geofences_path = storage.file(GEOFENCES_FILE);
        let alerts_path = storage.file(ALERTS_FILE);

        let geofences: Vec<Geofence> = store.read(&geofences_path).await?;
        let alerts: Vec<Alert> = store.read(&alerts_path).await?;
        info!("Loaded {} geofences", geofences.len());
        info!("Loaded {} alerts", alerts.len());

        Ok(Self {
            store,
            geofences_path,
            alerts_path,
            settings,
            state: RwLock::new(FenceState { geofences, alerts }),
        })
    }

    pub async fn set_geofence(&self, input: GeofenceInput) -> ApiResult<Geofence> {
        self.set_geofence_at(input, Utc::now()).await
    }

    pub async fn set_geofence_at(&self, input: GeofenceInput, now: DateTime<Utc>) -> ApiResult<Geofence> {
        let (base_location, radius) = input.validate()?;

        let mut state = self.state.write().await;
        let mut fences = state.geofences.clone();

        let id = input
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("fence_{}", now.timestamp_millis()));
        let created_at = fences
            .iter()
            .find(|f| f.id == id)
            .map(|f| f.created_at)
            .unwrap_or(now);

        let fence = Geofence {
            id: id.clone(),
            name: input.name.unwrap_or_else(|| "Default Fence".to_string()),
            base_location,
            radius,
            is_active: true,
            created_at,
            updated_at: now,
        };

        for f in fences.iter_mut() {
            f.is_active = false;
        }
        match fences.iter_mut().find(|f| f.id == id) {
            Some(slot) => *slot = fence.clone(),
            None => fences.push(fence.clone()),
        }

        self.store.write(&self.geofences_path, &fences).await?;
        state.geofences = fences;

        info!(
            "Geofence {} set: centre ({}, {}), radius {} km",
            fence.id, fence.base_location.lat, fence.base_location.lng, fence.radius
        );
        Ok(fence)
    }

    pub async fn geofences(&self) -> Vec<Geofence> {
        self.state.read().await.geofences.clone()
    }

    pub async fn active_geofence(&self) -> Option<Geofence> {
        let state = self.state.read().await;
        state.geofences.iter().find(|f| f.is_active).cloned()
    }

    pub async fn check(&self, location: Option<&Location>) -> GeofenceCheck {
        let state = self.state.read().await;
        let active = state.geofences.iter().find(|f| f.is_active);
        if active.is_none() {
            debug!("No active geofence found");
        }
        check_against(active, location)
    }

    /// check a reported position and raise a breach alert if needed
    pub async fn process_bike_update(
        &self,
        bike_id: &str,
        location: Option<&Location>,
        now: DateTime<Utc>,
    ) -> ApiResult<FenceUpdate> {
        // held across check and alert creation so two reports cannot both pass the dedup test
        let mut state = self.state.write().await;
        let active = state.geofences.iter().find(|f| f.is_active);
        let check = check_against(active, location);

        debug!(
            "Geofence check for {bike_id}: distance {:.3} km, outside {}",
            check.distance_from_base, check.is_outside_fence
        );

        let alert = if check.is_outside_fence {
            self.create_alert(&mut state, bike_id, location, &check, now).await?
        } else {
            None
        };

        Ok(FenceUpdate { geofence_result: check, alert })
    }

    async fn create_alert(
        &self,
        state: &mut FenceState,
        bike_id: &str,
        location: Option<&Location>,
        check: &GeofenceCheck,
        now: DateTime<Utc>,
    ) -> ApiResult<Option<Alert>> {
        let window = Duration::minutes(self.settings.alert_dedup_minutes);
        let recent = state.alerts.iter().any(|a| {
            a.bike_id == bike_id
                && a.kind == AlertKind::FenceBreach
                && a.status == Status::Active
                && now.signed_duration_since(a.timestamp) < window
        });
        if recent {
            debug!("Breach alert for {bike_id} suppressed, one raised in the last {window}");
            return Ok(None);
        }

        let alert = Alert {
            id: format!("alert_{}_{}", now.timestamp_millis(), bike_id),
            bike_id: bike_id.to_string(),
            kind: AlertKind::FenceBreach,
            message: format!("Bike {bike_id} has left the geo-fence area"),
            distance: round2(check.distance_from_base),
            geofence_id: check.geofence_id.clone(),
            location: location.copied(),
            timestamp: now,
            status: Status::Active,
            acknowledged: false,
            acknowledged_at: None,
        };

        let mut alerts = Vec::with_capacity(state.alerts.len() + 1);
        alerts.push(alert.clone());
        alerts.extend(state.alerts.iter().cloned());
        alerts.truncate(self.settings.max_alerts);

        self.store.write(&self.alerts_path, &alerts).await?;
        state.alerts = alerts;

        warn!("Created geofence alert for bike {bike_id}: {} km from base", alert.distance);
        Ok(Some(alert))
    }

    pub async fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let state = self.state.read().await;
        let matching = state
            .alerts
            .iter()
            .filter(|a| filter.bike_id.as_deref().map_or(true, |id| a.bike_id == id))
            .filter(|a| filter.status.as_deref().map_or(true, |s| a.status.as_str() == s))
            .filter(|a| filter.kind.as_deref().map_or(true, |k| a.kind.as_str() == k))
            .cloned();

        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) -> ApiResult<Option<Alert>> {
        let mut state = self.state.write().await;
        let mut alerts = state.alerts.clone();

        let Some(alert) = alerts.iter_mut().find(|a| a.id == alert_id) else {
            return Ok(None);
        };
        alert.acknowledged = true;
        alert.acknowledged_at = Some(Utc::now());
        let acked = alert.clone();

        self.store.write(&self.alerts_path, &alerts).await?;
        state.alerts = alerts;

        info!("Alert {alert_id} acknowledged");
        Ok(Some(acked))
    }

    /// drop alerts older than `hours`, returns how many went
    pub async fn clear_old_alerts(&self, hours: i64, now: DateTime<Utc>) -> ApiResult<usize> {
        let cutoff = Duration::try_hours(hours)
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| AppError::validation("Hours out of range"))?;

        let mut state = self.state.write().await;
        let before = state.alerts.len();
        let kept: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|a| a.timestamp > cutoff)
            .cloned()
            .collect();
        let cleared = before - kept.len();

        if cleared > 0 {
            self.store.write(&self.alerts_path, &kept).await?;
            state.alerts = kept;
            info!("Cleared {cleared} old alerts");
        }
        Ok(cleared)
    }
}

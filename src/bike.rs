//! ==============================================================================
//! bike.rs - telemetry ingest and the fleet views
//! ==============================================================================
//!
//! purpose:
//!     turns a raw report into a stored record, runs the geofence and speed
//!     checks on it, and answers every "what do the bikes look like" query.
//!
//! ingest pipeline:
//!
//!     report ──> validate ──> enrich ──> geofence ──> speed check
//!                                                          │
//!                   hub <── bikes.json upsert <── daily log append
//!
//! files:
//!     - bikes.json              current state, one entry per bike
//!     - daily/YYYY-MM-DD.json   every accepted report of that day
//!
//! ==============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{LoggingConfig, StorageConfig};
use crate::domain::{
    parse_number, Alert, Bike, BikeFenceBrief, GeofenceCheck, GeofencingSummary, Location, SpeedCheck,
    SpeedViolation, Status, TelemetryData, TelemetryRecord, TelemetryReport,
};
use crate::error::{ApiResult, AppError};
use crate::geofence::GeofencingService;
use crate::hub::Hub;
use crate::speed_limit::SpeedLimitService;
use crate::store::{self, JsonStore};

pub const BIKES_FILE: &str = "bikes.json";

pub const INVALID_DATA_FORMAT: &str = "Invalid data format. Required: bikeId, data";
pub const INVALID_DATA_STRUCTURE: &str = "Invalid data structure. Required: avgSpeed, location, battery";
pub const DATA_RECEIVED: &str = "Data received successfully";

const DATE_FORMAT: &str = "%Y-%m-%d";

// ==============================================================================
// payloads
// ==============================================================================

/// a report that passed validation, numbers already parsed
#[derive(Clone, Debug, PartialEq)]
pub struct ValidReport {
    pub bike_id: String,
    pub data: TelemetryData,
    pub speed: f64,
    pub location: Location,
    pub battery: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedLimitBrief {
    pub limit: Option<f64>,
    pub is_exceeded: bool,
    pub violation: Option<SpeedViolation>,
}

impl From<&SpeedCheck> for SpeedLimitBrief {
    fn from(check: &SpeedCheck) -> Self {
        Self {
            limit: check.speed_limit,
            is_exceeded: check.is_exceeded,
            violation: check.violation.clone(),
        }
    }
}

/// `bikeData` / `bikeSpecificUpdate`: the stored record plus both check results
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BikeDataEvent {
    #[serde(flatten)]
    pub record: TelemetryRecord,
    pub geofencing: GeofenceCheck,
    pub speed_limit: SpeedLimitBrief,
}

/// what a caller gets back after posting a report
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub message: &'static str,
    pub geofencing: GeofenceCheck,
    pub geofence_alert: Option<Alert>,
    pub speed_limit: SpeedCheck,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BikeFenceStatus {
    pub bike_id: String,
    pub location: Option<Location>,
    pub is_outside_fence: bool,
    pub distance_from_base: f64,
    pub geofence_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FenceCounts {
    pub total: usize,
    pub inside: usize,
    pub outside: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceStatusReport {
    pub bike_statuses: Vec<BikeFenceStatus>,
    pub summary: FenceCounts,
}

// ==============================================================================
// validation
// ==============================================================================

pub fn validate(report: TelemetryReport) -> ApiResult<ValidReport> {
    let (bike_id, data) = match (report.bike_id, report.data) {
        (Some(id), Some(data)) if !id.trim().is_empty() => (id, data),
        _ => return Err(AppError::validation(INVALID_DATA_FORMAT)),
    };

    let (raw_speed, raw_location, raw_battery) = match (&data.avg_speed, &data.location, &data.battery) {
        (Some(speed), Some(location), Some(battery)) => (speed, location, battery),
        _ => return Err(AppError::validation(INVALID_DATA_STRUCTURE)),
    };

    let speed = parse_number(raw_speed)
        .filter(|s| *s >= 0.0)
        .ok_or_else(|| AppError::validation("Invalid speed value"))?;

    let location = Location::from_value(raw_location)
        .filter(Location::is_valid)
        .ok_or_else(|| AppError::validation("Invalid location value"))?;

    let battery = parse_number(raw_battery).ok_or_else(|| AppError::validation("Invalid battery value"))?;

    Ok(ValidReport { bike_id, data, speed, location, battery })
}

// ==============================================================================
// service
// ==============================================================================

pub struct BikeService {
    store: Arc<JsonStore>,
    hub: Arc<Hub>,
    geofencing: Arc<GeofencingService>,
    speed_limits: Arc<SpeedLimitService>,
    data_dir: PathBuf,
    bikes_path: PathBuf,
    daily_dir: PathBuf,
    show_bike_data: bool,
}

impl BikeService {
    pub fn new(
        store: Arc<JsonStore>,
        hub: Arc<Hub>,
        geofencing: Arc<GeofencingService>,
        speed_limits: Arc<SpeedLimitService>,
        storage: &StorageConfig,
        logging: &LoggingConfig,
    ) -> Self {
        Self {
            store,
            hub,
            geofencing,
            speed_limits,
            data_dir: storage.data_dir.clone(),
            bikes_path: storage.file(BIKES_FILE),
            daily_dir: storage.daily_dir(),
            show_bike_data: logging.show_bike_data,
        }
    }

    pub async fn init_files(&self) -> store::Result<()> {
        self.store.ensure_dir(&self.data_dir).await?;
        self.store.ensure_dir(&self.daily_dir).await?;
        self.store.ensure_file(&self.bikes_path, &Vec::<Bike>::new()).await?;
        Ok(())
    }

    fn daily_file(&self, date: NaiveDate) -> PathBuf {
        self.daily_dir.join(format!("{}.json", date.format(DATE_FORMAT)))
    }

    pub async fn process_bike_data(&self, report: TelemetryReport) -> ApiResult<IngestOutcome> {
        self.process_bike_data_at(report, Utc::now()).await
    }

    pub async fn process_bike_data_at(&self, report: TelemetryReport, now: DateTime<Utc>) -> ApiResult<IngestOutcome> {
        let valid = validate(report)?;
        let bike_id = valid.bike_id.clone();

        if self.show_bike_data {
            info!(
                "Bike data from {bike_id}: speed {} km/h, battery {}, at ({}, {})",
                valid.speed, valid.battery, valid.location.lat, valid.location.lng
            );
        } else {
            debug!("Processing bike data for {bike_id}");
        }

        let record = TelemetryRecord::enrich(bike_id.clone(), valid.data.clone(), now);
        let fence = self
            .geofencing
            .process_bike_update(&bike_id, Some(&valid.location), now)
            .await?;
        let speed = self
            .speed_limits
            .check_speed_violation_at(&bike_id, valid.speed, now)
            .await?;

        self.append_daily(&record, now).await?;
        let bike = self.upsert_bike(&valid, &fence.geofence_result, &speed, now).await?;

        let event = BikeDataEvent {
            record,
            geofencing: fence.geofence_result.clone(),
            speed_limit: SpeedLimitBrief::from(&speed),
        };
        self.hub.broadcast("bikeData", &event);
        self.hub.broadcast(
            "bikeUpdate",
            &json!({
                "bikeId": bike.bike_id,
                "data": event.record.data,
                "timestamp": event.record.timestamp,
                "geofencing": event.geofencing,
                "speedLimit": event.speed_limit,
            }),
        );
        self.hub.send_to_bike(&bike_id, "bikeSpecificUpdate", &event);

        if let Some(alert) = &fence.alert {
            self.hub.broadcast("geofenceAlert", alert);
        }
        if let Some(violation) = &speed.violation {
            self.hub.broadcast(
                "speedLimitViolation",
                &json!({ "bikeId": bike_id, "violation": violation, "timestamp": now }),
            );
        }

        info!(
            "Data processed for {bike_id}: outside fence {}, {:.3} km from base, speed exceeded {}",
            fence.geofence_result.is_outside_fence, fence.geofence_result.distance_from_base, speed.is_exceeded
        );

        Ok(IngestOutcome {
            message: DATA_RECEIVED,
            geofencing: fence.geofence_result,
            geofence_alert: fence.alert,
            speed_limit: speed,
        })
    }

    async fn append_daily(&self, record: &TelemetryRecord, now: DateTime<Utc>) -> ApiResult<()> {
        let path = self.daily_file(now.date_naive());
        self.store.ensure_dir(&self.daily_dir).await?;
        self.store
            .update(&path, |log: &mut Vec<TelemetryRecord>| log.push(record.clone()))
            .await?;
        debug!("Saved data to daily log: {}", path.display());
        Ok(())
    }

    /// merge the report into bikes.json, returning the stored record
    async fn upsert_bike(
        &self,
        report: &ValidReport,
        fence: &GeofenceCheck,
        speed: &SpeedCheck,
        now: DateTime<Utc>,
    ) -> ApiResult<Bike> {
        let bike = self
            .store
            .update(&self.bikes_path, |bikes: &mut Vec<Bike>| {
                let index = match bikes.iter().position(|b| b.bike_id == report.bike_id) {
                    Some(i) => i,
                    None => {
                        debug!("Created new bike entry for {}", report.bike_id);
                        bikes.push(Bike {
                            bike_id: report.bike_id.clone(),
                            created_at: Some(now),
                            ..Default::default()
                        });
                        bikes.len() - 1
                    }
                };

                let bike = &mut bikes[index];
                bike.last_seen = Some(now);
                bike.current_location = Some(report.location);
                bike.avg_speed = report.speed;
                bike.battery_level = report.battery;
                bike.status = Status::Active;
                bike.is_outside_fence = fence.is_outside_fence;
                bike.distance_from_base = fence.distance_from_base;
                bike.geofence_id = fence.geofence_id.clone();
                bike.speed_limit = speed.speed_limit;
                bike.is_speed_exceeded = speed.is_exceeded;
                if speed.is_exceeded {
                    bike.last_speed_violation = Some(now);
                }
                bike.clone()
            })
            .await?;
        Ok(bike)
    }

    // ==============================================================================
    // fleet views
    // ==============================================================================

    /// re-evaluate a stored bike against the current fence and limit
    async fn refresh(&self, mut bike: Bike) -> ApiResult<Bike> {
        if let Some(location) = bike.current_location {
            let check = self.geofencing.check(Some(&location)).await;
            bike.is_outside_fence = check.is_outside_fence;
            bike.distance_from_base = check.distance_from_base;
            bike.geofence_id = check.geofence_id;
        }

        let limit = self.speed_limits.effective_limit(&bike.bike_id).await?;
        bike.speed_limit = limit.as_ref().map(|l| l.speed_limit);
        bike.speed_limit_set_at = limit.as_ref().map(|l| l.set_at);
        bike.speed_limit_set_by = limit.and_then(|l| l.set_by);
        Ok(bike)
    }

    async fn stored_bikes(&self) -> ApiResult<Vec<Bike>> {
        self.store
            .read_existing(&self.bikes_path)
            .await?
            .ok_or_else(|| AppError::not_found("Bikes data not found"))
    }

    pub async fn all_bikes(&self) -> ApiResult<Vec<Bike>> {
        let stored = self.stored_bikes().await?;
        let mut bikes = Vec::with_capacity(stored.len());
        for bike in stored {
            bikes.push(self.refresh(bike).await?);
        }
        debug!("Retrieved {} bikes", bikes.len());
        Ok(bikes)
    }

    pub async fn bike(&self, bike_id: &str) -> ApiResult<Bike> {
        let bike = self
            .stored_bikes()
            .await?
            .into_iter()
            .find(|b| b.bike_id == bike_id)
            .ok_or_else(|| AppError::not_found("Bike not found"))?;
        self.refresh(bike).await
    }

    pub async fn bikes_outside(&self) -> ApiResult<Vec<Bike>> {
        let bikes = self.all_bikes().await?;
        Ok(bikes.into_iter().filter(|b| b.is_outside_fence).collect())
    }

    pub async fn bikes_inside(&self) -> ApiResult<Vec<Bike>> {
        let bikes = self.all_bikes().await?;
        Ok(bikes.into_iter().filter(|b| !b.is_outside_fence).collect())
    }

    pub async fn geofencing_summary(&self) -> ApiResult<GeofencingSummary> {
        let bikes = self.all_bikes().await?;
        let brief = |b: &Bike| BikeFenceBrief {
            bike_id: b.bike_id.clone(),
            distance_from_base: b.distance_from_base,
            speed_limit: b.speed_limit,
            is_speed_exceeded: b.is_speed_exceeded,
        };

        let (outside, inside): (Vec<&Bike>, Vec<&Bike>) = bikes.iter().partition(|b| b.is_outside_fence);
        Ok(GeofencingSummary {
            total: bikes.len(),
            inside: inside.len(),
            outside: outside.len(),
            inside_bikes: inside.into_iter().map(brief).collect(),
            outside_bikes: outside.into_iter().map(brief).collect(),
        })
    }

    pub async fn geofence_status(&self) -> ApiResult<GeofenceStatusReport> {
        let bikes = self.all_bikes().await?;
        let bike_statuses: Vec<BikeFenceStatus> = bikes
            .into_iter()
            .map(|b| BikeFenceStatus {
                bike_id: b.bike_id,
                location: b.current_location,
                is_outside_fence: b.is_outside_fence,
                distance_from_base: b.distance_from_base,
                geofence_id: b.geofence_id,
            })
            .collect();

        let outside = bike_statuses.iter().filter(|b| b.is_outside_fence).count();
        let summary = FenceCounts {
            total: bike_statuses.len(),
            inside: bike_statuses.len() - outside,
            outside,
        };
        Ok(GeofenceStatusReport { bike_statuses, summary })
    }

    // ==============================================================================
    // daily logs
    // ==============================================================================

    pub async fn latest_bike_data(&self, bike_id: &str) -> ApiResult<TelemetryRecord> {
        self.latest_bike_data_on(bike_id, Utc::now().date_naive()).await
    }

    pub async fn latest_bike_data_on(&self, bike_id: &str, day: NaiveDate) -> ApiResult<TelemetryRecord> {
        let log: Vec<TelemetryRecord> = self
            .store
            .read_existing(&self.daily_file(day))
            .await?
            .ok_or_else(|| AppError::not_found("No data found for today"))?;

        log.into_iter()
            .filter(|r| r.bike_id == bike_id)
            .max_by_key(|r| r.timestamp)
            .ok_or_else(|| AppError::not_found("No data found for this bike today"))
    }

    /// every record of one day; `date` must be YYYY-MM-DD
    pub async fn historical_data(&self, date: &str) -> ApiResult<Vec<TelemetryRecord>> {
        let day = NaiveDate::parse_from_str(date, DATE_FORMAT)
            .map_err(|_| AppError::validation("Invalid date format. Use YYYY-MM-DD"))?;

        let records: Vec<TelemetryRecord> = self
            .store
            .read_existing(&self.daily_file(day))
            .await?
            .ok_or_else(|| AppError::not_found("No data found for this date"))?;

        info!("Found {} records for date {date}", records.len());
        Ok(records)
    }

    pub async fn available_dates(&self) -> ApiResult<Vec<String>> {
        if !self.store.exists(&self.daily_dir).await {
            return Ok(Vec::new());
        }
        let mut dates: Vec<String> = self
            .store
            .list_dir(&self.daily_dir)
            .await?
            .into_iter()
            .filter_map(|name| name.strip_suffix(".json").map(str::to_string))
            .collect();
        dates.sort();
        Ok(dates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeofenceConfig, SpeedLimitConfig};
    use crate::domain::Severity;
    use crate::geofence::{AlertFilter, GeofenceInput};
    use chrono::Duration;
    use serde_json::Value;

    struct Fixture {
        _dir: tempfile::TempDir,
        bikes: BikeService,
        geofencing: Arc<GeofencingService>,
        speed_limits: Arc<SpeedLimitService>,
        hub: Arc<Hub>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig { data_dir: dir.path().to_path_buf(), daily_dir: None };
        let store = Arc::new(JsonStore::new());
        let hub = Arc::new(Hub::new(64));
        let geofencing = Arc::new(
            GeofencingService::load(store.clone(), &storage, GeofenceConfig::default())
                .await
                .unwrap(),
        );
        let speed_limits = Arc::new(SpeedLimitService::new(
            store.clone(),
            hub.clone(),
            &storage,
            SpeedLimitConfig::default(),
        ));
        let bikes = BikeService::new(
            store,
            hub.clone(),
            geofencing.clone(),
            speed_limits.clone(),
            &storage,
            &LoggingConfig::default(),
        );
        bikes.init_files().await.unwrap();
        Fixture { _dir: dir, bikes, geofencing, speed_limits, hub }
    }

    fn report(bike_id: &str, speed: Value, lat: f64, lng: f64) -> TelemetryReport {
        serde_json::from_value(json!({
            "bikeId": bike_id,
            "data": { "avgSpeed": speed, "location": { "lat": lat, "lng": lng }, "battery": 80 }
        }))
        .unwrap()
    }

    async fn mumbai_fence(fx: &Fixture) {
        fx.geofencing
            .set_geofence(GeofenceInput {
                base_location: Some(Location::new(19.0760, 72.8777)),
                radius: Some(1.0),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_validate_messages() {
        let missing_id: TelemetryReport = serde_json::from_value(json!({"data": {}})).unwrap();
        assert_eq!(validate(missing_id).unwrap_err().to_string(), INVALID_DATA_FORMAT);

        let missing_battery: TelemetryReport = serde_json::from_value(json!({
            "bikeId": "B1",
            "data": {"avgSpeed": 10, "location": {"lat": 1.0, "lng": 1.0}}
        }))
        .unwrap();
        assert_eq!(validate(missing_battery).unwrap_err().to_string(), INVALID_DATA_STRUCTURE);

        let bad_speed = report("B1", json!("fast"), 1.0, 1.0);
        assert_eq!(validate(bad_speed).unwrap_err().to_string(), "Invalid speed value");

        let negative = report("B1", json!(-3), 1.0, 1.0);
        assert!(validate(negative).is_err());

        let off_globe = report("B1", json!(10), 95.0, 1.0);
        assert_eq!(validate(off_globe).unwrap_err().to_string(), "Invalid location value");

        let partial: TelemetryReport = serde_json::from_value(json!({
            "bikeId": "B1",
            "data": {"avgSpeed": 10, "location": {"lat": 19.07}, "battery": 80}
        }))
        .unwrap();
        assert_eq!(validate(partial).unwrap_err().to_string(), "Invalid location value");
    }

    #[test]
    fn test_validate_accepts_string_coordinates() {
        let stringy: TelemetryReport = serde_json::from_value(json!({
            "bikeId": "B1",
            "data": {"avgSpeed": "12", "location": {"lat": "19.07", "lng": "72.87"}, "battery": "80"}
        }))
        .unwrap();

        let valid = validate(stringy).unwrap();
        assert_eq!(valid.location, Location::new(19.07, 72.87));
        assert_eq!((valid.speed, valid.battery), (12.0, 80.0));
        assert_eq!(valid.data.location, Some(json!({"lat": "19.07", "lng": "72.87"})));
    }

    #[test]
    fn test_validate_accepts_zero_and_strings() {
        let parked = validate(report("B1", json!(0), 19.0, 72.8)).unwrap();
        assert_eq!(parked.speed, 0.0);

        let stringy = validate(report("B1", json!("12.5"), 19.0, 72.8)).unwrap();
        assert_eq!(stringy.speed, 12.5);
        assert_eq!(stringy.battery, 80.0);
    }

    #[tokio::test]
    async fn test_ingest_updates_bike_and_daily_log() {
        let fx = fixture().await;
        let now = Utc::now();

        let outcome = fx
            .bikes
            .process_bike_data_at(report("B1", json!(14.0), 19.0760, 72.8777), now)
            .await
            .unwrap();
        assert_eq!(outcome.message, DATA_RECEIVED);
        assert!(!outcome.geofencing.is_outside_fence);

        let bike = fx.bikes.bike("B1").await.unwrap();
        assert_eq!(bike.avg_speed, 14.0);
        assert_eq!(bike.status, Status::Active);
        assert_eq!(bike.created_at, Some(now));

        let later = now + Duration::seconds(30);
        fx.bikes
            .process_bike_data_at(report("B1", json!(16.0), 19.0761, 72.8777), later)
            .await
            .unwrap();

        let bike = fx.bikes.bike("B1").await.unwrap();
        assert_eq!(bike.avg_speed, 16.0);
        assert_eq!(bike.created_at, Some(now));
        assert_eq!(bike.last_seen, Some(later));

        let latest = fx.bikes.latest_bike_data_on("B1", now.date_naive()).await.unwrap();
        assert_eq!(latest.timestamp, later);

        let date = now.date_naive().format(DATE_FORMAT).to_string();
        assert_eq!(fx.bikes.historical_data(&date).await.unwrap().len(), 2);
        assert!(fx.bikes.available_dates().await.unwrap().contains(&date));
    }

    #[tokio::test]
    async fn test_ingest_raises_alert_and_violation() {
        let fx = fixture().await;
        mumbai_fence(&fx).await;
        fx.speed_limits
            .set_speed_limit("B2", Some(&json!(50)), None)
            .await
            .unwrap();
        let mut rx = fx.hub.subscribe();

        let outcome = fx
            .bikes
            .process_bike_data(report("B2", json!(65), 19.0950, 72.8777))
            .await
            .unwrap();

        assert!(outcome.geofencing.is_outside_fence);
        assert!(outcome.geofence_alert.is_some());
        assert!(outcome.speed_limit.is_exceeded);
        assert_eq!(outcome.speed_limit.severity, Some(Severity::Medium));

        let bike = fx.bikes.bike("B2").await.unwrap();
        assert!(bike.is_speed_exceeded);
        assert!(bike.last_speed_violation.is_some());
        assert_eq!(bike.speed_limit, Some(50.0));

        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(frame.envelope.event.clone());
        }
        for expected in ["bikeData", "bikeUpdate", "bikeSpecificUpdate", "geofenceAlert", "speedLimitViolation"] {
            assert!(events.iter().any(|e| e == expected), "missing {expected} in {events:?}");
        }
    }

    #[tokio::test]
    async fn test_views_use_current_fence() {
        let fx = fixture().await;
        fx.bikes
            .process_bike_data(report("B1", json!(10), 19.0760, 72.8777))
            .await
            .unwrap();
        fx.bikes
            .process_bike_data(report("B2", json!(10), 19.1500, 72.8777))
            .await
            .unwrap();

        // no fence yet: everybody is inside
        assert_eq!(fx.bikes.bikes_outside().await.unwrap().len(), 0);

        mumbai_fence(&fx).await;
        let outside = fx.bikes.bikes_outside().await.unwrap();
        assert_eq!(outside.len(), 1);
        assert_eq!(outside[0].bike_id, "B2");
        assert_eq!(fx.bikes.bikes_inside().await.unwrap()[0].bike_id, "B1");

        let summary = fx.bikes.geofencing_summary().await.unwrap();
        assert_eq!((summary.total, summary.inside, summary.outside), (2, 1, 1));
        assert_eq!(summary.inside_bikes[0].speed_limit, None);

        let status = fx.bikes.geofence_status().await.unwrap();
        assert_eq!(status.summary, FenceCounts { total: 2, inside: 1, outside: 1 });
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let fx = fixture().await;

        assert!(matches!(fx.bikes.bike("nope").await, Err(AppError::NotFound(_))));
        assert!(matches!(fx.bikes.historical_data("2020-01-01").await, Err(AppError::NotFound(_))));
        assert!(matches!(fx.bikes.historical_data("../bikes").await, Err(AppError::Validation(_))));

        let err = fx.bikes.latest_bike_data("B1").await.unwrap_err();
        assert_eq!(err.to_string(), "No data found for today");

        fx.bikes
            .process_bike_data(report("B1", json!(10), 19.0, 72.8))
            .await
            .unwrap();
        let err = fx.bikes.latest_bike_data("B7").await.unwrap_err();
        assert_eq!(err.to_string(), "No data found for this bike today");
    }

    #[tokio::test]
    async fn test_concurrent_reports_keep_every_bike() {
        let fx = Arc::new(fixture().await);
        let mut tasks = Vec::new();
        for i in 0..20 {
            let fx = fx.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("B{i}");
                fx.bikes
                    .process_bike_data(report(&id, json!(5), 19.0, 72.8))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(fx.bikes.all_bikes().await.unwrap().len(), 20);
        let today = Utc::now().date_naive().format(DATE_FORMAT).to_string();
        assert_eq!(fx.bikes.historical_data(&today).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_concurrent_reports_for_one_bike() {
        let fx = Arc::new(fixture().await);
        mumbai_fence(&fx).await;

        let mut tasks = Vec::new();
        for i in 0..12 {
            let fx = fx.clone();
            tasks.push(tokio::spawn(async move {
                let speed = json!(10 + i);
                fx.bikes
                    .process_bike_data(report("B9", speed, 19.0950, 72.8777))
                    .await
                    .unwrap()
            }));
        }
        let mut raised = 0;
        for t in tasks {
            if t.await.unwrap().geofence_alert.is_some() {
                raised += 1;
            }
        }

        assert_eq!(raised, 1);
        let alerts = fx.geofencing.alerts(&AlertFilter::default()).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].bike_id, "B9");

        let bikes = fx.bikes.all_bikes().await.unwrap();
        assert_eq!(bikes.len(), 1);
        assert!(bikes[0].is_outside_fence);

        let today = Utc::now().date_naive().format(DATE_FORMAT).to_string();
        assert_eq!(fx.bikes.historical_data(&today).await.unwrap().len(), 12);
    }
}

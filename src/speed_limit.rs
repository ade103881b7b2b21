//! ==============================================================================
//! speed_limit.rs - per-bike speed limits and the violation log
//! ==============================================================================
//!
//! files:
//!     - speed_limits.json          one entry per bike, active or inactive
//!     - speed_limit_history.json   every limit ever set, last max_history kept
//!     - speed_violations.json      every violation, last max_violations kept
//!
//! ==============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bike::BIKES_FILE;
use crate::config::{SpeedLimitConfig, StorageConfig};
use crate::domain::{
    parse_number, round2, Bike, BikeSpeedLimit, Severity, SpeedCheck, SpeedLimitEntry, SpeedViolation, Status,
};
use crate::error::{ApiResult, AppError};
use crate::hub::Hub;
use crate::store::{self, JsonStore};

pub const SPEED_LIMITS_FILE: &str = "speed_limits.json";
pub const HISTORY_FILE: &str = "speed_limit_history.json";
pub const VIOLATIONS_FILE: &str = "speed_violations.json";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationsSummary {
    pub total_bikes: usize,
    pub bikes_with_speed_limits: usize,
    pub bikes_without_speed_limits: usize,
    pub current_violations: usize,
    pub active_bikes: usize,
    pub violations: Vec<ViolationBrief>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationBrief {
    pub bike_id: String,
    pub current_speed: f64,
    pub speed_limit: f64,
    pub exceed_by: f64,
}

pub struct SpeedLimitService {
    store: Arc<JsonStore>,
    hub: Arc<Hub>,
    limits_path: PathBuf,
    history_path: PathBuf,
    violations_path: PathBuf,
    bikes_path: PathBuf,
    settings: SpeedLimitConfig,
}

fn require_bike_id(bike_id: &str) -> ApiResult<()> {
    if bike_id.trim().is_empty() {
        return Err(AppError::validation("Bike ID is required"));
    }
    Ok(())
}

impl SpeedLimitService {
    pub fn new(store: Arc<JsonStore>, hub: Arc<Hub>, storage: &StorageConfig, settings: SpeedLimitConfig) -> Self {
        Self {
            store,
            hub,
            limits_path: storage.file(SPEED_LIMITS_FILE),
            history_path: storage.file(HISTORY_FILE),
            violations_path: storage.file(VIOLATIONS_FILE),
            bikes_path: storage.file(BIKES_FILE),
            settings,
        }
    }

    pub async fn init_files(&self) -> store::Result<()> {
        for path in [&self.limits_path, &self.history_path, &self.violations_path] {
            self.store.ensure_file(path, &Vec::<Value>::new()).await?;
        }
        Ok(())
    }

    /// parse and range-check a limit as sent by a client
    pub fn validate_limit(&self, raw: Option<&Value>) -> ApiResult<f64> {
        let raw = match raw {
            None | Some(Value::Null) => return Err(AppError::validation("Speed limit is required")),
            Some(v) => v,
        };

        let limit = parse_number(raw)
            .filter(|v| *v >= 0.0)
            .ok_or_else(|| AppError::validation("Speed limit must be a positive number"))?;

        if limit > self.settings.max_limit {
            return Err(AppError::validation(format!(
                "Speed limit cannot exceed {} km/h",
                self.settings.max_limit
            )));
        }
        Ok(limit)
    }

    pub async fn set_speed_limit(
        &self,
        bike_id: &str,
        raw: Option<&Value>,
        set_by: Option<String>,
    ) -> ApiResult<SpeedLimitEntry> {
        require_bike_id(bike_id)?;
        let speed_limit = self.validate_limit(raw)?;

        let entry = SpeedLimitEntry {
            bike_id: bike_id.to_string(),
            speed_limit,
            set_at: Utc::now(),
            set_by,
            status: Status::Active,
            removed_at: None,
        };

        self.store
            .update(&self.limits_path, |limits: &mut Vec<SpeedLimitEntry>| {
                match limits.iter_mut().find(|l| l.bike_id == bike_id) {
                    Some(slot) => *slot = entry.clone(),
                    None => limits.push(entry.clone()),
                }
            })
            .await?;

        let cap = self.settings.max_history;
        self.store
            .update(&self.history_path, |history: &mut Vec<SpeedLimitEntry>| {
                history.push(entry.clone());
                if history.len() > cap {
                    let excess = history.len() - cap;
                    history.drain(..excess);
                }
            })
            .await?;

        self.hub.broadcast("speedLimitUpdated", &entry);
        self.hub.send_to_bike(
            bike_id,
            "speedLimitChanged",
            &json!({ "speedLimit": entry.speed_limit, "setAt": entry.set_at }),
        );
        self.hub.broadcast(
            "speedLimitChange",
            &json!({ "bikeId": bike_id, "speedLimit": entry.speed_limit, "timestamp": entry.set_at }),
        );

        info!("Speed limit set for bike {bike_id}: {speed_limit} km/h");
        Ok(entry)
    }

    /// the limit that applies to a bike right now
    ///
    /// the active entry wins. a bike that has never had an entry in
    /// speed_limits.json falls back to its latest history record; a bike
    /// whose limit was removed has none.
    pub async fn effective_limit(&self, bike_id: &str) -> store::Result<Option<SpeedLimitEntry>> {
        let limits: Vec<SpeedLimitEntry> = self.store.read(&self.limits_path).await?;

        if let Some(active) = limits.iter().find(|l| l.bike_id == bike_id && l.status == Status::Active) {
            return Ok(Some(active.clone()));
        }
        if limits.iter().any(|l| l.bike_id == bike_id) {
            return Ok(None);
        }

        let history: Vec<SpeedLimitEntry> = self.store.read(&self.history_path).await?;
        Ok(history
            .into_iter()
            .filter(|h| h.bike_id == bike_id)
            .max_by_key(|h| h.set_at))
    }

    pub async fn get_speed_limit(&self, bike_id: &str) -> ApiResult<SpeedLimitEntry> {
        require_bike_id(bike_id)?;
        self.effective_limit(bike_id)
            .await?
            .ok_or_else(|| AppError::not_found("No speed limit set for this bike"))
    }

    /// every active entry
    pub async fn all_speed_limits(&self) -> ApiResult<Vec<SpeedLimitEntry>> {
        let limits: Vec<SpeedLimitEntry> = self.store.read(&self.limits_path).await?;
        Ok(limits.into_iter().filter(|l| l.status == Status::Active).collect())
    }

    pub async fn remove_speed_limit(&self, bike_id: &str) -> ApiResult<()> {
        require_bike_id(bike_id)?;
        let now = Utc::now();

        let removed = self
            .store
            .update(&self.limits_path, |limits: &mut Vec<SpeedLimitEntry>| {
                match limits.iter_mut().find(|l| l.bike_id == bike_id && l.status == Status::Active) {
                    Some(entry) => {
                        entry.status = Status::Inactive;
                        entry.removed_at = Some(now);
                        true
                    }
                    None => false,
                }
            })
            .await?;

        if !removed {
            return Err(AppError::not_found("No active speed limit found for this bike"));
        }

        self.hub.send_to_bike(bike_id, "speedLimitRemoved", &json!({ "bikeId": bike_id }));
        self.hub.broadcast(
            "speedLimitChange",
            &json!({ "bikeId": bike_id, "speedLimit": null, "timestamp": now, "action": "removed" }),
        );

        info!("Speed limit removed for bike {bike_id}");
        Ok(())
    }

    pub async fn check_speed_violation(&self, bike_id: &str, current_speed: f64) -> ApiResult<SpeedCheck> {
        self.check_speed_violation_at(bike_id, current_speed, Utc::now()).await
    }

    /// compare a reported speed with the bike's limit, logging a violation when over
    pub async fn check_speed_violation_at(
        &self,
        bike_id: &str,
        current_speed: f64,
        now: DateTime<Utc>,
    ) -> ApiResult<SpeedCheck> {
        let Some(entry) = self.effective_limit(bike_id).await? else {
            return Ok(SpeedCheck {
                current_speed,
                reason: Some("No speed limit set".to_string()),
                ..Default::default()
            });
        };

        let limit = entry.speed_limit;
        let is_exceeded = current_speed > limit;
        let raw_excess = if is_exceeded { current_speed - limit } else { 0.0 };

        let mut check = SpeedCheck {
            is_exceeded,
            speed_limit: Some(limit),
            current_speed,
            exceed_by: round2(raw_excess),
            ..Default::default()
        };

        if is_exceeded {
            let violation = SpeedViolation {
                bike_id: bike_id.to_string(),
                current_speed,
                speed_limit: limit,
                exceed_by: check.exceed_by,
                timestamp: now,
                severity: Severity::from_excess(raw_excess),
            };
            self.record_violation(&violation).await?;
            check.severity = Some(violation.severity);
            check.violation = Some(violation);
        }

        Ok(check)
    }

    async fn record_violation(&self, violation: &SpeedViolation) -> ApiResult<()> {
        let cap = self.settings.max_violations;
        self.store
            .update(&self.violations_path, |log: &mut Vec<SpeedViolation>| {
                log.push(violation.clone());
                if log.len() > cap {
                    let excess = log.len() - cap;
                    log.drain(..excess);
                }
            })
            .await?;

        self.hub.send_to_bike(&violation.bike_id, "speedViolation", violation);
        self.hub.broadcast("speedViolationAlert", violation);

        warn!(
            "Speed violation for bike {}: {} km/h in a {} km/h limit ({:?})",
            violation.bike_id, violation.current_speed, violation.speed_limit, violation.severity
        );
        Ok(())
    }

    /// newest first
    pub async fn violations(&self, bike_id: &str, limit: usize) -> ApiResult<Vec<SpeedViolation>> {
        let log: Vec<SpeedViolation> = self.store.read(&self.violations_path).await?;
        let mut mine: Vec<SpeedViolation> = log.into_iter().filter(|v| v.bike_id == bike_id).collect();
        mine.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        mine.truncate(limit);
        Ok(mine)
    }

    /// newest first
    pub async fn history(&self, bike_id: &str, limit: usize) -> ApiResult<Vec<SpeedLimitEntry>> {
        let history: Vec<SpeedLimitEntry> = self.store.read(&self.history_path).await?;
        let mut mine: Vec<SpeedLimitEntry> = history.into_iter().filter(|h| h.bike_id == bike_id).collect();
        mine.sort_by(|a, b| b.set_at.cmp(&a.set_at));
        mine.truncate(limit);
        Ok(mine)
    }

    /// every known bike with its active limit, plus bikes that only have a limit
    pub async fn all_bikes_speed_limits(&self) -> ApiResult<Vec<BikeSpeedLimit>> {
        let bikes: Vec<Bike> = self.store.read(&self.bikes_path).await?;
        let active = self.all_speed_limits().await?;

        let mut rows: Vec<BikeSpeedLimit> = bikes
            .iter()
            .map(|bike| {
                let limit = active.iter().find(|l| l.bike_id == bike.bike_id);
                BikeSpeedLimit {
                    bike_id: bike.bike_id.clone(),
                    speed_limit: limit.map(|l| l.speed_limit),
                    speed_limit_set_at: limit.map(|l| l.set_at),
                    current_speed: bike.avg_speed,
                    is_speed_exceeded: limit.map_or(false, |l| bike.avg_speed > l.speed_limit),
                    last_seen: bike.last_seen,
                    status: bike.status,
                }
            })
            .collect();

        for limit in active.iter().filter(|l| !bikes.iter().any(|b| b.bike_id == l.bike_id)) {
            rows.push(BikeSpeedLimit {
                bike_id: limit.bike_id.clone(),
                speed_limit: Some(limit.speed_limit),
                speed_limit_set_at: Some(limit.set_at),
                current_speed: 0.0,
                is_speed_exceeded: false,
                last_seen: None,
                status: Status::Inactive,
            });
        }

        Ok(rows)
    }

    pub async fn violations_summary(&self) -> ApiResult<ViolationsSummary> {
        let rows = self.all_bikes_speed_limits().await?;

        let violations: Vec<ViolationBrief> = rows
            .iter()
            .filter(|r| r.is_speed_exceeded)
            .filter_map(|r| {
                r.speed_limit.map(|limit| ViolationBrief {
                    bike_id: r.bike_id.clone(),
                    current_speed: r.current_speed,
                    speed_limit: limit,
                    exceed_by: round2(r.current_speed - limit),
                })
            })
            .collect();

        let with_limits = rows.iter().filter(|r| r.speed_limit.is_some()).count();
        Ok(ViolationsSummary {
            total_bikes: rows.len(),
            bikes_with_speed_limits: with_limits,
            bikes_without_speed_limits: rows.len() - with_limits,
            current_violations: violations.len(),
            active_bikes: rows.iter().filter(|r| r.status == Status::Active).count(),
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Location;

    fn service(dir: &tempfile::TempDir) -> (SpeedLimitService, Arc<Hub>, Arc<JsonStore>) {
        let storage = StorageConfig { data_dir: dir.path().to_path_buf(), daily_dir: None };
        let store = Arc::new(JsonStore::new());
        let hub = Arc::new(Hub::new(64));
        let svc = SpeedLimitService::new(store.clone(), hub.clone(), &storage, SpeedLimitConfig::default());
        (svc, hub, store)
    }

    #[test]
    fn test_validate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, _) = service(&dir);

        assert_eq!(svc.validate_limit(Some(&json!(50))).unwrap(), 50.0);
        assert_eq!(svc.validate_limit(Some(&json!("25.5"))).unwrap(), 25.5);
        assert_eq!(svc.validate_limit(Some(&json!(0))).unwrap(), 0.0);
        assert_eq!(svc.validate_limit(None).unwrap_err().to_string(), "Speed limit is required");
        assert_eq!(
            svc.validate_limit(Some(&json!(-1))).unwrap_err().to_string(),
            "Speed limit must be a positive number"
        );
        assert_eq!(
            svc.validate_limit(Some(&json!(201))).unwrap_err().to_string(),
            "Speed limit cannot exceed 200 km/h"
        );
    }

    #[tokio::test]
    async fn test_limit_50_speed_65_is_medium() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, _) = service(&dir);
        svc.set_speed_limit("B1", Some(&json!(50)), None).await.unwrap();

        let check = svc.check_speed_violation("B1", 65.0).await.unwrap();
        assert!(check.is_exceeded);
        assert_eq!(check.exceed_by, 15.0);
        assert_eq!(check.severity, Some(Severity::Medium));
        assert_eq!(check.speed_limit, Some(50.0));

        let logged = svc.violations("B1", 50).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_excess_never_negative() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, _) = service(&dir);
        svc.set_speed_limit("B1", Some(&json!(30)), None).await.unwrap();

        for speed in [0.0, 12.0, 29.99, 30.0] {
            let check = svc.check_speed_violation("B1", speed).await.unwrap();
            assert!(!check.is_exceeded, "speed {speed}");
            assert_eq!(check.exceed_by, 0.0);
            assert!(check.violation.is_none());
        }
        let over = svc.check_speed_violation("B1", 30.5).await.unwrap();
        assert!(over.is_exceeded);
        assert_eq!(over.exceed_by, 0.5);
        assert!(svc.violations("B1", 50).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_no_limit_means_no_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, _) = service(&dir);

        let check = svc.check_speed_violation("ghost", 99.0).await.unwrap();
        assert!(!check.is_exceeded);
        assert_eq!(check.reason.as_deref(), Some("No speed limit set"));

        let err = svc.get_speed_limit("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_replaces_and_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, hub, _) = service(&dir);
        let mut rx = hub.subscribe();

        svc.set_speed_limit("B1", Some(&json!(40)), Some("admin".into())).await.unwrap();
        svc.set_speed_limit("B1", Some(&json!(35)), None).await.unwrap();

        assert_eq!(svc.get_speed_limit("B1").await.unwrap().speed_limit, 35.0);
        assert_eq!(svc.all_speed_limits().await.unwrap().len(), 1);

        let history = svc.history("B1", 50).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].speed_limit, 35.0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.envelope.event, "speedLimitUpdated");
        assert_eq!(first.envelope.data["setBy"], json!("admin"));
    }

    #[tokio::test]
    async fn test_remove_disables_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, _) = service(&dir);
        svc.set_speed_limit("B1", Some(&json!(40)), None).await.unwrap();

        svc.remove_speed_limit("B1").await.unwrap();
        assert!(svc.get_speed_limit("B1").await.is_err());
        assert!(!svc.check_speed_violation("B1", 80.0).await.unwrap().is_exceeded);

        let again = svc.remove_speed_limit("B1").await.unwrap_err();
        assert_eq!(again.to_string(), "No active speed limit found for this bike");
    }

    #[tokio::test]
    async fn test_history_fallback_for_unlisted_bike() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, store) = service(&dir);
        let entry = SpeedLimitEntry {
            bike_id: "B9".into(),
            speed_limit: 22.0,
            set_at: Utc::now(),
            set_by: None,
            status: Status::Active,
            removed_at: None,
        };
        store.write(&dir.path().join(HISTORY_FILE), &vec![entry]).await.unwrap();

        assert_eq!(svc.get_speed_limit("B9").await.unwrap().speed_limit, 22.0);
    }

    #[tokio::test]
    async fn test_violation_log_cap() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig { data_dir: dir.path().to_path_buf(), daily_dir: None };
        let settings = SpeedLimitConfig { max_violations: 3, ..Default::default() };
        let svc = SpeedLimitService::new(Arc::new(JsonStore::new()), Arc::new(Hub::new(8)), &storage, settings);
        svc.set_speed_limit("B1", Some(&json!(10)), None).await.unwrap();

        for speed in [11.0, 12.0, 13.0, 14.0, 15.0] {
            svc.check_speed_violation("B1", speed).await.unwrap();
        }
        let log = svc.violations("B1", 50).await.unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|v| v.current_speed >= 13.0));
    }

    #[tokio::test]
    async fn test_fleet_view_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, store) = service(&dir);

        let bikes = vec![
            Bike {
                bike_id: "B1".into(),
                current_location: Some(Location::new(19.0, 72.8)),
                avg_speed: 45.0,
                ..Default::default()
            },
            Bike { bike_id: "B2".into(), avg_speed: 10.0, ..Default::default() },
        ];
        store.write(&dir.path().join(BIKES_FILE), &bikes).await.unwrap();

        svc.set_speed_limit("B1", Some(&json!(30)), None).await.unwrap();
        svc.set_speed_limit("B3", Some(&json!(25)), None).await.unwrap();

        let rows = svc.all_bikes_speed_limits().await.unwrap();
        assert_eq!(rows.len(), 3);
        let b3 = rows.iter().find(|r| r.bike_id == "B3").unwrap();
        assert_eq!(b3.status, Status::Inactive);

        let summary = svc.violations_summary().await.unwrap();
        assert_eq!(summary.total_bikes, 3);
        assert_eq!(summary.bikes_with_speed_limits, 2);
        assert_eq!(summary.bikes_without_speed_limits, 1);
        assert_eq!(summary.current_violations, 1);
        assert_eq!(summary.violations[0].exceed_by, 15.0);
        assert_eq!(summary.active_bikes, 2);
    }
}

//! ==============================================================================
//! domain.rs - records shared by the services, the api and the websocket hub
//! ==============================================================================
//!
//! every struct here is stored as-is in one of the json data files, so the
//! serde attributes ARE the file format. keys are camelCase on disk and on
//! the wire.
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// a point on the globe in decimal degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// `{"lat": .., "lng": ..}` with either coordinate as a number or a
    /// numeric string
    pub fn from_value(value: &Value) -> Option<Self> {
        let lat = parse_number(value.get("lat")?)?;
        let lng = parse_number(value.get("lng")?)?;
        Some(Self::new(lat, lng))
    }

    /// latitude in [-90, 90], longitude in [-180, 180], both finite
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Inactive,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
        }
    }
}

// ==============================================================================
// bikes
// ==============================================================================

/// current state of one bike, one entry per bike in bikes.json
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bike {
    pub bike_id: String,
    #[serde(default)]
    pub current_location: Option<Location>,
    #[serde(default)]
    pub avg_speed: f64,
    #[serde(default)]
    pub battery_level: f64,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub is_outside_fence: bool,
    /// kilometres from the active fence centre
    #[serde(default)]
    pub distance_from_base: f64,
    #[serde(default)]
    pub geofence_id: Option<String>,
    #[serde(default)]
    pub speed_limit: Option<f64>,
    #[serde(default)]
    pub is_speed_exceeded: bool,
    #[serde(default)]
    pub last_speed_violation: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_limit_set_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_limit_set_by: Option<String>,
}

/// raw telemetry as posted by a bike or the simulator
///
/// every field is optional so that a malformed report turns into a
/// validation error with a useful message instead of a parse failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    #[serde(default)]
    pub bike_id: Option<String>,
    #[serde(default)]
    pub data: Option<TelemetryData>,
}

/// the `data` block of a report
///
/// speed, battery and the location are kept as raw json values because
/// firmware sends numbers either as json numbers or as numeric strings.
/// anything else the bike reports is carried through to the daily log
/// untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_speed: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// one entry of a daily log file (daily/YYYY-MM-DD.json)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub bike_id: String,
    pub data: TelemetryData,
    pub timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    /// unix epoch millis
    pub received_at: i64,
}

impl TelemetryRecord {
    pub fn enrich(bike_id: String, data: TelemetryData, now: DateTime<Utc>) -> Self {
        Self {
            bike_id,
            data,
            timestamp: now,
            server_timestamp: now,
            received_at: now.timestamp_millis(),
        }
    }
}

// ==============================================================================
// geofencing
// ==============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub id: String,
    pub name: String,
    pub base_location: Location,
    /// kilometres
    pub radius: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// outcome of testing one position against the active fence
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceCheck {
    pub is_outside_fence: bool,
    pub distance_from_base: f64,
    pub geofence_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FenceBreach,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::FenceBreach => "fence_breach",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub bike_id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    /// kilometres, two decimals
    pub distance: f64,
    pub geofence_id: Option<String>,
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
    pub status: Status,
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// counts plus per-bike detail, pushed to dashboards as `geofencingSummary`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofencingSummary {
    pub total: usize,
    pub inside: usize,
    pub outside: usize,
    pub inside_bikes: Vec<BikeFenceBrief>,
    pub outside_bikes: Vec<BikeFenceBrief>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BikeFenceBrief {
    pub bike_id: String,
    pub distance_from_base: f64,
    pub speed_limit: Option<f64>,
    pub is_speed_exceeded: bool,
}

// ==============================================================================
// speed limits
// ==============================================================================

/// one row of speed_limits.json, also the shape of speed_limit_history.json
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedLimitEntry {
    pub bike_id: String,
    /// km/h
    pub speed_limit: f64,
    pub set_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// fixed banding on the km/h above the limit
    pub fn from_excess(exceed_by: f64) -> Self {
        if exceed_by <= 5.0 {
            Severity::Low
        } else if exceed_by <= 15.0 {
            Severity::Medium
        } else if exceed_by <= 30.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedViolation {
    pub bike_id: String,
    pub current_speed: f64,
    pub speed_limit: f64,
    pub exceed_by: f64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

/// result of comparing one reported speed against the bike's limit
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedCheck {
    pub is_exceeded: bool,
    pub speed_limit: Option<f64>,
    pub current_speed: f64,
    pub exceed_by: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<SpeedViolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// a bike joined with its active speed limit, for the fleet speed view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BikeSpeedLimit {
    pub bike_id: String,
    pub speed_limit: Option<f64>,
    pub speed_limit_set_at: Option<DateTime<Utc>>,
    pub current_speed: f64,
    pub is_speed_exceeded: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: Status,
}

// ==============================================================================
// helpers
// ==============================================================================

/// lenient number parsing: json numbers and numeric strings both count
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// round to two decimals, the precision used for distances and excess speed
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

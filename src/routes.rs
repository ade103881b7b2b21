//! ==============================================================================
//! routes.rs - REST api
//! ==============================================================================
//!
//! every handler is a thin shell over a service call. failures come back as
//! AppError and turn into `{"success": false, "error": ...}` with the
//! matching status code.
//!
//! ==============================================================================

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::bike::{IngestOutcome, INVALID_DATA_FORMAT};
use crate::domain::{parse_number, TelemetryReport};
use crate::error::{ApiResult, AppError};
use crate::geofence::{AlertFilter, GeofenceInput};
use crate::socket::ws_handler;
use crate::state::SharedState;

const DEFAULT_LIST_LIMIT: usize = 50;
const DEFAULT_ALERT_MAX_AGE_HOURS: i64 = 24;

pub const FEATURES: [&str; 4] = ["geofencing", "speed-limits", "real-time-alerts", "daily-history"];

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/ws", get(ws_handler))
        // bikes
        .route("/api/bike/data", post(post_bike_data))
        .route("/api/bikes", get(list_bikes))
        .route("/api/bikes/:bike_id", get(get_bike))
        .route("/api/bikes/:bike_id/latest", get(latest_bike_data))
        // history
        .route("/api/history", get(available_dates))
        .route("/api/history/:date", get(historical_data))
        // geofencing
        .route("/api/geofencing/geofence", post(set_geofence))
        .route("/api/geofencing/geofences", get(list_geofences))
        .route("/api/geofencing/geofence/active", get(active_geofence))
        .route("/api/geofencing/alerts", get(list_alerts))
        .route("/api/geofencing/alerts/old", delete(clear_old_alerts))
        .route("/api/geofencing/alerts/:alert_id/acknowledge", put(acknowledge_alert))
        .route("/api/geofencing/bikes/status", get(geofence_status))
        .route("/api/geofencing/bikes/outside", get(bikes_outside))
        .route("/api/geofencing/bikes/inside", get(bikes_inside))
        .route("/api/geofencing/summary", get(geofencing_summary))
        // speed limits
        .route(
            "/api/bikes/:bike_id/speed-limit",
            post(set_speed_limit).get(get_speed_limit).delete(remove_speed_limit),
        )
        .route("/api/bikes/:bike_id/check-speed", post(check_speed))
        .route("/api/bikes/:bike_id/speed-violations", get(speed_violations))
        .route("/api/bikes/:bike_id/speed-limit-history", get(speed_limit_history))
        .route("/api/speed-limits", get(all_speed_limits))
        .route("/api/speed-violations/summary", get(violations_summary))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(method: Method, uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Route not found", "path": uri.path(), "method": method.as_str() })),
    )
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "clientsConnected": state.hub.connected_clients(),
        "uptime": state.started.elapsed().as_secs_f64(),
        "features": FEATURES,
    }))
}

// ==============================================================================
// bikes & history
// ==============================================================================

async fn post_bike_data(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<IngestOutcome>> {
    let Json(body) = body.map_err(|_| AppError::validation(INVALID_DATA_FORMAT))?;
    let report: TelemetryReport =
        serde_json::from_value(body).map_err(|_| AppError::validation(INVALID_DATA_FORMAT))?;

    let outcome = state.bikes.process_bike_data(report).await?;
    Ok(Json(outcome))
}

async fn list_bikes(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let bikes = state.bikes.all_bikes().await?;
    Ok(Json(json!({ "bikes": bikes })))
}

async fn get_bike(State(state): State<SharedState>, Path(bike_id): Path<String>) -> ApiResult<Json<Value>> {
    let bike = state.bikes.bike(&bike_id).await?;
    Ok(Json(json!({ "bike": bike })))
}

async fn latest_bike_data(
    State(state): State<SharedState>,
    Path(bike_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let latest = state.bikes.latest_bike_data(&bike_id).await?;
    Ok(Json(json!({ "latestData": latest })))
}

async fn available_dates(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let dates = state.bikes.available_dates().await?;
    Ok(Json(json!({ "availableDates": dates })))
}

async fn historical_data(State(state): State<SharedState>, Path(date): Path<String>) -> ApiResult<Json<Value>> {
    let data = state.bikes.historical_data(&date).await?;
    Ok(Json(json!({ "date": date, "data": data })))
}

// ==============================================================================
// geofencing
// ==============================================================================

async fn set_geofence(
    State(state): State<SharedState>,
    body: Result<Json<GeofenceInput>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(input) = body.map_err(|_| AppError::validation("Base location with lat and lng is required"))?;
    let fence = state.geofencing.set_geofence(input).await?;
    state.hub.broadcast("geofenceUpdated", &fence);
    Ok(Json(json!({ "success": true, "geofence": fence, "message": "Geofence set successfully" })))
}

async fn list_geofences(State(state): State<SharedState>) -> Json<Value> {
    let geofences = state.geofencing.geofences().await;
    Json(json!({ "success": true, "geofences": geofences }))
}

async fn active_geofence(State(state): State<SharedState>) -> Json<Value> {
    let geofence = state.geofencing.active_geofence().await;
    Json(json!({ "success": true, "geofence": geofence }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertQuery {
    bike_id: Option<String>,
    status: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<usize>,
}

impl AlertQuery {
    /// status defaults to "active"; `status=all` or an empty value lifts the filter
    fn into_filter(self) -> AlertFilter {
        let status = match self.status.as_deref() {
            None => Some("active".to_string()),
            Some("") | Some("all") => None,
            Some(s) => Some(s.to_string()),
        };
        AlertFilter {
            bike_id: self.bike_id.filter(|id| !id.is_empty()),
            status,
            kind: self.kind.filter(|k| !k.is_empty()),
            // 0 means every match
            limit: match self.limit {
                Some(0) => None,
                limit => Some(limit.unwrap_or(DEFAULT_LIST_LIMIT)),
            },
        }
    }
}

async fn list_alerts(State(state): State<SharedState>, Query(query): Query<AlertQuery>) -> Json<Value> {
    let filter = query.into_filter();
    let alerts = state.geofencing.alerts(&filter).await;
    Json(json!({
        "success": true,
        "count": alerts.len(),
        "alerts": alerts,
        "filters": {
            "bikeId": filter.bike_id,
            "status": filter.status,
            "type": filter.kind,
            "limit": filter.limit,
        },
    }))
}

async fn acknowledge_alert(
    State(state): State<SharedState>,
    Path(alert_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let alert = state
        .geofencing
        .acknowledge_alert(&alert_id)
        .await?
        .ok_or_else(|| AppError::not_found("Alert not found"))?;
    state.hub.broadcast("alertAcknowledged", &alert);
    Ok(Json(json!({ "success": true, "alert": alert, "message": "Alert acknowledged successfully" })))
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    hours: Option<i64>,
}

async fn clear_old_alerts(
    State(state): State<SharedState>,
    Query(query): Query<ClearQuery>,
) -> ApiResult<Json<Value>> {
    let hours = query.hours.unwrap_or(DEFAULT_ALERT_MAX_AGE_HOURS);
    if hours < 0 {
        return Err(AppError::validation("Hours must be zero or more"));
    }
    let cleared = state.geofencing.clear_old_alerts(hours, Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "clearedCount": cleared,
        "message": format!("Cleared {cleared} old alerts"),
    })))
}

async fn geofence_status(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let report = state.bikes.geofence_status().await?;
    Ok(Json(json!({ "success": true, "bikeStatuses": report.bike_statuses, "summary": report.summary })))
}

async fn bikes_outside(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let bikes = state.bikes.bikes_outside().await?;
    Ok(Json(json!({ "success": true, "count": bikes.len(), "bikes": bikes })))
}

async fn bikes_inside(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let bikes = state.bikes.bikes_inside().await?;
    Ok(Json(json!({ "success": true, "count": bikes.len(), "bikes": bikes })))
}

async fn geofencing_summary(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let summary = state.bikes.geofencing_summary().await?;
    Ok(Json(json!({ "success": true, "summary": summary })))
}

// ==============================================================================
// speed limits
// ==============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeedLimitBody {
    speed_limit: Option<Value>,
    set_by: Option<String>,
}

async fn set_speed_limit(
    State(state): State<SharedState>,
    Path(bike_id): Path<String>,
    body: Result<Json<SpeedLimitBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let set_by = body.set_by.unwrap_or_else(|| "api".to_string());
    let entry = state
        .speed_limits
        .set_speed_limit(&bike_id, body.speed_limit.as_ref(), Some(set_by))
        .await?;
    Ok(Json(json!({ "success": true, "message": "Speed limit set successfully", "speedLimit": entry })))
}

async fn get_speed_limit(
    State(state): State<SharedState>,
    Path(bike_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let entry = state.speed_limits.get_speed_limit(&bike_id).await?;
    Ok(Json(json!({ "success": true, "speedLimit": entry })))
}

async fn remove_speed_limit(
    State(state): State<SharedState>,
    Path(bike_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.speed_limits.remove_speed_limit(&bike_id).await?;
    Ok(Json(json!({ "success": true, "message": "Speed limit removed successfully" })))
}

async fn check_speed(
    State(state): State<SharedState>,
    Path(bike_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let speed = body
        .ok()
        .and_then(|Json(b)| b.get("currentSpeed").and_then(parse_number))
        .filter(|s| *s >= 0.0)
        .ok_or_else(|| AppError::validation("Current speed is required"))?;

    let check = state.speed_limits.check_speed_violation(&bike_id, speed).await?;
    Ok(Json(json!({ "success": true, "bikeId": bike_id, "speedCheck": check })))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn speed_violations(
    State(state): State<SharedState>,
    Path(bike_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let violations = state
        .speed_limits
        .violations(&bike_id, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(json!({ "success": true, "bikeId": bike_id, "count": violations.len(), "violations": violations })))
}

async fn speed_limit_history(
    State(state): State<SharedState>,
    Path(bike_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let history = state
        .speed_limits
        .history(&bike_id, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(json!({ "success": true, "bikeId": bike_id, "count": history.len(), "history": history })))
}

async fn all_speed_limits(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let bikes = state.speed_limits.all_bikes_speed_limits().await?;
    Ok(Json(json!({ "success": true, "bikes": bikes })))
}

async fn violations_summary(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let summary = state.speed_limits.violations_summary().await?;
    Ok(Json(json!({ "success": true, "summary": summary })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubConfig, StorageConfig};
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app(dir: &tempfile::TempDir) -> Router {
        let config = HubConfig {
            storage: StorageConfig { data_dir: dir.path().to_path_buf(), daily_dir: None },
            ..Default::default()
        };
        router(AppState::init(config).await.unwrap())
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn report(bike_id: &str, speed: f64, lat: f64) -> Value {
        json!({ "bikeId": bike_id, "data": { "avgSpeed": speed, "location": { "lat": lat, "lng": 72.8777 }, "battery": 64 } })
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        for path in ["/health", "/api/health"] {
            let (status, body) = call(&app, "GET", path, None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], json!("healthy"));
            assert_eq!(body["clientsConnected"], json!(0));
        }
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "GET", "/api/nothing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Route not found", "path": "/api/nothing", "method": "GET" }));
    }

    #[tokio::test]
    async fn test_post_bike_data_flow() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "POST", "/api/bike/data", Some(report("B1", 18.0, 19.0760))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], json!("Data received successfully"));

        let (status, body) = call(&app, "GET", "/api/bikes/B1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bike"]["avgSpeed"], json!(18.0));

        let (_, body) = call(&app, "GET", "/api/bikes", None).await;
        assert_eq!(body["bikes"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "GET", "/api/bikes/B1/latest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["latestData"]["bikeId"], json!("B1"));

        let (_, body) = call(&app, "GET", "/api/history", None).await;
        assert_eq!(body["availableDates"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_reports_are_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "POST", "/api/bike/data", Some(json!({ "bikeId": "B1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "success": false, "error": INVALID_DATA_FORMAT }));

        let (status, _) = call(&app, "POST", "/api/bike/data", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/history/not-a-date", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/bikes/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_geofence_and_alert_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let fence = json!({ "name": "Depot", "baseLocation": { "lat": 19.0760, "lng": 72.8777 }, "radius": 1 });
        let (status, body) = call(&app, "POST", "/api/geofencing/geofence", Some(fence)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["geofence"]["name"], json!("Depot"));

        let (status, _) = call(&app, "POST", "/api/geofencing/geofence", Some(json!({ "radius": 1 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        call(&app, "POST", "/api/bike/data", Some(report("B1", 10.0, 19.0760))).await;
        call(&app, "POST", "/api/bike/data", Some(report("B2", 10.0, 19.1000))).await;

        let (_, body) = call(&app, "GET", "/api/geofencing/bikes/outside", None).await;
        assert_eq!(body["count"], json!(1));
        let (_, body) = call(&app, "GET", "/api/geofencing/summary", None).await;
        assert_eq!(body["summary"]["inside"], json!(1));
        let (_, body) = call(&app, "GET", "/api/geofencing/bikes/status", None).await;
        assert_eq!(body["summary"]["outside"], json!(1));

        let (_, body) = call(&app, "GET", "/api/geofencing/alerts", None).await;
        assert_eq!(body["count"], json!(1));
        let alert_id = body["alerts"][0]["id"].as_str().unwrap().to_string();

        let uri = format!("/api/geofencing/alerts/{alert_id}/acknowledge");
        let (status, body) = call(&app, "PUT", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alert"]["acknowledged"], json!(true));

        let (status, _) = call(&app, "PUT", "/api/geofencing/alerts/missing/acknowledge", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, "DELETE", "/api/geofencing/alerts/old?hours=24", None).await;
        assert_eq!(body["clearedCount"], json!(0));
    }

    #[tokio::test]
    async fn test_clear_old_alerts_rejects_huge_hours() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "DELETE", "/api/geofencing/alerts/old?hours=10000000000", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "success": false, "error": "Hours out of range" }));

        let (status, _) = call(&app, "DELETE", "/api/geofencing/alerts/old?hours=-1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_alert_limit_zero_lists_everything() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let fence = json!({ "baseLocation": { "lat": 19.0760, "lng": 72.8777 }, "radius": 1 });
        call(&app, "POST", "/api/geofencing/geofence", Some(fence)).await;
        for id in ["B1", "B2", "B3"] {
            call(&app, "POST", "/api/bike/data", Some(report(id, 10.0, 19.1000))).await;
        }

        let (_, body) = call(&app, "GET", "/api/geofencing/alerts?limit=0", None).await;
        assert_eq!(body["count"], json!(3));
        let (_, body) = call(&app, "GET", "/api/geofencing/alerts?limit=2", None).await;
        assert_eq!(body["count"], json!(2));
    }

    #[tokio::test]
    async fn test_string_coordinates_are_ingested() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let stringy = json!({
            "bikeId": "B1",
            "data": { "avgSpeed": "12", "location": { "lat": "19.07", "lng": "72.87" }, "battery": "80" }
        });
        let (status, _) = call(&app, "POST", "/api/bike/data", Some(stringy)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, "GET", "/api/bikes/B1", None).await;
        assert_eq!(body["bike"]["currentLocation"], json!({ "lat": 19.07, "lng": 72.87 }));

        let partial = json!({ "bikeId": "B1", "data": { "avgSpeed": 12, "location": { "lat": 19.07 }, "battery": 80 } });
        let (status, body) = call(&app, "POST", "/api/bike/data", Some(partial)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Invalid location value"));
    }

    #[tokio::test]
    async fn test_speed_limit_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, _) = call(&app, "POST", "/api/bikes/B1/speed-limit", Some(json!({ "speedLimit": 250 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "POST", "/api/bikes/B1/speed-limit", Some(json!({ "speedLimit": 50 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["speedLimit"]["speedLimit"], json!(50.0));

        let (_, body) = call(&app, "POST", "/api/bikes/B1/check-speed", Some(json!({ "currentSpeed": 65 }))).await;
        assert_eq!(body["speedCheck"]["isExceeded"], json!(true));
        assert_eq!(body["speedCheck"]["exceedBy"], json!(15.0));
        assert_eq!(body["speedCheck"]["severity"], json!("medium"));

        let (status, _) = call(&app, "POST", "/api/bikes/B1/check-speed", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "GET", "/api/bikes/B1/speed-violations", None).await;
        assert_eq!(body["count"], json!(1));
        let (_, body) = call(&app, "GET", "/api/bikes/B1/speed-limit-history?limit=5", None).await;
        assert_eq!(body["count"], json!(1));
        let (_, body) = call(&app, "GET", "/api/speed-limits", None).await;
        assert_eq!(body["bikes"].as_array().unwrap().len(), 1);
        let (_, body) = call(&app, "GET", "/api/speed-violations/summary", None).await;
        assert_eq!(body["summary"]["bikesWithSpeedLimits"], json!(1));

        let (status, _) = call(&app, "DELETE", "/api/bikes/B1/speed-limit", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, "GET", "/api/bikes/B1/speed-limit", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("No speed limit set for this bike"));
    }
}

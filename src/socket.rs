//! ==============================================================================
//! socket.rs - one websocket session per dashboard
//! ==============================================================================
//!
//! purpose:
//!     upgrades GET /ws, pushes the initial snapshot, then runs a single
//!     loop that both answers client commands and forwards hub frames.
//!
//! session loop:
//!
//!     ┌──────────────┐   command    ┌──────────┐   reply    ┌──────────┐
//!     │ client frame │ ───────────> │ dispatch │ ─────────> │  sink    │
//!     └──────────────┘              └──────────┘            └──────────┘
//!                                                                ▲
//!     ┌──────────────┐   room filter                             │
//!     │  hub frame   │ ──────────────────────────────────────────┘
//!     └──────────────┘
//!
//! client commands:
//!     join-bike / subscribeToBike    enter a bike's room
//!     unsubscribeFromBike            leave it
//!     setGeofence                    -> geofenceUpdated (all), geofenceSet (reply)
//!     setSpeedLimit                  -> speedLimitSet (reply)
//!     getSpeedLimit                  -> speedLimitData (reply)
//!     acknowledgeAlert               -> alertAcknowledged (all)
//!     bikeData                       -> dataReceived (reply)
//!
//! ==============================================================================

use std::collections::HashSet;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::domain::TelemetryReport;
use crate::error::AppError;
use crate::geofence::{AlertFilter, GeofenceInput};
use crate::hub::Envelope;
use crate::state::SharedState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| session(socket, state))
}

async fn session(socket: WebSocket, state: SharedState) {
    let mut frames = state.hub.subscribe();
    let connected = state.hub.client_connected();
    info!("Client connected ({connected} total)");

    let (mut sink, mut stream) = socket.split();
    let mut rooms: HashSet<String> = HashSet::new();

    for envelope in snapshot(&state).await {
        if send(&mut sink, &envelope).await.is_err() {
            finish(&state);
            return;
        }
    }

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let replies = dispatch(&state, &mut rooms, &text).await;
                    let mut failed = false;
                    for reply in replies {
                        if send(&mut sink, &reply).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket read error: {e}");
                    break;
                }
            },
            frame = frames.recv() => match frame {
                Ok(out) => {
                    let wanted = out.room.as_ref().map_or(true, |room| rooms.contains(room));
                    if wanted && send(&mut sink, &out.envelope).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Slow client skipped {skipped} frames");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    finish(&state);
}

fn finish(state: &SharedState) {
    let remaining = state.hub.client_disconnected();
    info!("Client disconnected ({remaining} remaining)");
}

async fn send<S>(sink: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(e) => {
            warn!("Dropping {}: {e}", envelope.event);
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

fn envelope<T: Serialize>(event: &str, data: &T) -> Option<Envelope> {
    Envelope::new(event, data)
}

/// what a fresh client sees before any live frame
pub async fn snapshot(state: &SharedState) -> Vec<Envelope> {
    let bikes = match state.bikes.all_bikes().await {
        Ok(bikes) => bikes,
        Err(AppError::NotFound(_)) => Vec::new(),
        Err(e) => {
            warn!("Initial bikes data unavailable: {e}");
            Vec::new()
        }
    };
    let active = state.geofencing.active_geofence().await;
    let recent = state
        .geofencing
        .alerts(&AlertFilter {
            status: Some("active".to_string()),
            limit: Some(state.config.geofence.recent_alerts),
            ..Default::default()
        })
        .await;
    let summary = state.bikes.geofencing_summary().await.unwrap_or_default();
    let limits = match state.speed_limits.all_speed_limits().await {
        Ok(limits) => limits,
        Err(e) => {
            warn!("Initial speed limits unavailable: {e}");
            Vec::new()
        }
    };

    [
        envelope("initialBikesData", &bikes),
        envelope("activeGeofence", &active),
        envelope("recentAlerts", &recent),
        envelope("geofencingSummary", &summary),
        envelope("initialSpeedLimits", &limits),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// bike id from either a bare string or `{"bikeId": ...}`
fn bike_id_of(data: &Value) -> Option<String> {
    match data {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map.get("bikeId").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
    .filter(|id| !id.is_empty())
}

/// run one client command, returning the frames for this client only
pub async fn dispatch(state: &SharedState, rooms: &mut HashSet<String>, text: &str) -> Vec<Envelope> {
    let Envelope { event, data } = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Ignoring malformed frame: {e}");
            return Vec::new();
        }
    };

    let reply = match event.as_str() {
        "join-bike" | "subscribeToBike" => {
            if let Some(id) = bike_id_of(&data) {
                info!("Client subscribed to bike {id}");
                rooms.insert(id);
            }
            None
        }
        "unsubscribeFromBike" => {
            if let Some(id) = bike_id_of(&data) {
                info!("Client unsubscribed from bike {id}");
                rooms.remove(&id);
            }
            None
        }
        "setGeofence" => {
            let result = match serde_json::from_value::<GeofenceInput>(data) {
                Ok(input) => state.geofencing.set_geofence(input).await,
                Err(_) => Err(AppError::validation("Base location with lat and lng is required")),
            };
            match result {
                Ok(fence) => {
                    state.hub.broadcast("geofenceUpdated", &fence);
                    envelope("geofenceSet", &json!({ "success": true, "geofence": fence }))
                }
                Err(e) => envelope("geofenceSet", &json!({ "success": false, "error": e.public_message() })),
            }
        }
        "setSpeedLimit" => {
            let bike_id = bike_id_of(&data).unwrap_or_default();
            let set_by = data
                .get("setBy")
                .and_then(Value::as_str)
                .unwrap_or("websocket")
                .to_string();
            match state
                .speed_limits
                .set_speed_limit(&bike_id, data.get("speedLimit"), Some(set_by))
                .await
            {
                Ok(entry) => envelope("speedLimitSet", &json!({ "success": true, "speedLimit": entry })),
                Err(e) => envelope("speedLimitSet", &json!({ "success": false, "error": e.public_message() })),
            }
        }
        "getSpeedLimit" => {
            let bike_id = bike_id_of(&data).unwrap_or_default();
            match state.speed_limits.get_speed_limit(&bike_id).await {
                Ok(entry) => envelope("speedLimitData", &json!({ "success": true, "speedLimit": entry })),
                Err(e) => envelope("speedLimitData", &json!({ "success": false, "error": e.public_message() })),
            }
        }
        "acknowledgeAlert" => {
            let alert_id = match &data {
                Value::String(id) => Some(id.clone()),
                other => other.get("alertId").and_then(Value::as_str).map(str::to_string),
            };
            if let Some(alert_id) = alert_id {
                match state.geofencing.acknowledge_alert(&alert_id).await {
                    Ok(Some(alert)) => state.hub.broadcast("alertAcknowledged", &alert),
                    Ok(None) => debug!("Alert {alert_id} not found"),
                    Err(e) => warn!("Failed to acknowledge alert {alert_id}: {e}"),
                }
            }
            None
        }
        "bikeData" => {
            let bike_id = bike_id_of(&data);
            let result = match serde_json::from_value::<TelemetryReport>(data) {
                Ok(report) => state.bikes.process_bike_data(report).await,
                Err(_) => Err(AppError::validation(crate::bike::INVALID_DATA_FORMAT)),
            };
            let (status, message) = match result {
                Ok(outcome) => ("success", outcome.message.to_string()),
                Err(e) => ("error", e.public_message()),
            };
            envelope(
                "dataReceived",
                &json!({ "bikeId": bike_id, "status": status, "message": message, "timestamp": Utc::now() }),
            )
        }
        other => {
            debug!("Unknown client event: {other}");
            None
        }
    };

    reply.into_iter().collect()
}

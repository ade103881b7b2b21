//! ==============================================================================
//! hub.rs - websocket fan-out
//! ==============================================================================
//!
//! purpose:
//!     pushes events to every connected dashboard, or only to the clients
//!     that joined a bike's room.
//!
//! wire format (both directions):
//!
//!     {"event": "bikeData", "data": { ... }}
//!
//! architecture:
//!
//!     services ──> Hub::broadcast / Hub::send_to_bike
//!                        │
//!                  broadcast channel (bounded)
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!       socket 1      socket 2      socket 3   (each filters by its rooms)
//!
//! delivery is at-most-once. a socket that falls more than the channel
//! capacity behind skips the frames it missed.
//!
//! ==============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(event: &str, data: &T) -> Option<Self> {
        match serde_json::to_value(data) {
            Ok(data) => Some(Self { event: event.to_string(), data }),
            Err(e) => {
                warn!("Dropping {event}: payload did not serialize: {e}");
                None
            }
        }
    }
}

/// one frame on the broadcast channel
#[derive(Clone, Debug)]
pub struct Outbound {
    /// None = everyone, Some(bike id) = that bike's room only
    pub room: Option<String>,
    pub envelope: Envelope,
}

pub struct Hub {
    tx: broadcast::Sender<Arc<Outbound>>,
    clients: AtomicUsize,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, clients: AtomicUsize::new(0) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.tx.subscribe()
    }

    /// emit to every connected client
    pub fn broadcast<T: Serialize>(&self, event: &str, data: &T) {
        self.publish(None, event, data);
    }

    /// emit to clients subscribed to this bike
    pub fn send_to_bike<T: Serialize>(&self, bike_id: &str, event: &str, data: &T) {
        self.publish(Some(bike_id.to_string()), event, data);
    }

    fn publish<T: Serialize>(&self, room: Option<String>, event: &str, data: &T) {
        let Some(envelope) = Envelope::new(event, data) else {
            return;
        };
        // no receivers is the normal state when no dashboard is open
        match self.tx.send(Arc::new(Outbound { room, envelope })) {
            Ok(n) => debug!("Emitted {event} to {n} sockets"),
            Err(_) => debug!("Emitted {event} with no sockets connected"),
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub(crate) fn client_connected(&self) -> usize {
        self.clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn client_disconnected(&self) -> usize {
        self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }
}

//! Telemetry ingestion and state reconciliation for the DroneGuard console.
//!
//! Frames arrive over one websocket (`transport`), are turned into typed
//! events (`classify`), folded into a bounded snapshot (`store`) and handed to
//! any number of listeners (`subscription`). `smoothing` derives the drawable
//! flight path; `commands` and `verify` talk plain HTTP to the backend.

pub mod classify;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
mod ring_buffer;
pub mod session;
pub mod smoothing;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod verify;

pub use classify::{ClassifiedEvent, Discard, classify};
pub use commands::{AttackMode, AttackRequest, CommandClient, CommandReply};
pub use config::ConsoleConfig;
pub use error::{ConsoleError, ConsoleResult};
pub use session::Session;
pub use smoothing::{FlightPath, GeoPoint, flight_path, smooth};
pub use store::{HistoryOrder, Store, StoreConfig, StoreSnapshot};
pub use subscription::{Subscribers, Subscription, Unsubscriber};
pub use transport::{ConnState, ReconnectPolicy, Transport, TransportEvent};

pub use droneguard_shared as shared;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

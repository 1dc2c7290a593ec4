// Session: wires transport -> classifier -> store, plus the verification poller.
//
// All transport events are applied on one pump task, in the order the
// supervisor produced them.

use crate::classify::classify;
use crate::config::ConsoleConfig;
use crate::error::ConsoleResult;
use crate::smoothing::{FlightPath, flight_path};
use crate::store::{Store, StoreSnapshot};
use crate::subscription::Subscription;
use crate::transport::{
    ConnState, Connector, Transport, TransportEvent, TransportStats, WsConnector,
};
use crate::verify::Verifier;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const TARGET: &str = "droneguard::session";

/// Folds one transport event into the store.
pub fn apply_transport_event(store: &Store, event: TransportEvent, now_ms: i64) {
    match event {
        TransportEvent::Open => store.set_connected(true, now_ms),
        TransportEvent::Close { .. } | TransportEvent::Error(_) => {
            store.set_connected(false, now_ms)
        }
        TransportEvent::Message(raw) => match classify(&raw, now_ms) {
            Ok(event) => store.apply(event),
            Err(reason) => {
                debug!(target: TARGET, %reason, len = raw.len(), "dropping frame");
                store.record_discard(reason);
            }
        },
    }
}

async fn run_pump(
    store: Arc<Store>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;
            ev = events.recv() => match ev {
                Some(ev) => apply_transport_event(&store, ev, crate::now_ms()),
                None => break,
            },
            _ = stop.notified() => {
                while let Ok(ev) = events.try_recv() {
                    apply_transport_event(&store, ev, crate::now_ms());
                }
                break;
            }
        }
    }
}

pub struct Session {
    config: ConsoleConfig,
    store: Arc<Store>,
    transport: Transport,
    stop: Arc<Notify>,
    pump: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connects to the configured websocket. Must run inside a tokio runtime.
    pub fn start(config: ConsoleConfig) -> ConsoleResult<Self> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ConsoleConfig, connector: Arc<dyn Connector>) -> ConsoleResult<Self> {
        config.validate()?;

        let verifier = if config.verification.enabled {
            Some(Verifier::new(config.verify_endpoint(), &config.verification)?)
        } else {
            None
        };

        let store = Arc::new(Store::new(config.store_config()));
        let (transport, events) = Transport::new(config.ws_endpoint(), config.reconnect, connector);
        let stop = Arc::new(Notify::new());
        let pump = tokio::spawn(run_pump(store.clone(), events, stop.clone()));

        let poller = verifier.map(|v| {
            let store = store.clone();
            info!(target: TARGET, url = v.url(), "verification poller started");
            tokio::spawn(v.run(move |report| store.set_verification(report)))
        });

        info!(target: TARGET, url = %transport.url(), "session starting");
        transport.connect();

        Ok(Self {
            config,
            store,
            transport,
            stop,
            pump: Mutex::new(Some(pump)),
            poller: Mutex::new(poller),
        })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.store.snapshot()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<StoreSnapshot>) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    /// Smoothed track of the current snapshot, using the configured step count.
    pub fn flight_path(&self) -> FlightPath {
        flight_path(&self.snapshot(), self.config.smoothing_steps)
    }

    pub fn transport_state(&self) -> ConnState {
        self.transport.state()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Retained history survives the switch.
    pub fn set_url(&self, url: impl Into<String>) {
        self.transport.set_url(url);
    }

    /// Stops the poller, closes the transport and applies any events still
    /// queued. Calling it again does nothing.
    pub async fn shutdown(&self) {
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            poller.abort();
        }

        self.transport.shutdown().await;

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            self.stop.notify_one();
            if let Err(e) = pump.await {
                tracing::error!(target: TARGET, "pump task failed: {e}");
            }
            info!(target: TARGET, "session stopped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for slot in [&self.poller, &self.pump] {
            if let Some(task) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
    }
}

// Single source of truth for everything the views render.
//
// The current state lives behind one `Arc<StoreSnapshot>`. Every change goes
// through `commit`, which edits a copy-on-write view of that snapshot under
// the lock and publishes the new `Arc` to listeners after the lock is
// released. A reader holding an older `Arc` keeps seeing exactly that state.
// The histories are persistent vectors, so when a reader still holds the
// previous snapshot the copy only duplicates the chunks an insert touches.

use crate::classify::{ClassifiedEvent, Discard};
use crate::ring_buffer::RingBuffer;
use crate::subscription::{Subscribers, Subscription};
use droneguard_shared::{Alert, ConnectivityState, FailsafeStatus, TelemetrySample, VerificationReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_TELEMETRY_CAPACITY: usize = 2_000;
pub const DEFAULT_ALERT_CAPACITY: usize = 500;

/// Which end of the telemetry history holds the newest sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub telemetry_capacity: usize,
    pub alert_capacity: usize,
    pub history_order: HistoryOrder,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            history_order: HistoryOrder::OldestFirst,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Frames handed to the store, kept or dropped.
    pub frames_received: u64,
    pub dropped_frames: u64,
    pub last_discard: Option<Discard>,
}

#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    telemetry: RingBuffer<Arc<TelemetrySample>>,
    order: HistoryOrder,
    // newest first
    alerts: RingBuffer<Arc<Alert>>,
    failsafe: FailsafeStatus,
    connectivity: ConnectivityState,
    diagnostics: Diagnostics,
    version: u64,
}

impl StoreSnapshot {
    fn empty(config: &StoreConfig) -> Self {
        Self {
            telemetry: RingBuffer::new(config.telemetry_capacity),
            order: config.history_order,
            alerts: RingBuffer::new(config.alert_capacity),
            failsafe: FailsafeStatus::default(),
            connectivity: ConnectivityState::default(),
            diagnostics: Diagnostics::default(),
            version: 0,
        }
    }

    /// Bumped once per committed change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Telemetry in storage order (see `HistoryOrder`).
    pub fn telemetry(&self) -> impl DoubleEndedIterator<Item = &TelemetrySample> + '_ {
        self.telemetry.iter().map(|s| s.as_ref())
    }

    /// Telemetry oldest to newest regardless of storage order.
    pub fn telemetry_chronological(&self) -> Box<dyn Iterator<Item = &TelemetrySample> + '_> {
        match self.order {
            HistoryOrder::OldestFirst => Box::new(self.telemetry()),
            HistoryOrder::NewestFirst => Box::new(self.telemetry().rev()),
        }
    }

    pub fn latest_telemetry(&self) -> Option<&TelemetrySample> {
        let newest = match self.order {
            HistoryOrder::OldestFirst => self.telemetry.back(),
            HistoryOrder::NewestFirst => self.telemetry.front(),
        };
        newest.map(|s| s.as_ref())
    }

    pub fn telemetry_len(&self) -> usize {
        self.telemetry.len()
    }

    pub fn telemetry_capacity(&self) -> usize {
        self.telemetry.capacity()
    }

    pub fn history_order(&self) -> HistoryOrder {
        self.order
    }

    /// Newest first.
    pub fn alerts(&self) -> impl Iterator<Item = &Alert> + '_ {
        self.alerts.iter().map(|a| a.as_ref())
    }

    pub fn recent_alerts(&self, n: usize) -> Vec<&Alert> {
        self.alerts().take(n).collect()
    }

    pub fn alerts_len(&self) -> usize {
        self.alerts.len()
    }

    pub fn alert_capacity(&self) -> usize {
        self.alerts.capacity()
    }

    /// Alerts grouped by detector type, each group newest first.
    pub fn alerts_by_kind(&self) -> BTreeMap<&str, Vec<&Alert>> {
        let mut grouped: BTreeMap<&str, Vec<&Alert>> = BTreeMap::new();
        for alert in self.alerts() {
            grouped.entry(alert.kind.as_str()).or_default().push(alert);
        }
        grouped
    }

    pub fn failsafe(&self) -> &FailsafeStatus {
        &self.failsafe
    }

    pub fn connectivity(&self) -> &ConnectivityState {
        &self.connectivity
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

// ---------------------------------------------------------
// Reducers. Each takes the working copy and one input.
// ---------------------------------------------------------

fn insert_sample(s: &mut StoreSnapshot, sample: TelemetrySample) {
    let sample = Arc::new(sample);
    match s.order {
        HistoryOrder::OldestFirst => s.telemetry.push_back(sample),
        HistoryOrder::NewestFirst => s.telemetry.push_front(sample),
    };
}

fn prepend_alerts(s: &mut StoreSnapshot, batch: Vec<Alert>) {
    // reversed so the first alert of the batch ends up at the very front
    for alert in batch.into_iter().rev() {
        s.alerts.push_front(Arc::new(alert));
    }
}

fn reduce(s: &mut StoreSnapshot, event: ClassifiedEvent) {
    s.diagnostics.frames_received += 1;
    match event {
        ClassifiedEvent::Telemetry {
            sample,
            alerts,
            failsafe,
        } => {
            insert_sample(s, sample);
            if !alerts.is_empty() {
                prepend_alerts(s, alerts);
            }
            if let Some(status) = failsafe {
                s.failsafe = status;
            }
        }
        ClassifiedEvent::Alerts(batch) => prepend_alerts(s, batch),
        ClassifiedEvent::Failsafe(status) => s.failsafe = status,
    }
}

fn reduce_discard(s: &mut StoreSnapshot, reason: Discard) {
    s.diagnostics.frames_received += 1;
    s.diagnostics.dropped_frames += 1;
    s.diagnostics.last_discard = Some(reason);
}

/// Returns false when nothing changed.
fn reduce_connected(s: &mut StoreSnapshot, connected: bool, at_ms: i64) -> bool {
    let conn = &mut s.connectivity;
    if connected {
        conn.connected = true;
        conn.generation += 1;
        conn.last_seen_ms = Some(at_ms);
        true
    } else if conn.connected {
        conn.connected = false;
        conn.last_seen_ms = Some(at_ms);
        true
    } else {
        false
    }
}

pub struct Store {
    current: Mutex<Arc<StoreSnapshot>>,
    subscribers: Subscribers<Arc<StoreSnapshot>>,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            current: Mutex::new(Arc::new(StoreSnapshot::empty(&config))),
            subscribers: Subscribers::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn apply(&self, event: ClassifiedEvent) {
        self.commit(|s| {
            reduce(s, event);
            true
        });
    }

    /// Counts a dropped frame in `Diagnostics` (frames seen, frames dropped,
    /// last reason). History, alerts, failsafe and connectivity stay as they
    /// were.
    pub fn record_discard(&self, reason: Discard) {
        self.commit(|s| {
            reduce_discard(s, reason);
            true
        });
    }

    /// Transport lifecycle only. Opening bumps the connectivity generation.
    pub fn set_connected(&self, connected: bool, at_ms: i64) {
        self.commit(|s| reduce_connected(s, connected, at_ms));
    }

    pub fn set_verification(&self, report: VerificationReport) {
        self.commit(|s| {
            s.connectivity.verification = Some(report);
            true
        });
    }

    /// Registers a listener and immediately hands it the current snapshot.
    /// A listener never receives a snapshot older than one it already saw.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<StoreSnapshot>) + Send + Sync + 'static,
    {
        // highest version delivered so far, plus one (0 = nothing yet)
        let delivered = AtomicU64::new(0);
        let sub = self.subscribers.subscribe(move |snap: &Arc<StoreSnapshot>| {
            let next = snap.version + 1;
            if delivered.fetch_max(next, Ordering::AcqRel) < next {
                listener(snap);
            }
        });
        let current = self.snapshot();
        self.subscribers.notify_one(&sub, &current);
        sub
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn commit<F>(&self, f: F)
    where
        F: FnOnce(&mut StoreSnapshot) -> bool,
    {
        let published = {
            let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let working = Arc::make_mut(&mut guard);
            if !f(working) {
                return;
            }
            working.version += 1;
            guard.clone()
        };
        self.subscribers.notify(&published);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use droneguard_shared::{FailsafeAction, TelemetrySource};
    use proptest::prelude::*;
    use serde_json::{Value, json};

    fn sample(time: f64) -> TelemetrySample {
        TelemetrySample {
            time,
            gps_lat: Some(time),
            gps_lon: Some(-time),
            roll: None,
            pitch: None,
            yaw: None,
            altitude: None,
            speed: None,
            source: TelemetrySource::Normal,
            raw: Value::Null,
        }
    }

    fn telemetry(time: f64) -> ClassifiedEvent {
        ClassifiedEvent::Telemetry {
            sample: sample(time),
            alerts: Vec::new(),
            failsafe: None,
        }
    }

    fn alert(kind: &str) -> Alert {
        Alert {
            kind: kind.to_string(),
            reason: None,
            detail: Value::Null,
            received_at_ms: 0,
        }
    }

    fn small_store(c: usize, a: usize, order: HistoryOrder) -> Store {
        Store::new(StoreConfig {
            telemetry_capacity: c,
            alert_capacity: a,
            history_order: order,
        })
    }

    proptest! {
        #[test]
        fn telemetry_history_stays_bounded(
            capacity in 1usize..40,
            count in 0usize..200,
            newest_first in any::<bool>(),
        ) {
            let order = if newest_first { HistoryOrder::NewestFirst } else { HistoryOrder::OldestFirst };
            let store = small_store(capacity, 10, order);
            for i in 0..count {
                store.apply(telemetry(i as f64));
                let snap = store.snapshot();
                prop_assert!(snap.telemetry_len() <= capacity);
                prop_assert_eq!(snap.latest_telemetry().map(|s| s.time), Some(i as f64));
                if i >= capacity {
                    let evicted = (i - capacity) as f64;
                    prop_assert!(snap.telemetry().all(|s| s.time != evicted));
                }
            }
            let snap = store.snapshot();
            let times: Vec<f64> = snap.telemetry_chronological().map(|s| s.time).collect();
            let expected: Vec<f64> = (count.saturating_sub(capacity)..count).map(|i| i as f64).collect();
            prop_assert_eq!(times, expected);
        }

        #[test]
        fn alert_feed_stays_bounded_and_keeps_batch_order(
            capacity in 1usize..25,
            // mixes single-alert and multi-alert frames
            batches in proptest::collection::vec(0usize..6, 0..40),
        ) {
            let store = small_store(10, capacity, HistoryOrder::OldestFirst);
            let mut next = 0usize;
            for size in batches {
                let objects: Vec<Value> = (next..next + size)
                    .map(|n| json!({"type": n.to_string()}))
                    .collect();
                next += size;
                let payload = if size == 1 { objects[0].clone() } else { Value::Array(objects) };
                let raw = json!({"type": "alert", "payload": payload}).to_string();
                store.apply(classify(&raw, 0).unwrap());
                let snap = store.snapshot();
                prop_assert!(snap.alerts_len() <= capacity);

                // within one batch ids ascend front-to-back, batches themselves are newest first
                let ids: Vec<usize> = snap.alerts().map(|a| a.kind.parse().unwrap()).collect();
                let batch_start = next - size;
                let head: Vec<usize> = ids.iter().copied().take_while(|id| *id >= batch_start).collect();
                let expected: Vec<usize> = (batch_start..next).take(capacity).collect();
                prop_assert_eq!(head, expected);
            }
        }
    }

    #[test]
    fn alert_batch_larger_than_capacity_keeps_its_head() {
        let store = small_store(10, 3, HistoryOrder::OldestFirst);
        store.apply(ClassifiedEvent::Alerts(vec![alert("old")]));
        store.apply(ClassifiedEvent::Alerts(
            ["a", "b", "c", "d", "e"].into_iter().map(alert).collect(),
        ));
        let snap = store.snapshot();
        let kinds: Vec<_> = snap.alerts().map(|a| a.kind.as_str()).collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);
    }

    #[test]
    fn newest_first_history_puts_latest_at_front() {
        let store = small_store(3, 3, HistoryOrder::NewestFirst);
        for t in 1..=4 {
            store.apply(telemetry(t as f64));
        }
        let snap = store.snapshot();
        let stored: Vec<f64> = snap.telemetry().map(|s| s.time).collect();
        assert_eq!(stored, vec![4.0, 3.0, 2.0]);
        let chrono: Vec<f64> = snap.telemetry_chronological().map(|s| s.time).collect();
        assert_eq!(chrono, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn telemetry_frame_folds_embedded_alerts_and_failsafe_at_once() {
        let store = Store::default();
        let raw = json!({
            "type": "telemetry",
            "payload": {"time": 5.0, "gps_lat": 1.0, "gps_lon": 2.0},
            "alerts": [{"type": "GPS_SPOOF"}, {"type": "YAW_JUMP"}],
            "failsafe": {"active": true, "reason": "TOO_MANY_ALERTS"}
        })
        .to_string();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = store.subscribe(move |snap| {
            seen2.lock().unwrap().push((
                snap.telemetry_len(),
                snap.alerts_len(),
                snap.failsafe().active,
            ));
        });

        store.apply(classify(&raw, 0).unwrap());
        let seen = seen.lock().unwrap();
        // initial delivery, then exactly one fully-applied update
        assert_eq!(*seen, vec![(0, 0, false), (1, 2, true)]);
    }

    #[test]
    fn malformed_frame_only_moves_the_drop_counter() {
        let store = Store::default();
        store.apply(telemetry(1.0));
        store.apply(ClassifiedEvent::Alerts(vec![alert("X")]));
        let before = store.snapshot();

        for raw in ["{{{", r#"{"type":"bogus","payload":{}}"#] {
            let discard = classify(raw, 0).unwrap_err();
            store.record_discard(discard);
        }

        let after = store.snapshot();
        assert_eq!(after.diagnostics().dropped_frames, before.diagnostics().dropped_frames + 2);
        assert_eq!(after.diagnostics().frames_received, before.diagnostics().frames_received + 2);
        assert_eq!(after.version(), before.version() + 2);
        assert_eq!(
            after.diagnostics().last_discard,
            Some(Discard::UnknownType("bogus".into()))
        );
        let times = |s: &StoreSnapshot| s.telemetry().map(|t| t.time).collect::<Vec<_>>();
        assert_eq!(times(&after), times(&before));
        assert_eq!(after.recent_alerts(10), before.recent_alerts(10));
        assert_eq!(after.failsafe(), before.failsafe());
        assert_eq!(after.connectivity(), before.connectivity());
    }

    #[test]
    fn reconnect_keeps_retained_window() {
        let store = Store::default();
        store.set_connected(true, 100);
        store.apply(telemetry(1.0));
        store.apply(ClassifiedEvent::Alerts(vec![alert("A")]));
        store.apply(ClassifiedEvent::Failsafe(FailsafeStatus {
            active: true,
            reason: Some("manual".into()),
            action: FailsafeAction::Land,
            activated_at: None,
            auto_mode: None,
        }));

        store.set_connected(false, 200);
        let down = store.snapshot();
        assert!(!down.connectivity().connected);
        assert_eq!(down.connectivity().last_seen_ms, Some(200));

        store.set_connected(true, 300);
        let up = store.snapshot();
        assert!(up.connectivity().connected);
        assert_eq!(up.connectivity().generation, 2);
        assert_eq!(up.telemetry_len(), 1);
        assert_eq!(up.alerts_len(), 1);
        assert!(up.failsafe().active);
        assert_eq!(up.failsafe().action, FailsafeAction::Land);
    }

    #[test]
    fn repeated_disconnect_is_not_a_change() {
        let store = Store::default();
        let v0 = store.snapshot().version();
        store.set_connected(false, 10);
        assert_eq!(store.snapshot().version(), v0);
    }

    #[test]
    fn failsafe_is_last_write_wins() {
        let store = Store::default();
        store.apply(ClassifiedEvent::Failsafe(FailsafeStatus {
            active: true,
            reason: Some("first".into()),
            action: FailsafeAction::KillSwitch,
            activated_at: Some(1.0),
            auto_mode: Some(true),
        }));
        store.apply(ClassifiedEvent::Failsafe(FailsafeStatus {
            active: false,
            ..FailsafeStatus::default()
        }));
        let snap = store.snapshot();
        assert_eq!(snap.failsafe(), &FailsafeStatus::default());
    }

    #[test]
    fn early_and_late_subscribers_agree_after_a_burst() {
        let store = Store::default();
        let early = Arc::new(Mutex::new(None::<Arc<StoreSnapshot>>));
        let e2 = early.clone();
        let _early_sub = store.subscribe(move |snap| {
            *e2.lock().unwrap() = Some(snap.clone());
        });

        for i in 0..50 {
            store.apply(telemetry(i as f64));
        }

        let late = Arc::new(Mutex::new(None::<Arc<StoreSnapshot>>));
        let l2 = late.clone();
        let _late_sub = store.subscribe(move |snap| {
            *l2.lock().unwrap() = Some(snap.clone());
        });

        let early = early.lock().unwrap().clone().unwrap();
        let late = late.lock().unwrap().clone().unwrap();
        assert_eq!(early.version(), late.version());
        assert_eq!(early.telemetry_len(), 50);
        let times = |s: &StoreSnapshot| s.telemetry().map(|t| t.time).collect::<Vec<_>>();
        assert_eq!(times(&early), times(&late));
    }

    #[test]
    fn held_snapshot_is_not_mutated_by_later_applies() {
        let store = Store::default();
        store.apply(telemetry(1.0));
        let held = store.snapshot();
        store.apply(telemetry(2.0));
        assert_eq!(held.telemetry_len(), 1);
        assert_eq!(store.snapshot().telemetry_len(), 2);
    }

    #[test]
    fn snapshots_held_across_a_full_window_of_applies_stay_intact() {
        let store = small_store(64, 16, HistoryOrder::OldestFirst);
        for t in 0..64 {
            store.apply(telemetry(t as f64));
        }

        let mut held = Vec::new();
        for t in 64..256 {
            held.push(store.snapshot());
            store.apply(telemetry(t as f64));
            store.apply(ClassifiedEvent::Alerts(vec![alert(&t.to_string())]));
        }

        for (i, snap) in held.iter().enumerate() {
            let newest = 63 + i;
            let times: Vec<f64> = snap.telemetry().map(|s| s.time).collect();
            let expected: Vec<f64> = (newest - 63..=newest).map(|t| t as f64).collect();
            assert_eq!(times, expected);
            assert_eq!(snap.alerts_len(), i.min(16));
        }
        let last = store.snapshot();
        assert_eq!(last.latest_telemetry().map(|s| s.time), Some(255.0));
        assert_eq!(last.alerts().next().map(|a| a.kind.as_str()), Some("255"));
    }

    #[test]
    fn alerts_group_by_kind() {
        let store = Store::default();
        store.apply(ClassifiedEvent::Alerts(vec![alert("GPS_SPOOF"), alert("YAW_JUMP")]));
        store.apply(ClassifiedEvent::Alerts(vec![alert("GPS_SPOOF")]));
        let snap = store.snapshot();
        let grouped = snap.alerts_by_kind();
        assert_eq!(grouped["GPS_SPOOF"].len(), 2);
        assert_eq!(grouped["YAW_JUMP"].len(), 1);
    }

    #[test]
    fn unsubscribe_from_inside_the_listener() {
        let store = Store::default();
        let hits = Arc::new(AtomicU64::new(0));
        let slot: Arc<std::sync::OnceLock<crate::subscription::Unsubscriber>> =
            Arc::new(std::sync::OnceLock::new());

        let (h, s) = (hits.clone(), slot.clone());
        let sub = store.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = s.get() {
                handle.unsubscribe();
            }
        });
        let _ = slot.set(sub.unsubscriber());

        store.apply(telemetry(1.0));
        store.apply(telemetry(2.0));
        // initial delivery + the first apply
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(store.subscriber_count(), 0);
    }
}

// Frame classification: raw websocket text -> closed event type.
//
// Everything downstream of `classify` works on `ClassifiedEvent`; untyped JSON
// never leaves this module except as the opaque `raw`/`detail` fields.

use droneguard_shared::{Alert, FailsafeAction, FailsafeStatus, TelemetrySample, TelemetrySource};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Envelope as broadcast by the backend:
///   { "type": "telemetry", "payload": {...}, "alerts": [...], "failsafe": {...} }
///   { "type": "alert",     "payload": {...} | [...] }
///   { "type": "failsafe",  "payload": {...} }
#[derive(Deserialize, Debug)]
struct WsInFrame {
    #[serde(rename = "type")]
    ty: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    alerts: Value,
    #[serde(default)]
    failsafe: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    /// A reading plus whatever detector output and failsafe state the backend
    /// attached to it. Applied as one unit.
    Telemetry {
        sample: TelemetrySample,
        alerts: Vec<Alert>,
        failsafe: Option<FailsafeStatus>,
    },
    /// Batch order as received.
    Alerts(Vec<Alert>),
    Failsafe(FailsafeStatus),
}

impl ClassifiedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifiedEvent::Telemetry { .. } => "telemetry",
            ClassifiedEvent::Alerts(_) => "alert",
            ClassifiedEvent::Failsafe(_) => "failsafe",
        }
    }
}

/// Why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Discard {
    #[error("frame is not valid JSON")]
    Malformed,
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no type")]
    MissingType,
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("{kind} frame has no usable payload")]
    BadPayload { kind: &'static str },
}

/// Never panics; anything unusable comes back as `Err(Discard)`.
pub fn classify(raw: &str, now_ms: i64) -> Result<ClassifiedEvent, Discard> {
    let value: Value = serde_json::from_str(raw).map_err(|_| Discard::Malformed)?;
    if !value.is_object() {
        return Err(Discard::NotAnObject);
    }
    let frame: WsInFrame = serde_json::from_value(value).map_err(|_| Discard::Malformed)?;
    let Some(ty) = frame.ty else {
        return Err(Discard::MissingType);
    };

    match ty.as_str() {
        "telemetry" => {
            let Value::Object(payload) = frame.payload else {
                return Err(Discard::BadPayload { kind: "telemetry" });
            };
            let sample = sample_from_payload(payload, now_ms);
            let alerts = match &frame.alerts {
                Value::Array(_) | Value::Object(_) => alerts_from_value(&frame.alerts, now_ms),
                _ => Vec::new(),
            };
            let failsafe = match &frame.failsafe {
                Value::Object(m) => Some(failsafe_from_payload(m)),
                _ => None,
            };
            Ok(ClassifiedEvent::Telemetry {
                sample,
                alerts,
                failsafe,
            })
        }

        "alert" => match &frame.payload {
            Value::Object(_) | Value::Array(_) => {
                Ok(ClassifiedEvent::Alerts(alerts_from_value(&frame.payload, now_ms)))
            }
            _ => Err(Discard::BadPayload { kind: "alert" }),
        },

        "failsafe" => match &frame.payload {
            Value::Object(m) => Ok(ClassifiedEvent::Failsafe(failsafe_from_payload(m))),
            _ => Err(Discard::BadPayload { kind: "failsafe" }),
        },

        other => Err(Discard::UnknownType(other.to_string())),
    }
}

fn number(p: &Map<String, Value>, key: &str) -> Option<f64> {
    p.get(key).and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn string(p: &Map<String, Value>, key: &str) -> Option<String> {
    p.get(key).and_then(Value::as_str).map(str::to_string)
}

fn sample_from_payload(p: Map<String, Value>, now_ms: i64) -> TelemetrySample {
    // zero is what an unset vehicle clock sends
    let time = number(&p, "time")
        .filter(|t| *t != 0.0)
        .unwrap_or(now_ms as f64 / 1000.0);

    TelemetrySample {
        time,
        gps_lat: number(&p, "gps_lat"),
        gps_lon: number(&p, "gps_lon"),
        roll: number(&p, "roll"),
        pitch: number(&p, "pitch"),
        yaw: number(&p, "yaw"),
        altitude: number(&p, "altitude").or_else(|| number(&p, "alt")),
        speed: number(&p, "speed"),
        source: p
            .get("source")
            .and_then(Value::as_str)
            .map(TelemetrySource::from_wire)
            .unwrap_or_default(),
        raw: Value::Object(p),
    }
}

fn alert_from_object(obj: &Map<String, Value>, now_ms: i64) -> Alert {
    let detail = obj.get("detail").cloned().unwrap_or_else(|| Value::Object(obj.clone()));
    let reason = string(obj, "reason").or_else(|| {
        detail
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    Alert {
        kind: string(obj, "type").unwrap_or_else(|| "unknown".to_string()),
        reason,
        detail,
        received_at_ms: now_ms,
    }
}

fn alerts_from_value(v: &Value, now_ms: i64) -> Vec<Alert> {
    match v {
        Value::Object(obj) => vec![alert_from_object(obj, now_ms)],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|obj| alert_from_object(obj, now_ms))
            .collect(),
        _ => Vec::new(),
    }
}

fn failsafe_from_payload(p: &Map<String, Value>) -> FailsafeStatus {
    FailsafeStatus {
        active: p.get("active").and_then(Value::as_bool).unwrap_or(false),
        reason: string(p, "reason"),
        action: p
            .get("action")
            .and_then(Value::as_str)
            .map(FailsafeAction::from_wire)
            .unwrap_or_default(),
        activated_at: number(p, "activated_at"),
        auto_mode: p.get("auto_mode").and_then(Value::as_bool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW_MS: i64 = 1_700_000_000_000;

    #[test]
    fn telemetry_fields_default_to_none_not_zero() {
        let raw = json!({
            "type": "telemetry",
            "payload": {
                "time": 12.5,
                "gps_lat": 43.0,
                "gps_lon": "not a number",
                "roll": 0.0,
                "speed": null,
                "source": "injected"
            }
        })
        .to_string();

        let ClassifiedEvent::Telemetry { sample, alerts, failsafe } = classify(&raw, NOW_MS).unwrap()
        else {
            panic!("expected telemetry");
        };
        assert_eq!(sample.time, 12.5);
        assert_eq!(sample.gps_lat, Some(43.0));
        assert_eq!(sample.gps_lon, None);
        assert_eq!(sample.roll, Some(0.0));
        assert_eq!(sample.pitch, None);
        assert_eq!(sample.speed, None);
        assert_eq!(sample.source, TelemetrySource::Injected);
        assert_eq!(sample.raw["gps_lon"], "not a number");
        assert!(alerts.is_empty());
        assert!(failsafe.is_none());
    }

    #[test]
    fn telemetry_time_and_altitude_fallbacks() {
        let raw = r#"{"type":"telemetry","payload":{"time":0,"alt":120.0}}"#;
        let Ok(ClassifiedEvent::Telemetry { sample, .. }) = classify(raw, NOW_MS) else {
            panic!("expected telemetry");
        };
        assert_eq!(sample.time, NOW_MS as f64 / 1000.0);
        assert_eq!(sample.altitude, Some(120.0));
        assert_eq!(sample.source, TelemetrySource::Normal);
    }

    #[test]
    fn telemetry_carries_embedded_alerts_and_failsafe() {
        let raw = json!({
            "type": "telemetry",
            "payload": {"time": 1.0},
            "alerts": [
                {"type": "GPS_SPOOF", "anomaly": true, "detail": {"distance_jump": 250.0}},
                {"type": "YAW_JUMP", "reason": "yaw delta 90", "detail": {}}
            ],
            "failsafe": {"active": true, "reason": "IMPOSSIBLE_MOVEMENT", "activated_at": 99.0, "auto_mode": false}
        })
        .to_string();

        let Ok(ClassifiedEvent::Telemetry { alerts, failsafe, .. }) = classify(&raw, NOW_MS) else {
            panic!("expected telemetry");
        };
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, "GPS_SPOOF");
        assert_eq!(alerts[0].detail["distance_jump"], 250.0);
        assert_eq!(alerts[1].reason.as_deref(), Some("yaw delta 90"));
        let failsafe = failsafe.unwrap();
        assert!(failsafe.active);
        assert_eq!(failsafe.activated_at, Some(99.0));
        assert_eq!(failsafe.auto_mode, Some(false));
        assert_eq!(failsafe.action, FailsafeAction::None);
    }

    #[test]
    fn alert_single_and_batch_normalize() {
        let single = r#"{"type":"alert","payload":{"type":"PHYSICS_CHECK","reason":"too fast"}}"#;
        let Ok(ClassifiedEvent::Alerts(one)) = classify(single, NOW_MS) else {
            panic!("expected alerts");
        };
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].kind, "PHYSICS_CHECK");
        assert_eq!(one[0].received_at_ms, NOW_MS);
        // no detail field: the whole object is kept
        assert_eq!(one[0].detail["reason"], "too fast");

        let batch = r#"{"type":"alert","payload":[{"type":"A"},"junk",{"reason":"r"},{"type":"C"}]}"#;
        let Ok(ClassifiedEvent::Alerts(many)) = classify(batch, NOW_MS) else {
            panic!("expected alerts");
        };
        let kinds: Vec<_> = many.iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(kinds, vec!["A", "unknown", "C"]);
    }

    #[test]
    fn failsafe_payload_replaces_fields() {
        let raw = r#"{"type":"failsafe","payload":{"active":true,"reason":null,"action":"rtl"}}"#;
        let Ok(ClassifiedEvent::Failsafe(status)) = classify(raw, NOW_MS) else {
            panic!("expected failsafe");
        };
        assert!(status.active);
        assert_eq!(status.reason, None);
        assert_eq!(status.action, FailsafeAction::ReturnToLaunch);
    }

    #[test]
    fn unusable_frames_are_discarded() {
        assert_eq!(classify("{not json", NOW_MS), Err(Discard::Malformed));
        assert_eq!(classify("[1,2,3]", NOW_MS), Err(Discard::NotAnObject));
        assert_eq!(classify(r#"{"payload":{}}"#, NOW_MS), Err(Discard::MissingType));
        assert_eq!(classify(r#"{"type":7}"#, NOW_MS), Err(Discard::Malformed));
        assert_eq!(
            classify(r#"{"type":"heartbeat","payload":{}}"#, NOW_MS),
            Err(Discard::UnknownType("heartbeat".into()))
        );
        assert_eq!(
            classify(r#"{"type":"telemetry"}"#, NOW_MS),
            Err(Discard::BadPayload { kind: "telemetry" })
        );
        assert_eq!(
            classify(r#"{"type":"alert","payload":"oops"}"#, NOW_MS),
            Err(Discard::BadPayload { kind: "alert" })
        );
        assert_eq!(
            classify(r#"{"type":"failsafe","payload":[true]}"#, NOW_MS),
            Err(Discard::BadPayload { kind: "failsafe" })
        );
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Origin tag on a telemetry sample. Only used for highlighting; the backend
/// decides what counts as injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    #[default]
    Normal,
    Injected,
    Failsafe,
}

impl TelemetrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetrySource::Normal => "normal",
            TelemetrySource::Injected => "injected",
            TelemetrySource::Failsafe => "failsafe",
        }
    }

    /// Unknown tags fall back to `Normal`.
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "injected" => TelemetrySource::Injected,
            "failsafe" => TelemetrySource::Failsafe,
            _ => TelemetrySource::Normal,
        }
    }
}

impl fmt::Display for TelemetrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One vehicle reading. `None` means the field was missing or not a number,
/// which is different from a zero reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Seconds since the unix epoch, as stamped by the vehicle.
    pub time: f64,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub source: TelemetrySource,
    /// The payload exactly as received.
    pub raw: Value,
}

impl TelemetrySample {
    pub fn gps(&self) -> Option<(f64, f64)> {
        Some((self.gps_lat?, self.gps_lon?))
    }
}

/// Detector output forwarded by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: String,
    pub reason: Option<String>,
    pub detail: Value,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailsafeAction {
    #[default]
    None,
    Hover,
    Land,
    ReturnToLaunch,
    KillSwitch,
    Other(String),
}

impl FailsafeAction {
    pub fn as_str(&self) -> &str {
        match self {
            FailsafeAction::None => "none",
            FailsafeAction::Hover => "hover",
            FailsafeAction::Land => "land",
            FailsafeAction::ReturnToLaunch => "return_to_launch",
            FailsafeAction::KillSwitch => "kill_switch",
            FailsafeAction::Other(s) => s,
        }
    }

    pub fn from_wire(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "" | "none" => FailsafeAction::None,
            "hover" | "hold" | "loiter" => FailsafeAction::Hover,
            "land" => FailsafeAction::Land,
            "rtl" | "return_to_launch" | "return_home" => FailsafeAction::ReturnToLaunch,
            "kill" | "kill_switch" | "killswitch" => FailsafeAction::KillSwitch,
            _ => FailsafeAction::Other(trimmed.to_string()),
        }
    }
}

impl From<String> for FailsafeAction {
    fn from(s: String) -> Self {
        FailsafeAction::from_wire(&s)
    }
}

impl From<FailsafeAction> for String {
    fn from(a: FailsafeAction) -> Self {
        a.as_str().to_string()
    }
}

impl fmt::Display for FailsafeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mirror of the backend failsafe. Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailsafeStatus {
    pub active: bool,
    pub reason: Option<String>,
    #[serde(default)]
    pub action: FailsafeAction,
    /// Backend clock, seconds.
    pub activated_at: Option<f64>,
    pub auto_mode: Option<bool>,
}

/// Result of one poll of the backend verification endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub status: String,
    pub error: Option<String>,
    pub body: Value,
    pub checked_at_ms: i64,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.status.eq_ignore_ascii_case("ok")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityState {
    /// Driven by the transport lifecycle only, never by message arrival.
    pub connected: bool,
    pub last_seen_ms: Option<i64>,
    /// Bumped on every successful open; a change means the timeline may have a gap.
    pub generation: u64,
    pub verification: Option<VerificationReport>,
}

// Operator command egress: attack injection and failsafe control.
//
// Commands go only to allow-listed local origins. Failures are returned to the
// operator and never touch ingestion state.

use crate::config::CommandConfig;
use crate::error::{ConsoleError, ConsoleResult};
use crate::verify::describe_reqwest_error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const TARGET: &str = "droneguard::commands";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttackMode {
    GpsSpoof,
    ImuInjection,
    ModeHijack,
    Jamming,
    SpeedSurge,
    DestHijack,
    YawSpike,
    Other(String),
}

impl AttackMode {
    pub fn as_str(&self) -> &str {
        match self {
            AttackMode::GpsSpoof => "GPS_SPOOF",
            AttackMode::ImuInjection => "IMU_INJECTION",
            AttackMode::ModeHijack => "MODE_HIJACK",
            AttackMode::Jamming => "JAMMING",
            AttackMode::SpeedSurge => "SPEED_SURGE",
            AttackMode::DestHijack => "DEST_HIJACK",
            AttackMode::YawSpike => "YAW_SPIKE",
            AttackMode::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        let norm = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "GPS_SPOOF" => AttackMode::GpsSpoof,
            "IMU_INJECTION" => AttackMode::ImuInjection,
            "MODE_HIJACK" => AttackMode::ModeHijack,
            "JAMMING" => AttackMode::Jamming,
            "SPEED_SURGE" => AttackMode::SpeedSurge,
            "DEST_HIJACK" => AttackMode::DestHijack,
            "YAW_SPIKE" => AttackMode::YawSpike,
            _ => AttackMode::Other(norm),
        }
    }
}

impl From<String> for AttackMode {
    fn from(s: String) -> Self {
        AttackMode::parse(&s)
    }
}

impl From<AttackMode> for String {
    fn from(m: AttackMode) -> Self {
        m.as_str().to_string()
    }
}

impl std::fmt::Display for AttackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackRequest {
    pub mode: AttackMode,
    /// Magnitude multiplier.
    pub mag: f64,
    /// `sudden` or `gradual`.
    pub style: String,
    /// Seconds.
    pub dur: u32,
}

impl AttackRequest {
    pub fn new(mode: AttackMode) -> Self {
        Self {
            mode,
            mag: 1.0,
            style: "sudden".to_string(),
            dur: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub status: u16,
    pub body: Value,
    pub attempts: u32,
}

pub struct CommandClient {
    client: reqwest::Client,
    base: Url,
    config: CommandConfig,
}

fn origin_of(raw: &str) -> ConsoleResult<String> {
    let url = Url::parse(raw.trim()).map_err(|e| ConsoleError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(url.origin().ascii_serialization())
}

impl CommandClient {
    /// Fails with `OriginNotAllowed` unless `base_url`'s origin is allow-listed.
    pub fn new(base_url: &str, config: CommandConfig) -> ConsoleResult<Self> {
        let origin = origin_of(base_url)?;
        let allowed = config
            .allowed_origins
            .iter()
            .filter_map(|o| origin_of(o).ok())
            .any(|o| o == origin);
        if !allowed {
            return Err(ConsoleError::OriginNotAllowed { origin });
        }

        let base = Url::parse(&origin).map_err(|e| ConsoleError::InvalidUrl {
            url: origin.clone(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base,
            config,
        })
    }

    pub fn origin(&self) -> String {
        self.base.origin().ascii_serialization()
    }

    pub async fn trigger_attack(&self, req: &AttackRequest) -> ConsoleResult<CommandReply> {
        let mag = req.mag.to_string();
        let dur = req.dur.to_string();
        self.post(
            "attack",
            "/attack",
            &[
                ("mode", req.mode.as_str()),
                ("mag", mag.as_str()),
                ("style", req.style.as_str()),
                ("dur", dur.as_str()),
            ],
        )
        .await
    }

    pub async fn clear_attack(&self) -> ConsoleResult<CommandReply> {
        self.post("clear-attack", "/attack/clear", &[]).await
    }

    pub async fn activate_failsafe(&self, reason: Option<&str>) -> ConsoleResult<CommandReply> {
        let query: Vec<(&str, &str)> = reason.map(|r| ("reason", r)).into_iter().collect();
        self.post("failsafe-activate", "/failsafe/activate", &query)
            .await
    }

    pub async fn deactivate_failsafe(&self) -> ConsoleResult<CommandReply> {
        self.post("failsafe-deactivate", "/failsafe/deactivate", &[])
            .await
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    async fn post(
        &self,
        command: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> ConsoleResult<CommandReply> {
        let url = self.endpoint(path, query);
        let attempts_allowed = self.config.max_retries + 1;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let last = attempt >= attempts_allowed;

            match self.client.post(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status().as_u16();
                    let body = match resp.bytes().await {
                        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
                        Err(e) => {
                            warn!(
                                target: TARGET,
                                command,
                                %url,
                                attempt,
                                error = %describe_reqwest_error(&e),
                                "command accepted but reply body unreadable"
                            );
                            Value::Null
                        }
                    };
                    info!(target: TARGET, command, %url, attempt, "command accepted");
                    return Ok(CommandReply {
                        status,
                        body,
                        attempts: attempt,
                    });
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    warn!(target: TARGET, command, %url, attempt, status, "command rejected");
                    if last {
                        return Err(ConsoleError::CommandRejected {
                            command,
                            status,
                            attempts: attempt,
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        target: TARGET,
                        command,
                        %url,
                        attempt,
                        error = %describe_reqwest_error(&e),
                        "command failed"
                    );
                    if last {
                        return Err(ConsoleError::CommandFailed {
                            command,
                            attempts: attempt,
                            source: e,
                        });
                    }
                }
            }

            let delay = self.config.backoff_ms.saturating_mul(u64::from(attempt));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

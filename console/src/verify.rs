// Backend verification poller: GET {backend}/pi/verify on an interval.
//
// Results only ever land in `ConnectivityState.verification`; a failing probe
// does not flip the transport's connected flag.

use crate::config::VerificationConfig;
use crate::error::ConsoleResult;
use droneguard_shared::VerificationReport;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const TARGET: &str = "droneguard::verify";
const MAX_BODY_BYTES: usize = 16 * 1024;

pub(crate) fn describe_reqwest_error(e: &reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect failed"
    } else if e.is_decode() {
        "decode error"
    } else if e.is_body() {
        "body read error"
    } else if e.is_request() {
        "request error"
    } else {
        "http error"
    };
    format!("{kind}: {e}")
}

pub struct Verifier {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl Verifier {
    pub fn new(url: impl Into<String>, config: &VerificationConfig) -> ConsoleResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            interval: config.interval(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One probe. Never fails: errors come back as `status: "error"`.
    pub async fn check(&self, now_ms: i64) -> VerificationReport {
        match self.fetch().await {
            Ok(body) => VerificationReport {
                status: body
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                error: body.get("error").and_then(Value::as_str).map(str::to_string),
                body,
                checked_at_ms: now_ms,
            },
            Err(error) => {
                debug!(target: TARGET, url = %self.url, %error, "verification failed");
                VerificationReport {
                    status: "error".to_string(),
                    error: Some(error),
                    body: Value::Null,
                    checked_at_ms: now_ms,
                }
            }
        }
    }

    async fn fetch(&self) -> Result<Value, String> {
        let mut resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| describe_reqwest_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("backend returned HTTP {}", status.as_u16()));
        }
        if let Some(len) = resp.content_length()
            && len > MAX_BODY_BYTES as u64
        {
            return Err(format!("response body too large ({len} bytes)"));
        }

        // chunked replies carry no length; stop reading once past the limit
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| describe_reqwest_error(&e))? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(format!("response body too large (over {MAX_BODY_BYTES} bytes)"));
            }
            body.extend_from_slice(&chunk);
        }
        serde_json::from_slice(&body).map_err(|e| format!("invalid JSON body: {e}"))
    }

    /// Probes forever, handing each report to `sink`. Abort the task to stop.
    pub async fn run<F>(self, sink: F)
    where
        F: Fn(VerificationReport) + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_ok: Option<bool> = None;
        loop {
            ticker.tick().await;
            let report = self.check(crate::now_ms()).await;
            let ok = report.is_ok();
            if last_ok != Some(ok) {
                if ok {
                    debug!(target: TARGET, url = %self.url, "backend verified");
                } else {
                    warn!(
                        target: TARGET,
                        url = %self.url,
                        status = %report.status,
                        error = report.error.as_deref().unwrap_or(""),
                        "backend verification not ok"
                    );
                }
                last_ok = Some(ok);
            }
            sink(report);
        }
    }
}

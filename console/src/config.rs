use crate::error::{ConsoleError, ConsoleResult};
use crate::smoothing::DEFAULT_SMOOTHING_STEPS;
use crate::store::{DEFAULT_ALERT_CAPACITY, DEFAULT_TELEMETRY_CAPACITY, HistoryOrder, StoreConfig};
use crate::transport::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_WS_PATH: &str = "/ws/frontend";
pub const DEFAULT_VERIFY_PATH: &str = "/pi/verify";

const ENV_CONFIG_PATH: &str = "DRONEGUARD_CONFIG";
const ENV_BACKEND_URL: &str = "DRONEGUARD_BACKEND_URL";
const ENV_WS_URL: &str = "DRONEGUARD_WS_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub path: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: DEFAULT_VERIFY_PATH.to_string(),
            interval_ms: 5_000,
            timeout_ms: 3_000,
        }
    }
}

impl VerificationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Origins (`scheme://host:port`) commands may be sent to.
    pub allowed_origins: Vec<String>,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://127.0.0.1:8000".to_string(),
                "http://localhost:8000".to_string(),
            ],
            max_retries: 2,
            backoff_ms: 400,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub backend_url: String,
    /// Full websocket URL. Derived from `backend_url` + `ws_path` when unset.
    pub ws_url: Option<String>,
    pub ws_path: String,
    pub telemetry_capacity: usize,
    pub alert_capacity: usize,
    pub history_order: HistoryOrder,
    pub smoothing_steps: usize,
    pub reconnect: ReconnectPolicy,
    pub verification: VerificationConfig,
    pub commands: CommandConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            ws_url: None,
            ws_path: DEFAULT_WS_PATH.to_string(),
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            history_order: HistoryOrder::OldestFirst,
            smoothing_steps: DEFAULT_SMOOTHING_STEPS,
            reconnect: ReconnectPolicy::default(),
            verification: VerificationConfig::default(),
            commands: CommandConfig::default(),
        }
    }
}

impl ConsoleConfig {
    /// Reads `path` (or `$DRONEGUARD_CONFIG`) if given, applies env overrides
    /// and validates. No file at all means defaults.
    pub fn load(path: Option<&Path>) -> ConsoleResult<Self> {
        let path: Option<PathBuf> = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConsoleResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConsoleError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConsoleError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BACKEND_URL).filter(|v| !v.trim().is_empty()) {
            self.backend_url = url;
        }
        if let Some(url) = lookup(ENV_WS_URL).filter(|v| !v.trim().is_empty()) {
            self.ws_url = Some(url);
        }
    }

    pub fn validate(&self) -> ConsoleResult<()> {
        let fail = |msg: &str| Err(ConsoleError::InvalidConfig(msg.to_string()));

        if self.telemetry_capacity == 0 {
            return fail("telemetry_capacity must be at least 1");
        }
        if self.alert_capacity == 0 {
            return fail("alert_capacity must be at least 1");
        }
        let r = &self.reconnect;
        if r.base_delay_ms == 0 || r.connect_timeout_ms == 0 {
            return fail("reconnect delays must be non-zero");
        }
        if r.base_delay_ms > r.max_delay_ms {
            return fail("reconnect.base_delay_ms exceeds reconnect.max_delay_ms");
        }
        if !r.growth.is_finite() || r.growth < 1.0 {
            return fail("reconnect.growth must be a finite number >= 1");
        }
        if self.verification.enabled
            && (self.verification.interval_ms == 0 || self.verification.timeout_ms == 0)
        {
            return fail("verification interval and timeout must be non-zero");
        }

        url::Url::parse(&self.backend_http()).map_err(|e| ConsoleError::InvalidUrl {
            url: self.backend_url.clone(),
            reason: e.to_string(),
        })?;
        let ws = self.ws_endpoint();
        let parsed = url::Url::parse(&ws).map_err(|e| ConsoleError::InvalidUrl {
            url: ws.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConsoleError::InvalidUrl {
                url: ws,
                reason: "websocket url must use ws:// or wss://".to_string(),
            });
        }
        Ok(())
    }

    /// `scheme://host[:port]` of the backend.
    pub fn backend_http(&self) -> String {
        normalize_base_url(self.backend_url.clone())
    }

    pub fn ws_endpoint(&self) -> String {
        if let Some(url) = self.ws_url.as_ref().filter(|u| !u.trim().is_empty()) {
            return url.trim().to_string();
        }
        join_url(&ws_base(&self.backend_http()), &self.ws_path)
    }

    pub fn verify_endpoint(&self) -> String {
        join_url(&self.backend_http(), &self.verification.path)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            telemetry_capacity: self.telemetry_capacity,
            alert_capacity: self.alert_capacity,
            history_order: self.history_order,
        }
    }
}

/// Strips fragment and path, keeping `scheme://host[:port]`.
pub fn normalize_base_url(mut base: String) -> String {
    if let Some(i) = base.find('#') {
        base.truncate(i);
    }
    if let Some(scheme_end) = base.find("://") {
        let rest = &base[scheme_end + 3..];
        if let Some(slash) = rest.find(['/', '?']) {
            base.truncate(scheme_end + 3 + slash);
        }
    }
    base.trim().trim_end_matches('/').to_string()
}

/// http(s) base to ws(s) base; other schemes pass through.
fn ws_base(base_http: &str) -> String {
    if let Some(rest) = base_http.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_http.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_http.to_string()
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

use std::path::PathBuf;

pub type ConsoleResult<T> = Result<T, ConsoleError>;

/// Everything the console can report to a caller. Transport faults never reach
/// here from the ingestion path; they become connectivity transitions instead.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect to {url} timed out after {timeout_ms} ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("origin {origin} is not in the command allow-list")]
    OriginNotAllowed { origin: String },

    #[error("{command} failed with HTTP {status} after {attempts} attempt(s)")]
    CommandRejected {
        command: &'static str,
        status: u16,
        attempts: u32,
    },

    #[error("{command} failed after {attempts} attempt(s): {source}")]
    CommandFailed {
        command: &'static str,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

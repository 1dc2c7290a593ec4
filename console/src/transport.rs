// ============================================================================
// Transport: one logical websocket connection with a reconnect supervisor.
//
// State machine (driven only by socket callbacks and caller requests):
//
//   Idle -> Connecting -> Open -> (close/error) -> Reconnecting -> Connecting ...
//                      \-> (error/timeout) ----/
//   any -> Closed          on shutdown or when max_attempts is exhausted
//
// The supervisor runs on its own task and reports everything through an
// unbounded channel of `TransportEvent`s, in the order it happened. Socket
// errors never escape as `Err` to the caller.
// ============================================================================

use crate::error::ConsoleError;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const TARGET: &str = "droneguard::transport";

/// Normal closure, sent when the caller asked for the close.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier applied per consecutive failure.
    pub growth: f64,
    /// Consecutive reconnect attempts before giving up.
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            growth: 1.3,
            max_attempts: 9_999,
            connect_timeout_ms: 4_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(1_000) as i32;
        let raw = self.base_delay_ms as f64 * self.growth.max(1.0).powi(exp);
        let ms = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(ms.round() as u64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting { attempt: u32 },
    Open,
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    /// `requested` is true when the caller closed the socket (shutdown or URL change).
    Close { code: Option<u16>, requested: bool },
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connect_attempts: u64,
    pub opens: u64,
    pub failures: u64,
    pub gave_up: bool,
}

// ---------------------------------------------------------
// Socket abstraction
// ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed { code: Option<u16> },
}

pub trait Connection: Send {
    /// `None` means the stream ended without a close frame.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Inbound, ConsoleError>>>;
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a str)
    -> BoxFuture<'a, Result<Box<dyn Connection>, ConsoleError>>;
}

/// Production connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connector for WsConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, ConsoleError>> {
        Box::pin(async move {
            let (ws, _) = tokio_tungstenite::connect_async(url).await?;
            Ok(Box::new(WsConnection { ws }) as Box<dyn Connection>)
        })
    }
}

impl Connection for WsConnection {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Inbound, ConsoleError>>> {
        Box::pin(async move {
            loop {
                let msg = match self.ws.next().await? {
                    Ok(m) => m,
                    Err(e) => return Some(Err(e.into())),
                };
                match msg {
                    Message::Text(s) => return Some(Ok(Inbound::Text(s.as_str().to_owned()))),
                    Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                        Ok(s) => return Some(Ok(Inbound::Text(s))),
                        Err(_) => debug!(target: TARGET, "skipping non-utf8 binary frame"),
                    },
                    Message::Close(frame) => {
                        return Some(Ok(Inbound::Closed {
                            code: frame.map(|f| u16::from(f.code)),
                        }));
                    }
                    // tungstenite answers pings itself
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.ws.close(None).await {
                debug!(target: TARGET, "close handshake failed: {e}");
            }
            let _ = self.ws.flush().await;
        })
    }
}

// ---------------------------------------------------------
// Handle
// ---------------------------------------------------------

struct Shared {
    url: Mutex<String>,
    policy: ReconnectPolicy,
    state: Mutex<ConnState>,
    alive: AtomicBool,
    // bumped on every URL change
    epoch: AtomicU64,
    wake: Notify,
    connect_attempts: AtomicU64,
    opens: AtomicU64,
    failures: AtomicU64,
    gave_up: AtomicBool,
}

impl Shared {
    fn set_state(&self, st: ConnState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = st;
    }

    fn state(&self) -> ConnState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self) -> String {
        self.url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

pub struct Transport {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<TransportEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            url: Mutex::new(url.into()),
            policy,
            state: Mutex::new(ConnState::Idle),
            alive: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            wake: Notify::new(),
            connect_attempts: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            gave_up: AtomicBool::new(false),
        });
        (
            Self {
                shared,
                connector,
                events,
                task: Mutex::new(None),
            },
            rx,
        )
    }

    /// Starts the supervisor. No-op while it is already running.
    /// Must be called from inside a tokio runtime.
    pub fn connect(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.shared.alive.store(true, Ordering::Release);
        self.shared.gave_up.store(false, Ordering::Release);
        *task = Some(tokio::spawn(supervise(
            self.shared.clone(),
            self.connector.clone(),
            self.events.clone(),
        )));
    }

    /// Drops the current socket and reconnects to `url` right away.
    pub fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!(target: TARGET, %url, "switching endpoint");
        *self.shared.url.lock().unwrap_or_else(PoisonError::into_inner) = url;
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.wake.notify_one();
    }

    /// Cancels any pending reconnect, closes the socket and waits for the
    /// supervisor to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shared.alive.store(false, Ordering::Release);
        self.shared.wake.notify_one();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(target: TARGET, "supervisor task failed: {e}");
        }
        self.shared.set_state(ConnState::Closed);
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// Liveness flag: true only while a socket is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Open
    }

    pub fn url(&self) -> String {
        self.shared.url()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            connect_attempts: self.shared.connect_attempts.load(Ordering::Relaxed),
            opens: self.shared.opens.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            gave_up: self.shared.gave_up.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

// ---------------------------------------------------------
// Supervisor (reconnect loop)
// ---------------------------------------------------------

enum ReadEnd {
    Closed(Option<u16>),
    Failed(String),
    /// Shutdown or URL change; the socket has already been closed.
    Interrupted,
}

enum Step {
    Item(Option<Result<Inbound, ConsoleError>>),
    Woken,
}

async fn read_until_closed(
    shared: &Shared,
    conn: &mut Box<dyn Connection>,
    epoch: u64,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> ReadEnd {
    loop {
        let step = tokio::select! {
            item = conn.recv() => Step::Item(item),
            _ = shared.wake.notified() => Step::Woken,
        };

        match step {
            Step::Item(Some(Ok(Inbound::Text(s)))) => {
                let _ = events.send(TransportEvent::Message(s));
            }
            Step::Item(Some(Ok(Inbound::Closed { code }))) => return ReadEnd::Closed(code),
            Step::Item(Some(Err(e))) => return ReadEnd::Failed(e.to_string()),
            Step::Item(None) => return ReadEnd::Closed(None),
            Step::Woken => {
                if !shared.alive() || shared.epoch() != epoch {
                    conn.close().await;
                    return ReadEnd::Interrupted;
                }
            }
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let policy = shared.policy;
    let mut failures: u32 = 0;

    loop {
        if !shared.alive() {
            break;
        }

        let epoch = shared.epoch();
        let url = shared.url();
        shared.set_state(ConnState::Connecting {
            attempt: failures + 1,
        });
        shared.connect_attempts.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, %url, attempt = failures + 1, "connecting");

        let outcome = tokio::select! {
            r = tokio::time::timeout(policy.connect_timeout(), connector.connect(&url)) => Some(r),
            _ = shared.wake.notified() => None,
        };

        let failure: Option<String> = match outcome {
            // interrupted mid-connect: shutdown, or a new URL to try right away
            None => {
                failures = 0;
                continue;
            }
            Some(Err(_elapsed)) => Some(
                ConsoleError::ConnectTimeout {
                    url: url.clone(),
                    timeout_ms: policy.connect_timeout_ms,
                }
                .to_string(),
            ),
            Some(Ok(Err(e))) => Some(e.to_string()),
            Some(Ok(Ok(mut conn))) => {
                failures = 0;
                shared.opens.fetch_add(1, Ordering::Relaxed);
                shared.set_state(ConnState::Open);
                info!(target: TARGET, %url, "open");
                let _ = events.send(TransportEvent::Open);

                let end = read_until_closed(&shared, &mut conn, epoch, &events).await;
                match end {
                    ReadEnd::Interrupted => {
                        debug!(target: TARGET, %url, "closed on request");
                        let _ = events.send(TransportEvent::Close {
                            code: Some(CLOSE_NORMAL),
                            requested: true,
                        });
                        continue;
                    }
                    ReadEnd::Closed(code) => {
                        warn!(target: TARGET, %url, ?code, "closed by peer");
                        let _ = events.send(TransportEvent::Close {
                            code,
                            requested: false,
                        });
                        None
                    }
                    ReadEnd::Failed(e) => Some(e),
                }
            }
        };

        if let Some(failure) = failure {
            shared.failures.fetch_add(1, Ordering::Relaxed);
            warn!(target: TARGET, %url, error = %failure, "transport error");
            let _ = events.send(TransportEvent::Error(failure));
        }

        if !shared.alive() {
            break;
        }
        if shared.epoch() != epoch {
            failures = 0;
            continue;
        }

        failures += 1;
        if failures > policy.max_attempts {
            error!(
                target: TARGET,
                %url,
                attempts = policy.max_attempts,
                "giving up on reconnect"
            );
            shared.gave_up.store(true, Ordering::Release);
            shared.set_state(ConnState::Closed);
            return;
        }

        let delay = policy.delay_for(failures);
        shared.set_state(ConnState::Reconnecting {
            attempt: failures,
            delay,
        });
        info!(
            target: TARGET,
            %url,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified() => {}
        }
    }

    shared.set_state(ConnState::Closed);
}

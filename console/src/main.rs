use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use droneguard_console::commands::{AttackMode, AttackRequest, CommandClient, CommandReply};
use droneguard_console::config::ConsoleConfig;
use droneguard_console::logging::{Verbosity, init_tracing};
use droneguard_console::smoothing::flight_path;
use droneguard_console::store::StoreSnapshot;
use droneguard_console::{ConnState, Session};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "DroneGuard Console")]
#[command(bin_name = "droneguard-console")]
struct Cli {
    /// JSON config file (falls back to $DRONEGUARD_CONFIG, then defaults).
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Follow live telemetry, alerts and failsafe state until Ctrl-C")]
    Watch(WatchArgs),
    #[command(about = "Ask the backend to inject an attack")]
    Attack(AttackArgs),
    #[command(about = "Clear every active attack")]
    ClearAttack,
    #[command(about = "Switch the backend failsafe on or off")]
    Failsafe(FailsafeArgs),
}

#[derive(clap::Args)]
struct WatchArgs {
    /// Minimum time between status lines.
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Overrides the configured websocket URL.
    #[arg(long)]
    ws_url: Option<String>,
}

#[derive(clap::Args)]
struct AttackArgs {
    /// GPS_SPOOF, IMU_INJECTION, MODE_HIJACK, JAMMING, ...
    mode: String,
    #[arg(long, default_value_t = 1.0)]
    mag: f64,
    #[arg(long, default_value = "sudden")]
    style: String,
    /// Duration in seconds.
    #[arg(long, default_value_t = 10)]
    dur: u32,
}

#[derive(clap::Args)]
struct FailsafeArgs {
    #[clap(subcommand)]
    action: FailsafeAction,
}

#[derive(Subcommand)]
enum FailsafeAction {
    On {
        #[arg(long)]
        reason: Option<String>,
    },
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(Verbosity::from_flags(cli.verbose, cli.quiet));

    let mut config = ConsoleConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Commands::Watch(args) => {
            if let Some(url) = args.ws_url {
                config.ws_url = Some(url);
                config.validate().context("checking --ws-url")?;
            }
            watch(config, Duration::from_millis(args.interval_ms.max(1))).await
        }
        Commands::Attack(args) => {
            let client = command_client(&config)?;
            let req = AttackRequest {
                mode: AttackMode::parse(&args.mode),
                mag: args.mag,
                style: args.style,
                dur: args.dur,
            };
            let reply = client
                .trigger_attack(&req)
                .await
                .with_context(|| format!("sending attack {}", req.mode))?;
            print_reply("attack", &reply);
            Ok(())
        }
        Commands::ClearAttack => {
            let reply = command_client(&config)?
                .clear_attack()
                .await
                .context("clearing attacks")?;
            print_reply("clear-attack", &reply);
            Ok(())
        }
        Commands::Failsafe(args) => {
            let client = command_client(&config)?;
            let reply = match args.action {
                FailsafeAction::On { reason } => client
                    .activate_failsafe(reason.as_deref())
                    .await
                    .context("activating failsafe")?,
                FailsafeAction::Off => client
                    .deactivate_failsafe()
                    .await
                    .context("deactivating failsafe")?,
            };
            print_reply("failsafe", &reply);
            Ok(())
        }
    }
}

fn command_client(config: &ConsoleConfig) -> Result<CommandClient> {
    CommandClient::new(&config.backend_http(), config.commands.clone())
        .context("building command client")
}

fn print_reply(command: &str, reply: &CommandReply) {
    println!(
        "{command}: HTTP {} after {} attempt(s) {}",
        reply.status, reply.attempts, reply.body
    );
}

async fn watch(config: ConsoleConfig, every: Duration) -> Result<()> {
    let steps = config.smoothing_steps;
    let session = Session::start(config).context("starting session")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<StoreSnapshot>>();
    let _sub = session.subscribe(move |snap| {
        let _ = tx.send(snap.clone());
    });

    let mut ticker = tokio::time::interval(every);
    let mut latest: Option<Arc<StoreSnapshot>> = None;
    let mut printed_version: Option<u64> = None;
    let mut last_state = session.transport_state();

    loop {
        tokio::select! {
            snap = rx.recv() => match snap {
                Some(snap) => latest = Some(snap),
                None => break,
            },
            _ = ticker.tick() => {
                let state = session.transport_state();
                if state != last_state {
                    eprintln!("transport: {}", describe_state(state));
                    last_state = state;
                }
                if let Some(snap) = &latest
                    && printed_version != Some(snap.version())
                {
                    println!("{}", status_line(snap, steps));
                    printed_version = Some(snap.version());
                }
                if state == ConnState::Closed {
                    eprintln!("transport gave up; exiting");
                    break;
                }
            }
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for Ctrl-C")?;
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn describe_state(state: ConnState) -> String {
    match state {
        ConnState::Idle => "idle".to_string(),
        ConnState::Connecting { attempt } => format!("connecting (attempt {attempt})"),
        ConnState::Open => "open".to_string(),
        ConnState::Reconnecting { attempt, delay } => {
            format!("reconnect {attempt} in {} ms", delay.as_millis())
        }
        ConnState::Closed => "closed".to_string(),
    }
}

fn status_line(snap: &StoreSnapshot, steps: usize) -> String {
    let conn = snap.connectivity();
    let link = if conn.connected { "up" } else { "down" };

    let position = snap
        .latest_telemetry()
        .map(|t| {
            let gps = t
                .gps()
                .map(|(lat, lon)| format!("{lat:.6},{lon:.6}"))
                .unwrap_or_else(|| "no-fix".to_string());
            let alt = t
                .altitude
                .map(|a| format!("{a:.1}m"))
                .unwrap_or_else(|| "-".to_string());
            format!("{gps} alt={alt} src={}", t.source.as_str())
        })
        .unwrap_or_else(|| "no telemetry".to_string());

    let failsafe = snap.failsafe();
    let failsafe = if failsafe.active {
        format!(
            "ACTIVE({}, {})",
            failsafe.action.as_str(),
            failsafe.reason.as_deref().unwrap_or("-")
        )
    } else {
        "off".to_string()
    };

    let newest_alert = snap
        .alerts()
        .next()
        .map(|a| a.kind.as_str())
        .unwrap_or("-");

    let verify = conn
        .verification
        .as_ref()
        .map(|v| v.status.as_str())
        .unwrap_or("-");

    format!(
        "[{link} gen={}] {position} | telemetry {}/{} path={}pts | alerts {} (latest {newest_alert}) | failsafe {failsafe} | verify {verify} | dropped {}",
        conn.generation,
        snap.telemetry_len(),
        snap.telemetry_capacity(),
        flight_path(snap, steps).path.len(),
        snap.alerts_len(),
        snap.diagnostics().dropped_frames,
    )
}

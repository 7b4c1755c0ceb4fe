use anyhow::{bail, Context};
use clap::Parser;
use loopwatch_core::OutboundMessage;
use loopwatch_stream::{
    spawn_transport, Backoff, ConnectionStatus, ExhaustionPolicy, StreamConfig, StreamHandle,
    TransportMode,
};
use std::{
    env,
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

mod session;

use session::SessionView;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_LOG_DIR: &str = ".loopwatch/logs";

#[derive(Clone, Debug)]
struct Config {
    session_id: String,
    api_url: String,
    ws_url: Option<String>,
    max_iterations: u32,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    give_up: bool,
    ping_interval: Duration,
    log_dir: String,
    log_stderr: bool,
    json: bool,
    exit_on_finish: bool,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "loopwatch-monitor")]
struct Args {
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    reconnect_attempts: Option<u32>,
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
    /// Stop in the error state once the push stream also fails.
    #[arg(long, default_value_t = false)]
    give_up: bool,
    /// Seconds between socket pings; 0 disables them.
    #[arg(long, default_value_t = 30)]
    ping_interval: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = false)]
    exit_on_finish: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl Config {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            socket_base: self.ws_url.clone(),
            reconnect_attempts: self.reconnect_attempts,
            backoff: Backoff::Linear {
                base: self.reconnect_delay,
            },
            exhaustion_policy: if self.give_up {
                ExhaustionPolicy::GiveUp
            } else {
                ExhaustionPolicy::Cycle
            },
            ..StreamConfig::new(self.api_url.clone())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(&config);
    info!(
        "monitor_start: session={} api={} ws={}",
        config.session_id,
        config.api_url,
        config.ws_url.as_deref().unwrap_or("-")
    );

    let (handle, mut events) = spawn_transport(config.stream_config());
    handle
        .activate(config.session_id.clone(), None)
        .await
        .context("starting transport")?;

    let mut view = SessionView::new(config.max_iterations, config.json);
    let mut ping = (!config.ping_interval.is_zero()).then(|| {
        let mut ticker = interval(config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("monitor_interrupt");
                break;
            }
            _ = next_tick(&mut ping) => send_ping(&handle).await,
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("monitor_stream_closed");
                    break;
                };
                for line in view.handle(event) {
                    println!("{line}");
                }
                if config.exit_on_finish && view.is_finished() {
                    info!("monitor_session_finished: {}", config.session_id);
                    break;
                }
            }
        }
    }

    // an undrained queue would stall the transport task mid-send
    drop(events);
    if let Err(err) = handle.disconnect().await {
        warn!("monitor_disconnect_error: {err}");
    }
    handle.shutdown().await;
    info!(
        "monitor_stop: iterations={} runs={}",
        view.workflow().state().iteration.current,
        view.projector().history().count()
    );
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// The backend answers `pong`; only the primary socket can carry it.
async fn send_ping(handle: &StreamHandle) {
    let state = handle.state();
    if state.status != ConnectionStatus::Connected || state.mode != TransportMode::PrimarySocket {
        return;
    }
    if let Err(err) = handle.send(OutboundMessage::ping()).await {
        warn!("ping_error: {err}");
    }
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let session_id = resolve_session_id(&args.session)?;
    let api_url = resolve_api_url(&args.api_url)?;
    let ws_url = resolve_ws_url(&args.ws_url)?;
    let max_iterations = resolve_number(args.max_iterations, "LOOPWATCH_MAX_ITERATIONS")
        .unwrap_or(loopwatch_progress::projector::DEFAULT_MAX_ITERATIONS);
    let reconnect_attempts = resolve_number(args.reconnect_attempts, "LOOPWATCH_RECONNECT_ATTEMPTS")
        .unwrap_or(loopwatch_stream::config::DEFAULT_RECONNECT_ATTEMPTS);
    let reconnect_delay_ms = resolve_number(args.reconnect_delay_ms, "LOOPWATCH_RECONNECT_DELAY_MS")
        .unwrap_or(loopwatch_stream::config::DEFAULT_RECONNECT_DELAY_MS);
    Ok(Config {
        session_id,
        api_url,
        ws_url,
        max_iterations,
        reconnect_attempts,
        reconnect_delay: Duration::from_millis(reconnect_delay_ms),
        give_up: args.give_up || env_true("LOOPWATCH_GIVE_UP"),
        ping_interval: Duration::from_secs(args.ping_interval),
        log_dir: resolve_log_dir(&args.log_dir),
        log_stderr: env_true("LOOPWATCH_LOG_STDERR"),
        json: args.json,
        exit_on_finish: args.exit_on_finish,
        debug: args.debug,
    })
}

type LogFile = Arc<Mutex<std::fs::File>>;

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = env::var("LOOPWATCH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = match open_log_file(&config.log_dir, &config.session_id) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let stderr_enabled = config.log_stderr;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stderr_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("log_init_error: subscriber already set");
    }
}

/// Log sink; stdout stays reserved for rendered session lines.
struct MultiWriter {
    stderr_enabled: bool,
    file: Option<LogFile>,
}

impl MultiWriter {
    fn new(file: Option<LogFile>, stderr_enabled: bool) -> Self {
        Self {
            stderr_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, session_id: &str) -> io::Result<Option<LogFile>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(None);
    }
    let path = dir.join(format!(
        "loopwatch-monitor-{}.log",
        sanitize_component(session_id)
    ));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn env_true(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn resolve_session_id(flag: &str) -> anyhow::Result<String> {
    if !flag.trim().is_empty() {
        return Ok(flag.trim().to_string());
    }
    match env_value("LOOPWATCH_SESSION_ID") {
        Some(value) => Ok(value.trim().to_string()),
        None => bail!("missing session id: pass --session or set LOOPWATCH_SESSION_ID"),
    }
}

fn resolve_api_url(flag: &str) -> anyhow::Result<String> {
    let raw = if !flag.trim().is_empty() {
        flag.trim().to_string()
    } else {
        env_value("LOOPWATCH_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string())
    };
    let url = Url::parse(&raw).with_context(|| format!("invalid api url: {raw}"))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(raw),
        other => bail!("unsupported api url scheme: {other}"),
    }
}

fn resolve_ws_url(flag: &str) -> anyhow::Result<Option<String>> {
    let raw = if !flag.trim().is_empty() {
        flag.trim().to_string()
    } else {
        match env_value("LOOPWATCH_WS_URL") {
            Some(value) => value,
            None => return Ok(None),
        }
    };
    Url::parse(&raw).with_context(|| format!("invalid socket url: {raw}"))?;
    Ok(Some(raw))
}

fn resolve_number<T: std::str::FromStr>(flag: Option<T>, key: &str) -> Option<T> {
    if flag.is_some() {
        return flag;
    }
    let value = env_value(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            eprintln!("config_error: ignoring {key}={value}");
            None
        }
    }
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_value("LOOPWATCH_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
}

mod api;
mod console;
mod core;
mod download;
mod feed;
mod frontend;
mod lock;
mod mpv;
mod player;
mod presence;

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use listen_proto::auth;
use listen_proto::config::{Config, SystemConfig};
use listen_proto::platform;
use listen_proto::protocol::{NowPlaying, GATEWAY_URL};
use listen_proto::session::Account;
use listen_proto::state::{PersistentState, StateFile};
use listen_proto::types::STREAM_URL;
use listen_proto::ClientError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::api::ApiClient;
use crate::console::{Console, ConsoleContext};
use crate::core::{SessionCore, SessionEvent};
use crate::download::Downloader;
use crate::feed::FeedClient;
use crate::frontend::Frontend;
use crate::lock::InstanceLock;
use crate::mpv::MpvDriver;
use crate::player::EngineAdapter;
use crate::presence::{LogSink, PresencePublisher};

const PLAYER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// A new snapshot is on the watch channel.
    SessionUpdated,
    TrackChanged(Box<NowPlaying>),
    Notice(String),
    Error(String),
    /// The session token was rejected; the user has to log in again.
    LoginRequired(String),
    /// The session is about to end.
    Fatal(String),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR reach the terminal
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "listentui", version, about = "LISTEN.moe in your terminal")]
struct Cli {
    /// Use this config file instead of the default one
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Write a log file (default location when PATH is omitted)
    #[arg(short, long, value_name = "PATH")]
    log: Option<Option<PathBuf>>,
    /// Remove a leftover instance lock and start anyway
    #[arg(long)]
    bypass: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("listentui: {:#}", e);
            e.downcast_ref::<ClientError>()
                .map(ClientError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(256);

    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)?;

    init_logging(&cli, &config, broadcast_tx.clone())?;
    info!("Config loaded from: {:?}", config_path);

    let lock = if config.system.instance_lock {
        Some(InstanceLock::acquire(&platform::lock_file(), cli.bypass)?)
    } else {
        None
    };
    if let Some(lock) = &lock {
        debug!("Holding instance lock {:?}", lock.path());
    }

    let state_file = StateFile::new(platform::state_file());
    let persistent = state_file.load();
    debug!("Restored state: volume {}", persistent.volume);

    // Event channel: all external inputs funnel into SessionCore
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);
    let (engine_tx, engine_rx) = mpsc::channel(32);
    let (jobs_tx, jobs_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let api = ApiClient::new()?;
    let bindings = config.keybind.bindings()?;

    let (core, snapshot_rx) = SessionCore::new(
        config.clone(),
        persistent.clone(),
        engine_tx,
        jobs_tx.clone(),
        broadcast_tx.clone(),
    );
    let core = core.with_state_file(state_file);

    // Playback
    let driver = MpvDriver::new(config.player.mpv_args(), persistent.volume);
    let (adapter, mpv_event_rx) = EngineAdapter::new(driver, STREAM_URL.to_string(), event_tx.clone());
    let player = tokio::spawn(adapter.run(engine_rx, mpv_event_rx));

    // Gateway feed
    let (feed, feed_rx) = FeedClient::new(GATEWAY_URL, event_tx.clone(), jobs_tx);
    tokio::spawn(feed.run(cancel.child_token()));

    // API jobs
    tokio::spawn(api::run_jobs(api.clone(), jobs_rx, event_tx.clone()));

    // Presence
    let publisher = PresencePublisher::new(config.presence.clone(), config.display.clone(), LogSink);
    tokio::spawn(publisher.run(broadcast_tx.subscribe(), snapshot_rx.clone()));

    // Console + terminal
    let (out_tx, out_rx) = mpsc::channel(64);
    let console = Console::new(
        ConsoleContext {
            api: api.clone(),
            downloader: Downloader::new(
                config.paths.downloads_dir.clone(),
                config.display.romaji_first,
                config.display.separator.clone(),
            ),
            display: config.display.clone(),
            system: config.system.clone(),
            snapshot_rx,
            feed_rx,
            event_tx: event_tx.clone(),
        },
        out_tx,
    );
    let frontend = Frontend::new(
        console,
        bindings,
        config.player.volume_step,
        config.display.clone(),
        event_tx.clone(),
    );
    tokio::spawn(frontend.run(out_rx, broadcast_tx.subscribe(), cancel.clone()));

    tokio::spawn(startup_login(api, config.system.clone(), persistent, event_tx.clone()));

    let shutdown_tx = event_tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(SessionEvent::Shutdown).await;
        }
    });

    info!("Client initialised, running event loop");
    let result = core.run(event_rx).await;
    cancel.cancel();
    // process::exit skips destructors, so mpv has to be gone before we return
    if !wait_for_player(player, PLAYER_SHUTDOWN_TIMEOUT).await {
        warn!("Player did not stop within {:?}", PLAYER_SHUTDOWN_TIMEOUT);
    }
    result?;
    Ok(())
}

/// Wait for the adapter task to stop mpv.  `false` on timeout.
async fn wait_for_player(player: JoinHandle<()>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, player).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Player task failed: {}", e);
            true
        }
        Err(_) => false,
    }
}

fn init_logging(
    cli: &Cli,
    config: &Config,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> anyhow::Result<()> {
    let file_layer = match &cli.log {
        Some(path) => {
            let log_path = path.clone().unwrap_or_else(platform::default_log_file);
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .with_context(|| format!("Failed to open log file {:?}", log_path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(log_file)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let default_filter = if config.system.debug {
        "info,listen_client=debug"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(BroadcastLayer::new(broadcast_tx))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
    Ok(())
}

/// Restore a login from a saved or configured token, or log in with the
/// configured password.  Failures leave the session anonymous.
async fn startup_login(
    api: ApiClient,
    system: SystemConfig,
    persistent: PersistentState,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let now = Utc::now();
    let saved = persistent
        .username
        .zip(persistent.token)
        .filter(|(_, token)| auth::token_is_valid(token, now));
    let configured = (!system.username.is_empty() && auth::token_is_valid(&system.token, now))
        .then(|| (system.username.clone(), system.token.clone()));

    let account = match saved.or(configured) {
        Some((username, token)) => {
            let display_name = match api.user(&username, 0).await {
                Ok(user) => user.display_name,
                Err(e) => {
                    debug!("startup: profile lookup for {} failed: {}", username, e);
                    None
                }
            };
            info!("startup: restored session for {}", username);
            Account {
                username,
                display_name,
                token,
            }
        }
        None if !system.username.is_empty() && !system.password.is_empty() => {
            match api.login(&system.username, &system.password).await {
                Ok(account) => account,
                Err(e) => {
                    warn!("startup: login failed: {}", e);
                    return;
                }
            }
        }
        None => {
            info!("startup: no credentials, listening anonymously");
            return;
        }
    };
    let _ = event_tx.send(SessionEvent::LoggedIn(account)).await;
}

/// FeedClient: keeps one websocket to the LISTEN.moe gateway alive and
/// forwards track updates to SessionCore.
///
/// ```text
///   connect ─→ hello (heartbeat interval) ─→ track updates ...
///      ↑                                         │ socket error / close /
///      └──── backoff (1s, 2s, 4s … 60s + jitter) ┘ two unanswered heartbeats
/// ```
///
/// The feed never gives up.  Every reconnect after the first successful
/// session also queues an `ApiJob::Resync`, so a track change missed while
/// disconnected is still picked up.
use futures_util::{SinkExt, StreamExt};
use listen_proto::protocol::{self, GatewayFrame, NowPlaying};
use listen_proto::session::{ConnectionStatus, FeedState};
use listen_proto::ClientError;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiJob;
use crate::core::SessionEvent;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Heartbeats sent without an ack before the connection is considered dead.
const MAX_MISSED_ACKS: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    Track(NowPlaying),
    /// Recovered from play history after a reconnect.
    Resynced(NowPlaying),
    Status(ConnectionStatus),
}

// ── backoff ───────────────────────────────────────────────────────────────────

/// Exponential backoff with up to 25% random jitter on top.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let delay = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

// ── client ────────────────────────────────────────────────────────────────────

pub struct FeedClient {
    url: String,
    event_tx: mpsc::Sender<SessionEvent>,
    jobs_tx: mpsc::Sender<ApiJob>,
    state_tx: watch::Sender<FeedState>,
    backoff: Backoff,
}

/// Why a gateway session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Lost(ClientError),
}

impl FeedClient {
    pub fn new(
        url: impl Into<String>,
        event_tx: mpsc::Sender<SessionEvent>,
        jobs_tx: mpsc::Sender<ApiJob>,
    ) -> (Self, watch::Receiver<FeedState>) {
        let (state_tx, state_rx) = watch::channel(FeedState::default());
        let client = Self {
            url: url.into(),
            event_tx,
            jobs_tx,
            state_tx,
            backoff: Backoff::new(BACKOFF_BASE, BACKOFF_CAP),
        };
        (client, state_rx)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut connected_before = false;
        loop {
            info!("feed: connecting to {}", self.url);
            let end = tokio::select! {
                _ = cancel.cancelled() => SessionEnd::Cancelled,
                end = self.connect_once(&mut connected_before) => end,
            };
            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Lost(e) => warn!("feed: connection lost: {}", e),
            }

            self.set_status(ConnectionStatus::Reconnecting).await;
            let delay = self.backoff.next_delay();
            info!("feed: reconnecting in {:.1}s", delay.as_secs_f32());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_status(ConnectionStatus::Disconnected).await;
        debug!("feed: stopped");
    }

    async fn connect_once(&mut self, connected_before: &mut bool) -> SessionEnd {
        let (ws, _) = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => return SessionEnd::Lost(ClientError::Network(e.to_string())),
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        let mut heartbeat: Option<tokio::time::Interval> = None;
        let mut missed_acks = 0u32;

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let text = match msg {
                        None => return SessionEnd::Lost(ClientError::Network("gateway closed the connection".into())),
                        Some(Err(e)) => return SessionEnd::Lost(ClientError::Network(e.to_string())),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            return SessionEnd::Lost(ClientError::Network(format!("gateway closed: {:?}", frame)))
                        }
                        Some(Ok(_)) => continue,
                    };
                    match protocol::parse_frame(&text) {
                        Ok(GatewayFrame::Hello { heartbeat: every }) => {
                            debug!("feed: hello, heartbeat every {:?}", every);
                            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            heartbeat = Some(interval);
                            missed_acks = 0;
                            self.backoff.reset();
                            self.set_status(ConnectionStatus::Connected).await;
                            if *connected_before {
                                let _ = self.jobs_tx.send(ApiJob::Resync).await;
                            }
                            *connected_before = true;
                        }
                        Ok(GatewayFrame::Track(np)) => {
                            info!("feed: now playing song {}", np.song.id);
                            self.state_tx.send_modify(|state| {
                                state.listeners = np.listeners;
                                state.received_at = Some(chrono::Utc::now());
                                state.now_playing = Some(np.clone());
                            });
                            self.post(FeedUpdate::Track(np)).await;
                        }
                        Ok(GatewayFrame::HeartbeatAck) => missed_acks = 0,
                        Ok(GatewayFrame::Ignored { op, kind }) => {
                            debug!("feed: ignoring op={} t={:?}", op, kind);
                        }
                        Err(e) => warn!("feed: dropping malformed frame: {}", e),
                    }
                }
                _ = next_heartbeat(&mut heartbeat) => {
                    if missed_acks >= MAX_MISSED_ACKS {
                        return SessionEnd::Lost(ClientError::Network(format!(
                            "{} heartbeats unanswered", missed_acks
                        )));
                    }
                    if let Err(e) = ws_tx.send(Message::Text(protocol::heartbeat_frame())).await {
                        return SessionEnd::Lost(ClientError::Network(e.to_string()));
                    }
                    missed_acks += 1;
                }
            }
        }
    }

    async fn set_status(&self, status: ConnectionStatus) {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.status == status {
                false
            } else {
                state.status = status;
                true
            }
        });
        if changed {
            self.post(FeedUpdate::Status(status)).await;
        }
    }

    async fn post(&self, update: FeedUpdate) {
        if self.event_tx.send(SessionEvent::Feed(update)).await.is_err() {
            debug!("feed: session core is gone");
        }
    }
}

async fn next_heartbeat(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

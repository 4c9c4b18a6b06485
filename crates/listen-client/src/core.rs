/// SessionCore: single-owner event loop for the `Session`.
///
/// The feed client, the playback adapter, the API worker and the console all
/// post `SessionEvent`s here; nothing else mutates the session.  After every
/// event that changed it, SessionCore publishes a fresh snapshot on the watch
/// channel and sends `BroadcastMessage::SessionUpdated`.
///
/// Stall recovery is a single optional deadline polled alongside the event
/// channel.  The adapter only reports; deciding to restart happens here.
use chrono::Utc;
use listen_proto::auth;
use listen_proto::config::Config;
use listen_proto::protocol::NowPlaying;
use listen_proto::session::{Account, ConnectionStatus, PlaybackState, Session, TrackChange};
use listen_proto::state::{PersistentState, StateFile};
use listen_proto::types::SongId;
use listen_proto::ClientError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::api::ApiJob;
use crate::feed::FeedUpdate;
use crate::player::{EngineCommand, EngineEvent};
use crate::BroadcastMessage;

// ── SessionEvent ──────────────────────────────────────────────────────────────

/// All inputs into the SessionCore loop.
#[derive(Debug)]
pub enum SessionEvent {
    Feed(FeedUpdate),
    Engine(EngineEvent),
    Command(SessionCommand),
    /// Result of a favourite lookup or toggle for `song_id`.
    FavouriteResolved {
        song_id: SongId,
        favourite: bool,
        announce: bool,
    },
    /// A background API job failed for a reason other than auth.
    JobFailed { job: &'static str, error: ClientError },
    LoggedIn(Account),
    /// The server rejected our token.
    AuthTokenInvalid,
    Shutdown,
}

/// User-initiated requests.  Every mutation from the console or key binds
/// goes through one of these.
#[derive(Debug)]
pub enum SessionCommand {
    TogglePause,
    AdjustVolume(i16),
    SeekToEnd,
    RestartPlayer,
    Favourite {
        song_id: Option<SongId>,
        reply: Option<oneshot::Sender<Result<SongId, ClientError>>>,
    },
    Preview {
        url: String,
    },
    Logout,
}

// ── SessionCore ───────────────────────────────────────────────────────────────

pub struct SessionCore {
    config: Config,
    session: Session,
    engine_tx: mpsc::Sender<EngineCommand>,
    jobs_tx: mpsc::Sender<ApiJob>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    snapshot_tx: watch::Sender<Session>,
    /// `None` disables persistence (tests).
    state_file: Option<StateFile>,
    /// Armed while a stall is waiting to be restarted.
    restart_deadline: Option<Instant>,
    /// Set after the engine died, so a restart from `Stopped` is allowed.
    engine_failed: bool,
    previewing: bool,
    resume_after_preview: bool,
}

impl SessionCore {
    pub fn new(
        config: Config,
        persistent: PersistentState,
        engine_tx: mpsc::Sender<EngineCommand>,
        jobs_tx: mpsc::Sender<ApiJob>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> (Self, watch::Receiver<Session>) {
        let session = Session::new(persistent.volume, config.display.history_limit);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.clone());
        let core = Self {
            config,
            session,
            engine_tx,
            jobs_tx,
            broadcast_tx,
            snapshot_tx,
            state_file: None,
            restart_deadline: None,
            engine_failed: false,
            previewing: false,
            resume_after_preview: false,
        };
        (core, snapshot_rx)
    }

    pub fn with_state_file(mut self, state_file: StateFile) -> Self {
        self.state_file = Some(state_file);
        self
    }

    /// Run until `Shutdown`, until every sender is dropped, or until stall
    /// recovery gives up (returned as `ClientError::PlaybackStall`).
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<SessionEvent>) -> Result<(), ClientError> {
        info!("SessionCore: starting event loop");
        self.send_engine(EngineCommand::Play).await;

        let result = loop {
            let deadline = self.restart_deadline;
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("SessionCore: event channel closed, shutting down");
                        break Ok(());
                    }
                    Some(SessionEvent::Shutdown) => {
                        info!("SessionCore: shutdown requested");
                        break Ok(());
                    }
                    Some(evt) => {
                        let rev = self.session.rev;
                        self.handle_event(evt).await;
                        if self.session.rev != rev {
                            self.publish();
                        }
                    }
                },
                _ = wait_for(deadline) => {
                    let rev = self.session.rev;
                    let outcome = self.on_restart_deadline().await;
                    if self.session.rev != rev {
                        self.publish();
                    }
                    if let Err(e) = outcome {
                        break Err(e);
                    }
                }
            }
        };

        self.cleanup().await;
        result
    }

    async fn handle_event(&mut self, evt: SessionEvent) {
        match evt {
            SessionEvent::Feed(update) => self.handle_feed(update).await,
            SessionEvent::Engine(evt) => self.handle_engine(evt).await,
            SessionEvent::Command(cmd) => {
                debug!("SessionCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            SessionEvent::FavouriteResolved {
                song_id,
                favourite,
                announce,
            } => {
                if self.session.set_favourite(song_id, favourite) {
                    debug!("SessionCore: song {} favourite={}", song_id, favourite);
                }
                if announce {
                    let verb = if favourite { "Favourited" } else { "Unfavourited" };
                    self.notice(format!("{} song {}", verb, song_id));
                }
            }
            SessionEvent::JobFailed { job, error } => {
                warn!("SessionCore: {} failed: {}", job, error);
                self.report_error(format!("{}: {}", job, error));
            }
            SessionEvent::LoggedIn(account) => {
                info!("SessionCore: logged in as {}", account.username);
                self.notice(format!("Logged in as {}", account.username));
                self.session.log_in(account);
                self.lookup_favourite().await;
                self.persist().await;
            }
            SessionEvent::AuthTokenInvalid => self.on_auth_token_invalid().await,
            SessionEvent::Shutdown => {}
        }
    }

    // ── feed ──────────────────────────────────────────────────────────────────

    async fn handle_feed(&mut self, update: FeedUpdate) {
        match update {
            FeedUpdate::Track(np) => self.on_feed_track(np).await,
            FeedUpdate::Resynced(mut np) => {
                // The play-statistics query carries no listener count.
                if np.listeners == 0 {
                    np.listeners = self.session.listeners;
                }
                self.on_feed_track(np).await;
            }
            FeedUpdate::Status(status) => {
                if self.session.feed_status != status {
                    info!(
                        "SessionCore: feed {:?} → {:?}",
                        self.session.feed_status, status
                    );
                    if status == ConnectionStatus::Reconnecting {
                        self.report_error("Lost connection to LISTEN.moe, reconnecting".to_string());
                    }
                    self.session.feed_status = status;
                    self.session.rev += 1;
                }
            }
        }
    }

    async fn on_feed_track(&mut self, np: NowPlaying) {
        let song_id = np.song.id;
        match self.session.apply_now_playing(np) {
            TrackChange::Stale => {
                debug!("SessionCore: ignoring stale delivery of song {}", song_id);
            }
            TrackChange::Refreshed => {
                debug!("SessionCore: refreshed song {}", song_id);
            }
            TrackChange::Changed { previous } => {
                info!(
                    "SessionCore: track {:?} → {}",
                    previous.as_ref().map(|s| s.id),
                    song_id
                );
                if let Some(current) = self.session.current.clone() {
                    let _ = self
                        .broadcast_tx
                        .send(BroadcastMessage::TrackChanged(Box::new(current)));
                }
                self.lookup_favourite().await;
            }
        }
    }

    /// Queue a favourite-status lookup for the current song when logged in.
    async fn lookup_favourite(&mut self) {
        let (Some(song_id), Some(token)) = (self.session.current_song_id(), self.session.token())
        else {
            return;
        };
        let job = ApiJob::CheckFavourite {
            song_id,
            token: token.to_string(),
        };
        self.send_job(job).await;
    }

    // ── engine ────────────────────────────────────────────────────────────────

    async fn handle_engine(&mut self, evt: EngineEvent) {
        debug!("SessionCore: engine {:?}", evt);
        match evt {
            EngineEvent::Started | EngineEvent::Resumed => {
                if self.session.restart_attempts > 0 {
                    self.notice("Playback recovered".to_string());
                }
                self.cancel_restart();
                self.engine_failed = false;
                self.session.set_playback(PlaybackState::Playing);
            }
            EngineEvent::Paused => {
                self.cancel_restart();
                self.session.set_playback(PlaybackState::Paused);
            }
            EngineEvent::Stalled => {
                if self.previewing {
                    debug!("SessionCore: ignoring stall during preview");
                    return;
                }
                self.on_playback_stalled();
            }
            EngineEvent::Fatal(reason) => {
                error!("SessionCore: playback engine failed: {}", reason);
                self.report_error(format!("Player failed: {}", reason));
                self.engine_failed = true;
                self.previewing = false;
                self.session.set_playback(PlaybackState::Stopped);
                self.arm_restart();
            }
            EngineEvent::RestartFailed(reason) => {
                warn!("SessionCore: restart failed: {}", reason);
                self.report_error(format!("Restart failed: {}", reason));
            }
            EngineEvent::PreviewFinished => {
                self.previewing = false;
                if std::mem::take(&mut self.resume_after_preview) {
                    self.send_engine(EngineCommand::Resume).await;
                }
            }
        }
    }

    fn on_playback_stalled(&mut self) {
        match self.session.playback {
            PlaybackState::Stalled => {}
            // The adapter only reports a stall for an unpaused mpv, so from
            // `Paused` this means the resume never produced audio.
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Stopped => {
                warn!(
                    "SessionCore: playback stalled, restarting in {}s unless it recovers",
                    self.config.player.restart_timeout
                );
                self.session.set_playback(PlaybackState::Stalled);
                self.arm_restart();
            }
        }
    }

    /// Arm the countdown.  An armed countdown is never pushed back.
    fn arm_restart(&mut self) {
        if self.restart_deadline.is_none() {
            self.restart_deadline = Some(Instant::now() + self.restart_timeout());
        }
    }

    fn cancel_restart(&mut self) {
        self.restart_deadline = None;
        if self.session.restart_attempts != 0 {
            self.session.restart_attempts = 0;
            self.session.rev += 1;
        }
    }

    fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.config.player.restart_timeout)
    }

    async fn on_restart_deadline(&mut self) -> Result<(), ClientError> {
        self.restart_deadline = None;
        let restartable = match self.session.playback {
            PlaybackState::Stalled => true,
            PlaybackState::Stopped => self.engine_failed,
            _ => false,
        };
        if !restartable {
            return Ok(());
        }

        let attempts = self.session.restart_attempts;
        if attempts >= self.config.player.max_restart_attempts {
            error!(
                "SessionCore: {} restart attempt(s) did not recover playback, giving up",
                attempts
            );
            let err = ClientError::PlaybackStall { attempts };
            self.session.set_playback(PlaybackState::Stopped);
            let _ = self.broadcast_tx.send(BroadcastMessage::Fatal(err.to_string()));
            return Err(err);
        }

        self.session.restart_attempts += 1;
        self.session.rev += 1;
        warn!(
            "SessionCore: no recovery after {}s, restarting player (attempt {}/{})",
            self.config.player.restart_timeout,
            self.session.restart_attempts,
            self.config.player.max_restart_attempts
        );
        self.notice(format!(
            "Restarting player (attempt {}/{})",
            self.session.restart_attempts, self.config.player.max_restart_attempts
        ));
        self.send_engine(EngineCommand::Restart).await;
        self.arm_restart();
        Ok(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::TogglePause => match self.session.playback {
                PlaybackState::Paused => self.send_engine(EngineCommand::Resume).await,
                PlaybackState::Stopped if !self.engine_failed => {
                    self.send_engine(EngineCommand::Play).await
                }
                _ => {
                    self.cancel_restart();
                    self.send_engine(EngineCommand::Pause).await;
                }
            },
            SessionCommand::AdjustVolume(delta) => {
                let volume = (i16::from(self.session.volume) + delta).clamp(0, 100) as u8;
                if volume != self.session.volume {
                    self.session.volume = volume;
                    self.session.rev += 1;
                    self.send_engine(EngineCommand::SetVolume(volume)).await;
                    self.persist().await;
                }
            }
            SessionCommand::SeekToEnd => self.send_engine(EngineCommand::SeekToEnd).await,
            SessionCommand::RestartPlayer => self.manual_restart().await,
            SessionCommand::Favourite { song_id, reply } => {
                let result = self.request_favourite(song_id).await;
                if let Err(e) = &result {
                    self.report_error(e.to_string());
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SessionCommand::Preview { url } => {
                if self.previewing {
                    self.report_error("A preview is already playing".to_string());
                    return;
                }
                self.previewing = true;
                self.resume_after_preview = self.session.playback == PlaybackState::Playing;
                self.send_engine(EngineCommand::Preview { url }).await;
            }
            SessionCommand::Logout => {
                if !matches!(self.session.auth, listen_proto::session::AuthState::Anonymous) {
                    info!("SessionCore: logged out");
                    self.session.log_out();
                    self.notice("Logged out".to_string());
                    self.persist().await;
                }
            }
        }
    }

    async fn manual_restart(&mut self) {
        if self.session.restart_attempts > 0 {
            self.notice("A restart is already in progress".to_string());
            return;
        }
        info!("SessionCore: manual player restart");
        if self.session.playback == PlaybackState::Stalled {
            // Counts as the first attempt of the pending countdown.
            self.session.restart_attempts += 1;
            self.session.rev += 1;
            self.restart_deadline = Some(Instant::now() + self.restart_timeout());
        }
        self.send_engine(EngineCommand::Restart).await;
    }

    /// Validate and queue a favourite toggle.  Nothing in the session changes
    /// unless the request is accepted; the flag itself only moves when the
    /// read-back arrives.
    async fn request_favourite(&mut self, song_id: Option<SongId>) -> Result<SongId, ClientError> {
        let token = match self.session.token() {
            Some(token) => token.to_string(),
            None => {
                return Err(ClientError::Authentication(
                    "log in to favourite songs".to_string(),
                ))
            }
        };
        if !auth::token_is_valid(&token, Utc::now()) {
            self.on_auth_token_invalid().await;
            return Err(ClientError::Authentication(
                "session token has expired".to_string(),
            ));
        }
        let song_id = song_id
            .or_else(|| self.session.current_song_id())
            .ok_or_else(|| ClientError::NotFound {
                kind: "song",
                id: "current".to_string(),
            })?;

        self.send_job(ApiJob::ToggleFavourite { song_id, token }).await;
        Ok(song_id)
    }

    async fn on_auth_token_invalid(&mut self) {
        if !self.session.is_authenticated() {
            return;
        }
        warn!("SessionCore: session token rejected, login required");
        self.session.expire_auth();
        let _ = self.broadcast_tx.send(BroadcastMessage::LoginRequired(
            "Your LISTEN.moe session expired; run `login` to sign in again".to_string(),
        ));
        self.persist().await;
    }

    // ── plumbing ──────────────────────────────────────────────────────────────

    async fn send_engine(&self, cmd: EngineCommand) {
        if self.engine_tx.send(cmd).await.is_err() {
            warn!("SessionCore: playback adapter is gone");
        }
    }

    async fn send_job(&self, job: ApiJob) {
        if self.jobs_tx.send(job).await.is_err() {
            warn!("SessionCore: api worker is gone");
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.session.clone());
        let _ = self.broadcast_tx.send(BroadcastMessage::SessionUpdated);
    }

    fn notice(&self, text: String) {
        let _ = self.broadcast_tx.send(BroadcastMessage::Notice(text));
    }

    fn report_error(&self, text: String) {
        let _ = self.broadcast_tx.send(BroadcastMessage::Error(text));
    }

    async fn persist(&self) {
        let Some(state_file) = &self.state_file else {
            return;
        };
        let account = self.session.auth.account();
        let persistent = PersistentState {
            volume: self.session.volume,
            username: account.map(|a| a.username.clone()),
            token: account.map(|a| a.token.clone()),
        };
        if let Err(e) = state_file.save(&persistent).await {
            warn!("SessionCore: failed to save state: {}", e);
        }
    }

    async fn cleanup(&mut self) {
        self.restart_deadline = None;
        self.send_engine(EngineCommand::Stop).await;
        self.session.feed_status = ConnectionStatus::Disconnected;
        if self.session.playback != PlaybackState::Stopped {
            self.session.set_playback(PlaybackState::Stopped);
        }
        self.session.rev += 1;
        self.publish();
        self.persist().await;
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// EngineAdapter: runs mpv and translates what it observes into
/// `EngineEvent`s for SessionCore.
///
/// The adapter reports only.  It never restarts on its own: a stall is posted
/// as `EngineEvent::Stalled` and the core decides when to send `Restart`.
///
/// Playback is derived from two observed properties:
///
/// ```text
///   pause=true                    → Paused
///   pause=false, core-idle=true   → Stalled   (buffering / no data)
///   pause=false, core-idle=false  → Playing
/// ```
///
/// Only transitions are reported.
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::core::SessionEvent;
use crate::mpv::{MpvDriver, MpvEvent, MpvHandle, OBS_CORE_IDLE, OBS_PAUSE};

const HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Play,
    Pause,
    Resume,
    SetVolume(u8),
    SeekToEnd,
    Restart,
    Stop,
    /// Play a short clip in a separate player while the stream is paused.
    Preview { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Started,
    Paused,
    Resumed,
    Stalled,
    /// The player process died or could not be started.
    Fatal(String),
    RestartFailed(String),
    PreviewFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Playing,
    Paused,
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Stopped,
    Playing,
    Paused,
}

fn derive(paused: bool, core_idle: bool) -> Observed {
    if paused {
        Observed::Paused
    } else if core_idle {
        Observed::Stalled
    } else {
        Observed::Playing
    }
}

/// The event to report when playback moves from `last` to `now`.
fn transition(last: Option<Observed>, now: Observed) -> Option<EngineEvent> {
    if last == Some(now) {
        return None;
    }
    Some(match now {
        Observed::Paused => EngineEvent::Paused,
        Observed::Stalled => EngineEvent::Stalled,
        Observed::Playing if last == Some(Observed::Paused) => EngineEvent::Resumed,
        Observed::Playing => EngineEvent::Started,
    })
}

pub struct EngineAdapter {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    mpv_event_tx: mpsc::Sender<MpvEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
    stream_url: String,
    intent: Intent,
    paused: bool,
    core_idle: bool,
    reported: Option<Observed>,
    preview: Option<Child>,
}

impl EngineAdapter {
    pub fn new(
        driver: MpvDriver,
        stream_url: String,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> (Self, mpsc::Receiver<MpvEvent>) {
        let (mpv_event_tx, mpv_event_rx) = mpsc::channel(256);
        let adapter = Self {
            driver,
            handle: None,
            mpv_event_tx,
            event_tx,
            stream_url,
            intent: Intent::Stopped,
            paused: false,
            core_idle: true,
            reported: None,
            preview: None,
        };
        (adapter, mpv_event_rx)
    }

    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut mpv_event_rx: mpsc::Receiver<MpvEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Stop) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(evt) = mpv_event_rx.recv() => self.handle_mpv_event(evt).await,
                _ = wait_preview(&mut self.preview) => {
                    self.preview = None;
                    info!("player: preview finished");
                    self.emit(EngineEvent::PreviewFinished).await;
                }
                _ = heartbeat.tick() => self.check_alive().await,
            }
        }
        debug!("player: adapter exiting");
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        debug!("player: command {:?}", cmd);
        match cmd {
            EngineCommand::Play => {
                self.intent = Intent::Playing;
                if let Err(e) = self.start().await {
                    warn!("player: failed to start: {:#}", e);
                    self.emit(EngineEvent::Fatal(format!("{:#}", e))).await;
                }
            }
            EngineCommand::Restart => {
                info!("player: restarting");
                self.intent = Intent::Playing;
                if let Err(e) = self.start().await {
                    warn!("player: restart failed: {:#}", e);
                    self.emit(EngineEvent::RestartFailed(format!("{:#}", e)))
                        .await;
                }
            }
            EngineCommand::Pause => {
                self.intent = Intent::Paused;
                if let Some(h) = &self.handle {
                    if let Err(e) = h.set_pause(true).await {
                        warn!("player: pause failed: {}", e);
                    }
                }
            }
            EngineCommand::Resume => {
                self.intent = Intent::Playing;
                match &self.handle {
                    Some(h) => {
                        if let Err(e) = h.set_pause(false).await {
                            warn!("player: resume failed: {}", e);
                        }
                    }
                    None => {
                        if let Err(e) = self.start().await {
                            self.emit(EngineEvent::Fatal(format!("{:#}", e))).await;
                        }
                    }
                }
            }
            EngineCommand::SetVolume(volume) => {
                self.driver.volume = volume;
                if let Some(h) = &self.handle {
                    if let Err(e) = h.set_volume(volume).await {
                        warn!("player: set volume failed: {}", e);
                    }
                }
            }
            EngineCommand::SeekToEnd => {
                if let Some(h) = &self.handle {
                    if let Err(e) = h.seek_to_live_edge().await {
                        warn!("player: seek failed: {}", e);
                    }
                }
            }
            EngineCommand::Preview { url } => self.start_preview(url).await,
            EngineCommand::Stop => {}
        }
    }

    /// Spawn a fresh mpv and load the stream.
    async fn start(&mut self) -> anyhow::Result<()> {
        self.handle = None;
        self.reported = None;
        self.paused = false;
        self.core_idle = true;

        let handle = self
            .driver
            .spawn_and_connect(self.mpv_event_tx.clone())
            .await?;
        handle.observe_properties().await;
        handle.load_stream(&self.stream_url).await?;
        info!("player: loaded {}", self.stream_url);
        self.handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.intent = Intent::Stopped;
        if let Some(h) = self.handle.take() {
            let _ = h.stop().await;
        }
        self.driver.kill().await;
        self.preview = None;
    }

    async fn handle_mpv_event(&mut self, evt: MpvEvent) {
        if let Some((id, data)) = evt.as_property_change() {
            match id {
                OBS_CORE_IDLE => self.core_idle = data.as_bool().unwrap_or(true),
                OBS_PAUSE => self.paused = data.as_bool().unwrap_or(false),
                _ => return,
            }
            self.reconcile().await;
            return;
        }

        if evt.event_name() == Some("end-file") {
            let reason = evt.end_reason().unwrap_or("unknown");
            debug!("player: end-file reason={}", reason);
            // A live stream never ends on its own
            if self.intent == Intent::Playing && matches!(reason, "eof" | "error" | "unknown") {
                warn!("player: stream ended ({})", reason);
                self.core_idle = true;
                self.report(Observed::Stalled).await;
            }
        }
    }

    async fn reconcile(&mut self) {
        if self.intent == Intent::Stopped {
            return;
        }
        let now = derive(self.paused, self.core_idle);
        self.report(now).await;
    }

    async fn report(&mut self, now: Observed) {
        if let Some(evt) = transition(self.reported, now) {
            self.reported = Some(now);
            self.emit(evt).await;
        }
    }

    async fn check_alive(&mut self) {
        if self.handle.is_none() {
            return;
        }
        let alive = self.driver.process_alive();
        let responsive = match &self.handle {
            Some(h) if alive => h.ping().await.is_ok(),
            _ => false,
        };
        if !responsive {
            warn!("player: heartbeat: mpv is gone");
            self.handle = None;
            self.reported = None;
            self.driver.kill().await;
            self.emit(EngineEvent::Fatal("mpv process exited".to_string()))
                .await;
        }
    }

    async fn start_preview(&mut self, url: String) {
        if let Some(h) = &self.handle {
            if self.intent == Intent::Playing {
                let _ = h.set_pause(true).await;
            }
        }
        match self.spawn_preview(&url) {
            Ok(child) => {
                info!("player: previewing {}", url);
                self.preview = Some(child);
            }
            Err(e) => {
                warn!("player: preview failed: {:#}", e);
                self.emit(EngineEvent::PreviewFinished).await;
            }
        }
    }

    fn spawn_preview(&self, url: &str) -> anyhow::Result<Child> {
        let mpv_binary = listen_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--really-quiet")
            .arg(format!("--volume={}", self.driver.volume.min(100)))
            .arg(url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    async fn emit(&self, evt: EngineEvent) {
        if self.event_tx.send(SessionEvent::Engine(evt)).await.is_err() {
            debug!("player: session core is gone");
        }
    }
}

async fn wait_preview(preview: &mut Option<Child>) {
    match preview {
        Some(child) => {
            let _ = child.wait().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_and_unpaused_is_a_stall() {
        assert_eq!(derive(false, true), Observed::Stalled);
        assert_eq!(derive(false, false), Observed::Playing);
        assert_eq!(derive(true, true), Observed::Paused);
        assert_eq!(derive(true, false), Observed::Paused);
    }

    #[test]
    fn only_transitions_are_reported() {
        assert_eq!(
            transition(None, Observed::Playing),
            Some(EngineEvent::Started)
        );
        assert_eq!(transition(Some(Observed::Playing), Observed::Playing), None);
        assert_eq!(
            transition(Some(Observed::Paused), Observed::Playing),
            Some(EngineEvent::Resumed)
        );
        assert_eq!(
            transition(Some(Observed::Stalled), Observed::Playing),
            Some(EngineEvent::Started)
        );
        assert_eq!(
            transition(Some(Observed::Playing), Observed::Stalled),
            Some(EngineEvent::Stalled)
        );
        assert_eq!(transition(Some(Observed::Stalled), Observed::Stalled), None);
    }

    #[tokio::test]
    async fn property_changes_become_engine_events() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (mut adapter, _mpv_rx) =
            EngineAdapter::new(MpvDriver::new(Vec::new(), 50), "stream".into(), event_tx);
        adapter.intent = Intent::Playing;

        let change = |id: u64, data: bool| MpvEvent {
            raw: serde_json::json!({"event": "property-change", "id": id, "data": data}),
        };

        adapter.handle_mpv_event(change(OBS_CORE_IDLE, false)).await;
        adapter.handle_mpv_event(change(OBS_CORE_IDLE, true)).await;
        adapter.handle_mpv_event(change(OBS_PAUSE, true)).await;
        adapter.handle_mpv_event(change(OBS_PAUSE, false)).await;

        let mut seen = Vec::new();
        while let Ok(SessionEvent::Engine(evt)) = event_rx.try_recv() {
            seen.push(evt);
        }
        assert_eq!(
            seen,
            vec![
                EngineEvent::Started,
                EngineEvent::Stalled,
                EngineEvent::Paused,
                EngineEvent::Stalled,
            ]
        );
    }

    #[tokio::test]
    async fn end_of_stream_while_playing_is_a_stall() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (mut adapter, _mpv_rx) =
            EngineAdapter::new(MpvDriver::new(Vec::new(), 50), "stream".into(), event_tx);
        adapter.intent = Intent::Playing;
        adapter.reported = Some(Observed::Playing);

        adapter
            .handle_mpv_event(MpvEvent {
                raw: serde_json::json!({"event": "end-file", "reason": "error"}),
            })
            .await;
        assert!(matches!(
            event_rx.try_recv(),
            Ok(SessionEvent::Engine(EngineEvent::Stalled))
        ));

        // A deliberate stop is not a stall
        adapter.intent = Intent::Stopped;
        adapter.reported = Some(Observed::Playing);
        adapter
            .handle_mpv_event(MpvEvent {
                raw: serde_json::json!({"event": "end-file", "reason": "eof"}),
            })
            .await;
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_ends_the_adapter_while_the_core_is_alive() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (adapter, mpv_rx) =
            EngineAdapter::new(MpvDriver::new(Vec::new(), 50), "stream".into(), event_tx);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(adapter.run(cmd_rx, mpv_rx));

        cmd_tx.send(EngineCommand::Stop).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("adapter kept running after Stop")
            .unwrap();
        assert!(cmd_tx.is_closed());
    }
}

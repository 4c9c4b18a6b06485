//! Presence publisher.
//!
//! Renders the `[presence]` templates for each new track into an `Activity`
//! and hands it to a `PresenceSink`.  The chat-client transport lives outside
//! this program; the shipped sink records each activity in the log.

use std::collections::HashMap;

use listen_proto::config::{DisplayConfig, PresenceConfig};
use listen_proto::protocol::NowPlaying;
use listen_proto::session::{PlaybackState, Session};
use listen_proto::types::{Song, SITE_URL};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::BroadcastMessage;

/// Longest string the presence protocol accepts before we truncate.
const MAX_TEXT_CHARS: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Button {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub details: Option<String>,
    pub state: Option<String>,
    /// Unix seconds.
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub large_image: Option<String>,
    pub large_text: Option<String>,
    pub small_image: Option<String>,
    pub small_text: Option<String>,
    pub buttons: Vec<Button>,
}

pub trait PresenceSink: Send {
    fn publish(&mut self, activity: &Activity) -> anyhow::Result<()>;
    fn clear(&mut self) -> anyhow::Result<()>;
}

/// Writes activities to the log.
pub struct LogSink;

impl PresenceSink for LogSink {
    fn publish(&mut self, activity: &Activity) -> anyhow::Result<()> {
        info!("presence: {}", serde_json::to_string(activity)?);
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        info!("presence: cleared");
        Ok(())
    }
}

// ── rendering ─────────────────────────────────────────────────────────────────

/// Template values for `song`.  Missing values render as empty strings.
pub fn template_values(song: &Song, display: &DisplayConfig) -> HashMap<&'static str, String> {
    let romaji = display.romaji_first;
    let mut values = HashMap::new();
    values.insert("id", song.id.to_string());
    values.insert("title", song.format_title(romaji).unwrap_or_default());
    values.insert(
        "source",
        song.format_source(romaji)
            .map(|s| format!("[{}]", s))
            .unwrap_or_default(),
    );
    values.insert("source_image", song.source_image().unwrap_or_default());
    values.insert(
        "artist",
        song.format_artists(romaji, &display.separator)
            .unwrap_or_default(),
    );
    values.insert("artist_image", song.artist_image().unwrap_or_default());
    values.insert("album", song.format_album(romaji).unwrap_or_default());
    values.insert("album_image", song.album_image().unwrap_or_default());
    values
}

/// Substitute `${key}` placeholders.  Unknown keys are left as written.
pub fn render_template(template: &str, values: &HashMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match values.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Pad strings shorter than two characters with the placeholder and truncate
/// long ones to fit the protocol limit.
pub fn sanitise(text: &str, placeholder: &str) -> String {
    if text.trim().chars().count() < 2 {
        return format!("{}{}", text, placeholder).trim().to_string();
    }
    if text.chars().count() >= MAX_TEXT_CHARS {
        let head: String = text.chars().take(MAX_TEXT_CHARS - 3).collect();
        return format!("{}...", head).trim().to_string();
    }
    text.trim().to_string()
}

pub fn build_activity(
    np: &NowPlaying,
    presence: &PresenceConfig,
    display: &DisplayConfig,
) -> Activity {
    let song = &np.song;
    let values = template_values(song, display);
    let text = |template: &str| -> Option<String> {
        let rendered = render_template(template, &values);
        if rendered.trim().is_empty() {
            None
        } else {
            Some(sanitise(&rendered, &presence.default_placeholder))
        }
    };

    let large_image = song
        .album_image()
        .or_else(|| {
            if presence.use_artist {
                song.artist_image()
            } else {
                None
            }
        })
        .or_else(|| presence.use_fallback.then(|| presence.fallback.clone()));

    let small_image = if presence.show_small_image {
        song.artist_image().filter(|img| Some(img) != large_image.as_ref())
    } else {
        None
    };

    let (start, end) = if presence.show_time_left {
        (
            Some(np.started_at.timestamp()),
            np.ends_at().map(|t| t.timestamp()),
        )
    } else {
        (None, None)
    };

    Activity {
        details: text(&presence.detail),
        state: text(&presence.state),
        start,
        end,
        large_image,
        large_text: text(&presence.large_text),
        small_image,
        small_text: text(&presence.small_text),
        buttons: vec![Button {
            label: "Join radio".to_string(),
            url: format!("{}/", SITE_URL),
        }],
    }
}

// ── publisher task ────────────────────────────────────────────────────────────

pub struct PresencePublisher<S: PresenceSink> {
    presence: PresenceConfig,
    display: DisplayConfig,
    sink: S,
    last: Option<Activity>,
    cleared: bool,
}

impl<S: PresenceSink> PresencePublisher<S> {
    pub fn new(presence: PresenceConfig, display: DisplayConfig, sink: S) -> Self {
        Self {
            presence,
            display,
            sink,
            last: None,
            cleared: true,
        }
    }

    /// Follow track changes until the broadcast channel closes.
    pub async fn run(
        mut self,
        mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
        snapshot_rx: watch::Receiver<Session>,
    ) {
        if !self.presence.enable_rpc {
            debug!("presence: disabled");
            return;
        }
        loop {
            match broadcast_rx.recv().await {
                Ok(BroadcastMessage::TrackChanged(np)) => self.on_track(&np),
                Ok(BroadcastMessage::SessionUpdated) => {
                    let playback = snapshot_rx.borrow().playback;
                    self.on_playback(playback);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("presence: lagged {} messages", n);
                    if let Some(np) = snapshot_rx.borrow().current.clone() {
                        self.on_track(&np);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        if let Err(e) = self.sink.clear() {
            warn!("presence: clear failed: {:#}", e);
        }
    }

    pub fn on_track(&mut self, np: &NowPlaying) {
        let activity = build_activity(np, &self.presence, &self.display);
        if self.last.as_ref() == Some(&activity) && !self.cleared {
            return;
        }
        match self.sink.publish(&activity) {
            Ok(()) => self.cleared = false,
            Err(e) => warn!("presence: publish failed: {:#}", e),
        }
        self.last = Some(activity);
    }

    /// Hide presence while nothing is audible; restore it on resume.
    pub fn on_playback(&mut self, playback: PlaybackState) {
        match playback {
            PlaybackState::Paused | PlaybackState::Stopped if !self.cleared => {
                match self.sink.clear() {
                    Ok(()) => self.cleared = true,
                    Err(e) => warn!("presence: clear failed: {:#}", e),
                }
            }
            PlaybackState::Playing if self.cleared => {
                if let Some(activity) = self.last.clone() {
                    match self.sink.publish(&activity) {
                        Ok(()) => self.cleared = false,
                        Err(e) => warn!("presence: publish failed: {:#}", e),
                    }
                }
            }
            _ => {}
        }
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::types::{Event, Requester, Song};

pub const GATEWAY_URL: &str = "wss://listen.moe/gateway_v2";

/// Gateway opcodes.
pub const OP_HELLO: u8 = 0;
pub const OP_TRACK: u8 = 1;
pub const OP_HEARTBEAT: u8 = 9;
pub const OP_HEARTBEAT_ACK: u8 = 10;

/// What the gateway says is on air.  Delivered by the feed client, owned by
/// the session once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowPlaying {
    pub song: Song,
    pub started_at: DateTime<Utc>,
    pub listeners: u64,
    #[serde(default)]
    pub requester: Option<Requester>,
    #[serde(default)]
    pub event: Option<Event>,
    #[serde(default)]
    pub last_played: Vec<Song>,
}

impl NowPlaying {
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time left in the track, `None` when the duration is unknown.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let total = Duration::from_secs(self.song.duration?);
        Some(total.saturating_sub(self.elapsed(now)))
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.song.duration?).ok()?;
        Some(self.started_at + chrono::Duration::seconds(secs))
    }
}

// ── frames ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawFrame {
    op: u8,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
    heartbeat: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackPayload {
    song: Song,
    start_time: DateTime<Utc>,
    #[serde(default)]
    listeners: u64,
    #[serde(default)]
    requester: Option<Requester>,
    #[serde(default)]
    event: Option<Event>,
    #[serde(default)]
    last_played: Option<Vec<Song>>,
}

/// Decoded gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayFrame {
    /// First frame after connecting; carries the heartbeat interval.
    Hello { heartbeat: Duration },
    Track(NowPlaying),
    HeartbeatAck,
    /// Frames we understand but don't act on (queue updates, notifications).
    Ignored { op: u8, kind: Option<String> },
}

pub fn parse_frame(text: &str) -> Result<GatewayFrame, ClientError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    match raw.op {
        OP_HELLO => {
            let d = raw
                .d
                .ok_or_else(|| ClientError::Protocol("hello without payload".to_string()))?;
            let hello: HelloPayload = serde_json::from_value(d)?;
            if hello.heartbeat == 0 {
                return Err(ClientError::Protocol("zero heartbeat interval".to_string()));
            }
            Ok(GatewayFrame::Hello {
                heartbeat: Duration::from_millis(hello.heartbeat),
            })
        }
        OP_TRACK if is_track_update(raw.t.as_deref()) => {
            let d = raw
                .d
                .ok_or_else(|| ClientError::Protocol("track update without payload".to_string()))?;
            let track: TrackPayload = serde_json::from_value(d)?;
            Ok(GatewayFrame::Track(NowPlaying {
                song: track.song,
                started_at: track.start_time,
                listeners: track.listeners,
                requester: track.requester,
                event: track.event,
                last_played: track.last_played.unwrap_or_default(),
            }))
        }
        OP_HEARTBEAT_ACK => Ok(GatewayFrame::HeartbeatAck),
        op => Ok(GatewayFrame::Ignored { op, kind: raw.t }),
    }
}

fn is_track_update(kind: Option<&str>) -> bool {
    matches!(kind, None | Some("TRACK_UPDATE") | Some("TRACK_UPDATE_REQUEST"))
}

pub fn heartbeat_frame() -> String {
    format!("{{\"op\":{}}}", OP_HEARTBEAT)
}

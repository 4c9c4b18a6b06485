use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::NowPlaying;
use crate::types::{Song, SongId};

/// Matches the size of the service's own system feed.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Playback as seen by the reconciler.  Changed only in response to engine
/// events (and the reconciler's own fatal escalation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Stalled,
}

/// Gateway connection status.
///
/// Transitions:
///   Connecting -> Connected -> Reconnecting -> Connected ...
///   any -> Disconnected (shutdown only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Owned by the feed client, read by everyone else through a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedState {
    pub now_playing: Option<NowPlaying>,
    pub received_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
    pub listeners: u64,
}

// ── auth ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Never exposed through session snapshots.
    #[serde(skip_serializing, default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "account")]
pub enum AuthState {
    #[default]
    Anonymous,
    LoggedIn(Account),
    /// The token was rejected or its `exp` passed; the user must log in again.
    Expired { username: String },
}

impl AuthState {
    pub fn account(&self) -> Option<&Account> {
        match self {
            AuthState::LoggedIn(account) => Some(account),
            _ => None,
        }
    }
}

// ── history ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub song: Song,
    pub played_at: DateTime<Utc>,
}

/// Append-only ring of recently played tracks.  The oldest entry is evicted
/// once `limit` is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest first.
    pub fn recent(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

// ── session ───────────────────────────────────────────────────────────────────

/// Outcome of offering a feed delivery to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackChange {
    /// A different song started; carries the song that was replaced.
    Changed { previous: Option<Song> },
    /// Same song re-announced (listener count, requester).
    Refreshed,
    /// Older than what we already have; ignored.
    Stale,
}

/// The single authoritative view of "what is playing".  Owned by the
/// reconciler task; everyone else sees cloned snapshots.  `rev` increases on
/// every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub rev: u64,
    pub current: Option<NowPlaying>,
    pub playback: PlaybackState,
    /// `None` while unknown (not logged in, or lookup in flight).
    pub favourite: Option<bool>,
    pub auth: AuthState,
    pub volume: u8,
    pub listeners: u64,
    pub feed_status: ConnectionStatus,
    pub history: History,
    pub restart_attempts: u32,
}

impl Session {
    pub fn new(volume: u8, history_limit: usize) -> Self {
        Self {
            rev: 1,
            current: None,
            playback: PlaybackState::Stopped,
            favourite: None,
            auth: AuthState::Anonymous,
            volume: volume.min(100),
            listeners: 0,
            feed_status: ConnectionStatus::Connecting,
            history: History::new(history_limit),
            restart_attempts: 0,
        }
    }

    pub fn current_song(&self) -> Option<&Song> {
        self.current.as_ref().map(|np| &np.song)
    }

    pub fn current_song_id(&self) -> Option<SongId> {
        self.current_song().map(|s| s.id)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.current.as_ref().map(|np| np.elapsed(now))
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.current.as_ref().and_then(|np| np.remaining(now))
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.auth, AuthState::LoggedIn(_))
    }

    pub fn token(&self) -> Option<&str> {
        self.auth.account().map(|a| a.token.as_str())
    }

    /// Offer a feed delivery.  Deliveries older than the current track are
    /// dropped; a new song moves the previous one into history and clears
    /// the favourite flag.  A refresh of the same song keeps the event and
    /// last-played list when the new delivery lacks them.
    pub fn apply_now_playing(&mut self, mut np: NowPlaying) -> TrackChange {
        let change = match &self.current {
            Some(cur) if np.started_at < cur.started_at => return TrackChange::Stale,
            Some(cur) if cur.song.id == np.song.id => TrackChange::Refreshed,
            Some(cur) => {
                self.history.push(HistoryEntry {
                    song: cur.song.clone(),
                    played_at: cur.started_at,
                });
                TrackChange::Changed {
                    previous: Some(cur.song.clone()),
                }
            }
            None => TrackChange::Changed { previous: None },
        };

        match &change {
            TrackChange::Changed { .. } => self.favourite = None,
            TrackChange::Refreshed => {
                // A refresh from the stats API carries less than the gateway did
                if let Some(cur) = self.current.take() {
                    np.requester = np.requester.or(cur.requester);
                    np.event = np.event.or(cur.event);
                    if np.last_played.is_empty() {
                        np.last_played = cur.last_played;
                    }
                }
            }
            TrackChange::Stale => {}
        }
        self.listeners = np.listeners;
        self.current = Some(np);
        self.rev += 1;
        change
    }

    pub fn set_playback(&mut self, state: PlaybackState) -> bool {
        if self.playback == state {
            return false;
        }
        self.playback = state;
        self.rev += 1;
        true
    }

    pub fn set_favourite(&mut self, song_id: SongId, favourite: bool) -> bool {
        if self.current_song_id() != Some(song_id) {
            return false;
        }
        self.favourite = Some(favourite);
        self.rev += 1;
        true
    }

    pub fn log_in(&mut self, account: Account) {
        self.auth = AuthState::LoggedIn(account);
        self.favourite = None;
        self.rev += 1;
    }

    pub fn log_out(&mut self) {
        self.auth = AuthState::Anonymous;
        self.favourite = None;
        self.rev += 1;
    }

    pub fn expire_auth(&mut self) {
        let username = match &self.auth {
            AuthState::LoggedIn(a) => a.username.clone(),
            AuthState::Expired { username } => username.clone(),
            AuthState::Anonymous => String::new(),
        };
        self.auth = AuthState::Expired { username };
        self.favourite = None;
        self.rev += 1;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(100, DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn np(id: SongId, started_secs: i64) -> NowPlaying {
        NowPlaying {
            song: serde_json::from_value(serde_json::json!({ "id": id, "duration": 200 })).unwrap(),
            started_at: DateTime::from_timestamp(1_700_000_000 + started_secs, 0).unwrap(),
            listeners: id,
            requester: None,
            event: None,
            last_played: Vec::new(),
        }
    }

    #[test]
    fn history_evicts_oldest() {
        let mut history = History::new(2);
        for id in 1..=3 {
            history.push(HistoryEntry {
                song: np(id, 0).song,
                played_at: Utc::now(),
            });
        }
        let ids: Vec<_> = history.recent().map(|e| e.song.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn new_track_moves_previous_into_history() {
        let mut session = Session::default();
        assert_eq!(
            session.apply_now_playing(np(1, 0)),
            TrackChange::Changed { previous: None }
        );
        session.favourite = Some(true);

        let change = session.apply_now_playing(np(2, 200));
        assert!(matches!(change, TrackChange::Changed { previous: Some(ref s) } if s.id == 1));
        assert_eq!(session.current_song_id(), Some(2));
        assert_eq!(session.favourite, None);
        assert_eq!(session.history.len(), 1);
    }

    #[test]
    fn stale_delivery_is_ignored() {
        let mut session = Session::default();
        session.apply_now_playing(np(2, 200));
        let rev = session.rev;

        assert_eq!(session.apply_now_playing(np(1, 0)), TrackChange::Stale);
        assert_eq!(session.current_song_id(), Some(2));
        assert_eq!(session.rev, rev);
        assert!(session.history.is_empty());
    }

    #[test]
    fn same_song_is_a_refresh() {
        let mut session = Session::default();
        session.apply_now_playing(np(5, 0));
        session.favourite = Some(true);

        let mut again = np(5, 0);
        again.listeners = 999;
        assert_eq!(session.apply_now_playing(again), TrackChange::Refreshed);
        assert_eq!(session.listeners, 999);
        assert_eq!(session.favourite, Some(true));
        assert!(session.history.is_empty());
    }

    #[test]
    fn refresh_keeps_gateway_extras() {
        let mut session = Session::default();
        let mut full = np(5, 0);
        full.event = Some(
            serde_json::from_value(serde_json::json!({ "id": "e1", "name": "Request Hour" }))
                .unwrap(),
        );
        full.last_played = vec![np(4, 0).song];
        session.apply_now_playing(full);

        let mut sparse = np(5, 0);
        sparse.listeners = 0;
        assert_eq!(session.apply_now_playing(sparse), TrackChange::Refreshed);
        let cur = session.current.as_ref().unwrap();
        assert_eq!(cur.event.as_ref().map(|e| e.name.as_str()), Some("Request Hour"));
        assert_eq!(cur.last_played.len(), 1);
        assert_eq!(cur.last_played[0].id, 4);
    }

    #[test]
    fn favourite_only_applies_to_current_song() {
        let mut session = Session::default();
        session.apply_now_playing(np(5, 0));
        assert!(!session.set_favourite(4, true));
        assert_eq!(session.favourite, None);
        assert!(session.set_favourite(5, true));
        assert_eq!(session.favourite, Some(true));
    }

    #[test]
    fn expiring_auth_keeps_username_and_clears_flag() {
        let mut session = Session::default();
        session.log_in(Account {
            username: "kyon".into(),
            display_name: None,
            token: "t".into(),
        });
        session.favourite = Some(false);
        session.expire_auth();
        assert_eq!(
            session.auth,
            AuthState::Expired {
                username: "kyon".into()
            }
        );
        assert_eq!(session.favourite, None);
        assert!(session.token().is_none());
    }

    #[test]
    fn snapshots_never_serialise_the_token() {
        let mut session = Session::default();
        session.log_in(Account {
            username: "kyon".into(),
            display_name: None,
            token: "secret-token".into(),
        });
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(json.contains("kyon"));
    }
}

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const SITE_URL: &str = "https://listen.moe";
pub const CDN_URL: &str = "https://cdn.listen.moe";
pub const STREAM_URL: &str = "https://listen.moe/stream";

pub type SongId = u64;

// ── helpers ───────────────────────────────────────────────────────────────────

/// GraphQL returns `null` for empty lists on some fields; treat it as empty.
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Millisecond epoch timestamps arrive either as numbers or numeric strings.
fn epoch_millis<'de, D>(d: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    let ms = match Raw::deserialize(d)? {
        Raw::Int(n) => n,
        Raw::Str(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom)?,
    };
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", ms)))
}

fn lenient_int<'de, D>(d: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
    }
}

fn pick_name<'a>(
    name: Option<&'a str>,
    romaji: Option<&'a str>,
    romaji_first: bool,
) -> Option<&'a str> {
    let name = name.filter(|s| !s.is_empty());
    let romaji = romaji.filter(|s| !s.is_empty());
    if romaji_first {
        romaji.or(name)
    } else {
        name.or(romaji)
    }
}

// ── images ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Album,
    Artist,
    Source,
}

impl ImageKind {
    fn cdn_dir(self) -> &'static str {
        match self {
            ImageKind::Album => "covers",
            ImageKind::Artist => "artists",
            ImageKind::Source => "source",
        }
    }
}

/// Public CDN URL for an image file name as returned by the API.
pub fn image_url(kind: ImageKind, name: &str) -> String {
    format!("{}/{}/{}", CDN_URL, kind.cdn_dir(), name)
}

pub fn snippet_url(snippet: &str) -> String {
    format!("{}/snippets/{}", CDN_URL, snippet)
}

// ── catalog entities ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Count {
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_romaji: Option<String>,
}

impl Character {
    pub fn display_name(&self, romaji_first: bool) -> Option<&str> {
        pick_name(self.name.as_deref(), self.name_romaji.as_deref(), romaji_first)
    }

    pub fn link(&self) -> String {
        format!("{}/characters/{}", SITE_URL, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Social {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_romaji: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Only populated by the `album` query.
    #[serde(default, deserialize_with = "nullable")]
    pub songs: Vec<Song>,
}

impl Album {
    pub fn display_name(&self, romaji_first: bool) -> Option<&str> {
        pick_name(self.name.as_deref(), self.name_romaji.as_deref(), romaji_first)
    }

    pub fn image_url(&self) -> Option<String> {
        self.image.as_deref().map(|i| image_url(ImageKind::Album, i))
    }

    pub fn link(&self) -> String {
        format!("{}/albums/{}", SITE_URL, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artist {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_romaji: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub characters: Vec<Character>,
    // Fields below are only populated by the `artist` query.
    #[serde(default, deserialize_with = "nullable")]
    pub links: Vec<Social>,
    #[serde(default)]
    pub songs: Option<Count>,
    #[serde(default, deserialize_with = "nullable")]
    pub albums: Vec<Album>,
    #[serde(default, deserialize_with = "nullable")]
    pub songs_without_album: Vec<Song>,
}

impl Artist {
    pub fn display_name(&self, romaji_first: bool) -> Option<&str> {
        pick_name(self.name.as_deref(), self.name_romaji.as_deref(), romaji_first)
    }

    pub fn image_url(&self) -> Option<String> {
        self.image.as_deref().map(|i| image_url(ImageKind::Artist, i))
    }

    pub fn link(&self) -> String {
        format!("{}/artists/{}", SITE_URL, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_romaji: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl Source {
    pub fn display_name(&self, romaji_first: bool) -> Option<&str> {
        pick_name(self.name.as_deref(), self.name_romaji.as_deref(), romaji_first)
    }

    pub fn image_url(&self) -> Option<String> {
        self.image.as_deref().map(|i| image_url(ImageKind::Source, i))
    }

    pub fn link(&self) -> String {
        format!("{}/sources/{}", SITE_URL, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub uuid: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Requester {
    pub fn link(&self) -> String {
        format!("{}/u/{}", SITE_URL, self.username)
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub presence: Option<String>,
}

// ── song ──────────────────────────────────────────────────────────────────────

/// A track as returned by the gateway or the catalog API.  Immutable once
/// received: a newer notification replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub id: SongId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub title_romaji: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub sources: Vec<Source>,
    #[serde(default, deserialize_with = "nullable")]
    pub artists: Vec<Artist>,
    #[serde(default, deserialize_with = "nullable")]
    pub characters: Vec<Character>,
    #[serde(default, deserialize_with = "nullable")]
    pub albums: Vec<Album>,
    /// Length in seconds.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub played: Option<u64>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub uploader: Option<Requester>,
}

impl Song {
    pub fn source(&self) -> Option<&Source> {
        self.sources.first()
    }

    pub fn album(&self) -> Option<&Album> {
        self.albums.first()
    }

    pub fn format_title(&self, romaji_first: bool) -> Option<String> {
        let title = if romaji_first {
            self.title_romaji
                .as_deref()
                .filter(|t| !t.is_empty())
                .or(self.title.as_deref())
        } else {
            self.title.as_deref()
        };
        title.filter(|t| !t.is_empty()).map(str::to_string)
    }

    /// Artist names joined by `separator`.  An artist credited as the voice
    /// of one of the song's characters is rendered `Character (CV: Artist)`.
    pub fn format_artists(&self, romaji_first: bool, separator: &str) -> Option<String> {
        let names = self.format_artist_list(romaji_first);
        if names.is_empty() {
            None
        } else {
            Some(names.join(separator))
        }
    }

    pub fn format_artist_list(&self, romaji_first: bool) -> Vec<String> {
        let mut out = Vec::with_capacity(self.artists.len());
        for artist in &self.artists {
            let Some(name) = artist.display_name(romaji_first) else {
                continue;
            };
            let voiced = artist
                .characters
                .iter()
                .find_map(|c| self.characters.iter().find(|sc| sc.id == c.id))
                .and_then(|c| c.display_name(romaji_first));
            match voiced {
                Some(character) => out.push(format!("{} (CV: {})", character, name)),
                None => out.push(name.to_string()),
            }
        }
        out
    }

    pub fn format_album(&self, romaji_first: bool) -> Option<String> {
        self.album()
            .and_then(|a| a.display_name(romaji_first))
            .map(str::to_string)
    }

    pub fn format_source(&self, romaji_first: bool) -> Option<String> {
        self.source()
            .and_then(|s| s.display_name(romaji_first))
            .map(str::to_string)
    }

    pub fn artist_image(&self) -> Option<String> {
        self.artists.first().and_then(Artist::image_url)
    }

    pub fn album_image(&self) -> Option<String> {
        self.album().and_then(Album::image_url)
    }

    pub fn source_image(&self) -> Option<String> {
        self.source().and_then(Source::image_url)
    }

    pub fn snippet_url(&self) -> Option<String> {
        self.snippet.as_deref().map(snippet_url)
    }

    /// One-line `Artist - Title [Source]` label for notices and history.
    pub fn label(&self, romaji_first: bool, separator: &str) -> String {
        let title = self
            .format_title(romaji_first)
            .unwrap_or_else(|| format!("#{}", self.id));
        let mut label = match self.format_artists(romaji_first, separator) {
            Some(artists) => format!("{} - {}", artists, title),
            None => title,
        };
        if let Some(source) = self.format_source(romaji_first) {
            label.push_str(&format!(" [{}]", source));
        }
        label
    }
}

// ── users ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    Favorited,
    Uploaded,
    Other,
}

impl From<i64> for ActivityType {
    fn from(v: i64) -> Self {
        match v {
            2 => ActivityType::Favorited,
            4 => ActivityType::Uploaded,
            _ => ActivityType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemFeed {
    #[serde(rename = "type", deserialize_with = "lenient_int")]
    pub kind: i64,
    #[serde(deserialize_with = "epoch_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub song: Option<Song>,
}

impl SystemFeed {
    pub fn activity(&self) -> ActivityType {
        ActivityType::from(self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uuid: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub favorites: Count,
    #[serde(default)]
    pub uploads: Count,
    #[serde(default)]
    pub requests: Count,
    #[serde(default, deserialize_with = "nullable")]
    pub system_feed: Vec<SystemFeed>,
}

impl User {
    pub fn link(&self) -> String {
        format!("{}/u/{}", SITE_URL, self.username)
    }
}

/// One entry of the station's play history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayStatistic {
    #[serde(deserialize_with = "epoch_millis")]
    pub created_at: DateTime<Utc>,
    pub song: Song,
    #[serde(default)]
    pub requester: Option<Requester>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song_json() -> serde_json::Value {
        serde_json::json!({
            "id": 4711,
            "title": "残酷な天使のテーゼ",
            "titleRomaji": "Zankoku na Tenshi no Thesis",
            "sources": [{ "id": 3, "name": "新世紀エヴァンゲリオン", "nameRomaji": "Neon Genesis Evangelion", "image": "eva.jpg" }],
            "artists": [
                { "id": 10, "name": "高橋洋子", "nameRomaji": "Yoko Takahashi", "image": "yoko.jpg", "characters": [] },
                { "id": 11, "name": "緒方恵美", "nameRomaji": "Megumi Ogata", "image": null, "characters": [{ "id": 50 }] }
            ],
            "characters": [{ "id": 50, "name": "碇シンジ", "nameRomaji": "Shinji Ikari" }],
            "albums": [{ "id": 7, "name": "Refrain", "nameRomaji": null, "image": "refrain.png" }],
            "duration": 245,
            "snippet": null
        })
    }

    #[test]
    fn song_deserialises_from_graphql_shape() {
        let song: Song = serde_json::from_value(song_json()).unwrap();
        assert_eq!(song.id, 4711);
        assert_eq!(song.duration, Some(245));
        assert_eq!(song.artists.len(), 2);
        assert_eq!(song.album().map(|a| a.id), Some(7));
    }

    #[test]
    fn null_lists_are_empty() {
        let song: Song =
            serde_json::from_value(serde_json::json!({ "id": 1, "artists": null, "albums": null }))
                .unwrap();
        assert!(song.artists.is_empty());
        assert!(song.format_artists(true, ", ").is_none());
        assert_eq!(song.label(true, ", "), "#1");
    }

    #[test]
    fn romaji_preference_controls_names() {
        let song: Song = serde_json::from_value(song_json()).unwrap();
        assert_eq!(
            song.format_title(true).as_deref(),
            Some("Zankoku na Tenshi no Thesis")
        );
        assert_eq!(song.format_title(false).as_deref(), Some("残酷な天使のテーゼ"));
        assert_eq!(
            song.format_source(true).as_deref(),
            Some("Neon Genesis Evangelion")
        );
        // Album has no romaji name, falls back to the native one.
        assert_eq!(song.format_album(true).as_deref(), Some("Refrain"));
    }

    #[test]
    fn voiced_characters_are_credited() {
        let song: Song = serde_json::from_value(song_json()).unwrap();
        assert_eq!(
            song.format_artists(true, " / ").as_deref(),
            Some("Yoko Takahashi / Shinji Ikari (CV: Megumi Ogata)")
        );
    }

    #[test]
    fn images_resolve_to_cdn_paths() {
        let song: Song = serde_json::from_value(song_json()).unwrap();
        assert_eq!(
            song.album_image().as_deref(),
            Some("https://cdn.listen.moe/covers/refrain.png")
        );
        assert_eq!(
            song.artist_image().as_deref(),
            Some("https://cdn.listen.moe/artists/yoko.jpg")
        );
        assert_eq!(
            song.source_image().as_deref(),
            Some("https://cdn.listen.moe/source/eva.jpg")
        );
    }

    #[test]
    fn system_feed_accepts_string_timestamps() {
        let feed: SystemFeed = serde_json::from_value(serde_json::json!({
            "type": "2",
            "createdAt": "1700000000000",
            "song": null
        }))
        .unwrap();
        assert_eq!(feed.activity(), ActivityType::Favorited);
        assert_eq!(feed.created_at.timestamp(), 1_700_000_000);
    }
}

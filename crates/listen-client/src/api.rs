//! LISTEN.moe GraphQL client and the background job worker.
//!
//! Every catalog lookup the console offers goes through `ApiClient`.
//! Favourite checks, favourite toggles and feed resyncs requested by
//! SessionCore run as `ApiJob`s; their results come back as
//! `SessionEvent`s, so only the core ever touches the session.

use anyhow::Context;
use listen_proto::protocol::NowPlaying;
use listen_proto::session::Account;
use listen_proto::types::{
    Album, Artist, Character, PlayStatistic, Song, SongId, Source, User,
};
use listen_proto::ClientError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::core::SessionEvent;
use crate::feed::FeedUpdate;

pub const GRAPHQL_URL: &str = "https://listen.moe/graphql";

/// A resync that fails on the network is tried once more after this delay.
const RESYNC_RETRY_DELAY: Duration = Duration::from_secs(3);

// ── query fragments ───────────────────────────────────────────────────────────

macro_rules! song_fields {
    () => {
        "id title titleRomaji duration played snippet \
         sources { id name nameRomaji image } \
         artists { id name nameRomaji image characters { id name nameRomaji } } \
         characters { id name nameRomaji } \
         albums { id name nameRomaji image }"
    };
}

macro_rules! user_fields {
    () => {
        "uuid username displayName bio favorites { count } uploads { count } requests { count }"
    };
}

const LOGIN: &str = concat!(
    "mutation login($username: String!, $password: String!) { ",
    "login(username: $username, password: $password) { user { ",
    user_fields!(),
    " } token } }"
);

const USER: &str = concat!(
    "query user($username: String!, $offset: Int, $count: Int) { user(username: $username) { ",
    user_fields!(),
    " systemFeed(offset: $offset, count: $count) { type createdAt song { ",
    song_fields!(),
    " } } } }"
);

const ALBUM: &str = concat!(
    "query album($id: Int!) { album(id: $id) { id name nameRomaji image songs { song { ",
    song_fields!(),
    " } } } }"
);

const ARTIST: &str = concat!(
    "query artist($id: Int!) { artist(id: $id) { id name nameRomaji image ",
    "characters { id name nameRomaji } links { name url } songs { count } ",
    "albums { id name nameRomaji image songs { song { ",
    song_fields!(),
    " } } } songsWithoutAlbum { song { ",
    song_fields!(),
    " } } } }"
);

const CHARACTER: &str =
    "query character($id: Int!) { character(id: $id) { id name nameRomaji } }";

const SONG: &str = concat!(
    "query song($id: Int!) { song(id: $id) { ",
    song_fields!(),
    " } }"
);

const SOURCE: &str =
    "query source($id: Int!) { source(id: $id) { id name nameRomaji image } }";

const PLAY_STATISTICS: &str = concat!(
    "query playStatistics($offset: Int!, $count: Int!) { ",
    "playStatistics(offset: $offset, count: $count) { songs { createdAt song { ",
    song_fields!(),
    " } requester { uuid username displayName } } } }"
);

const SEARCH: &str = concat!(
    "query search($term: String!, $favoritesOnly: Boolean) { ",
    "search(query: $term, favoritesOnly: $favoritesOnly) { ... on Song { ",
    song_fields!(),
    " } } }"
);

const CHECK_FAVORITE: &str =
    "query checkFavorite($songs: [Int!]!) { checkFavorite(songs: $songs) }";

const FAVORITE_SONG: &str = "mutation favoriteSong($id: Int!) { favoriteSong(id: $id) { id } }";

// ── responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    user: User,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PlayStatistics {
    songs: Vec<PlayStatistic>,
}

fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["unauthorized", "unauthenticated", "not authenticated", "jwt", "token"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Turn a GraphQL envelope into `data`, or the error it reports.
fn into_data(response: GraphQlResponse) -> Result<Value, ClientError> {
    if let Some(first) = response.errors.first() {
        let message = response
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(if is_auth_message(&first.message) {
            ClientError::Authentication(message)
        } else {
            ClientError::Api(message)
        });
    }
    response
        .data
        .ok_or_else(|| ClientError::Api("response carried no data".to_string()))
}

/// Catalog queries return `songs: [{ song: {..} }]`; flatten those wrappers
/// in place so the entries deserialize as plain `Song`s.
fn flatten_song_entries(value: &mut Value, key: &str) {
    if let Some(Value::Array(entries)) = value.get_mut(key) {
        for entry in entries.iter_mut() {
            if let Some(song) = entry.get_mut("song").map(Value::take) {
                *entry = song;
            }
        }
    }
}

// ── client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ApiClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_endpoint(GRAPHQL_URL)
    }

    pub fn with_endpoint(endpoint: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("listentui/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    /// Run one GraphQL operation and return its `data` object.
    pub async fn execute(
        &self,
        query: &str,
        variables: Value,
        token: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ClientError::Authentication(format!(
                "server returned {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let envelope: GraphQlResponse = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ClientError::Network(format!("server returned {}", status)))
            }
            Err(e) => return Err(ClientError::Api(format!("unreadable response: {}", e))),
        };
        into_data(envelope)
    }

    async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        field: &str,
        variables: Value,
        token: Option<&str>,
    ) -> Result<Option<T>, ClientError> {
        let mut data = self.execute(query, variables, token).await?;
        match data.get_mut(field).map(Value::take) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ClientError::Api(format!("{}: {}", field, e))),
        }
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        query: &str,
        kind: &'static str,
        id: u64,
    ) -> Result<T, ClientError> {
        self.query(query, kind, json!({ "id": id }), None)
            .await?
            .ok_or_else(|| ClientError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Account, ClientError> {
        let payload: LoginPayload = self
            .query(
                LOGIN,
                "login",
                json!({ "username": username, "password": password }),
                None,
            )
            .await
            .map_err(|e| match e {
                ClientError::Api(message) => ClientError::Authentication(message),
                other => other,
            })?
            .ok_or_else(|| ClientError::Authentication("login rejected".to_string()))?;
        Ok(Account {
            username: payload.user.username,
            display_name: payload.user.display_name,
            token: payload.token,
        })
    }

    /// Profile plus the latest `count` entries of the user's activity feed.
    pub async fn user(&self, username: &str, count: u32) -> Result<User, ClientError> {
        self.query(
            USER,
            "user",
            json!({ "username": username, "offset": 0, "count": count }),
            None,
        )
        .await?
        .ok_or_else(|| ClientError::NotFound {
            kind: "user",
            id: username.to_string(),
        })
    }

    pub async fn album(&self, id: u64) -> Result<Album, ClientError> {
        let mut data = self.execute(ALBUM, json!({ "id": id }), None).await?;
        let mut album = data.get_mut("album").map(Value::take).unwrap_or(Value::Null);
        if album.is_null() {
            return Err(ClientError::NotFound {
                kind: "album",
                id: id.to_string(),
            });
        }
        flatten_song_entries(&mut album, "songs");
        serde_json::from_value(album).map_err(|e| ClientError::Api(format!("album: {}", e)))
    }

    pub async fn artist(&self, id: u64) -> Result<Artist, ClientError> {
        let mut data = self.execute(ARTIST, json!({ "id": id }), None).await?;
        let mut artist = data.get_mut("artist").map(Value::take).unwrap_or(Value::Null);
        if artist.is_null() {
            return Err(ClientError::NotFound {
                kind: "artist",
                id: id.to_string(),
            });
        }
        flatten_song_entries(&mut artist, "songsWithoutAlbum");
        if let Some(Value::Array(albums)) = artist.get_mut("albums") {
            for album in albums.iter_mut() {
                flatten_song_entries(album, "songs");
            }
        }
        serde_json::from_value(artist).map_err(|e| ClientError::Api(format!("artist: {}", e)))
    }

    pub async fn character(&self, id: u64) -> Result<Character, ClientError> {
        self.lookup(CHARACTER, "character", id).await
    }

    pub async fn song(&self, id: SongId) -> Result<Song, ClientError> {
        self.lookup(SONG, "song", id).await
    }

    pub async fn source(&self, id: u64) -> Result<Source, ClientError> {
        self.lookup(SOURCE, "source", id).await
    }

    /// Station play history, newest first.
    pub async fn play_statistics(
        &self,
        count: u32,
        offset: u32,
    ) -> Result<Vec<PlayStatistic>, ClientError> {
        let stats: Option<PlayStatistics> = self
            .query(
                PLAY_STATISTICS,
                "playStatistics",
                json!({ "offset": offset, "count": count }),
                None,
            )
            .await?;
        Ok(stats.map(|s| s.songs).unwrap_or_default())
    }

    /// Full-text song search.  `favorites_only` needs a token.
    pub async fn search(
        &self,
        term: &str,
        count: usize,
        favorites_only: bool,
        token: Option<&str>,
    ) -> Result<Vec<Song>, ClientError> {
        if favorites_only && token.is_none() {
            return Err(ClientError::Authentication(
                "log in to search your favourites".to_string(),
            ));
        }
        let results: Option<Vec<Value>> = self
            .query(
                SEARCH,
                "search",
                json!({ "term": term, "favoritesOnly": favorites_only }),
                token,
            )
            .await?;
        // Non-song hits come back as empty objects from the inline fragment
        let mut songs: Vec<Song> = results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        songs.truncate(count);
        Ok(songs)
    }

    /// Which of `songs` the token's owner has favourited.
    pub async fn check_favorite(
        &self,
        songs: &[SongId],
        token: &str,
    ) -> Result<Vec<SongId>, ClientError> {
        let favourites: Option<Vec<SongId>> = self
            .query(
                CHECK_FAVORITE,
                "checkFavorite",
                json!({ "songs": songs }),
                Some(token),
            )
            .await?;
        Ok(favourites.unwrap_or_default())
    }

    /// Flip the favourite flag of `song_id` server-side.
    pub async fn favorite_song(&self, song_id: SongId, token: &str) -> Result<(), ClientError> {
        self.execute(FAVORITE_SONG, json!({ "id": song_id }), Some(token))
            .await?;
        Ok(())
    }
}

// ── background jobs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ApiJob {
    CheckFavourite { song_id: SongId, token: String },
    /// Toggle, then read the flag back.
    ToggleFavourite { song_id: SongId, token: String },
    /// Fetch the newest play-history entry after a feed reconnect.
    Resync,
}

/// Run jobs until the queue closes.  Each job runs as its own task so a slow
/// request never holds up the next one.
pub async fn run_jobs(
    api: ApiClient,
    mut jobs_rx: mpsc::Receiver<ApiJob>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(job) = jobs_rx.recv().await {
        debug!("api: job {:?}", job_name(&job));
        let api = api.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let name = job_name(&job);
            let evt = match run_job(&api, job).await {
                Ok(evt) => evt,
                Err(ClientError::Authentication(e)) => {
                    warn!("api: {} rejected: {}", name, e);
                    SessionEvent::AuthTokenInvalid
                }
                Err(error) => SessionEvent::JobFailed { job: name, error },
            };
            let _ = event_tx.send(evt).await;
        });
    }
    debug!("api: job queue closed");
}

fn job_name(job: &ApiJob) -> &'static str {
    match job {
        ApiJob::CheckFavourite { .. } => "favourite lookup",
        ApiJob::ToggleFavourite { .. } => "favourite",
        ApiJob::Resync => "resync",
    }
}

async fn run_job(api: &ApiClient, job: ApiJob) -> Result<SessionEvent, ClientError> {
    match job {
        ApiJob::CheckFavourite { song_id, token } => {
            let favourites = api.check_favorite(&[song_id], &token).await?;
            Ok(SessionEvent::FavouriteResolved {
                song_id,
                favourite: favourites.contains(&song_id),
                announce: false,
            })
        }
        ApiJob::ToggleFavourite { song_id, token } => {
            api.favorite_song(song_id, &token).await?;
            let favourites = api.check_favorite(&[song_id], &token).await?;
            Ok(SessionEvent::FavouriteResolved {
                song_id,
                favourite: favourites.contains(&song_id),
                announce: true,
            })
        }
        ApiJob::Resync => {
            let np = resync(api, RESYNC_RETRY_DELAY).await?;
            Ok(SessionEvent::Feed(FeedUpdate::Resynced(np)))
        }
    }
}

/// The newest play from the stats API.  It has no listener count.
async fn resync(api: &ApiClient, retry_delay: Duration) -> Result<NowPlaying, ClientError> {
    let latest = match api.play_statistics(1, 0).await {
        Err(e) if e.is_retryable() => {
            warn!("api: resync failed ({}), retrying in {:?}", e, retry_delay);
            tokio::time::sleep(retry_delay).await;
            api.play_statistics(1, 0).await?
        }
        other => other?,
    };
    let latest = latest
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::Api("empty play history".to_string()))?;
    Ok(NowPlaying {
        song: latest.song,
        started_at: latest.created_at,
        listeners: 0,
        requester: latest.requester,
        event: None,
        last_played: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Read one request off `sock` and answer it with `status` and `body`.
    async fn answer(sock: &mut tokio::net::TcpStream, status: &str, body: &str) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= split + 4 + length || n == 0 {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Answer one HTTP request with `status` and `body`; yields the request.
    async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/graphql", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            answer(&mut sock, status, &body).await
        });
        (url, handle)
    }

    #[test]
    fn query_strings_embed_fragments() {
        assert!(SONG.contains("titleRomaji"));
        assert!(ALBUM.contains("songs { song { id title"));
        assert!(LOGIN.contains("favorites { count }"));
        assert!(SEARCH.contains("... on Song"));
    }

    #[test]
    fn graphql_errors_are_classified() {
        let auth = GraphQlResponse {
            data: None,
            errors: vec![GraphQlError {
                message: "Unauthorized".into(),
            }],
        };
        assert!(matches!(into_data(auth), Err(ClientError::Authentication(_))));

        let other = GraphQlResponse {
            data: None,
            errors: vec![GraphQlError {
                message: "Song not in database".into(),
            }],
        };
        assert_eq!(
            into_data(other),
            Err(ClientError::Api("Song not in database".into()))
        );
    }

    #[test]
    fn song_wrappers_are_flattened() {
        let mut album = json!({
            "id": 7,
            "name": "Suzumiya Haruhi no Tsumeawase",
            "songs": [{ "song": { "id": 1 } }, { "song": { "id": 2 } }]
        });
        flatten_song_entries(&mut album, "songs");
        let album: Album = serde_json::from_value(album).unwrap();
        let ids: Vec<_> = album.songs.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn lookup_sends_bearer_and_variables() {
        let body = json!({ "data": { "checkFavorite": [42] } }).to_string();
        let (url, server) = serve_once("200 OK", body).await;
        let api = ApiClient::with_endpoint(&url).unwrap();

        let favourites = api.check_favorite(&[42, 43], "tok-123").await.unwrap();
        assert_eq!(favourites, vec![42]);

        let request = server.await.unwrap();
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok-123"));
        assert!(request.contains("\"songs\":[42,43]"));
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let body = json!({ "data": { "song": null } }).to_string();
        let (url, _server) = serve_once("200 OK", body).await;
        let api = ApiClient::with_endpoint(&url).unwrap();

        assert_eq!(
            api.song(9999).await,
            Err(ClientError::NotFound {
                kind: "song",
                id: "9999".into()
            })
        );
    }

    #[tokio::test]
    async fn unauthorized_status_is_an_auth_error() {
        let (url, _server) = serve_once("401 Unauthorized", "{}".to_string()).await;
        let api = ApiClient::with_endpoint(&url).unwrap();
        let err = api.favorite_song(1, "expired").await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
    }

    #[tokio::test]
    async fn favourites_only_search_needs_a_token() {
        let api = ApiClient::with_endpoint("http://127.0.0.1:9/graphql").unwrap();
        let err = api.search("hare", 10, true, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
    }

    #[tokio::test]
    async fn search_truncates_to_count() {
        let hits: Vec<_> = (1..=5).map(|id| json!({ "id": id, "title": "x" })).collect();
        let body = json!({ "data": { "search": hits } }).to_string();
        let (url, _server) = serve_once("200 OK", body).await;
        let api = ApiClient::with_endpoint(&url).unwrap();

        let songs = api.search("x", 3, false, None).await.unwrap();
        assert_eq!(songs.len(), 3);
    }

    #[tokio::test]
    async fn resync_retries_once_after_a_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/graphql", listener.local_addr().unwrap());
        let ok = json!({ "data": { "playStatistics": { "songs": [{
            "createdAt": 1_700_000_000_000i64,
            "song": { "id": 12, "title": "God knows..." },
            "requester": null
        }] } } })
        .to_string();
        let server = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            answer(&mut first, "503 Service Unavailable", "unavailable").await;
            drop(first);
            let (mut second, _) = listener.accept().await.unwrap();
            answer(&mut second, "200 OK", &ok).await;
        });
        let api = ApiClient::with_endpoint(&url).unwrap();

        let np = resync(&api, Duration::from_millis(10)).await.unwrap();
        assert_eq!(np.song.id, 12);
        assert_eq!(np.listeners, 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn resync_gives_up_after_the_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/graphql", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut sock, _) = listener.accept().await.unwrap();
                answer(&mut sock, "502 Bad Gateway", "down").await;
            }
        });
        let api = ApiClient::with_endpoint(&url).unwrap();

        let err = resync(&api, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ClientError::Network(_)), "{:?}", err);
        server.await.unwrap();
    }
}

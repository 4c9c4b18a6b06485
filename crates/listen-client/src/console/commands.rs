use chrono::{DateTime, Local, Utc};
use futures_util::future::try_join_all;
use listen_proto::config::DisplayConfig;
use listen_proto::types::{ActivityType, Song, SongId};
use listen_proto::ClientError;
use tokio::sync::oneshot;

use super::eval;
use super::table::{fields, Table};
use super::{Command, ConsoleContext};
use crate::core::{SessionCommand, SessionEvent};

pub(super) async fn execute(ctx: &ConsoleContext, command: Command) -> Result<String, ClientError> {
    match command {
        Command::Eval { path } => {
            let snapshot = ctx.snapshot_rx.borrow().clone();
            let feed = ctx.feed_rx.borrow().clone();
            let value = eval::eval_path(&snapshot, &feed, path.as_deref().unwrap_or(""))?;
            Ok(eval::render(&value))
        }
        Command::Search {
            query,
            count,
            favorites_only,
        } => {
            let token = current_token(ctx);
            let songs = ctx
                .api
                .search(&query.join(" "), count, favorites_only, token.as_deref())
                .await?;
            if songs.is_empty() {
                return Ok(format!("No results for \"{}\"", query.join(" ")));
            }
            Ok(song_table(&songs, &ctx.display))
        }
        Command::History { count, local } => {
            if local {
                local_history(ctx, count as usize)
            } else {
                remote_history(ctx, count).await
            }
        }
        Command::Album { ids } => {
            let ids = ids_or_current(ids, current_song(ctx).and_then(|s| s.album().map(|a| a.id)), "album")?;
            let albums = try_join_all(ids.into_iter().map(|id| ctx.api.album(id))).await?;
            let romaji = ctx.display.romaji_first;
            Ok(albums
                .iter()
                .map(|album| {
                    let mut out = fields(&[
                        ("Album", album.display_name(romaji).unwrap_or_default().to_string()),
                        ("ID", album.id.to_string()),
                        ("Image", album.image_url().unwrap_or_default()),
                        ("Link", album.link()),
                    ]);
                    if !album.songs.is_empty() {
                        out.push('\n');
                        out.push_str(&song_table(&album.songs, &ctx.display));
                    }
                    out
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Artist { ids } => {
            let current = current_song(ctx).and_then(|s| s.artists.first().map(|a| a.id));
            let ids = ids_or_current(ids, current, "artist")?;
            let artists = try_join_all(ids.into_iter().map(|id| ctx.api.artist(id))).await?;
            let romaji = ctx.display.romaji_first;
            Ok(artists
                .iter()
                .map(|artist| {
                    let characters = artist
                        .characters
                        .iter()
                        .filter_map(|c| c.display_name(romaji))
                        .collect::<Vec<_>>()
                        .join(&ctx.display.separator);
                    let socials = artist
                        .links
                        .iter()
                        .map(|l| format!("{} <{}>", l.name, l.url))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let mut out = fields(&[
                        ("Artist", artist.display_name(romaji).unwrap_or_default().to_string()),
                        ("ID", artist.id.to_string()),
                        ("Characters", characters),
                        (
                            "Songs",
                            artist.songs.as_ref().map(|c| c.count.to_string()).unwrap_or_default(),
                        ),
                        ("Socials", socials),
                        ("Image", artist.image_url().unwrap_or_default()),
                        ("Link", artist.link()),
                    ]);
                    for album in &artist.albums {
                        out.push_str(&format!(
                            "\n{} (album {})\n",
                            album.display_name(romaji).unwrap_or("?"),
                            album.id
                        ));
                        out.push_str(&song_table(&album.songs, &ctx.display));
                    }
                    if !artist.songs_without_album.is_empty() {
                        out.push_str("\nSongs without album\n");
                        out.push_str(&song_table(&artist.songs_without_album, &ctx.display));
                    }
                    out
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Song { ids } => {
            let ids = ids_or_current(ids, current_song(ctx).map(|s| s.id), "song")?;
            let songs = try_join_all(ids.into_iter().map(|id| ctx.api.song(id))).await?;
            Ok(songs
                .iter()
                .map(|song| song_block(song, &ctx.display))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Preview { id } => {
            let current = current_song(ctx);
            let id = ids_or_current(id.into_iter().collect(), current.as_ref().map(|s| s.id), "song")?[0];
            let song = match current {
                Some(song) if song.id == id && song.snippet.is_some() => song,
                _ => ctx.api.song(id).await?,
            };
            let url = song.snippet_url().ok_or_else(|| ClientError::NotFound {
                kind: "snippet",
                id: id.to_string(),
            })?;
            send(ctx, SessionEvent::Command(SessionCommand::Preview { url })).await?;
            Ok(format!(
                "Previewing {}",
                song.label(ctx.display.romaji_first, &ctx.display.separator)
            ))
        }
        Command::User { username, count } => {
            let user = ctx.api.user(&username, count).await?;
            let mut out = fields(&[
                ("User", user.display_name.clone().unwrap_or_else(|| user.username.clone())),
                ("Username", user.username.clone()),
                ("Bio", user.bio.clone().unwrap_or_default()),
                ("Favorites", user.favorites.count.to_string()),
                ("Uploads", user.uploads.count.to_string()),
                ("Requests", user.requests.count.to_string()),
                ("Link", user.link()),
            ]);
            if !user.system_feed.is_empty() {
                let mut table = Table::new(&["When", "Activity", "Song"]);
                for entry in &user.system_feed {
                    let activity = match entry.activity() {
                        ActivityType::Favorited => "favorited",
                        ActivityType::Uploaded => "uploaded",
                        ActivityType::Other => "",
                    };
                    let song = entry
                        .song
                        .as_ref()
                        .map(|s| s.label(ctx.display.romaji_first, &ctx.display.separator))
                        .unwrap_or_default();
                    table.push(vec![local_time(entry.created_at), activity.to_string(), song]);
                }
                out.push('\n');
                out.push_str(&table.render());
            }
            Ok(out)
        }
        Command::Character { ids } => {
            let current = current_song(ctx).and_then(|s| s.characters.first().map(|c| c.id));
            let ids = ids_or_current(ids, current, "character")?;
            let characters = try_join_all(ids.into_iter().map(|id| ctx.api.character(id))).await?;
            Ok(characters
                .iter()
                .map(|c| {
                    fields(&[
                        (
                            "Character",
                            c.display_name(ctx.display.romaji_first).unwrap_or_default().to_string(),
                        ),
                        ("ID", c.id.to_string()),
                        ("Link", c.link()),
                    ])
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Source { ids } => {
            let current = current_song(ctx).and_then(|s| s.source().map(|src| src.id));
            let ids = ids_or_current(ids, current, "source")?;
            let sources = try_join_all(ids.into_iter().map(|id| ctx.api.source(id))).await?;
            Ok(sources
                .iter()
                .map(|s| {
                    fields(&[
                        (
                            "Source",
                            s.display_name(ctx.display.romaji_first).unwrap_or_default().to_string(),
                        ),
                        ("ID", s.id.to_string()),
                        ("Image", s.image_url().unwrap_or_default()),
                        ("Link", s.link()),
                    ])
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Download { ids } => {
            let current = current_song(ctx);
            let ids = ids_or_current(ids, current.as_ref().map(|s| s.id), "song")?;
            let mut lines = Vec::with_capacity(ids.len());
            for id in ids {
                let song = match &current {
                    Some(song) if song.id == id && song.snippet.is_some() => song.clone(),
                    _ => ctx.api.song(id).await?,
                };
                if song.snippet.is_none() {
                    return Err(ClientError::NotFound {
                        kind: "snippet",
                        id: id.to_string(),
                    });
                }
                let path = ctx
                    .downloader
                    .download(&song)
                    .await
                    .map_err(|e| ClientError::Network(format!("{:#}", e)))?;
                lines.push(format!("Saved {}", path.display()));
            }
            Ok(lines.join("\n"))
        }
        Command::CheckFavorite { ids } => {
            let token = current_token(ctx).ok_or_else(|| {
                ClientError::Authentication("log in to check favourites".to_string())
            })?;
            let ids = ids_or_current(ids, current_song(ctx).map(|s| s.id), "song")?;
            let favourites = ctx.api.check_favorite(&ids, &token).await?;
            Ok(ids
                .iter()
                .map(|id| {
                    if favourites.contains(id) {
                        format!("♥ {} is favourited", id)
                    } else {
                        format!("♡ {} is not favourited", id)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Favorite { ids } => {
            let targets: Vec<Option<SongId>> = if ids.is_empty() {
                vec![None]
            } else {
                ids.into_iter().map(Some).collect()
            };
            let mut lines = Vec::with_capacity(targets.len());
            for song_id in targets {
                let (reply_tx, reply_rx) = oneshot::channel();
                send(
                    ctx,
                    SessionEvent::Command(SessionCommand::Favourite {
                        song_id,
                        reply: Some(reply_tx),
                    }),
                )
                .await?;
                let id = reply_rx.await.map_err(|_| ClientError::Cancelled)??;
                lines.push(format!("Toggling favourite on {}", id));
            }
            Ok(lines.join("\n"))
        }
        Command::Login { username, password } => {
            let username = username.unwrap_or_else(|| ctx.system.username.clone());
            let password = password.unwrap_or_else(|| ctx.system.password.clone());
            if username.is_empty() || password.is_empty() {
                return Err(ClientError::Authentication(
                    "usage: login <username> <password> (or set them in [system])".to_string(),
                ));
            }
            let account = ctx.api.login(&username, &password).await?;
            let name = account
                .display_name
                .clone()
                .unwrap_or_else(|| account.username.clone());
            send(ctx, SessionEvent::LoggedIn(account)).await?;
            Ok(format!("Welcome, {}", name))
        }
        Command::Logout => {
            send(ctx, SessionEvent::Command(SessionCommand::Logout)).await?;
            Ok("Logged out".to_string())
        }
        // Handled synchronously by the console
        Command::Help { .. } | Command::Clear | Command::Reset => Ok(String::new()),
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn current_song(ctx: &ConsoleContext) -> Option<Song> {
    ctx.snapshot_rx.borrow().current_song().cloned()
}

fn current_token(ctx: &ConsoleContext) -> Option<String> {
    ctx.snapshot_rx.borrow().token().map(str::to_string)
}

/// Explicit ids, or the current track's entity when none were given.
fn ids_or_current(ids: Vec<u64>, current: Option<u64>, kind: &'static str) -> Result<Vec<u64>, ClientError> {
    if !ids.is_empty() {
        return Ok(ids);
    }
    current.map(|id| vec![id]).ok_or_else(|| ClientError::NotFound {
        kind,
        id: "current".to_string(),
    })
}

async fn send(ctx: &ConsoleContext, evt: SessionEvent) -> Result<(), ClientError> {
    ctx.event_tx
        .send(evt)
        .await
        .map_err(|_| ClientError::Cancelled)
}

fn local_history(ctx: &ConsoleContext, count: usize) -> Result<String, ClientError> {
    let snapshot = ctx.snapshot_rx.borrow().clone();
    if snapshot.history.is_empty() {
        return Ok("Nothing played yet this session".to_string());
    }
    let mut table = Table::new(&["Played", "ID", "Song"]);
    for entry in snapshot.history.recent().take(count) {
        table.push(vec![
            local_time(entry.played_at),
            entry.song.id.to_string(),
            entry
                .song
                .label(ctx.display.romaji_first, &ctx.display.separator),
        ]);
    }
    Ok(table.render())
}

async fn remote_history(ctx: &ConsoleContext, count: u32) -> Result<String, ClientError> {
    let plays = ctx.api.play_statistics(count, 0).await?;
    let mut table = Table::new(&["Played", "ID", "Song", "Requested by"]);
    for play in &plays {
        table.push(vec![
            local_time(play.created_at),
            play.song.id.to_string(),
            play.song
                .label(ctx.display.romaji_first, &ctx.display.separator),
            play.requester
                .as_ref()
                .map(|r| r.label().to_string())
                .unwrap_or_default(),
        ]);
    }
    Ok(table.render())
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

fn format_duration(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn song_table(songs: &[Song], display: &DisplayConfig) -> String {
    let romaji = display.romaji_first;
    let mut table = Table::new(&["ID", "Title", "Artists", "Source", "Length"]);
    for song in songs {
        table.push(vec![
            song.id.to_string(),
            song.format_title(romaji).unwrap_or_default(),
            song.format_artists(romaji, &display.separator)
                .unwrap_or_default(),
            song.format_source(romaji).unwrap_or_default(),
            song.duration.map(format_duration).unwrap_or_default(),
        ]);
    }
    table.render()
}

fn song_block(song: &Song, display: &DisplayConfig) -> String {
    let romaji = display.romaji_first;
    fields(&[
        ("Title", song.format_title(romaji).unwrap_or_default()),
        ("ID", song.id.to_string()),
        (
            "Artists",
            song.format_artists(romaji, &display.separator)
                .unwrap_or_default(),
        ),
        ("Album", song.format_album(romaji).unwrap_or_default()),
        ("Source", song.format_source(romaji).unwrap_or_default()),
        ("Length", song.duration.map(format_duration).unwrap_or_default()),
        ("Played", song.played.map(|p| p.to_string()).unwrap_or_default()),
        ("Cover", song.album_image().unwrap_or_default()),
        ("Snippet", song.snippet_url().unwrap_or_default()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::download::Downloader;
    use chrono::TimeZone;
    use listen_proto::config::SystemConfig;
    use listen_proto::protocol::NowPlaying;
    use listen_proto::session::{ConnectionStatus, FeedState, Session};
    use tokio::sync::{mpsc, watch};

    fn context(session: Session) -> (ConsoleContext, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (_snapshot_tx, snapshot_rx) = watch::channel(session);
        let (_feed_tx, feed_rx) = watch::channel(FeedState {
            status: ConnectionStatus::Connected,
            listeners: 12,
            ..FeedState::default()
        });
        let ctx = ConsoleContext {
            api: ApiClient::with_endpoint("http://127.0.0.1:9/graphql").unwrap(),
            downloader: Downloader::new(std::env::temp_dir(), true, ", ".into()),
            display: DisplayConfig::default(),
            system: SystemConfig::default(),
            snapshot_rx,
            feed_rx,
            event_tx,
        };
        (ctx, event_rx)
    }

    fn playing(id: SongId, secs: i64) -> NowPlaying {
        NowPlaying {
            song: serde_json::from_value(serde_json::json!({
                "id": id,
                "title": format!("Song {}", id),
                "snippet": format!("{}.ogg", id),
            }))
            .unwrap(),
            started_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            listeners: 1,
            requester: None,
            event: None,
            last_played: Vec::new(),
        }
    }

    #[test]
    fn durations_are_minutes_and_seconds() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(261), "4:21");
    }

    #[test]
    fn missing_current_entity_is_not_found() {
        assert_eq!(ids_or_current(vec![3, 4], None, "album").unwrap(), vec![3, 4]);
        assert_eq!(ids_or_current(vec![], Some(7), "album").unwrap(), vec![7]);
        assert_eq!(
            ids_or_current(vec![], None, "album"),
            Err(ClientError::NotFound {
                kind: "album",
                id: "current".into()
            })
        );
    }

    #[tokio::test]
    async fn local_history_lists_newest_first() {
        let mut session = Session::default();
        for (i, id) in [1, 2, 3].into_iter().enumerate() {
            session.apply_now_playing(playing(id, i as i64 * 200));
        }
        let (ctx, _rx) = context(session);
        let out = execute(&ctx, Command::History { count: 10, local: true })
            .await
            .unwrap();
        let first = out.lines().nth(2).unwrap();
        assert!(first.contains("Song 2"), "{}", out);
        assert!(out.lines().nth(3).unwrap().contains("Song 1"));
    }

    #[tokio::test]
    async fn check_favourite_requires_login() {
        let (ctx, _rx) = context(Session::default());
        let err = execute(&ctx, Command::CheckFavorite { ids: vec![1] })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
    }

    #[tokio::test]
    async fn preview_of_current_song_uses_its_snippet() {
        let mut session = Session::default();
        session.apply_now_playing(playing(42, 0));
        let (ctx, mut rx) = context(session);

        let out = execute(&ctx, Command::Preview { id: None }).await.unwrap();
        assert!(out.contains("Song 42"));
        match rx.recv().await {
            Some(SessionEvent::Command(SessionCommand::Preview { url })) => {
                assert_eq!(url, "https://cdn.listen.moe/snippets/42.ogg")
            }
            other => panic!("expected a preview command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn favourite_reports_the_core_verdict() {
        let (ctx, mut rx) = context(Session::default());
        let core = tokio::spawn(async move {
            if let Some(SessionEvent::Command(SessionCommand::Favourite { song_id, reply })) = rx.recv().await {
                assert_eq!(song_id, None);
                let _ = reply.unwrap().send(Err(ClientError::Authentication("log in".into())));
            }
        });
        let err = execute(&ctx, Command::Favorite { ids: vec![] })
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Authentication("log in".into()));
        core.await.unwrap();
    }

    #[tokio::test]
    async fn eval_reads_the_snapshot() {
        let mut session = Session::default();
        session.apply_now_playing(playing(5, 0));
        let (ctx, _rx) = context(session);
        let out = execute(
            &ctx,
            Command::Eval {
                path: Some("current.song.title".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(out, "Song 5");

        let listeners = execute(
            &ctx,
            Command::Eval {
                path: Some("feed.listeners".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(listeners, "12");
    }
}

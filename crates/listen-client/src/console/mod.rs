/// Command console.
///
/// A line is split shell-style, parsed with clap, and run as its own task
/// under a child `CancellationToken`.  Commands never wait on each other or
/// on SessionCore: read-only work talks to the API directly, anything that
/// mutates the session is sent to the core as a `SessionCommand`.
///
/// Results (or errors) are delivered on the output channel tagged with the
/// command's sequence number.
mod commands;
pub mod eval;
pub mod table;

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use listen_proto::config::{DisplayConfig, SystemConfig};
use listen_proto::session::{FeedState, Session};
use listen_proto::ClientError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::ApiClient;
use crate::core::SessionEvent;
use crate::download::Downloader;

// ── grammar ───────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "",
    no_binary_name = true,
    disable_help_flag = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct ConsoleLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Print help for a command
    Help {
        #[arg(value_name = "COMMAND")]
        cmd: Option<String>,
    },
    /// Clear the console output
    Clear,
    /// Cancel running commands and clear the output
    Reset,
    /// Inspect the session, e.g. `eval current.song.title` or `eval feed.status`
    Eval {
        #[arg(value_name = "PATH")]
        path: Option<String>,
    },
    /// Search for a song
    Search {
        #[arg(required = true, value_name = "STRING")]
        query: Vec<String>,
        /// The amount of results to return
        #[arg(short, long, default_value_t = 10)]
        count: usize,
        /// [Requires login] Search favourited songs only
        #[arg(short = 'f', long = "favorite")]
        favorites_only: bool,
    },
    /// Show previously played songs
    History {
        /// The amount of results to return
        #[arg(short, long, default_value_t = 10)]
        count: u32,
        /// Only songs heard in this session
        #[arg(short, long)]
        local: bool,
    },
    /// Fetch info on an album (default: current song's album)
    Album {
        #[arg(value_name = "AlbumID")]
        ids: Vec<u64>,
    },
    /// Fetch info on an artist (default: current song's first artist)
    Artist {
        #[arg(value_name = "ArtistID")]
        ids: Vec<u64>,
    },
    /// Fetch info on a song (default: current song)
    Song {
        #[arg(value_name = "SongID")]
        ids: Vec<u64>,
    },
    /// Preview a portion of the song audio
    #[command(visible_alias = "pv")]
    Preview {
        #[arg(value_name = "SongID")]
        id: Option<u64>,
    },
    /// Fetch info on a user
    User {
        #[arg(value_name = "USERNAME")]
        username: String,
        /// The amount of feed entries to return
        #[arg(short, long, default_value_t = 10)]
        count: u32,
    },
    /// Fetch info on a character (default: current song's first character)
    Character {
        #[arg(value_name = "CharacterID")]
        ids: Vec<u64>,
    },
    /// Fetch info on a source (default: current song's source)
    Source {
        #[arg(value_name = "SourceID")]
        ids: Vec<u64>,
    },
    /// Download song snippets (default: current song)
    Download {
        #[arg(value_name = "SongID")]
        ids: Vec<u64>,
    },
    /// Check if songs are favourited (default: current song)
    #[command(name = "check_favorite", visible_aliases = ["cf", "check"])]
    CheckFavorite {
        #[arg(value_name = "SongID")]
        ids: Vec<u64>,
    },
    /// Toggle favourite on songs (default: current song)
    #[command(visible_alias = "f")]
    Favorite {
        #[arg(value_name = "SongID")]
        ids: Vec<u64>,
    },
    /// Log in (default: credentials from config)
    Login {
        username: Option<String>,
        password: Option<String>,
    },
    /// Log out and forget the session token
    Logout,
}

/// Parse one console line.  Unknown commands yield the help listing.
pub fn parse(line: &str) -> Result<Command, ParseFailure> {
    let words = split_words(line);
    if words.is_empty() {
        return Err(ParseFailure::Empty);
    }
    match ConsoleLine::try_parse_from(&words) {
        Ok(parsed) => Ok(parsed.command),
        Err(e) => match e.kind() {
            clap::error::ErrorKind::InvalidSubcommand
            | clap::error::ErrorKind::MissingSubcommand
            | clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                Err(ParseFailure::Unknown {
                    error: ClientError::UnknownCommand(words[0].clone()),
                    help: help_listing(),
                })
            }
            _ => Err(ParseFailure::Usage(e.render().to_string())),
        },
    }
}

#[derive(Debug)]
pub enum ParseFailure {
    Empty,
    Unknown { error: ClientError, help: String },
    Usage(String),
}

pub fn help_listing() -> String {
    ConsoleLine::command().render_help().to_string()
}

/// Help for one command, or the listing when `name` is unknown.
pub fn help_for(name: &str) -> String {
    let mut cmd = ConsoleLine::command();
    cmd.build();
    let text = match cmd
        .get_subcommands_mut()
        .find(|c| c.get_name() == name || c.get_all_aliases().any(|a| a == name))
    {
        Some(sub) => sub.render_help().to_string(),
        None => help_listing(),
    };
    text
}

/// Whitespace split that keeps quoted runs together.
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;
    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

// ── runtime ───────────────────────────────────────────────────────────────────

/// Everything a running command may use.
pub struct ConsoleContext {
    pub api: ApiClient,
    pub downloader: Downloader,
    pub display: DisplayConfig,
    pub system: SystemConfig,
    pub snapshot_rx: watch::Receiver<Session>,
    pub feed_rx: watch::Receiver<FeedState>,
    pub event_tx: mpsc::Sender<SessionEvent>,
}

#[derive(Debug)]
pub enum Output {
    Text(String),
    Clear,
}

#[derive(Debug)]
pub struct ConsoleOutput {
    pub seq: u64,
    pub line: String,
    pub result: Result<Output, ClientError>,
}

pub struct Console {
    ctx: Arc<ConsoleContext>,
    out_tx: mpsc::Sender<ConsoleOutput>,
    root: CancellationToken,
    next_seq: u64,
}

impl Console {
    pub fn new(ctx: ConsoleContext, out_tx: mpsc::Sender<ConsoleOutput>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            out_tx,
            root: CancellationToken::new(),
            next_seq: 1,
        }
    }

    /// Parse and start `line`.  Returns the sequence number its output will
    /// carry, or `None` for a blank line.
    pub async fn submit(&mut self, line: &str) -> Option<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let command = match parse(line) {
            Ok(command) => command,
            Err(ParseFailure::Empty) => return None,
            Err(ParseFailure::Unknown { error, help }) => {
                self.emit(seq, line, Ok(Output::Text(format!("{}\n\n{}", error, help))))
                    .await;
                return Some(seq);
            }
            Err(ParseFailure::Usage(text)) => {
                self.emit(seq, line, Ok(Output::Text(text))).await;
                return Some(seq);
            }
        };
        debug!("console: #{} {:?}", seq, command);

        match command {
            Command::Help { cmd } => {
                let text = match cmd {
                    Some(name) => help_for(&name),
                    None => help_listing(),
                };
                self.emit(seq, line, Ok(Output::Text(text))).await;
            }
            Command::Clear => self.emit(seq, line, Ok(Output::Clear)).await,
            Command::Reset => {
                self.cancel_all();
                self.emit(seq, line, Ok(Output::Clear)).await;
            }
            command => {
                let ctx = self.ctx.clone();
                let out_tx = self.out_tx.clone();
                let token = self.root.child_token();
                let line = line.to_string();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = token.cancelled() => Err(ClientError::Cancelled),
                        result = commands::execute(&ctx, command) => result.map(Output::Text),
                    };
                    let _ = out_tx.send(ConsoleOutput { seq, line, result }).await;
                });
            }
        }
        Some(seq)
    }

    /// Cancel every running command.
    pub fn cancel_all(&mut self) {
        self.root.cancel();
        self.root = CancellationToken::new();
    }

    async fn emit(&self, seq: u64, line: &str, result: Result<Output, ClientError>) {
        let _ = self
            .out_tx
            .send(ConsoleOutput {
                seq,
                line: line.to_string(),
                result,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_words_stay_together() {
        assert_eq!(
            split_words(r#"search "hare hare" -c 3"#),
            vec!["search", "hare hare", "-c", "3"]
        );
        assert_eq!(split_words("  song   12  "), vec!["song", "12"]);
        assert_eq!(split_words(r#"user ''"#), vec!["user", ""]);
    }

    #[test]
    fn aliases_and_flags_parse() {
        assert_eq!(parse("pv 12").unwrap(), Command::Preview { id: Some(12) });
        assert_eq!(
            parse("cf 1 2").unwrap(),
            Command::CheckFavorite { ids: vec![1, 2] }
        );
        assert_eq!(parse("f").unwrap(), Command::Favorite { ids: vec![] });
        assert_eq!(
            parse("search god knows -c 3 -f").unwrap(),
            Command::Search {
                query: vec!["god".into(), "knows".into()],
                count: 3,
                favorites_only: true,
            }
        );
        assert_eq!(
            parse("history -l").unwrap(),
            Command::History {
                count: 10,
                local: true
            }
        );
    }

    #[test]
    fn unknown_command_returns_help() {
        match parse("dance now") {
            Err(ParseFailure::Unknown { error, help }) => {
                assert_eq!(error, ClientError::UnknownCommand("dance".into()));
                assert!(help.contains("check_favorite"));
                assert!(help.contains("search"));
            }
            other => panic!("expected unknown command, got {:?}", other),
        }
        assert!(matches!(parse("   "), Err(ParseFailure::Empty)));
    }

    #[test]
    fn bad_arguments_are_usage_errors() {
        assert!(matches!(parse("song abc"), Err(ParseFailure::Usage(_))));
        assert!(matches!(parse("search"), Err(ParseFailure::Usage(_))));
    }

    #[test]
    fn help_for_resolves_aliases() {
        assert!(help_for("pv").contains("Preview a portion"));
        assert!(help_for("nonsense").contains("Fetch info on a user"));
    }
}

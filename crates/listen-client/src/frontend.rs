/// Line-oriented terminal frontend.
///
/// Reads stdin one line at a time.  A line that matches a key binding
/// becomes a `SessionCommand`; anything else goes to the console.  Console
/// results and broadcast notices are printed as they arrive.
use std::io::Write;

use crossterm::cursor::MoveTo;
use crossterm::style::{style, Stylize};
use crossterm::terminal::{Clear, ClearType};
use listen_proto::config::{DisplayConfig, Key, KeyAction};
use listen_proto::protocol::NowPlaying;
use listen_proto::ClientError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::console::{Console, ConsoleOutput, Output};
use crate::core::{SessionCommand, SessionEvent};
use crate::BroadcastMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Plain,
    Track,
    Notice,
    Error,
}

pub struct Frontend {
    console: Console,
    bindings: Vec<(Key, KeyAction)>,
    volume_step: u8,
    display: DisplayConfig,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl Frontend {
    pub fn new(
        console: Console,
        bindings: Vec<(Key, KeyAction)>,
        volume_step: u8,
        display: DisplayConfig,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            console,
            bindings,
            volume_step,
            display,
            event_tx,
        }
    }

    pub async fn run(
        mut self,
        mut out_rx: mpsc::Receiver<ConsoleOutput>,
        mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
        cancel: CancellationToken,
    ) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        print_line(Tone::Notice, "Type `help` for commands, Ctrl-C to quit");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.on_line(&line).await,
                    Ok(None) => {
                        debug!("frontend: stdin closed");
                        let _ = self.event_tx.send(SessionEvent::Shutdown).await;
                        break;
                    }
                    Err(e) => {
                        warn!("frontend: failed to read stdin: {}", e);
                        let _ = self.event_tx.send(SessionEvent::Shutdown).await;
                        break;
                    }
                },
                Some(out) = out_rx.recv() => show_output(out),
                msg = broadcast_rx.recv() => match msg {
                    Ok(msg) => {
                        if let Some((tone, text)) = render_broadcast(&msg, &self.display) {
                            print_line(tone, &text);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("frontend: lagged {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        self.console.cancel_all();
    }

    async fn on_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if let Some(cmd) = bound_command(&self.bindings, self.volume_step, trimmed) {
            debug!("frontend: key {:?} → {:?}", trimmed, cmd);
            let _ = self.event_tx.send(SessionEvent::Command(cmd)).await;
            return;
        }
        self.console.submit(trimmed).await;
    }
}

/// The command bound to `input`, if it is a bound key.
fn bound_command(bindings: &[(Key, KeyAction)], step: u8, input: &str) -> Option<SessionCommand> {
    let key = Key::from_input(input)?;
    let (_, action) = bindings.iter().find(|(k, _)| *k == key)?;
    let step = i16::from(step);
    Some(match action {
        KeyAction::PlayPause => SessionCommand::TogglePause,
        KeyAction::LowerVolume => SessionCommand::AdjustVolume(-step),
        KeyAction::RaiseVolume => SessionCommand::AdjustVolume(step),
        KeyAction::LowerVolumeFine => SessionCommand::AdjustVolume(-1),
        KeyAction::RaiseVolumeFine => SessionCommand::AdjustVolume(1),
        KeyAction::FavouriteSong => SessionCommand::Favourite {
            song_id: None,
            reply: None,
        },
        KeyAction::RestartPlayer => SessionCommand::RestartPlayer,
        KeyAction::SeekToEnd => SessionCommand::SeekToEnd,
    })
}

fn render_broadcast(msg: &BroadcastMessage, display: &DisplayConfig) -> Option<(Tone, String)> {
    match msg {
        BroadcastMessage::SessionUpdated => None,
        BroadcastMessage::TrackChanged(np) => Some((Tone::Track, now_playing_line(np, display))),
        BroadcastMessage::Notice(text) => Some((Tone::Notice, text.clone())),
        BroadcastMessage::Error(text) => Some((Tone::Error, text.clone())),
        BroadcastMessage::LoginRequired(text) => Some((Tone::Error, text.clone())),
        BroadcastMessage::Fatal(text) => Some((Tone::Error, format!("fatal: {}", text))),
        BroadcastMessage::Log(text) => Some((Tone::Plain, text.clone())),
    }
}

fn now_playing_line(np: &NowPlaying, display: &DisplayConfig) -> String {
    let mut line = format!(
        "♪ {}",
        np.song.label(display.romaji_first, &display.separator)
    );
    if let Some(secs) = np.song.duration {
        line.push_str(&format!(" ({}:{:02})", secs / 60, secs % 60));
    }
    if let Some(requester) = &np.requester {
        line.push_str(&format!(", requested by {}", requester.label()));
    }
    if let Some(event) = &np.event {
        line.push_str(&format!(" [{}]", event.name));
    }
    line
}

fn show_output(out: ConsoleOutput) {
    match out.result {
        Ok(Output::Text(text)) => {
            for line in text.trim_end().lines() {
                print_line(Tone::Plain, line);
            }
        }
        Ok(Output::Clear) => {
            let mut stdout = std::io::stdout();
            let _ = crossterm::execute!(stdout, Clear(ClearType::All), MoveTo(0, 0));
        }
        Err(e) => print_line(Tone::Error, &error_line(out.seq, &out.line, &e)),
    }
}

/// Commands finish out of order, so errors name the line they came from.
fn error_line(seq: u64, line: &str, error: &ClientError) -> String {
    format!("[#{}] {}: {}", seq, line, error)
}

fn print_line(tone: Tone, text: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = match tone {
        Tone::Plain => writeln!(stdout, "{}", text),
        Tone::Track => writeln!(stdout, "{}", style(text).cyan()),
        Tone::Notice => writeln!(stdout, "{}", style(text).green()),
        Tone::Error => writeln!(stdout, "{}", style(text).red()),
    };
    let _ = stdout.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use listen_proto::config::KeybindConfig;

    fn bindings() -> Vec<(Key, KeyAction)> {
        KeybindConfig::default().bindings().unwrap()
    }

    #[test]
    fn bound_keys_become_commands() {
        let b = bindings();
        assert!(matches!(
            bound_command(&b, 5, "space"),
            Some(SessionCommand::TogglePause)
        ));
        assert!(matches!(
            bound_command(&b, 5, "f"),
            Some(SessionCommand::Favourite {
                song_id: None,
                reply: None
            })
        ));
        assert!(bound_command(&b, 5, "search foo").is_none());
        assert!(bound_command(&b, 5, "").is_none());
    }

    #[test]
    fn volume_keys_use_the_step() {
        let b = bindings();
        let deltas: Vec<i16> = b
            .iter()
            .filter_map(|(key, _)| {
                let input = match key {
                    Key::Char(c) => c.to_string(),
                    other => format!("{:?}", other),
                };
                match bound_command(&b, 7, &input) {
                    Some(SessionCommand::AdjustVolume(d)) => Some(d),
                    _ => None,
                }
            })
            .collect();
        let mut sorted = deltas.clone();
        sorted.sort();
        assert_eq!(sorted, vec![-7, -1, 1, 7]);
    }

    #[test]
    fn errors_name_their_command() {
        let err = ClientError::NotFound {
            kind: "song",
            id: "current".into(),
        };
        let text = error_line(4, "song", &err);
        assert!(text.starts_with("[#4] song: "), "{}", text);
        assert!(text.ends_with(&err.to_string()));
    }

    #[test]
    fn track_changes_render_a_now_playing_line() {
        let np: NowPlaying = serde_json::from_value(serde_json::json!({
            "song": {
                "id": 1,
                "title": "Koi no Mikuru Densetsu",
                "artists": [{ "id": 2, "name": "Mikuru" }],
                "duration": 185
            },
            "started_at": "2024-01-01T00:00:00Z",
            "listeners": 10,
            "requester": { "uuid": "u", "username": "kyon", "displayName": "Kyon" }
        }))
        .unwrap();
        let (tone, text) = render_broadcast(
            &BroadcastMessage::TrackChanged(Box::new(np)),
            &DisplayConfig::default(),
        )
        .unwrap();
        assert_eq!(tone, Tone::Track);
        assert_eq!(text, "♪ Mikuru - Koi no Mikuru Densetsu (3:05), requested by Kyon");
        assert!(render_broadcast(&BroadcastMessage::SessionUpdated, &DisplayConfig::default()).is_none());
    }
}

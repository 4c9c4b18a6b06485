use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;
use crate::error::ClientError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub keybind: KeybindConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// LISTEN.moe login; leave empty to run anonymously.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Session token, used instead of the password while it is still valid.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub debug: bool,
    /// Refuse to start while another instance holds the lock file.
    #[serde(default = "default_true")]
    pub instance_lock: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            token: String::new(),
            debug: false,
            instance_lock: true,
        }
    }
}

// ── keybinds ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Space,
    Up,
    Down,
    Left,
    Right,
    Enter,
}

impl Key {
    /// Parse a binding from the config file: either a single character or a
    /// symbolic name such as `${SPACE}`.
    pub fn parse_binding(raw: &str) -> Result<Key, ClientError> {
        if let Some(name) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return Key::from_name(name)
                .ok_or_else(|| ClientError::Config(format!("unknown key name {:?}", raw)));
        }
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(Key::Char(c)),
            _ => Err(ClientError::Config(format!(
                "keybind {:?} must be one character or ${{NAME}}",
                raw
            ))),
        }
    }

    /// Interpret one line of user input as a key press.  Key names are
    /// matched case-insensitively so `space` and `UP` both work.
    pub fn from_input(input: &str) -> Option<Key> {
        let mut chars = input.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Some(Key::Char(c));
        }
        Key::from_name(input)
    }

    fn from_name(name: &str) -> Option<Key> {
        match name.to_ascii_uppercase().as_str() {
            "SPACE" => Some(Key::Space),
            "UP" => Some(Key::Up),
            "DOWN" => Some(Key::Down),
            "LEFT" => Some(Key::Left),
            "RIGHT" => Some(Key::Right),
            "ENTER" => Some(Key::Enter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    PlayPause,
    LowerVolume,
    RaiseVolume,
    LowerVolumeFine,
    RaiseVolumeFine,
    FavouriteSong,
    RestartPlayer,
    SeekToEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeybindConfig {
    #[serde(default = "default_play_pause")]
    pub play_pause: String,
    #[serde(default = "default_lower_volume")]
    pub lower_volume: String,
    #[serde(default = "default_raise_volume")]
    pub raise_volume: String,
    #[serde(default = "default_lower_volume_fine")]
    pub lower_volume_fine: String,
    #[serde(default = "default_raise_volume_fine")]
    pub raise_volume_fine: String,
    #[serde(default = "default_favourite_song")]
    pub favourite_song: String,
    #[serde(default = "default_restart_player")]
    pub restart_player: String,
    #[serde(default = "default_seek_to_end")]
    pub seek_to_end: String,
}

impl KeybindConfig {
    /// Resolve every binding.  Two actions on the same key is a config error.
    pub fn bindings(&self) -> Result<Vec<(Key, KeyAction)>, ClientError> {
        let raw = [
            (&self.play_pause, KeyAction::PlayPause),
            (&self.lower_volume, KeyAction::LowerVolume),
            (&self.raise_volume, KeyAction::RaiseVolume),
            (&self.lower_volume_fine, KeyAction::LowerVolumeFine),
            (&self.raise_volume_fine, KeyAction::RaiseVolumeFine),
            (&self.favourite_song, KeyAction::FavouriteSong),
            (&self.restart_player, KeyAction::RestartPlayer),
            (&self.seek_to_end, KeyAction::SeekToEnd),
        ];
        let mut out: Vec<(Key, KeyAction)> = Vec::with_capacity(raw.len());
        for (binding, action) in raw {
            let key = Key::parse_binding(binding)?;
            if let Some((_, other)) = out.iter().find(|(k, _)| *k == key) {
                return Err(ClientError::Config(format!(
                    "key {:?} bound to both {:?} and {:?}",
                    binding, other, action
                )));
            }
            out.push((key, action));
        }
        Ok(out)
    }
}

impl Default for KeybindConfig {
    fn default() -> Self {
        Self {
            play_pause: default_play_pause(),
            lower_volume: default_lower_volume(),
            raise_volume: default_raise_volume(),
            lower_volume_fine: default_lower_volume_fine(),
            raise_volume_fine: default_raise_volume_fine(),
            favourite_song: default_favourite_song(),
            restart_player: default_restart_player(),
            seek_to_end: default_seek_to_end(),
        }
    }
}

// ── display / presence ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_true")]
    pub romaji_first: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            romaji_first: true,
            separator: default_separator(),
            history_limit: default_history_limit(),
        }
    }
}

/// Templates accept `${id}`, `${title}`, `${source}`, `${source_image}`,
/// `${artist}`, `${artist_image}`, `${album}` and `${album_image}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_true")]
    pub enable_rpc: bool,
    /// Appended to fields shorter than two characters.
    #[serde(default = "default_placeholder")]
    pub default_placeholder: String,
    #[serde(default = "default_true")]
    pub use_fallback: bool,
    #[serde(default = "default_fallback")]
    pub fallback: String,
    #[serde(default = "default_true")]
    pub use_artist: bool,
    #[serde(default = "default_detail")]
    pub detail: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_large_text")]
    pub large_text: String,
    #[serde(default = "default_small_text")]
    pub small_text: String,
    #[serde(default = "default_true")]
    pub show_time_left: bool,
    #[serde(default = "default_true")]
    pub show_small_image: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enable_rpc: true,
            default_placeholder: default_placeholder(),
            use_fallback: true,
            fallback: default_fallback(),
            use_artist: true,
            detail: default_detail(),
            state: default_state(),
            large_text: default_large_text(),
            small_text: default_small_text(),
            show_time_left: true,
            show_small_image: true,
        }
    }
}

// ── player ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_volume_step")]
    pub volume_step: u8,
    /// Seconds a stall may last before the stream is restarted.
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout: u64,
    /// Consecutive unrecovered restarts before playback is declared dead.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Adds a compressor/loudnorm `af` chain unless `mpv_options` sets `af`.
    #[serde(default = "default_true")]
    pub dynamic_range_compression: bool,
    /// Passed to mpv as `--key=value`; underscores become dashes.
    #[serde(default = "default_mpv_options")]
    pub mpv_options: toml::Table,
}

pub const DRC_FILTER: &str = "acompressor=ratio=4,loudnorm=I=-16:LRA=11:TP=-1.5";

impl PlayerConfig {
    pub fn mpv_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.mpv_options.len() + 1);
        let mut has_af = false;
        for (key, value) in &self.mpv_options {
            let key = key.replace('_', "-");
            let value = match value {
                toml::Value::Boolean(b) => (if *b { "yes" } else { "no" }).to_string(),
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                other => {
                    tracing::warn!("config: ignoring mpv option {} = {}", key, other);
                    continue;
                }
            };
            has_af |= key == "af";
            args.push(format!("--{}={}", key, value));
        }
        if self.dynamic_range_compression && !has_af {
            args.push(format!("--af={}", DRC_FILTER));
        }
        args
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            volume_step: default_volume_step(),
            restart_timeout: default_restart_timeout(),
            max_restart_attempts: default_max_restart_attempts(),
            dynamic_range_compression: true,
            mpv_options: default_mpv_options(),
        }
    }
}

/// User-configurable paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where `download` stores song snippets.
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
        }
    }
}

// ── defaults ──────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_play_pause() -> String {
    "${SPACE}".to_string()
}

fn default_lower_volume() -> String {
    "${DOWN}".to_string()
}

fn default_raise_volume() -> String {
    "${UP}".to_string()
}

fn default_lower_volume_fine() -> String {
    "${LEFT}".to_string()
}

fn default_raise_volume_fine() -> String {
    "${RIGHT}".to_string()
}

fn default_favourite_song() -> String {
    "f".to_string()
}

fn default_restart_player() -> String {
    "r".to_string()
}

fn default_seek_to_end() -> String {
    "s".to_string()
}

fn default_separator() -> String {
    ", ".to_string()
}

fn default_history_limit() -> usize {
    crate::session::DEFAULT_HISTORY_LIMIT
}

fn default_placeholder() -> String {
    " ♪".to_string()
}

fn default_fallback() -> String {
    "fallback2".to_string()
}

fn default_detail() -> String {
    "${title}".to_string()
}

fn default_state() -> String {
    "${artist}".to_string()
}

fn default_large_text() -> String {
    "${source} ${title}".to_string()
}

fn default_small_text() -> String {
    "${artist}".to_string()
}

fn default_volume_step() -> u8 {
    5
}

fn default_restart_timeout() -> u64 {
    20
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_mpv_options() -> toml::Table {
    let mut t = toml::Table::new();
    t.insert("ad".into(), toml::Value::String("vorbis".into()));
    t.insert("cache".into(), toml::Value::Boolean(true));
    t.insert("cache_secs".into(), toml::Value::Integer(20));
    t.insert("cache_pause_initial".into(), toml::Value::Boolean(true));
    t.insert("cache_pause_wait".into(), toml::Value::Integer(3));
    t.insert(
        "demuxer_lavf_linearize_timestamps".into(),
        toml::Value::Boolean(true),
    );
    t
}

fn default_downloads_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("listen-moe")
}

// ── load / save ───────────────────────────────────────────────────────────────

impl Config {
    pub fn load() -> Result<Self, ClientError> {
        Self::load_from(&Self::config_path())
    }

    /// Load `path`, writing the defaults there first when it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ClientError> {
        let io_err = |e: std::io::Error| ClientError::Config(format!("{}: {}", path.display(), e));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(io_err)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.presence.default_placeholder.chars().count() < 2 {
            return Err(ClientError::Config(
                "presence.default_placeholder must be at least 2 characters".to_string(),
            ));
        }
        if self.player.volume_step == 0 || self.player.volume_step > 100 {
            return Err(ClientError::Config(
                "player.volume_step must be between 1 and 100".to_string(),
            ));
        }
        if self.player.restart_timeout == 0 {
            return Err(ClientError::Config(
                "player.restart_timeout must be positive".to_string(),
            ));
        }
        if self.player.max_restart_attempts == 0 {
            return Err(ClientError::Config(
                "player.max_restart_attempts must be at least 1".to_string(),
            ));
        }
        self.keybind.bindings()?;
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        !self.system.username.is_empty()
            && (!self.system.password.is_empty() || !self.system.token.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.player.restart_timeout, 20);
        assert_eq!(config.player.volume_step, 5);
        assert_eq!(config.display.separator, ", ");
        assert!(config.system.instance_lock);
        assert!(!config.has_credentials());
    }

    #[test]
    fn default_mpv_args_include_compression() {
        let args = PlayerConfig::default().mpv_args();
        assert!(args.contains(&"--cache-secs=20".to_string()));
        assert!(args.contains(&"--cache=yes".to_string()));
        assert!(args.contains(&"--ad=vorbis".to_string()));
        assert_eq!(args.last().unwrap(), &format!("--af={}", DRC_FILTER));
    }

    #[test]
    fn explicit_af_overrides_compression() {
        let config: Config = toml::from_str(
            r#"
            [player]
            mpv_options = { af = "volume=2" }
            "#,
        )
        .unwrap();
        assert_eq!(config.player.mpv_args(), vec!["--af=volume=2".to_string()]);
    }

    #[test]
    fn symbolic_keybinds_resolve() {
        let bindings = KeybindConfig::default().bindings().unwrap();
        assert!(bindings.contains(&(Key::Space, KeyAction::PlayPause)));
        assert!(bindings.contains(&(Key::Char('f'), KeyAction::FavouriteSong)));
        assert_eq!(Key::from_input("space"), Some(Key::Space));
        assert_eq!(Key::from_input("r"), Some(Key::Char('r')));
        assert_eq!(Key::from_input("search"), None);
    }

    #[test]
    fn duplicate_keybinds_are_rejected() {
        let keybind = KeybindConfig {
            restart_player: "f".into(),
            ..KeybindConfig::default()
        };
        assert!(matches!(keybind.bindings(), Err(ClientError::Config(_))));
        assert!(Key::parse_binding("${NOPE}").is_err());
        assert!(Key::parse_binding("ab").is_err());
    }

    #[test]
    fn short_placeholder_is_rejected() {
        let mut config = Config::default();
        config.presence.default_placeholder = "x".into();
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listentui").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.player.max_restart_attempts, 3);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.keybind.play_pause, "${SPACE}");
    }
}

use listen_proto::config::{Config, Key, KeyAction};
use listen_proto::ClientError;

#[test]
fn missing_file_is_created_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("listentui").join("config.toml");

    let config = Config::load_from(&path).unwrap();
    assert!(path.exists());
    assert_eq!(config.player.volume_step, 5);

    // The written file loads back to the same settings
    let again = Config::load_from(&path).unwrap();
    assert_eq!(again.player.restart_timeout, config.player.restart_timeout);
    assert_eq!(again.display.separator, config.display.separator);
}

#[test]
fn partial_file_keeps_defaults_for_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [system]
        username = "itsuki"

        [keybind]
        play_pause = "p"

        [player]
        restart_timeout = 30
        "#,
    )
    .unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.system.username, "itsuki");
    assert_eq!(config.player.restart_timeout, 30);
    assert!(config.display.romaji_first);

    let bindings = config.keybind.bindings().unwrap();
    assert!(bindings.contains(&(Key::Char('p'), KeyAction::PlayPause)));
    assert!(bindings.contains(&(Key::Up, KeyAction::RaiseVolume)));
}

#[test]
fn conflicting_binds_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [keybind]
        favourite_song = "r"
        "#,
    )
    .unwrap();

    assert!(matches!(Config::load_from(&path), Err(ClientError::Config(_))));
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Values that survive a restart: last volume and the session token obtained
/// from the last successful login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub volume: u8,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            volume: 100,
            username: None,
            token: None,
        }
    }
}

/// `state.json` next to the other runtime data.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state is not an error; we start from defaults.
    pub fn load(&self) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(&self.path) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
            tracing::warn!("state: ignoring unreadable {:?}", self.path);
        }
        PersistentState::default()
    }

    pub async fn save(&self, state: &PersistentState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("nested").join("state.json"));
        assert_eq!(file.load(), PersistentState::default());

        let state = PersistentState {
            volume: 35,
            username: Some("mikuru".into()),
            token: Some("abc".into()),
        };
        file.save(&state).await.unwrap();
        assert_eq!(file.load(), state);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ volume: nope").unwrap();
        assert_eq!(StateFile::new(path).load(), PersistentState::default());
    }
}

//! Single-instance lock file.
//!
//! The file holds the owner's pid.  A lock left behind by a process that no
//! longer exists is taken over; a live one makes startup fail with
//! `ClientError::InstanceLocked` unless `--bypass` clears it first.

use std::io::Write;
use std::path::{Path, PathBuf};

use listen_proto::ClientError;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path, bypass: bool) -> Result<Self, ClientError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ClientError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        if bypass && path.exists() {
            info!("lock: --bypass, removing {:?}", path);
            let _ = std::fs::remove_file(path);
        }

        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    debug!("lock: acquired {:?}", path);
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = read_owner(path);
                    if owner.is_some_and(pid_alive) {
                        return Err(ClientError::InstanceLocked(path.to_path_buf()));
                    }
                    warn!("lock: removing stale lock {:?} (pid {:?})", path, owner);
                    let _ = std::fs::remove_file(path);
                }
                Err(e) => {
                    return Err(ClientError::Config(format!(
                        "cannot create lock {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Err(ClientError::InstanceLocked(path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if read_owner(&self.path) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without a cheap liveness check, any recorded pid counts as alive.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");

        let lock = InstanceLock::acquire(&path, false).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
        assert_eq!(
            InstanceLock::acquire(&path, false).unwrap_err(),
            ClientError::InstanceLocked(path.clone())
        );

        drop(lock);
        assert!(!path.exists());
        let _again = InstanceLock::acquire(&path, false).unwrap();
    }

    #[test]
    fn bypass_clears_a_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        let _held = InstanceLock::acquire(&path, false).unwrap();

        let taken = InstanceLock::acquire(&path, true).unwrap();
        assert_eq!(taken.path(), path.as_path());
    }

    #[test]
    fn garbage_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        std::fs::write(&path, "not a pid").unwrap();

        let _lock = InstanceLock::acquire(&path, false).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_pid_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        // Above the default pid_max, never a live process
        std::fs::write(&path, "4194305").unwrap();

        let _lock = InstanceLock::acquire(&path, false).unwrap();
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }
}

//! Remote store rooted at a shared directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{PushResult, RemoteStatus, RemoteSync};
use crate::error::{Error, Result};
use crate::store::StateSnapshot;

const STATE_FILE: &str = "state.json";

/// Keeps the remote copy as `state.json` in a directory, for example a synced
/// or network-mounted folder.
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    async fn read_state(&self) -> Result<Option<StateSnapshot>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Sync(format!("Failed to read remote state {}: {}", path.display(), e)))?;
        let state = serde_json::from_str(&json).map_err(|e| {
            log::warn!("Corrupted remote state {}: {}", path.display(), e);
            Error::Sync(format!("Failed to parse remote state: {}", e))
        })?;
        Ok(Some(state))
    }

    async fn write_state(&self, state: &StateSnapshot) -> Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)
                .await
                .map_err(|e| Error::Sync(format!("Failed to create remote dir {}: {}", self.root.display(), e)))?;
        }
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, json)
            .await
            .map_err(|e| Error::Sync(format!("Failed to write remote state: {}", e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Sync(format!("Failed to replace remote state: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteSync for DirectoryRemote {
    async fn check_remote(&self) -> Result<RemoteStatus> {
        match self.read_state().await? {
            Some(state) => Ok(RemoteStatus {
                exists: true,
                last_modified: Some(state.last_updated),
            }),
            None => Ok(RemoteStatus::default()),
        }
    }

    async fn fetch(&self) -> Result<StateSnapshot> {
        self.read_state()
            .await?
            .ok_or_else(|| Error::Sync(format!("no remote state at {}", self.state_path().display())))
    }

    async fn push(&self, state: &StateSnapshot) -> PushResult {
        match self.write_state(state).await {
            Ok(()) => PushResult::ok(),
            Err(e) => PushResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_remote() {
        let temp = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(temp.path().join("remote"));

        let status = remote.check_remote().await.unwrap();
        assert!(!status.exists);
        assert!(status.last_modified.is_none());
        assert!(remote.fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_push_then_fetch() {
        let temp = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(temp.path().join("remote"));
        let state = StateSnapshot::default();

        assert!(remote.push(&state).await.success);
        let status = remote.check_remote().await.unwrap();
        assert_eq!(status.last_modified, Some(state.last_updated));
        assert_eq!(remote.fetch().await.unwrap(), state);
    }
}

//! Dual-store sync and conflict resolution.
//!
//! Local state is authoritative only after its `last_updated` has been compared
//! with the remote copy. A strictly newer remote is a conflict that the caller
//! must resolve with a [`ResolveStrategy`]. An unreachable remote is not a
//! conflict: local state wins and the failure is logged.

mod merge;
mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::store::StateSnapshot;

pub use merge::merge_states;
pub use remote::DirectoryRemote;

/// What the remote currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStatus {
    pub exists: bool,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    pub success: bool,
    pub error: Option<String>,
}

impl PushResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Remote store collaborator.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    async fn check_remote(&self) -> Result<RemoteStatus>;
    async fn fetch(&self) -> Result<StateSnapshot>;
    async fn push(&self, state: &StateSnapshot) -> PushResult;
}

/// Result of comparing local and remote timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCheck {
    NoConflict,
    Conflict {
        local: DateTime<Utc>,
        remote: DateTime<Utc>,
    },
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// Keep local state, optionally overwriting the remote with it.
    KeepLocal { push: bool },
    /// Replace local state with the remote copy.
    KeepRemote,
    /// Union both states, adopt the result locally and push it.
    Merge,
}

/// What resolving produced.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// State to adopt locally. `None` keeps the current local state.
    pub adopt: Option<StateSnapshot>,
    /// Push outcome, if a push was attempted.
    pub push: Option<PushResult>,
}

/// Compares and reconciles local state with a remote collaborator.
#[derive(Clone)]
pub struct SyncResolver {
    remote: Arc<dyn RemoteSync>,
}

impl SyncResolver {
    pub fn new(remote: Arc<dyn RemoteSync>) -> Self {
        Self { remote }
    }

    /// Compare local `last_updated` with the remote copy.
    pub async fn check(&self, local_updated: DateTime<Utc>) -> SyncCheck {
        let status = match self.remote.check_remote().await {
            Ok(status) => status,
            Err(e) => {
                log::warn!("Remote unreachable, keeping local state: {}", e);
                return SyncCheck::NoConflict;
            }
        };

        match status.last_modified {
            Some(remote) if status.exists && remote > local_updated => {
                log::warn!("Remote state ({}) is newer than local ({})", remote, local_updated);
                SyncCheck::Conflict {
                    local: local_updated,
                    remote,
                }
            }
            _ => {
                log::debug!("No sync conflict");
                SyncCheck::NoConflict
            }
        }
    }

    /// Apply a strategy to `local`.
    pub async fn resolve(&self, strategy: ResolveStrategy, local: &StateSnapshot) -> Result<Resolution> {
        log::info!("Resolving sync conflict with {:?}", strategy);
        match strategy {
            ResolveStrategy::KeepLocal { push } => {
                let push = if push { Some(self.remote.push(local).await) } else { None };
                Ok(Resolution { adopt: None, push })
            }
            ResolveStrategy::KeepRemote => {
                let remote = self.remote.fetch().await?;
                Ok(Resolution {
                    adopt: Some(remote),
                    push: None,
                })
            }
            ResolveStrategy::Merge => {
                let remote = self.remote.fetch().await?;
                let merged = merge_states(local, &remote);
                let push = self.remote.push(&merged).await;
                if let Some(error) = &push.error {
                    log::warn!("Merged state adopted but push failed: {}", error);
                }
                Ok(Resolution {
                    adopt: Some(merged),
                    push: Some(push),
                })
            }
        }
    }

    pub async fn push(&self, state: &StateSnapshot) -> PushResult {
        let result = self.remote.push(state).await;
        match &result.error {
            Some(e) => log::warn!("Push failed: {}", e),
            None => log::info!("Pushed state updated {}", state.last_updated),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryRemote {
        state: Mutex<Option<StateSnapshot>>,
        unreachable: bool,
    }

    #[async_trait]
    impl RemoteSync for MemoryRemote {
        async fn check_remote(&self) -> Result<RemoteStatus> {
            if self.unreachable {
                return Err(Error::Sync("offline".into()));
            }
            let state = self.state.lock().await;
            Ok(RemoteStatus {
                exists: state.is_some(),
                last_modified: state.as_ref().map(|s| s.last_updated),
            })
        }

        async fn fetch(&self) -> Result<StateSnapshot> {
            self.state.lock().await.clone().ok_or(Error::Sync("empty".into()))
        }

        async fn push(&self, state: &StateSnapshot) -> PushResult {
            *self.state.lock().await = Some(state.clone());
            PushResult::ok()
        }
    }

    fn remote_with(updated: DateTime<Utc>) -> Arc<MemoryRemote> {
        let state = StateSnapshot {
            last_updated: updated,
            ..Default::default()
        };
        Arc::new(MemoryRemote {
            state: Mutex::new(Some(state)),
            unreachable: false,
        })
    }

    #[tokio::test]
    async fn test_newer_remote_is_conflict() {
        let local = Utc::now();
        let resolver = SyncResolver::new(remote_with(local + Duration::seconds(5)));
        assert!(matches!(resolver.check(local).await, SyncCheck::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_equal_or_older_remote_is_not_conflict() {
        let local = Utc::now();
        assert_eq!(SyncResolver::new(remote_with(local)).check(local).await, SyncCheck::NoConflict);
        assert_eq!(
            SyncResolver::new(remote_with(local - Duration::seconds(5))).check(local).await,
            SyncCheck::NoConflict
        );
    }

    #[tokio::test]
    async fn test_unreachable_or_missing_remote_is_not_conflict() {
        let local = Utc::now();
        let offline = Arc::new(MemoryRemote {
            unreachable: true,
            ..Default::default()
        });
        assert_eq!(SyncResolver::new(offline).check(local).await, SyncCheck::NoConflict);
        let empty = Arc::new(MemoryRemote::default());
        assert_eq!(SyncResolver::new(empty).check(local).await, SyncCheck::NoConflict);
    }

    #[tokio::test]
    async fn test_keep_local_with_push_overwrites_remote() {
        let remote = remote_with(Utc::now() + Duration::hours(1));
        let resolver = SyncResolver::new(remote.clone());
        let local = StateSnapshot::default();

        let resolution = resolver
            .resolve(ResolveStrategy::KeepLocal { push: true }, &local)
            .await
            .unwrap();
        assert!(resolution.adopt.is_none());
        assert_eq!(remote.state.lock().await.as_ref(), Some(&local));
    }

    #[tokio::test]
    async fn test_keep_remote_adopts_remote() {
        let updated = Utc::now() + Duration::hours(1);
        let resolver = SyncResolver::new(remote_with(updated));
        let resolution = resolver
            .resolve(ResolveStrategy::KeepRemote, &StateSnapshot::default())
            .await
            .unwrap();
        assert_eq!(resolution.adopt.unwrap().last_updated, updated);
        assert!(resolution.push.is_none());
    }
}

//! Checkpoint persistence.
//!
//! Checkpoints live in 15 slots. Slots 0-9 form the auto-save ring and slots
//! 10-14 hold named manual saves. [`FilePersistence`] keeps one JSON file per
//! slot; [`MemoryPersistence`] keeps them in a map for tests and embedders.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::store::StateSnapshot;

/// Number of auto-save ring slots.
pub const AUTO_SLOTS: u8 = 10;
/// First manual slot.
pub const FIRST_MANUAL_SLOT: u8 = 10;
/// One past the last manual slot.
pub const SLOT_COUNT: u8 = 15;

pub fn is_auto_slot(index: u8) -> bool {
    index < AUTO_SLOTS
}

pub fn is_manual_slot(index: u8) -> bool {
    (FIRST_MANUAL_SLOT..SLOT_COUNT).contains(&index)
}

/// Slot metadata, cheap to list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub index: u8,
    pub name: String,
    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,
    /// Monotonic write counter across auto saves; orders the ring.
    #[serde(default)]
    pub generation: u64,
    /// `last_updated` of the embedded state.
    pub state_updated: DateTime<Utc>,
}

/// A checkpoint slot with its embedded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub state: StateSnapshot,
}

/// Ring slot that the next auto save overwrites.
pub fn next_auto_slot(existing: &[CheckpointMeta]) -> (u8, u64) {
    existing
        .iter()
        .filter(|m| is_auto_slot(m.index))
        .max_by_key(|m| m.generation)
        .map(|latest| ((latest.index + 1) % AUTO_SLOTS, latest.generation + 1))
        .unwrap_or((0, 1))
}

/// Persistence collaborator for checkpoints.
///
/// Implementors provide slot storage; the checkpoint operations are built on top.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Write a checkpoint into its slot, replacing any previous occupant.
    async fn write_slot(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Read a slot. `None` if empty.
    async fn read_slot(&self, index: u8) -> Result<Option<Checkpoint>>;

    /// Clear a slot. Returns false if it was already empty.
    async fn remove_slot(&self, index: u8) -> Result<bool>;

    /// Metadata of every occupied slot, ordered by index.
    async fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>>;

    /// Save into the next auto ring slot, evicting its previous occupant.
    async fn save_auto_checkpoint(&self, state: &StateSnapshot) -> Result<CheckpointMeta> {
        let existing = self.list_checkpoints().await?;
        let (index, generation) = next_auto_slot(&existing);
        let now = Utc::now();
        let meta = CheckpointMeta {
            index,
            name: format!("Auto save {}", now.format("%Y-%m-%d %H:%M:%S")),
            timestamp: now,
            generation,
            state_updated: state.last_updated,
        };
        self.write_slot(&Checkpoint {
            meta: meta.clone(),
            state: state.clone(),
        })
        .await?;
        log::info!("Auto checkpoint written to slot {}", index);
        Ok(meta)
    }

    /// Save into a named manual slot (10-14), overwriting it.
    async fn save_manual_checkpoint(&self, index: u8, name: &str, state: &StateSnapshot) -> Result<CheckpointMeta> {
        if !is_manual_slot(index) {
            return Err(Error::Validation(format!(
                "manual checkpoint slot must be {}-{}, got {}",
                FIRST_MANUAL_SLOT,
                SLOT_COUNT - 1,
                index
            )));
        }
        let meta = CheckpointMeta {
            index,
            name: name.to_string(),
            timestamp: Utc::now(),
            generation: 0,
            state_updated: state.last_updated,
        };
        self.write_slot(&Checkpoint {
            meta: meta.clone(),
            state: state.clone(),
        })
        .await?;
        log::info!("Manual checkpoint '{}' written to slot {}", name, index);
        Ok(meta)
    }

    async fn delete_checkpoint(&self, index: u8) -> Result<bool> {
        if index >= SLOT_COUNT {
            return Ok(false);
        }
        self.remove_slot(index).await
    }

    async fn load_checkpoint(&self, index: u8) -> Result<Option<Checkpoint>> {
        if index >= SLOT_COUNT {
            return Ok(None);
        }
        self.read_slot(index).await
    }

    /// State from the most recently written auto slot.
    async fn load_latest_auto(&self) -> Result<Option<StateSnapshot>> {
        let existing = self.list_checkpoints().await?;
        let latest = existing
            .iter()
            .filter(|m| is_auto_slot(m.index))
            .max_by_key(|m| m.generation);
        match latest {
            Some(meta) => Ok(self.read_slot(meta.index).await?.map(|c| c.state)),
            None => Ok(None),
        }
    }
}

/// One JSON file per slot under a directory.
pub struct FilePersistence {
    path: PathBuf,
}

#[derive(Deserialize)]
struct MetaOnly {
    meta: CheckpointMeta,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.path.exists() {
            fs::create_dir_all(&self.path).await.map_err(|e| {
                Error::Storage(format!(
                    "Failed to create checkpoint directory {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn slot_path(&self, index: u8) -> PathBuf {
        self.path.join(format!("slot-{:02}.json", index))
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn write_slot(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.ensure_dir().await?;
        let file_path = self.slot_path(checkpoint.meta.index);
        let tmp_path = file_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&tmp_path, json)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write checkpoint {}: {}", tmp_path.display(), e)))?;
        fs::rename(&tmp_path, &file_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to replace checkpoint {}: {}", file_path.display(), e)))?;
        Ok(())
    }

    async fn read_slot(&self, index: u8) -> Result<Option<Checkpoint>> {
        let file_path = self.slot_path(index);
        if !file_path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&file_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read checkpoint {}: {}", file_path.display(), e)))?;
        let checkpoint = serde_json::from_str(&json).map_err(|e| {
            log::warn!("Corrupted checkpoint file {}: {}", file_path.display(), e);
            Error::Storage(format!("Failed to parse checkpoint {}: {}", file_path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    async fn remove_slot(&self, index: u8) -> Result<bool> {
        let file_path = self.slot_path(index);
        if !file_path.exists() {
            return Ok(false);
        }
        fs::remove_file(&file_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to remove checkpoint {}: {}", file_path.display(), e)))?;
        Ok(true)
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut metas = Vec::new();
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read checkpoint directory: {}", e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path).await {
                    Ok(json) => match serde_json::from_str::<MetaOnly>(&json) {
                        Ok(m) => metas.push(m.meta),
                        Err(e) => {
                            log::warn!("Skipping corrupted checkpoint file {}: {}", path.display(), e);
                        }
                    },
                    Err(e) => {
                        log::warn!("Failed to read checkpoint file {}: {}", path.display(), e);
                    }
                }
            }
        }

        metas.sort_by_key(|m| m.index);
        Ok(metas)
    }
}

/// Slots kept in memory.
#[derive(Default)]
pub struct MemoryPersistence {
    slots: Mutex<BTreeMap<u8, Checkpoint>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn write_slot(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.slots.lock().await.insert(checkpoint.meta.index, checkpoint.clone());
        Ok(())
    }

    async fn read_slot(&self, index: u8) -> Result<Option<Checkpoint>> {
        Ok(self.slots.lock().await.get(&index).cloned())
    }

    async fn remove_slot(&self, index: u8) -> Result<bool> {
        Ok(self.slots.lock().await.remove(&index).is_some())
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>> {
        Ok(self.slots.lock().await.values().map(|c| c.meta.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(marker: &str) -> StateSnapshot {
        let mut state = StateSnapshot::default();
        state
            .human
            .settings
            .insert("marker".to_string(), serde_json::json!(marker));
        state
    }

    fn marker(state: &StateSnapshot) -> String {
        state.human.settings["marker"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_auto_ring_wraps_after_ten() {
        let persistence = MemoryPersistence::new();
        for i in 0..12 {
            persistence.save_auto_checkpoint(&state(&format!("s{}", i))).await.unwrap();
        }

        let metas = persistence.list_checkpoints().await.unwrap();
        assert_eq!(metas.len(), 10);

        // Writes 10 and 11 evicted slots 0 and 1
        let slot0 = persistence.load_checkpoint(0).await.unwrap().unwrap();
        assert_eq!(marker(&slot0.state), "s10");
        let slot2 = persistence.load_checkpoint(2).await.unwrap().unwrap();
        assert_eq!(marker(&slot2.state), "s2");

        let latest = persistence.load_latest_auto().await.unwrap().unwrap();
        assert_eq!(marker(&latest), "s11");
    }

    #[tokio::test]
    async fn test_manual_slots_validated() {
        let persistence = MemoryPersistence::new();
        assert!(persistence.save_manual_checkpoint(9, "bad", &state("x")).await.is_err());
        assert!(persistence.save_manual_checkpoint(15, "bad", &state("x")).await.is_err());

        let meta = persistence.save_manual_checkpoint(12, "before trip", &state("m")).await.unwrap();
        assert_eq!(meta.index, 12);
        // Manual saves do not count as auto saves
        assert!(persistence.load_latest_auto().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_and_empty_slots() {
        let persistence = MemoryPersistence::new();
        assert!(persistence.load_checkpoint(3).await.unwrap().is_none());
        assert!(persistence.load_checkpoint(99).await.unwrap().is_none());
        assert!(!persistence.delete_checkpoint(99).await.unwrap());
        assert!(!persistence.delete_checkpoint(3).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_persistence_save_load_delete() {
        let temp = TempDir::new().unwrap();
        let persistence = FilePersistence::new(temp.path().join("checkpoints"));

        assert!(persistence.list_checkpoints().await.unwrap().is_empty());
        let meta = persistence.save_auto_checkpoint(&state("a")).await.unwrap();
        assert_eq!(meta.index, 0);
        persistence.save_manual_checkpoint(10, "named", &state("b")).await.unwrap();

        let metas = persistence.list_checkpoints().await.unwrap();
        assert_eq!(metas.iter().map(|m| m.index).collect::<Vec<_>>(), vec![0, 10]);

        let loaded = persistence.load_checkpoint(10).await.unwrap().unwrap();
        assert_eq!(loaded.meta.name, "named");
        assert_eq!(marker(&loaded.state), "b");

        assert!(persistence.delete_checkpoint(10).await.unwrap());
        assert!(persistence.load_checkpoint(10).await.unwrap().is_none());
        assert!(!temp.path().join("checkpoints").join("slot-00.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_skipped_in_listing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("checkpoints");
        let persistence = FilePersistence::new(&dir);
        persistence.save_auto_checkpoint(&state("a")).await.unwrap();
        std::fs::write(dir.join("slot-03.json"), "{not json").unwrap();

        let metas = persistence.list_checkpoints().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert!(persistence.load_checkpoint(3).await.is_err());
    }
}

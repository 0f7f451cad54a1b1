//! Checkpoint manager: auto-save timer, manual saves, restore and undo.
//!
//! The manager only ever reads a snapshot of the store and never touches the
//! request queue beyond copying its pending items into the snapshot, so it keeps
//! working while the queue is paused or busy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::EventHandlers;
use crate::persistence::{CheckpointMeta, Persistence, SLOT_COUNT, is_auto_slot};
use crate::queue::RequestQueue;
use crate::store::{EntityStore, StateSnapshot};

/// Coordinates snapshots between the live store and a persistence collaborator.
#[derive(Clone)]
pub struct CheckpointManager {
    persistence: Arc<dyn Persistence>,
    store: Arc<RwLock<EntityStore>>,
    queue: Arc<Mutex<RequestQueue>>,
}

impl CheckpointManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        store: Arc<RwLock<EntityStore>>,
        queue: Arc<Mutex<RequestQueue>>,
    ) -> Self {
        Self {
            persistence,
            store,
            queue,
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Store snapshot with the queue's outstanding items attached.
    pub async fn snapshot(&self) -> StateSnapshot {
        let mut snapshot = self.store.read().await.snapshot();
        snapshot.queue = self.queue.lock().await.items();
        snapshot
    }

    /// Write the current state into the next auto slot.
    pub async fn auto_save(&self) -> Result<CheckpointMeta> {
        let snapshot = self.snapshot().await;
        self.persistence.save_auto_checkpoint(&snapshot).await
    }

    /// Write the current state into a named manual slot.
    pub async fn manual_save(&self, index: u8, name: &str) -> Result<CheckpointMeta> {
        let snapshot = self.snapshot().await;
        self.persistence.save_manual_checkpoint(index, name, &snapshot).await
    }

    pub async fn list(&self) -> Result<Vec<CheckpointMeta>> {
        self.persistence.list_checkpoints().await
    }

    pub async fn delete(&self, index: u8) -> Result<bool> {
        self.persistence.delete_checkpoint(index).await
    }

    /// Replace the live store with the checkpoint in `index`.
    ///
    /// Returns `Ok(false)` for an out-of-range index or an empty slot and an error
    /// when the slot cannot be read. Either way the store is left untouched. The
    /// request queue is never modified by a restore.
    pub async fn restore(&self, index: u8) -> Result<bool> {
        if index >= SLOT_COUNT {
            return Ok(false);
        }
        match self.persistence.load_checkpoint(index).await? {
            Some(checkpoint) => {
                self.store.write().await.replace(checkpoint.state);
                log::info!("Restored checkpoint {} ({})", index, checkpoint.meta.name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Restore the `steps`-th most recent auto save. `undo(1)` restores the latest.
    pub async fn undo(&self, steps: usize) -> Result<bool> {
        if steps == 0 {
            return Ok(false);
        }
        let mut autos: Vec<CheckpointMeta> = self
            .persistence
            .list_checkpoints()
            .await?
            .into_iter()
            .filter(|m| is_auto_slot(m.index))
            .collect();
        autos.sort_by(|a, b| b.generation.cmp(&a.generation));

        match autos.get(steps - 1) {
            Some(meta) => self.restore(meta.index).await,
            None => Ok(false),
        }
    }

    /// Run auto saves on a fixed interval until `shutdown` fires.
    ///
    /// Failures go to `handlers.on_error` and the timer keeps going.
    pub fn spawn_auto_save(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
        handlers: EventHandlers,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::debug!("Auto-save timer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.auto_save().await {
                            handlers.error(e.code(), &format!("Auto-save failed: {}", e));
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::queue::{LlmQueueItem, Priority, QueuePayload};
    use crate::store::Fact;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(
            Arc::new(MemoryPersistence::new()),
            Arc::new(RwLock::new(EntityStore::new())),
            Arc::new(Mutex::new(RequestQueue::new())),
        )
    }

    async fn fact_count(m: &CheckpointManager) -> usize {
        m.store.read().await.human().facts.len()
    }

    #[tokio::test]
    async fn test_restore_empty_or_out_of_range_leaves_store() {
        let m = manager();
        m.store.write().await.human_fact_upsert(Fact::new("Name", "Sam"));
        let before = m.store.read().await.snapshot();

        assert!(!m.restore(4).await.unwrap());
        assert!(!m.restore(15).await.unwrap());
        assert_eq!(m.store.read().await.snapshot(), before);
    }

    #[tokio::test]
    async fn test_save_then_restore_roundtrip() {
        let m = manager();
        m.store.write().await.human_fact_upsert(Fact::new("Name", "Sam"));
        let saved = m.store.read().await.snapshot();
        m.manual_save(11, "named").await.unwrap();

        m.store.write().await.human_fact_upsert(Fact::new("Pet", "Cat"));
        assert_eq!(fact_count(&m).await, 2);

        assert!(m.restore(11).await.unwrap());
        assert_eq!(m.store.read().await.snapshot(), saved);
    }

    #[tokio::test]
    async fn test_snapshot_carries_queue_but_restore_ignores_it() {
        let m = manager();
        m.queue
            .lock()
            .await
            .enqueue(LlmQueueItem::new(Priority::Normal, QueuePayload::Ceremony));
        let meta = m.auto_save().await.unwrap();

        let saved = m.persistence.load_checkpoint(meta.index).await.unwrap().unwrap();
        assert_eq!(saved.state.queue.len(), 1);

        let id = m.queue.lock().await.claim_next().unwrap().id;
        m.queue.lock().await.complete(&id);
        assert!(m.restore(meta.index).await.unwrap());
        assert!(m.queue.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_undo_steps_back_through_auto_saves() {
        let m = manager();
        for i in 0..3 {
            m.store.write().await.human_fact_upsert(Fact::new(format!("f{}", i), ""));
            m.auto_save().await.unwrap();
        }
        assert!(m.undo(2).await.unwrap());
        assert_eq!(fact_count(&m).await, 2);
        assert!(!m.undo(0).await.unwrap());
        assert!(!m.undo(4).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_save_timer_runs_until_shutdown() {
        let m = manager();
        let shutdown = CancellationToken::new();
        let handle = m.spawn_auto_save(Duration::from_millis(10), shutdown.clone(), EventHandlers::new());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(!m.list().await.unwrap().is_empty());
    }
}

//! Priority request queue for model-bound work.
//!
//! Items move `pending -> active -> {completed | pending again | failed-terminal}`.
//! The queue itself never calls a model; the processor claims one item at a time.
//! While paused, peek and claim return nothing but enqueue keeps accepting work.

mod item;

pub use item::{ItemState, LlmQueueItem, Priority, QueueItemKind, QueuePayload, ResponseTrigger};

use serde::{Deserialize, Serialize};

/// Whether the queue hands out work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    #[default]
    Running,
    Paused,
}

/// Result of failing an item.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// The item went back to pending with its attempt count bumped.
    Requeued { attempts: u32 },
    /// The item hit the attempt cutoff and was removed.
    GaveUp(LlmQueueItem),
    /// No item with that id.
    Unknown,
}

/// In-memory request queue.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: Vec<LlmQueueItem>,
    mode: QueueMode,
    next_seq: u64,
    max_attempts: Option<u32>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that gives up on an item after `max_attempts` failures.
    pub fn with_max_attempts(max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Add an item. Always succeeds, even while paused. Returns the item id.
    pub fn enqueue(&mut self, mut item: LlmQueueItem) -> String {
        item.seq = self.next_seq;
        item.state = ItemState::Pending;
        self.next_seq += 1;
        let id = item.id.clone();
        log::debug!("Enqueued {:?} item {} at {:?}", item.kind, id, item.priority);
        self.items.push(item);
        id
    }

    /// Re-add items recovered from a snapshot. Active items come back as pending.
    pub fn restore_pending(&mut self, items: Vec<LlmQueueItem>) -> usize {
        let mut restored = 0;
        for item in items {
            if self.items.iter().any(|i| i.id == item.id) {
                continue;
            }
            // Keep the recovered order by re-sequencing in saved order
            self.enqueue(item);
            restored += 1;
        }
        restored
    }

    fn next_pending_index(&self) -> Option<usize> {
        if self.mode == QueueMode::Paused {
            return None;
        }
        self.items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.state == ItemState::Pending)
            .min_by(|(_, a), (_, b)| a.dispatch_cmp(b))
            .map(|(idx, _)| idx)
    }

    /// The next pending item without claiming it. `None` while paused.
    pub fn peek_highest(&self) -> Option<&LlmQueueItem> {
        self.next_pending_index().map(|idx| &self.items[idx])
    }

    /// Claim the next pending item and mark it active.
    pub fn claim_next(&mut self) -> Option<LlmQueueItem> {
        let idx = self.next_pending_index()?;
        let item = &mut self.items[idx];
        item.state = ItemState::Active;
        Some(item.clone())
    }

    /// Remove a finished item. Returns false if it was already gone.
    pub fn complete(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        self.items.len() != before
    }

    /// Return an item to pending with its attempt count incremented.
    pub fn fail(&mut self, id: &str, reason: impl Into<String>) -> FailOutcome {
        let reason = reason.into();
        let Some(pos) = self.items.iter().position(|i| i.id == id) else {
            return FailOutcome::Unknown;
        };

        let item = &mut self.items[pos];
        item.attempts += 1;
        item.last_error = Some(reason.clone());
        item.state = ItemState::Pending;

        if let Some(max) = self.max_attempts
            && item.attempts >= max
        {
            log::warn!("Giving up on item {} after {} attempts: {}", id, item.attempts, reason);
            return FailOutcome::GaveUp(self.items.remove(pos));
        }

        log::info!("Item {} failed (attempt {}): {}", id, item.attempts, reason);
        FailOutcome::Requeued {
            attempts: item.attempts,
        }
    }

    /// Remove an item that must never be retried.
    pub fn fail_terminal(&mut self, id: &str, reason: &str) -> Option<LlmQueueItem> {
        let pos = self.items.iter().position(|i| i.id == id)?;
        log::warn!("Dropping item {}: {}", id, reason);
        Some(self.items.remove(pos))
    }

    pub fn pause(&mut self) {
        self.mode = QueueMode::Paused;
    }

    pub fn resume(&mut self) {
        self.mode = QueueMode::Running;
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn is_paused(&self) -> bool {
        self.mode == QueueMode::Paused
    }

    /// Items waiting to be claimed.
    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|i| i.state == ItemState::Pending).count()
    }

    /// Whether any waiting or running item matches `pred`.
    pub fn has_item(&self, pred: impl Fn(&LlmQueueItem) -> bool) -> bool {
        self.items.iter().any(pred)
    }

    /// Drop pending items matching `pred`. Active items are left alone.
    pub fn remove_pending_where(&mut self, pred: impl Fn(&LlmQueueItem) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|i| i.state == ItemState::Active || !pred(i));
        before - self.items.len()
    }

    /// Copy of every item for persistence, in dispatch order.
    pub fn items(&self) -> Vec<LlmQueueItem> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| a.dispatch_cmp(b));
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

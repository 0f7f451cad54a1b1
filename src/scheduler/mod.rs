//! Extraction, heartbeat and ceremony scheduling.
//!
//! The scheduler never calls the model. It mutates counters and timestamps in
//! the store and returns queue items for the processor to submit.

pub mod ceremony;
pub mod extraction;
pub mod heartbeat;

use chrono::{DateTime, Local, Utc};

use crate::config::Config;
use crate::queue::{LlmQueueItem, Priority, QueueItemKind, QueuePayload, RequestQueue, ResponseTrigger};
use crate::store::EntityStore;

pub use ceremony::{ceremony_due, digest, render_digest};
pub use extraction::{drop_queued_extractions, record_extraction, trigger_extraction};
pub use heartbeat::{heartbeat_candidate, MIN_DESIRE_GAP, MIN_SENTIMENT};

/// What one scheduler tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Personas whose timed pause expired.
    pub resumed: Vec<String>,
    /// Whether persona affect levels decayed.
    pub decayed: bool,
    /// Items to enqueue.
    pub items: Vec<LlmQueueItem>,
}

fn has_pending_response(queue: &RequestQueue, persona_id: &str) -> bool {
    queue.has_item(|i| i.kind == QueueItemKind::Response && i.payload.persona_id() == Some(persona_id))
}

/// Lift expired pauses. Returns the ids of resumed personas.
pub fn expire_pauses(store: &mut EntityStore, now: DateTime<Utc>) -> Vec<String> {
    let expired: Vec<String> = store
        .personas()
        .iter()
        .filter(|p| p.is_paused && !p.is_paused_at(now))
        .map(|p| p.id.clone())
        .collect();

    for id in &expired {
        if store.persona_resume(id).is_ok() {
            log::info!("Pause expired for persona {}", id);
        }
    }
    expired
}

/// Decay every active persona's topics by the time elapsed since the last decay.
pub fn decay_affect(store: &mut EntityStore, now: DateTime<Utc>, per_day: f64) -> bool {
    let Some(last) = store.scheduler_state().last_decay else {
        store.scheduler_state_mut().last_decay = Some(now);
        return false;
    };
    let elapsed = now.signed_duration_since(last);
    if elapsed <= chrono::Duration::zero() {
        return false;
    }

    let ids: Vec<String> = store
        .personas()
        .iter()
        .filter(|p| !p.is_archived)
        .map(|p| p.id.clone())
        .collect();

    let mut changed = false;
    for id in ids {
        if let Ok(moved) = store.with_persona_mut(&id, |p| heartbeat::decay_topics(&mut p.topics, elapsed, per_day)) {
            changed |= moved;
        }
    }
    store.scheduler_state_mut().last_decay = Some(now);
    changed
}

/// Heartbeat items for personas that have been quiet long enough and have
/// something they want to talk about.
pub fn due_heartbeats(
    store: &mut EntityStore,
    queue: &RequestQueue,
    config: &Config,
    now: DateTime<Utc>,
) -> Vec<LlmQueueItem> {
    let mut items = Vec::new();
    let candidates: Vec<(String, String)> = store
        .personas()
        .iter()
        .filter(|p| !p.is_archived && !p.is_paused_at(now))
        .filter(|p| heartbeat::silence_elapsed(p, now, config.heartbeat.default_delay))
        .filter(|p| !has_pending_response(queue, &p.id))
        .filter_map(|p| heartbeat_candidate(&p.topics).map(|t| (p.id.clone(), t.name.clone())))
        .collect();

    for (persona_id, topic) in candidates {
        log::info!("Heartbeat due for {} about {}", persona_id, topic);
        if let Err(e) = store.with_persona_mut(&persona_id, |p| p.last_heartbeat = Some(now)) {
            log::warn!("Failed to record heartbeat for {}: {}", persona_id, e);
        }
        items.push(LlmQueueItem::new(
            Priority::Normal,
            QueuePayload::Response {
                persona_id,
                trigger: ResponseTrigger::Heartbeat { topic },
            },
        ));
    }
    items
}

/// Ceremony item if one is due and none is already queued.
pub fn due_ceremony(
    store: &EntityStore,
    queue: &RequestQueue,
    config: &Config,
    now: DateTime<Utc>,
) -> Option<LlmQueueItem> {
    if !config.ceremony.enabled || queue.has_item(|i| i.kind == QueueItemKind::Ceremony) {
        return None;
    }
    let now_local = now.with_timezone(&Local).naive_local();
    let last_local = store
        .scheduler_state()
        .last_ceremony
        .map(|t| t.with_timezone(&Local).naive_local());

    if ceremony_due(now_local, last_local, config.ceremony.time) {
        Some(LlmQueueItem::new(Priority::Normal, QueuePayload::Ceremony))
    } else {
        None
    }
}

/// Run one scheduler pass.
pub fn tick(store: &mut EntityStore, queue: &RequestQueue, config: &Config, now: DateTime<Utc>) -> TickReport {
    let resumed = expire_pauses(store, now);
    let decayed = decay_affect(store, now, config.heartbeat.decay_per_day);

    let mut items = due_heartbeats(store, queue, config, now);
    items.extend(due_ceremony(store, queue, config, now));

    TickReport {
        resumed,
        decayed,
        items,
    }
}

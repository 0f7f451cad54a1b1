//! Event callbacks delivered to the UI layer.
//!
//! Callbacks form a fixed-shape struct: every event has one optional slot and
//! unset slots are skipped. Callbacks run synchronously on the caller's task
//! and must not block.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::ErrorCode;
use crate::queue::QueueMode;
use crate::store::{Message, PersonaEntity, Quote};

pub type PersonaCallback = Arc<dyn Fn(&PersonaEntity) + Send + Sync>;
pub type IdCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&str, &Message) + Send + Sync>;
pub type QueueStateCallback = Arc<dyn Fn(QueueState) + Send + Sync>;
pub type BoundaryCallback = Arc<dyn Fn(&str, Option<DateTime<Utc>>) + Send + Sync>;
pub type QuoteCallback = Arc<dyn Fn(&Quote) + Send + Sync>;
pub type ConflictCallback = Arc<dyn Fn(StateConflict) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ErrorCode, &str) + Send + Sync>;
pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

/// Queue state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Busy,
    Paused,
}

impl QueueState {
    /// Paused wins over busy, which wins over idle.
    pub fn from_parts(mode: QueueMode, busy: bool) -> Self {
        match (mode, busy) {
            (QueueMode::Paused, _) => QueueState::Paused,
            (QueueMode::Running, true) => QueueState::Busy,
            (QueueMode::Running, false) => QueueState::Idle,
        }
    }
}

/// A detected divergence between local and remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateConflict {
    pub local_updated: DateTime<Utc>,
    pub remote_updated: DateTime<Utc>,
}

/// Optional callbacks for processor events.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub on_persona_added: Option<PersonaCallback>,
    /// Receives the removed persona's id.
    pub on_persona_removed: Option<IdCallback>,
    pub on_persona_updated: Option<PersonaCallback>,
    /// Receives the persona id and the appended message.
    pub on_message_added: Option<MessageCallback>,
    pub on_queue_state_changed: Option<QueueStateCallback>,
    pub on_context_boundary_changed: Option<BoundaryCallback>,
    pub on_quote_added: Option<QuoteCallback>,
    pub on_quote_updated: Option<QuoteCallback>,
    /// Receives the removed quote's id.
    pub on_quote_removed: Option<IdCallback>,
    pub on_state_conflict: Option<ConflictCallback>,
    /// The whole store was swapped (startup load, restore, undo, conflict resolution).
    /// Message logs and data items may have changed; reload them.
    pub on_state_replaced: Option<RefreshCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_persona_added", &self.on_persona_added.is_some())
            .field("on_persona_removed", &self.on_persona_removed.is_some())
            .field("on_persona_updated", &self.on_persona_updated.is_some())
            .field("on_message_added", &self.on_message_added.is_some())
            .field("on_queue_state_changed", &self.on_queue_state_changed.is_some())
            .field("on_context_boundary_changed", &self.on_context_boundary_changed.is_some())
            .field("on_quote_added", &self.on_quote_added.is_some())
            .field("on_quote_updated", &self.on_quote_updated.is_some())
            .field("on_quote_removed", &self.on_quote_removed.is_some())
            .field("on_state_conflict", &self.on_state_conflict.is_some())
            .field("on_state_replaced", &self.on_state_replaced.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persona_added(mut self, f: impl Fn(&PersonaEntity) + Send + Sync + 'static) -> Self {
        self.on_persona_added = Some(Arc::new(f));
        self
    }

    pub fn with_persona_removed(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_persona_removed = Some(Arc::new(f));
        self
    }

    pub fn with_persona_updated(mut self, f: impl Fn(&PersonaEntity) + Send + Sync + 'static) -> Self {
        self.on_persona_updated = Some(Arc::new(f));
        self
    }

    pub fn with_message_added(mut self, f: impl Fn(&str, &Message) + Send + Sync + 'static) -> Self {
        self.on_message_added = Some(Arc::new(f));
        self
    }

    pub fn with_queue_state_changed(mut self, f: impl Fn(QueueState) + Send + Sync + 'static) -> Self {
        self.on_queue_state_changed = Some(Arc::new(f));
        self
    }

    pub fn with_context_boundary_changed(
        mut self,
        f: impl Fn(&str, Option<DateTime<Utc>>) + Send + Sync + 'static,
    ) -> Self {
        self.on_context_boundary_changed = Some(Arc::new(f));
        self
    }

    pub fn with_quote_added(mut self, f: impl Fn(&Quote) + Send + Sync + 'static) -> Self {
        self.on_quote_added = Some(Arc::new(f));
        self
    }

    pub fn with_quote_updated(mut self, f: impl Fn(&Quote) + Send + Sync + 'static) -> Self {
        self.on_quote_updated = Some(Arc::new(f));
        self
    }

    pub fn with_quote_removed(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_quote_removed = Some(Arc::new(f));
        self
    }

    pub fn with_state_conflict(mut self, f: impl Fn(StateConflict) + Send + Sync + 'static) -> Self {
        self.on_state_conflict = Some(Arc::new(f));
        self
    }

    pub fn with_state_replaced(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_state_replaced = Some(Arc::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(ErrorCode, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    // ---- emit helpers ------------------------------------------------------

    pub(crate) fn persona_added(&self, persona: &PersonaEntity) {
        log::debug!("event: persona added {}", persona.id);
        if let Some(f) = &self.on_persona_added {
            f(persona);
        }
    }

    pub(crate) fn persona_removed(&self, id: &str) {
        log::debug!("event: persona removed {}", id);
        if let Some(f) = &self.on_persona_removed {
            f(id);
        }
    }

    pub(crate) fn persona_updated(&self, persona: &PersonaEntity) {
        log::debug!("event: persona updated {}", persona.id);
        if let Some(f) = &self.on_persona_updated {
            f(persona);
        }
    }

    pub(crate) fn message_added(&self, persona_id: &str, message: &Message) {
        log::debug!("event: message {} added for {}", message.id, persona_id);
        if let Some(f) = &self.on_message_added {
            f(persona_id, message);
        }
    }

    pub(crate) fn queue_state_changed(&self, state: QueueState) {
        log::debug!("event: queue state {:?}", state);
        if let Some(f) = &self.on_queue_state_changed {
            f(state);
        }
    }

    pub(crate) fn context_boundary_changed(&self, persona_id: &str, boundary: Option<DateTime<Utc>>) {
        log::debug!("event: context boundary for {} set to {:?}", persona_id, boundary);
        if let Some(f) = &self.on_context_boundary_changed {
            f(persona_id, boundary);
        }
    }

    pub(crate) fn quote_added(&self, quote: &Quote) {
        if let Some(f) = &self.on_quote_added {
            f(quote);
        }
    }

    pub(crate) fn quote_updated(&self, quote: &Quote) {
        if let Some(f) = &self.on_quote_updated {
            f(quote);
        }
    }

    pub(crate) fn quote_removed(&self, id: &str) {
        if let Some(f) = &self.on_quote_removed {
            f(id);
        }
    }

    pub(crate) fn state_conflict(&self, conflict: StateConflict) {
        log::warn!(
            "event: state conflict (local {}, remote {})",
            conflict.local_updated,
            conflict.remote_updated
        );
        if let Some(f) = &self.on_state_conflict {
            f(conflict);
        }
    }

    /// Report a wholesale store swap as per-persona events followed by a refresh.
    pub(crate) fn state_replaced(&self, before: &[PersonaEntity], after: &[PersonaEntity]) {
        for old in before {
            if !after.iter().any(|p| p.id == old.id) {
                self.persona_removed(&old.id);
            }
        }
        for new in after {
            match before.iter().find(|p| p.id == new.id) {
                None => self.persona_added(new),
                Some(old) if old != new => self.persona_updated(new),
                Some(_) => {}
            }
        }
        log::debug!("event: state replaced ({} personas)", after.len());
        if let Some(f) = &self.on_state_replaced {
            f();
        }
    }

    pub(crate) fn error(&self, code: ErrorCode, message: &str) {
        log::error!("{}: {}", code, message);
        if let Some(f) = &self.on_error {
            f(code, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_unset_handlers_are_skipped() {
        let handlers = EventHandlers::new();
        handlers.queue_state_changed(QueueState::Busy);
        handlers.error(ErrorCode::StorageIo, "disk full");
    }

    #[test]
    fn test_handlers_receive_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = seen.clone();
        let states = seen.clone();

        let handlers = EventHandlers::new()
            .with_error(move |code, msg| errors.lock().unwrap().push(format!("{}:{}", code, msg)))
            .with_queue_state_changed(move |s| states.lock().unwrap().push(format!("{:?}", s)));

        handlers.error(ErrorCode::ValidationError, "bad payload");
        handlers.queue_state_changed(QueueState::Paused);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["VALIDATION_ERROR:bad payload".to_string(), "Paused".to_string()]
        );
    }

    #[test]
    fn test_state_replaced_diffs_personas() {
        use crate::store::{EntityStore, NewPersona, PersonaUpdate};

        let mut store = EntityStore::new();
        let kept = store.persona_add(NewPersona::named("Sage")).unwrap();
        let changed = store.persona_add(NewPersona::named("Iris")).unwrap();
        let gone = store.persona_add(NewPersona::named("Bram")).unwrap();
        let before = store.personas().to_vec();

        store
            .persona_update(
                &changed.id,
                PersonaUpdate {
                    short_description: Some("gardener".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        store.persona_delete(&gone.id);
        let fresh = store.persona_add(NewPersona::named("Wren")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (added, removed, updated, refreshed) = (seen.clone(), seen.clone(), seen.clone(), seen.clone());
        let handlers = EventHandlers::new()
            .with_persona_added(move |p| added.lock().unwrap().push(format!("added {}", p.id)))
            .with_persona_removed(move |id| removed.lock().unwrap().push(format!("removed {}", id)))
            .with_persona_updated(move |p| updated.lock().unwrap().push(format!("updated {}", p.id)))
            .with_state_replaced(move || refreshed.lock().unwrap().push("refresh".to_string()));

        handlers.state_replaced(&before, store.personas());

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&format!("removed {}", gone.id)));
        assert!(seen.contains(&format!("updated {}", changed.id)));
        assert!(seen.contains(&format!("added {}", fresh.id)));
        assert!(!seen.iter().any(|e| e.ends_with(&kept.id)));
        assert_eq!(seen.last().map(String::as_str), Some("refresh"));
    }

    #[test]
    fn test_queue_state_precedence() {
        assert_eq!(QueueState::from_parts(QueueMode::Paused, true), QueueState::Paused);
        assert_eq!(QueueState::from_parts(QueueMode::Running, true), QueueState::Busy);
        assert_eq!(QueueState::from_parts(QueueMode::Running, false), QueueState::Idle);
    }
}

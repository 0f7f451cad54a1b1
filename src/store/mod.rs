//! Authoritative in-memory entity store.
//!
//! The store holds the human, personas, message logs, extraction counters,
//! pending validations, quotes and scheduler timestamps. All mutations are
//! synchronous and only touch the store itself; persistence is handled by the
//! checkpoint and sync layers, which read [`EntityStore::snapshot`] on demand.

pub mod context;
pub mod types;

use chrono::{DateTime, Utc};

pub use types::{
    Concept, ContextStatus, DataItem, DataType, EntityRef, ExtractionState, Fact, HumanEntity, Message, MessageRole,
    NewPersona, NewQuote, PendingValidation, Person, PersonaEntity, PersonaKind, PersonaUpdate, Quote,
    SchedulerState, StateSnapshot, Topic, Trait,
};

use crate::error::{Error, Result};
use types::new_id;

/// Replace an item with the same id or append it. Returns true when inserted.
pub(crate) fn upsert_item<T: DataItem>(items: &mut Vec<T>, item: T) -> bool {
    match items.iter_mut().find(|i| i.id() == item.id()) {
        Some(existing) => {
            *existing = item;
            false
        }
        None => {
            items.push(item);
            true
        }
    }
}

/// Remove the item with `id`. Returns true when something was removed.
pub(crate) fn remove_item<T: DataItem>(items: &mut Vec<T>, id: &str) -> bool {
    let before = items.len();
    items.retain(|i| i.id() != id);
    items.len() != before
}

/// Trim, drop empties and drop case-insensitive duplicates.
fn normalize_aliases(aliases: Vec<String>) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for alias in aliases {
        let alias = alias.trim().to_string();
        if alias.is_empty() || out.iter().any(|a| a.eq_ignore_ascii_case(&alias)) {
            continue;
        }
        out.push(alias);
    }
    if out.is_empty() {
        return Err(Error::Validation("persona needs at least one alias".to_string()));
    }
    Ok(out)
}

/// Single-writer entity store.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    state: StateSnapshot,
}

impl EntityStore {
    /// Create an empty default state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a snapshot. Queue items carried by the snapshot are ignored.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        let mut store = Self { state: snapshot };
        store.state.queue.clear();
        store
    }

    /// Point-in-time copy of the whole store.
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.clone()
    }

    /// Replace the entire store with `snapshot`, keeping its `last_updated`.
    pub fn replace(&mut self, snapshot: StateSnapshot) {
        self.state = snapshot;
        self.state.queue.clear();
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.state.last_updated
    }

    fn touch(&mut self) {
        self.state.last_updated = Utc::now();
    }

    // ---- human -------------------------------------------------------------

    pub fn human(&self) -> &HumanEntity {
        &self.state.human
    }

    pub fn human_fact_upsert(&mut self, fact: Fact) -> bool {
        let inserted = upsert_item(&mut self.state.human.facts, fact);
        self.touch();
        inserted
    }

    pub fn human_fact_remove(&mut self, id: &str) -> bool {
        let removed = remove_item(&mut self.state.human.facts, id);
        if removed {
            self.touch();
        }
        removed
    }

    pub fn human_trait_upsert(&mut self, item: Trait) -> bool {
        let inserted = upsert_item(&mut self.state.human.traits, item);
        self.touch();
        inserted
    }

    pub fn human_trait_remove(&mut self, id: &str) -> bool {
        let removed = remove_item(&mut self.state.human.traits, id);
        if removed {
            self.touch();
        }
        removed
    }

    pub fn human_topic_upsert(&mut self, topic: Topic) -> bool {
        let inserted = upsert_item(&mut self.state.human.topics, topic);
        self.touch();
        inserted
    }

    pub fn human_topic_remove(&mut self, id: &str) -> bool {
        let removed = remove_item(&mut self.state.human.topics, id);
        if removed {
            self.touch();
        }
        removed
    }

    pub fn human_person_upsert(&mut self, person: Person) -> bool {
        let inserted = upsert_item(&mut self.state.human.people, person);
        self.touch();
        inserted
    }

    pub fn human_person_remove(&mut self, id: &str) -> bool {
        let removed = remove_item(&mut self.state.human.people, id);
        if removed {
            self.touch();
        }
        removed
    }

    /// The human as seen by a persona: only data items whose groups it can see.
    ///
    /// Returns `None` if the persona does not exist.
    pub fn human_visible_to(&self, persona_id: &str) -> Option<HumanEntity> {
        let persona = self.persona_get(persona_id)?;
        let human = &self.state.human;
        Some(HumanEntity {
            facts: human.facts.iter().filter(|i| persona.can_see(&i.persona_groups)).cloned().collect(),
            traits: human.traits.iter().filter(|i| persona.can_see(&i.persona_groups)).cloned().collect(),
            topics: human.topics.iter().filter(|i| persona.can_see(&i.persona_groups)).cloned().collect(),
            people: human.people.iter().filter(|i| persona.can_see(&i.persona_groups)).cloned().collect(),
            settings: Default::default(),
        })
    }

    // ---- settings ----------------------------------------------------------

    pub fn setting_get(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.human.settings.get(key)
    }

    /// Set a setting, returning the previous value.
    pub fn setting_set(&mut self, key: impl Into<String>, value: serde_json::Value) -> Option<serde_json::Value> {
        let previous = self.state.human.settings.insert(key.into(), value);
        self.touch();
        previous
    }

    // ---- personas ----------------------------------------------------------

    pub fn personas(&self) -> &[PersonaEntity] {
        &self.state.personas
    }

    /// Look a persona up by id or by any of its aliases.
    pub fn persona_get(&self, id_or_alias: &str) -> Option<&PersonaEntity> {
        self.state
            .personas
            .iter()
            .find(|p| p.id == id_or_alias)
            .or_else(|| self.state.personas.iter().find(|p| p.has_alias(id_or_alias)))
    }

    fn persona_index(&self, id: &str) -> Result<usize> {
        self.state
            .personas
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::PersonaNotFound { id: id.to_string() })
    }

    fn check_aliases_free(&self, aliases: &[String], except_id: Option<&str>) -> Result<()> {
        for alias in aliases {
            let taken = self
                .state
                .personas
                .iter()
                .filter(|p| Some(p.id.as_str()) != except_id)
                .any(|p| p.has_alias(alias));
            if taken {
                return Err(Error::DuplicateAlias { alias: alias.clone() });
            }
        }
        Ok(())
    }

    pub fn persona_add(&mut self, new: NewPersona) -> Result<PersonaEntity> {
        self.persona_add_kind(new, PersonaKind::Companion)
    }

    fn persona_add_kind(&mut self, new: NewPersona, kind: PersonaKind) -> Result<PersonaEntity> {
        let aliases = normalize_aliases(new.aliases)?;
        self.check_aliases_free(&aliases, None)?;

        let now = Utc::now();
        let persona = PersonaEntity {
            id: new_id("persona"),
            kind,
            aliases,
            short_description: new.short_description,
            long_description: new.long_description,
            traits: new.traits,
            topics: new.topics,
            group_primary: new.group_primary,
            groups_visible: new.groups_visible,
            is_paused: false,
            pause_until: None,
            is_archived: false,
            archived_at: None,
            context_boundary: None,
            heartbeat_delay_ms: new.heartbeat_delay_ms,
            last_activity: None,
            last_heartbeat: None,
            created_at: now,
            last_updated: now,
        };

        log::info!("Adding persona {} ({})", persona.display_name(), persona.id);
        self.state.messages.entry(persona.id.clone()).or_default();
        self.state.personas.push(persona.clone());
        self.touch();
        Ok(persona)
    }

    /// Return the integration persona for `alias`, creating it if needed.
    ///
    /// The boolean is true when the persona was created.
    pub fn persona_ensure_integration(&mut self, alias: &str) -> Result<(PersonaEntity, bool)> {
        if let Some(existing) = self.persona_get(alias) {
            return Ok((existing.clone(), false));
        }
        let new = NewPersona {
            short_description: format!("Integration agent {}", alias),
            ..NewPersona::named(alias)
        };
        let persona = self.persona_add_kind(new, PersonaKind::Integration)?;
        Ok((persona, true))
    }

    pub fn persona_update(&mut self, id: &str, update: PersonaUpdate) -> Result<PersonaEntity> {
        let idx = self.persona_index(id)?;

        let aliases = match update.aliases {
            Some(aliases) => {
                let aliases = normalize_aliases(aliases)?;
                self.check_aliases_free(&aliases, Some(id))?;
                Some(aliases)
            }
            None => None,
        };

        let persona = &mut self.state.personas[idx];
        if let Some(aliases) = aliases {
            persona.aliases = aliases;
        }
        if let Some(v) = update.short_description {
            persona.short_description = v;
        }
        if let Some(v) = update.long_description {
            persona.long_description = v;
        }
        if let Some(v) = update.traits {
            persona.traits = v;
        }
        if let Some(v) = update.topics {
            persona.topics = v;
        }
        if let Some(v) = update.group_primary {
            persona.group_primary = v;
        }
        if let Some(v) = update.groups_visible {
            persona.groups_visible = v;
        }
        if let Some(v) = update.heartbeat_delay_ms {
            persona.heartbeat_delay_ms = v;
        }
        persona.last_updated = Utc::now();
        let updated = persona.clone();
        self.touch();
        Ok(updated)
    }

    /// Run `f` against a persona and mark the store updated.
    pub(crate) fn with_persona_mut<R>(&mut self, id: &str, f: impl FnOnce(&mut PersonaEntity) -> R) -> Result<R> {
        let idx = self.persona_index(id)?;
        let persona = &mut self.state.personas[idx];
        let result = f(persona);
        persona.last_updated = Utc::now();
        self.touch();
        Ok(result)
    }

    pub fn persona_archive(&mut self, id: &str) -> Result<PersonaEntity> {
        self.with_persona_mut(id, |p| {
            p.is_archived = true;
            p.archived_at = Some(Utc::now());
            p.clone()
        })
    }

    pub fn persona_unarchive(&mut self, id: &str) -> Result<PersonaEntity> {
        self.with_persona_mut(id, |p| {
            p.is_archived = false;
            p.archived_at = None;
            p.clone()
        })
    }

    /// Hard-delete a persona with its messages, quotes and counters.
    ///
    /// Deleting a missing persona is a no-op that returns false.
    pub fn persona_delete(&mut self, id: &str) -> bool {
        let before = self.state.personas.len();
        self.state.personas.retain(|p| p.id != id);
        if self.state.personas.len() == before {
            return false;
        }

        self.state.messages.remove(id);
        self.state.quotes.retain(|q| q.persona_id != id);
        let entity = EntityRef::Persona(id.to_string());
        self.state.extraction.retain(|s| s.entity != entity);
        log::info!("Deleted persona {}", id);
        self.touch();
        true
    }

    /// Pause a persona, optionally until a given instant.
    pub fn persona_pause(&mut self, id: &str, until: Option<DateTime<Utc>>) -> Result<PersonaEntity> {
        self.with_persona_mut(id, |p| {
            p.is_paused = true;
            p.pause_until = until;
            p.clone()
        })
    }

    pub fn persona_resume(&mut self, id: &str) -> Result<PersonaEntity> {
        self.with_persona_mut(id, |p| {
            p.is_paused = false;
            p.pause_until = None;
            p.clone()
        })
    }

    pub fn persona_set_context_boundary(
        &mut self,
        id: &str,
        boundary: Option<DateTime<Utc>>,
    ) -> Result<PersonaEntity> {
        self.with_persona_mut(id, |p| {
            p.context_boundary = boundary;
            p.clone()
        })
    }

    pub fn persona_topic_upsert(&mut self, persona_id: &str, topic: Topic) -> Result<bool> {
        self.with_persona_mut(persona_id, |p| upsert_item(&mut p.topics, topic))
    }

    pub fn persona_trait_upsert(&mut self, persona_id: &str, item: Trait) -> Result<bool> {
        self.with_persona_mut(persona_id, |p| upsert_item(&mut p.traits, item))
    }

    // ---- messages ----------------------------------------------------------

    /// A persona's message log, oldest first. Empty for unknown personas.
    pub fn messages(&self, persona_id: &str) -> &[Message] {
        self.state.messages.get(persona_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Append a message to a persona's log.
    pub fn message_append(&mut self, persona_id: &str, message: Message) -> Result<Message> {
        let idx = self.persona_index(persona_id)?;

        let persona = &mut self.state.personas[idx];
        persona.last_activity = Some(match persona.last_activity {
            Some(last) if last > message.timestamp => last,
            _ => message.timestamp,
        });

        self.state
            .messages
            .entry(persona_id.to_string())
            .or_default()
            .push(message.clone());
        self.touch();
        Ok(message)
    }

    pub fn message_set_context_status(
        &mut self,
        persona_id: &str,
        message_id: &str,
        status: ContextStatus,
    ) -> Result<Message> {
        let message = self
            .state
            .messages
            .get_mut(persona_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| Error::MessageNotFound {
                id: message_id.to_string(),
            })?;
        message.context_status = status;
        let updated = message.clone();
        self.touch();
        Ok(updated)
    }

    /// Mark every message of a persona read. Returns how many changed.
    pub fn messages_mark_read(&mut self, persona_id: &str) -> usize {
        let mut changed = 0;
        if let Some(log) = self.state.messages.get_mut(persona_id) {
            for message in log.iter_mut().filter(|m| !m.read) {
                message.read = true;
                changed += 1;
            }
        }
        if changed > 0 {
            self.touch();
        }
        changed
    }

    pub fn unread_count(&self, persona_id: &str) -> usize {
        self.messages(persona_id).iter().filter(|m| !m.read).count()
    }

    /// Find a message anywhere, returning the owning persona id with it.
    pub fn message_find(&self, message_id: &str) -> Option<(&str, &Message)> {
        self.state.messages.iter().find_map(|(persona_id, log)| {
            log.iter()
                .find(|m| m.id == message_id)
                .map(|m| (persona_id.as_str(), m))
        })
    }

    /// Messages in the persona's active context at `now`.
    pub fn context_messages(&self, persona_id: &str, now: DateTime<Utc>, window: std::time::Duration) -> Vec<Message> {
        let boundary = self.persona_get(persona_id).and_then(|p| p.context_boundary);
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        context::select_context(self.messages(persona_id), now, window, boundary)
            .into_iter()
            .cloned()
            .collect()
    }

    // ---- extraction counters -------------------------------------------------

    pub fn extraction_states(&self) -> &[ExtractionState] {
        &self.state.extraction
    }

    pub fn extraction_state(&self, entity: &EntityRef, data_type: DataType) -> Option<&ExtractionState> {
        self.state
            .extraction
            .iter()
            .find(|s| s.entity == *entity && s.data_type == data_type)
    }

    /// Counter record for (entity, data type), created on first use.
    pub(crate) fn extraction_state_mut(&mut self, entity: &EntityRef, data_type: DataType) -> &mut ExtractionState {
        self.state.last_updated = Utc::now();
        let pos = self
            .state
            .extraction
            .iter()
            .position(|s| s.entity == *entity && s.data_type == data_type);
        match pos {
            Some(pos) => &mut self.state.extraction[pos],
            None => {
                self.state
                    .extraction
                    .push(ExtractionState::new(entity.clone(), data_type));
                let last = self.state.extraction.len() - 1;
                &mut self.state.extraction[last]
            }
        }
    }

    // ---- validations -------------------------------------------------------

    pub fn validations(&self) -> &[PendingValidation] {
        &self.state.validations
    }

    pub fn validation_get(&self, id: &str) -> Option<&PendingValidation> {
        self.state.validations.iter().find(|v| v.id == id)
    }

    pub fn validation_add(&mut self, validation: PendingValidation) {
        self.state.validations.push(validation);
        self.touch();
    }

    pub fn validation_set_confidence(&mut self, id: &str, confidence: f64) -> bool {
        let Some(validation) = self.state.validations.iter_mut().find(|v| v.id == id) else {
            return false;
        };
        validation.confidence = confidence;
        self.touch();
        true
    }

    pub fn validation_remove(&mut self, id: &str) -> Option<PendingValidation> {
        let pos = self.state.validations.iter().position(|v| v.id == id)?;
        let removed = self.state.validations.remove(pos);
        self.touch();
        Some(removed)
    }

    /// Accept the validated item at full confidence.
    pub fn validation_confirm(&mut self, id: &str) -> Result<()> {
        self.validation_accept(id, 1.0)
    }

    /// Accept the validated item, recording `confidence` on it.
    pub fn validation_accept(&mut self, id: &str, confidence: f64) -> Result<()> {
        let validation = self
            .validation_remove(id)
            .ok_or_else(|| Error::Validation(format!("no pending validation {}", id)))?;
        if validation.data_type == DataType::Fact
            && let Some(fact) = self
                .state
                .human
                .facts
                .iter_mut()
                .find(|f| f.id == validation.item_id)
        {
            fact.confidence = confidence;
            fact.last_updated = Utc::now();
        }
        Ok(())
    }

    /// Reject the validated item, removing it from the human.
    pub fn validation_reject(&mut self, id: &str) -> Result<()> {
        let validation = self
            .validation_remove(id)
            .ok_or_else(|| Error::Validation(format!("no pending validation {}", id)))?;
        let human = &mut self.state.human;
        match validation.data_type {
            DataType::Fact => remove_item(&mut human.facts, &validation.item_id),
            DataType::Trait => remove_item(&mut human.traits, &validation.item_id),
            DataType::Topic => remove_item(&mut human.topics, &validation.item_id),
            DataType::Person => remove_item(&mut human.people, &validation.item_id),
        };
        Ok(())
    }

    // ---- quotes ------------------------------------------------------------

    pub fn quotes(&self) -> &[Quote] {
        &self.state.quotes
    }

    fn quote_text(message: &Message, start: usize, end: usize) -> Result<String> {
        let len = message.content.chars().count();
        if start >= end || end > len {
            return Err(Error::InvalidQuote(format!(
                "range {}..{} outside message of {} characters",
                start, end, len
            )));
        }
        Ok(message.content.chars().skip(start).take(end - start).collect())
    }

    /// Capture an excerpt of a message.
    pub fn quote_add(&mut self, new: NewQuote) -> Result<Quote> {
        let (persona_id, message) = self
            .message_find(&new.message_id)
            .ok_or_else(|| Error::MessageNotFound {
                id: new.message_id.clone(),
            })?;
        let text = Self::quote_text(message, new.start, new.end)?;
        let speaker = match message.role {
            MessageRole::Human => "human".to_string(),
            MessageRole::System => self
                .persona_get(persona_id)
                .map(|p| p.display_name().to_string())
                .unwrap_or_else(|| persona_id.to_string()),
        };

        let quote = Quote {
            id: new_id("quote"),
            message_id: new.message_id,
            persona_id: persona_id.to_string(),
            start: new.start,
            end: new.end,
            text,
            speaker,
            data_item_ids: new.data_item_ids,
            created_at: Utc::now(),
        };
        self.state.quotes.push(quote.clone());
        self.touch();
        Ok(quote)
    }

    /// Change a quote's range and linked data items.
    pub fn quote_update(&mut self, id: &str, start: usize, end: usize, data_item_ids: Vec<String>) -> Result<Quote> {
        let pos = self
            .state
            .quotes
            .iter()
            .position(|q| q.id == id)
            .ok_or_else(|| Error::InvalidQuote(format!("no quote {}", id)))?;
        let message_id = self.state.quotes[pos].message_id.clone();
        let (_, message) = self
            .message_find(&message_id)
            .ok_or(Error::MessageNotFound { id: message_id.clone() })?;
        let text = Self::quote_text(message, start, end)?;

        let quote = &mut self.state.quotes[pos];
        quote.start = start;
        quote.end = end;
        quote.text = text;
        quote.data_item_ids = data_item_ids;
        let updated = quote.clone();
        self.touch();
        Ok(updated)
    }

    pub fn quote_remove(&mut self, id: &str) -> bool {
        let before = self.state.quotes.len();
        self.state.quotes.retain(|q| q.id != id);
        let removed = self.state.quotes.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    // ---- scheduler timestamps ------------------------------------------------

    pub fn scheduler_state(&self) -> &SchedulerState {
        &self.state.scheduler
    }

    pub(crate) fn scheduler_state_mut(&mut self) -> &mut SchedulerState {
        self.touch();
        &mut self.state.scheduler
    }
}

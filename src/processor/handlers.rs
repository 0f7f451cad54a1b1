//! Per-kind handling of queue items.
//!
//! Each item goes through two phases. `prepare` reads the store and builds the
//! prompt (or decides to skip the call). `apply` writes the model's output back.
//! The model call happens in between with no store lock held.

use chrono::{DateTime, Utc};

use super::ProcessOutcome;
use super::prompt::{self, Prompt};
use super::response::{self, ExtractedItem, ValidationVerdict};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::{LlmQueueItem, Priority, QueuePayload, ResponseTrigger};
use crate::scheduler::{self, ceremony};
use crate::store::{
    DataType, EntityRef, EntityStore, Fact, Message, PendingValidation, Person, PersonaEntity, Topic, Trait,
};

/// What `prepare` decided.
#[derive(Debug)]
pub(crate) enum Prepared {
    /// Nothing to ask the model.
    Skip,
    Call(Prompt),
}

/// Model output handed to `apply`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Output<'a> {
    pub text: &'a str,
    pub truncated: bool,
}

/// What `apply` changed.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub outcome: ProcessOutcome,
    /// Items to enqueue once the current one completes.
    pub follow_ups: Vec<LlmQueueItem>,
    /// Appended messages, keyed by persona id, for event delivery.
    pub messages: Vec<(String, Message)>,
}

impl Applied {
    fn skipped() -> Self {
        Self {
            outcome: ProcessOutcome::Skipped,
            ..Default::default()
        }
    }
}

pub(crate) fn prepare(
    store: &EntityStore,
    item: &LlmQueueItem,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<Prepared> {
    match &item.payload {
        QueuePayload::Response { persona_id, trigger } => prepare_response(store, persona_id, trigger, config, now),
        QueuePayload::Extraction {
            target,
            data_types,
            persona_id,
            ..
        } => {
            let persona = store.persona_get(persona_id).ok_or_else(|| Error::PersonaNotFound {
                id: persona_id.clone(),
            })?;
            let history = store.context_messages(&persona.id, now, config.context.window);
            if history.is_empty() {
                return Ok(Prepared::Skip);
            }
            Ok(Prepared::Call(Prompt {
                system: prompt::extraction_system(target, data_types),
                user: prompt::extraction_user(),
                history,
            }))
        }
        QueuePayload::Validation { validation_id } => match store.validation_get(validation_id) {
            Some(validation) => Ok(Prepared::Call(Prompt {
                system: prompt::validation_system(),
                user: prompt::validation_user(validation),
                history: Vec::new(),
            })),
            None => Ok(Prepared::Skip),
        },
        QueuePayload::Ceremony => {
            let Some(persona) = ceremony_persona(store, config) else {
                return Ok(Prepared::Skip);
            };
            let items = ceremony::digest(store.validations(), config.ceremony.max_items);
            if items.is_empty() {
                return Ok(Prepared::Skip);
            }
            Ok(Prepared::Call(Prompt {
                system: prompt::ceremony_system(persona),
                user: ceremony::render_digest(&items),
                history: Vec::new(),
            }))
        }
    }
}

fn prepare_response(
    store: &EntityStore,
    persona_id: &str,
    trigger: &ResponseTrigger,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<Prepared> {
    let persona = store.persona_get(persona_id).ok_or_else(|| Error::PersonaNotFound {
        id: persona_id.to_string(),
    })?;
    if persona.is_archived {
        return Err(Error::PersonaArchived { id: persona.id.clone() });
    }
    if persona.is_paused_at(now) {
        log::debug!("Persona {} is paused, skipping response", persona.id);
        return Ok(Prepared::Skip);
    }

    let human = store.human_visible_to(&persona.id).unwrap_or_default();
    let context = store.context_messages(&persona.id, now, config.context.window);

    let (user, history) = match trigger {
        ResponseTrigger::HumanMessage { message_id } => {
            let message = store
                .messages(&persona.id)
                .iter()
                .find(|m| m.id == *message_id)
                .ok_or_else(|| Error::MessageNotFound { id: message_id.clone() })?;
            let history = context
                .into_iter()
                .filter(|m| m.id != message.id && m.timestamp <= message.timestamp)
                .collect();
            (message.content.clone(), history)
        }
        ResponseTrigger::Heartbeat { topic } => (prompt::heartbeat_user(topic), context),
    };

    Ok(Prepared::Call(Prompt {
        system: prompt::persona_system(persona, &human),
        user,
        history,
    }))
}

/// Write model output (or the skip decision when `output` is `None`) back to the store.
pub(crate) fn apply(
    store: &mut EntityStore,
    item: &LlmQueueItem,
    output: Option<Output<'_>>,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<Applied> {
    match &item.payload {
        QueuePayload::Response { persona_id, trigger } => {
            let Some(output) = output else {
                return Ok(Applied::skipped());
            };
            apply_response(store, persona_id, trigger, output, config)
        }
        QueuePayload::Extraction {
            target,
            data_types,
            persona_id,
            fast_scan,
        } => {
            let Some(output) = output else {
                return Ok(Applied::skipped());
            };
            let extracted = response::parse_extraction(output.text)?;
            let follow_ups = apply_extraction(store, target, data_types, persona_id, extracted, config, now)?;
            if !fast_scan {
                scheduler::record_extraction(store, target, data_types, now);
            }
            Ok(Applied {
                outcome: ProcessOutcome::Completed,
                follow_ups,
                messages: Vec::new(),
            })
        }
        QueuePayload::Validation { validation_id } => {
            let Some(output) = output else {
                return Ok(Applied::skipped());
            };
            let verdict: ValidationVerdict = response::parse_json(output.text)?;
            if store.validation_get(validation_id).is_none() {
                return Ok(Applied::skipped());
            }
            if !verdict.valid {
                store.validation_reject(validation_id)?;
            } else if verdict.confidence >= config.extraction.low_confidence {
                store.validation_accept(validation_id, verdict.confidence)?;
            } else {
                store.validation_set_confidence(validation_id, verdict.confidence);
            }
            Ok(Applied {
                outcome: ProcessOutcome::Completed,
                ..Default::default()
            })
        }
        QueuePayload::Ceremony => apply_ceremony(store, output, config, now),
    }
}

fn apply_response(
    store: &mut EntityStore,
    persona_id: &str,
    trigger: &ResponseTrigger,
    output: Output<'_>,
    config: &Config,
) -> Result<Applied> {
    let input = match trigger {
        ResponseTrigger::HumanMessage { message_id } => store
            .messages(persona_id)
            .iter()
            .find(|m| m.id == *message_id)
            .map(|m| m.content.clone())
            .unwrap_or_default(),
        ResponseTrigger::Heartbeat { .. } => String::new(),
    };

    let text = response::strip_echo(output.text, &input);
    if text.is_empty() {
        log::info!("Empty response for persona {}, nothing appended", persona_id);
        return Ok(Applied {
            outcome: ProcessOutcome::NoResponse,
            ..Default::default()
        });
    }

    let mut message = Message::system(text);
    message.partial = output.truncated;
    let message = store.message_append(persona_id, message)?;
    let follow_ups = scheduler::trigger_extraction(store, persona_id, &config.extraction);

    Ok(Applied {
        outcome: if output.truncated {
            ProcessOutcome::Truncated
        } else {
            ProcessOutcome::Completed
        },
        follow_ups,
        messages: vec![(persona_id.to_string(), message)],
    })
}

fn apply_ceremony(
    store: &mut EntityStore,
    output: Option<Output<'_>>,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<Applied> {
    store.scheduler_state_mut().last_ceremony = Some(now);

    let Some(output) = output else {
        log::info!("Ceremony had nothing to present");
        return Ok(Applied::skipped());
    };
    let Some(persona_id) = ceremony_persona(store, config).map(|p| p.id.clone()) else {
        return Ok(Applied::skipped());
    };

    let text = match output.text.trim() {
        "" => {
            let items = ceremony::digest(store.validations(), config.ceremony.max_items);
            ceremony::render_digest(&items)
        }
        text => text.to_string(),
    };
    let mut message = Message::system(text);
    message.partial = output.truncated;
    let message = store.message_append(&persona_id, message)?;

    Ok(Applied {
        outcome: ProcessOutcome::Completed,
        follow_ups: Vec::new(),
        messages: vec![(persona_id, message)],
    })
}

/// Persona that delivers the ceremony: the configured alias, else the first active persona.
pub(crate) fn ceremony_persona<'a>(store: &'a EntityStore, config: &Config) -> Option<&'a PersonaEntity> {
    store
        .persona_get(&config.ceremony.persona)
        .filter(|p| !p.is_archived)
        .or_else(|| store.personas().iter().find(|p| !p.is_archived))
}

fn apply_extraction(
    store: &mut EntityStore,
    target: &EntityRef,
    data_types: &[DataType],
    persona_id: &str,
    extracted: Vec<ExtractedItem>,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<Vec<LlmQueueItem>> {
    let groups: Vec<String> = store
        .persona_get(persona_id)
        .and_then(|p| p.group_primary.clone())
        .into_iter()
        .collect();

    let mut follow_ups = Vec::new();
    let mut applied = 0;
    for item in extracted {
        if !data_types.contains(&item.data_type) || !item.data_type.applies_to(target) {
            log::debug!("Ignoring extracted {} '{}'", item.data_type.as_str(), item.name);
            continue;
        }
        applied += 1;
        match target {
            EntityRef::Human => {
                if let Some(validation) = upsert_human_item(store, &item, persona_id, &groups, config, now) {
                    follow_ups.push(validation);
                }
            }
            EntityRef::Persona(id) => upsert_persona_item(store, id, &item, now)?,
        }
    }
    log::info!("Applied {} extracted item(s) for {:?}", applied, target);
    Ok(follow_ups)
}

fn find_by_name<'a, T>(items: &'a [T], name: &str, get: impl Fn(&T) -> &str) -> Option<&'a T> {
    items.iter().find(|i| get(i).eq_ignore_ascii_case(name.trim()))
}

/// Provenance for an item first learned in this conversation.
fn tag_new(
    is_new: bool,
    learned_by: &mut Option<String>,
    persona_groups: &mut Vec<String>,
    persona_id: &str,
    groups: &[String],
) {
    if is_new {
        *learned_by = Some(persona_id.to_string());
        *persona_groups = groups.to_vec();
    }
}

/// Upsert into the human. Returns a validation item when a fact needs review.
fn upsert_human_item(
    store: &mut EntityStore,
    item: &ExtractedItem,
    persona_id: &str,
    groups: &[String],
    config: &Config,
    now: DateTime<Utc>,
) -> Option<LlmQueueItem> {
    let name = item.name.trim();
    match item.data_type {
        DataType::Fact => {
            let existing = find_by_name(&store.human().facts, name, |f| f.name.as_str()).cloned();
            let is_new = existing.is_none();
            let mut fact = existing.unwrap_or_else(|| Fact::new(name, ""));
            if !item.description.is_empty() {
                fact.description = item.description.clone();
            }
            fact.sentiment = item.sentiment;
            fact.confidence = item.confidence.unwrap_or(fact.confidence).clamp(0.0, 1.0);
            tag_new(is_new, &mut fact.learned_by, &mut fact.persona_groups, persona_id, groups);
            fact.last_updated = now;

            let needs_review = fact.confidence < config.extraction.low_confidence
                && !store.validations().iter().any(|v| v.item_id == fact.id);
            let validation = needs_review.then(|| PendingValidation::for_fact(&fact));
            store.human_fact_upsert(fact);

            validation.map(|v| {
                let validation_id = v.id.clone();
                store.validation_add(v);
                LlmQueueItem::new(Priority::Low, QueuePayload::Validation { validation_id })
            })
        }
        DataType::Trait => {
            let existing = find_by_name(&store.human().traits, name, |t| t.name.as_str()).cloned();
            let is_new = existing.is_none();
            let mut t = existing.unwrap_or_else(|| Trait::new(name, ""));
            if !item.description.is_empty() {
                t.description = item.description.clone();
            }
            t.sentiment = item.sentiment;
            t.strength = item.strength.unwrap_or(t.strength);
            tag_new(is_new, &mut t.learned_by, &mut t.persona_groups, persona_id, groups);
            t.last_updated = now;
            store.human_trait_upsert(t);
            None
        }
        DataType::Topic => {
            let existing = find_by_name(&store.human().topics, name, |t| t.name.as_str()).cloned();
            let is_new = existing.is_none();
            let mut topic = existing.unwrap_or_else(|| Topic::new(name, ""));
            apply_topic_fields(&mut topic, item, now);
            tag_new(is_new, &mut topic.learned_by, &mut topic.persona_groups, persona_id, groups);
            store.human_topic_upsert(topic);
            None
        }
        DataType::Person => {
            let existing = find_by_name(&store.human().people, name, |p| p.name.as_str()).cloned();
            let is_new = existing.is_none();
            let mut person = existing.unwrap_or_else(|| Person::new(name, ""));
            if let Some(relationship) = &item.relationship {
                person.relationship = relationship.clone();
            }
            if !item.description.is_empty() {
                person.description = item.description.clone();
            }
            person.sentiment = item.sentiment;
            person.level_current = item.level_current.unwrap_or(person.level_current);
            person.level_ideal = item.level_ideal.unwrap_or(person.level_ideal);
            tag_new(is_new, &mut person.learned_by, &mut person.persona_groups, persona_id, groups);
            person.last_updated = now;
            store.human_person_upsert(person);
            None
        }
    }
}

fn apply_topic_fields(topic: &mut Topic, item: &ExtractedItem, now: DateTime<Utc>) {
    if !item.description.is_empty() {
        topic.description = item.description.clone();
    }
    topic.sentiment = item.sentiment;
    topic.level_current = item.level_current.unwrap_or(topic.level_current);
    topic.level_ideal = item.level_ideal.unwrap_or(topic.level_ideal);
    topic.last_updated = now;
}

fn upsert_persona_item(
    store: &mut EntityStore,
    persona_id: &str,
    item: &ExtractedItem,
    now: DateTime<Utc>,
) -> Result<()> {
    let persona = store.persona_get(persona_id).ok_or_else(|| Error::PersonaNotFound {
        id: persona_id.to_string(),
    })?;
    let name = item.name.trim();
    match item.data_type {
        DataType::Topic => {
            let mut topic = find_by_name(&persona.topics, name, |t| t.name.as_str())
                .cloned()
                .unwrap_or_else(|| Topic::new(name, ""));
            apply_topic_fields(&mut topic, item, now);
            store.persona_topic_upsert(persona_id, topic)?;
        }
        DataType::Trait => {
            let mut t = find_by_name(&persona.traits, name, |t| t.name.as_str())
                .cloned()
                .unwrap_or_else(|| Trait::new(name, ""));
            if !item.description.is_empty() {
                t.description = item.description.clone();
            }
            t.sentiment = item.sentiment;
            t.strength = item.strength.unwrap_or(t.strength);
            t.last_updated = now;
            store.persona_trait_upsert(persona_id, t)?;
        }
        DataType::Fact | DataType::Person => {}
    }
    Ok(())
}

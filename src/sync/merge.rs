//! Experimental union merge of two diverged states.
//!
//! Records are matched by id. When both sides hold the same record the one with
//! the newer `last_updated` wins and ties go to the local copy. Message logs are
//! unioned and re-sorted by timestamp. A persona record taken from the remote
//! side loses any alias that already belongs to another persona.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;

use crate::store::{DataItem, HumanEntity, Message, PersonaEntity, StateSnapshot};

fn merge_items<T: DataItem + Clone>(local: &[T], remote: &[T]) -> Vec<T> {
    let mut merged: Vec<T> = local.to_vec();
    for theirs in remote {
        match merged.iter_mut().find(|ours| ours.id() == theirs.id()) {
            Some(ours) => {
                if theirs.last_updated() > ours.last_updated() {
                    *ours = theirs.clone();
                }
            }
            None => merged.push(theirs.clone()),
        }
    }
    merged
}

fn merge_human(local: &HumanEntity, remote: &HumanEntity) -> HumanEntity {
    let mut settings = remote.settings.clone();
    settings.extend(local.settings.clone());
    HumanEntity {
        facts: merge_items(&local.facts, &remote.facts),
        traits: merge_items(&local.traits, &remote.traits),
        topics: merge_items(&local.topics, &remote.topics),
        people: merge_items(&local.people, &remote.people),
        settings,
    }
}

fn merge_personas(local: &[PersonaEntity], remote: &[PersonaEntity]) -> Vec<PersonaEntity> {
    let mut merged: Vec<PersonaEntity> = local.to_vec();
    let mut from_remote = vec![false; merged.len()];

    for theirs in remote {
        match merged.iter().position(|ours| ours.id == theirs.id) {
            Some(idx) => {
                if theirs.last_updated > merged[idx].last_updated {
                    merged[idx] = theirs.clone();
                    from_remote[idx] = true;
                }
            }
            None => {
                merged.push(theirs.clone());
                from_remote.push(true);
            }
        }
    }

    // Remote records yield aliases to local records and to remote records already checked
    for idx in 0..merged.len() {
        if !from_remote[idx] {
            continue;
        }
        let taken: Vec<String> = merged
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != idx && (!from_remote[*other] || *other < idx))
            .flat_map(|(_, p)| p.aliases.iter().cloned())
            .collect();

        let persona = &mut merged[idx];
        let before = persona.aliases.len();
        persona
            .aliases
            .retain(|alias| !taken.iter().any(|t| t.eq_ignore_ascii_case(alias)));
        if persona.aliases.len() != before {
            log::warn!(
                "Dropped {} colliding alias(es) from merged persona {}",
                before - persona.aliases.len(),
                persona.id
            );
        }
        if persona.aliases.is_empty() {
            persona.aliases.push(persona.id.clone());
        }
    }
    merged
}

fn merge_log(local: &[Message], remote: &[Message]) -> Vec<Message> {
    let mut merged: Vec<Message> = local.to_vec();
    for theirs in remote {
        match merged.iter_mut().find(|ours| ours.id == theirs.id) {
            Some(ours) => ours.read |= theirs.read,
            None => merged.push(theirs.clone()),
        }
    }
    // Stable sort keeps local order for equal timestamps
    merged.sort_by_key(|m| m.timestamp);
    merged
}

/// Union of two states. The result is stamped with the current time.
pub fn merge_states(local: &StateSnapshot, remote: &StateSnapshot) -> StateSnapshot {
    let personas = merge_personas(&local.personas, &remote.personas);
    let known: HashSet<&str> = personas.iter().map(|p| p.id.as_str()).collect();

    let mut messages: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for persona_id in local.messages.keys().chain(remote.messages.keys()) {
        if !known.contains(persona_id.as_str()) || messages.contains_key(persona_id) {
            continue;
        }
        let ours = local.messages.get(persona_id).map(Vec::as_slice).unwrap_or(&[]);
        let theirs = remote.messages.get(persona_id).map(Vec::as_slice).unwrap_or(&[]);
        messages.insert(persona_id.clone(), merge_log(ours, theirs));
    }

    let mut extraction = local.extraction.clone();
    for theirs in &remote.extraction {
        match extraction
            .iter_mut()
            .find(|ours| ours.entity == theirs.entity && ours.data_type == theirs.data_type)
        {
            Some(ours) => {
                if theirs.total_extractions > ours.total_extractions {
                    *ours = theirs.clone();
                }
            }
            None => extraction.push(theirs.clone()),
        }
    }

    let mut validations = local.validations.clone();
    for theirs in &remote.validations {
        if !validations.iter().any(|v| v.id == theirs.id) {
            validations.push(theirs.clone());
        }
    }

    let mut quotes = local.quotes.clone();
    for theirs in &remote.quotes {
        if !quotes.iter().any(|q| q.id == theirs.id) {
            quotes.push(theirs.clone());
        }
    }

    let mut scheduler = local.scheduler.clone();
    scheduler.last_ceremony = scheduler.last_ceremony.max(remote.scheduler.last_ceremony);
    scheduler.last_decay = scheduler.last_decay.max(remote.scheduler.last_decay);

    StateSnapshot {
        version: local.version.max(remote.version),
        human: merge_human(&local.human, &remote.human),
        personas,
        messages,
        extraction,
        validations,
        quotes,
        scheduler,
        queue: Vec::new(),
        last_updated: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityStore, Fact, NewPersona};
    use chrono::Duration;

    #[test]
    fn test_newer_record_wins_ties_go_local() {
        let now = Utc::now();
        let mut ours = Fact::new("City", "Oslo");
        ours.last_updated = now;
        let mut theirs = ours.clone();
        theirs.description = "Bergen".into();
        theirs.last_updated = now + Duration::seconds(1);

        let merged = merge_items(&[ours.clone()], &[theirs.clone()]);
        assert_eq!(merged[0].description, "Bergen");

        theirs.last_updated = now;
        let merged = merge_items(&[ours], &[theirs]);
        assert_eq!(merged[0].description, "Oslo");
    }

    #[test]
    fn test_union_of_both_sides() {
        let mut local = EntityStore::new();
        let shared = local.persona_add(NewPersona::named("Sage")).unwrap();
        local.message_append(&shared.id, Message::human("from laptop")).unwrap();
        local.human_fact_upsert(Fact::new("Laptop fact", ""));

        let mut remote = EntityStore::from_snapshot(local.snapshot());
        remote
            .message_append(&shared.id, Message::human("from phone").at(Utc::now() - Duration::minutes(1)))
            .unwrap();
        remote.human_fact_upsert(Fact::new("Phone fact", ""));
        remote.persona_add(NewPersona::named("Echo")).unwrap();

        let merged = merge_states(&local.snapshot(), &remote.snapshot());
        assert_eq!(merged.human.facts.len(), 2);
        assert_eq!(merged.personas.len(), 2);

        let log: Vec<_> = merged.messages[&shared.id].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(log, vec!["from phone", "from laptop"]);
    }

    #[test]
    fn test_colliding_alias_dropped_from_remote_persona() {
        let mut local = EntityStore::new();
        local.persona_add(NewPersona::named("Sage")).unwrap();

        let mut remote = EntityStore::new();
        let other = remote
            .persona_add(NewPersona {
                aliases: vec!["sage".into(), "Oracle".into()],
                ..Default::default()
            })
            .unwrap();

        let merged = merge_states(&local.snapshot(), &remote.snapshot());
        let merged_other = merged.personas.iter().find(|p| p.id == other.id).unwrap();
        assert_eq!(merged_other.aliases, vec!["Oracle"]);
    }

    #[test]
    fn test_renamed_remote_persona_yields_alias_to_local_persona() {
        let mut local = EntityStore::new();
        let sage = local.persona_add(NewPersona::named("Sage")).unwrap();
        let mut remote = local.snapshot();
        let echo = local.persona_add(NewPersona::named("Echo")).unwrap();

        let renamed = remote.personas.iter_mut().find(|p| p.id == sage.id).unwrap();
        renamed.aliases = vec!["Echo".into()];
        renamed.last_updated = Utc::now() + Duration::seconds(5);

        let merged = merge_states(&local.snapshot(), &remote);
        let owners: Vec<&str> = merged
            .personas
            .iter()
            .filter(|p| p.has_alias("echo"))
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(owners, vec![echo.id.as_str()]);

        let merged_sage = merged.personas.iter().find(|p| p.id == sage.id).unwrap();
        assert_eq!(merged_sage.aliases, vec![sage.id.clone()]);
    }

    #[test]
    fn test_messages_of_unknown_personas_dropped() {
        let local = StateSnapshot::default();
        let mut remote = StateSnapshot::default();
        remote.messages.insert("ghost".into(), vec![Message::human("boo")]);

        let merged = merge_states(&local, &remote);
        assert!(merged.messages.is_empty());
    }
}

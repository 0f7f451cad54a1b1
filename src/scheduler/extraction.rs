//! Extraction counters and triggers.

use chrono::{DateTime, Utc};

use crate::config::ExtractionSettings;
use crate::queue::{LlmQueueItem, Priority, QueuePayload, RequestQueue};
use crate::store::{DataType, EntityRef, EntityStore};

/// Message-count threshold for a data type.
pub fn threshold(settings: &ExtractionSettings, data_type: DataType) -> u32 {
    match data_type {
        DataType::Fact => settings.fact_threshold,
        DataType::Trait => settings.trait_threshold,
        DataType::Topic => settings.topic_threshold,
        DataType::Person => settings.person_threshold,
    }
}

/// Count a completed turn and decide which extractions to queue.
///
/// Counters move for every data type the human and the responding persona
/// track. A fast scan of topics and people about the human is always queued;
/// full extractions are queued per entity for the data types that reached
/// their threshold.
pub fn trigger_extraction(
    store: &mut EntityStore,
    persona_id: &str,
    settings: &ExtractionSettings,
) -> Vec<LlmQueueItem> {
    let mut items = vec![LlmQueueItem::new(
        Priority::Low,
        QueuePayload::Extraction {
            target: EntityRef::Human,
            data_types: DataType::FAST_SCAN.to_vec(),
            persona_id: persona_id.to_string(),
            fast_scan: true,
        },
    )];

    for entity in [EntityRef::Human, EntityRef::Persona(persona_id.to_string())] {
        let mut due = Vec::new();
        for data_type in entity.data_types() {
            let state = store.extraction_state_mut(&entity, data_type);
            state.messages_since_last_extract += 1;
            if state.messages_since_last_extract >= threshold(settings, data_type) {
                due.push(data_type);
            }
        }

        if !due.is_empty() {
            log::info!("Extraction due for {:?}: {:?}", entity, due);
            items.push(LlmQueueItem::new(
                Priority::Low,
                QueuePayload::Extraction {
                    target: entity,
                    data_types: due,
                    persona_id: persona_id.to_string(),
                    fast_scan: false,
                },
            ));
        }
    }

    items
}

/// Whether a full extraction of `data_type` for `target` is already queued or running.
pub fn full_extraction_queued(queue: &RequestQueue, target: &EntityRef, data_type: DataType) -> bool {
    queue.has_item(|i| match &i.payload {
        QueuePayload::Extraction {
            target: t,
            data_types,
            fast_scan: false,
            ..
        } => t == target && data_types.contains(&data_type),
        _ => false,
    })
}

/// Drop data types from full extractions that the queue already covers.
///
/// Counters only reset once a full extraction finishes, so every turn in between
/// would ask again. Items left without data types are dropped; fast scans pass through.
pub fn drop_queued_extractions(queue: &RequestQueue, items: Vec<LlmQueueItem>) -> Vec<LlmQueueItem> {
    items
        .into_iter()
        .filter_map(|mut item| {
            if let QueuePayload::Extraction {
                target,
                data_types,
                fast_scan: false,
                ..
            } = &mut item.payload
            {
                data_types.retain(|dt| !full_extraction_queued(queue, target, *dt));
                if data_types.is_empty() {
                    log::debug!("Full extraction for {:?} already queued", target);
                    return None;
                }
            }
            Some(item)
        })
        .collect()
}

/// Reset counters after a full extraction ran.
pub fn record_extraction(store: &mut EntityStore, entity: &EntityRef, data_types: &[DataType], now: DateTime<Utc>) {
    for data_type in data_types {
        if !data_type.applies_to(entity) {
            continue;
        }
        let state = store.extraction_state_mut(entity, *data_type);
        state.messages_since_last_extract = 0;
        state.last_extraction = Some(now);
        state.total_extractions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewPersona;

    fn setup() -> (EntityStore, String) {
        let mut store = EntityStore::new();
        let persona = store.persona_add(NewPersona::named("Sage")).unwrap();
        (store, persona.id)
    }

    fn counter(store: &EntityStore, entity: &EntityRef, data_type: DataType) -> Option<u32> {
        store
            .extraction_state(entity, data_type)
            .map(|s| s.messages_since_last_extract)
    }

    #[test]
    fn test_counters_for_human_and_persona() {
        let (mut store, persona_id) = setup();
        let settings = ExtractionSettings::default();

        trigger_extraction(&mut store, &persona_id, &settings);

        let persona = EntityRef::Persona(persona_id.clone());
        for dt in DataType::ALL {
            assert_eq!(counter(&store, &EntityRef::Human, dt), Some(1));
        }
        assert_eq!(counter(&store, &persona, DataType::Trait), Some(1));
        assert_eq!(counter(&store, &persona, DataType::Topic), Some(1));
        assert_eq!(counter(&store, &persona, DataType::Fact), None);
        assert_eq!(counter(&store, &persona, DataType::Person), None);
    }

    #[test]
    fn test_fast_scan_always_queued() {
        let (mut store, persona_id) = setup();
        let items = trigger_extraction(&mut store, &persona_id, &ExtractionSettings::default());

        assert_eq!(items.len(), 1);
        match &items[0].payload {
            QueuePayload::Extraction {
                target,
                data_types,
                fast_scan,
                ..
            } => {
                assert_eq!(*target, EntityRef::Human);
                assert_eq!(data_types, &vec![DataType::Topic, DataType::Person]);
                assert!(fast_scan);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(items[0].priority, Priority::Low);
    }

    #[test]
    fn test_threshold_gates_full_extraction() {
        let (mut store, persona_id) = setup();
        let settings = ExtractionSettings {
            fact_threshold: 2,
            trait_threshold: 100,
            topic_threshold: 100,
            person_threshold: 100,
            ..Default::default()
        };

        assert_eq!(trigger_extraction(&mut store, &persona_id, &settings).len(), 1);
        let items = trigger_extraction(&mut store, &persona_id, &settings);
        assert_eq!(items.len(), 2);
        match &items[1].payload {
            QueuePayload::Extraction {
                target, data_types, ..
            } => {
                assert_eq!(*target, EntityRef::Human);
                assert_eq!(data_types, &vec![DataType::Fact]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_record_extraction_resets_counter() {
        let (mut store, persona_id) = setup();
        let settings = ExtractionSettings::default();
        trigger_extraction(&mut store, &persona_id, &settings);
        trigger_extraction(&mut store, &persona_id, &settings);

        let now = Utc::now();
        record_extraction(&mut store, &EntityRef::Human, &[DataType::Fact], now);

        let fact = store.extraction_state(&EntityRef::Human, DataType::Fact).unwrap();
        assert_eq!(fact.messages_since_last_extract, 0);
        assert_eq!(fact.total_extractions, 1);
        assert_eq!(fact.last_extraction, Some(now));
        assert_eq!(counter(&store, &EntityRef::Human, DataType::Trait), Some(2));
    }

    #[test]
    fn test_full_extraction_not_requeued_while_pending() {
        let (mut store, persona_id) = setup();
        let settings = ExtractionSettings {
            fact_threshold: 2,
            trait_threshold: 100,
            topic_threshold: 100,
            person_threshold: 100,
            ..Default::default()
        };
        let mut queue = RequestQueue::new();

        for _ in 0..5 {
            let items = trigger_extraction(&mut store, &persona_id, &settings);
            for item in drop_queued_extractions(&queue, items) {
                queue.enqueue(item);
            }
        }

        let full = queue
            .items()
            .iter()
            .filter(|i| matches!(i.payload, QueuePayload::Extraction { fast_scan: false, .. }))
            .count();
        assert_eq!(full, 1);
        assert!(full_extraction_queued(&queue, &EntityRef::Human, DataType::Fact));
        assert!(!full_extraction_queued(&queue, &EntityRef::Human, DataType::Trait));
    }

    #[test]
    fn test_only_uncovered_data_types_kept() {
        let mut queue = RequestQueue::new();
        queue.enqueue(LlmQueueItem::new(
            Priority::Low,
            QueuePayload::Extraction {
                target: EntityRef::Human,
                data_types: vec![DataType::Fact],
                persona_id: "p".into(),
                fast_scan: false,
            },
        ));
        let incoming = LlmQueueItem::new(
            Priority::Low,
            QueuePayload::Extraction {
                target: EntityRef::Human,
                data_types: vec![DataType::Fact, DataType::Person],
                persona_id: "p".into(),
                fast_scan: false,
            },
        );

        let kept = drop_queued_extractions(&queue, vec![incoming]);
        match &kept[0].payload {
            QueuePayload::Extraction { data_types, .. } => assert_eq!(data_types, &vec![DataType::Person]),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_record_skips_types_persona_does_not_track() {
        let (mut store, persona_id) = setup();
        let persona = EntityRef::Persona(persona_id);
        record_extraction(&mut store, &persona, &[DataType::Fact, DataType::Topic], Utc::now());
        assert!(store.extraction_state(&persona, DataType::Fact).is_none());
        assert!(store.extraction_state(&persona, DataType::Topic).is_some());
    }
}

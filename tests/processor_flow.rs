//! Processor integration tests.
//!
//! These drive the public API end to end with scripted model collaborators:
//! message round trips, extraction follow-ups, abort, concurrent submission
//! and the scheduler tick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use ei::store::{DataType, MessageRole, Topic};
use ei::{
    Config, Error, EventHandlers, MemoryPersistence, Message, ModelClient, ModelOutcome, NewPersona, ProcessOutcome,
    Processor, QueueState, Result,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Model that replays a script and records the prompts it was given.
#[derive(Default)]
struct ScriptedModel {
    replies: StdMutex<VecDeque<Result<ModelOutcome>>>,
    prompts: StdMutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    fn replying(replies: &[&str]) -> Self {
        Self {
            replies: StdMutex::new(replies.iter().map(|r| Ok(ModelOutcome::text(*r))).collect()),
            prompts: StdMutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn call(
        &self,
        system: &str,
        user: &str,
        _history: &[Message],
        _cancel: &CancellationToken,
    ) -> Result<ModelOutcome> {
        self.prompts.lock().unwrap().push((system.to_string(), user.to_string()));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ModelOutcome::text("")))
    }
}

/// Model that blocks until cancelled.
#[derive(Default)]
struct BlockingModel {
    started: Notify,
    calls: StdMutex<usize>,
}

#[async_trait]
impl ModelClient for BlockingModel {
    async fn call(
        &self,
        _system: &str,
        _user: &str,
        _history: &[Message],
        cancel: &CancellationToken,
    ) -> Result<ModelOutcome> {
        *self.calls.lock().unwrap() += 1;
        self.started.notify_one();
        cancel.cancelled().await;
        Ok(ModelOutcome::Aborted)
    }
}

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.ceremony.enabled = false;
    config
}

async fn start(model: Arc<dyn ModelClient>, handlers: EventHandlers) -> Arc<Processor> {
    init_logging();
    let processor = Processor::new(quiet_config(), model, Arc::new(MemoryPersistence::new()), None, handlers);
    processor.initialize().await;
    Arc::new(processor)
}

#[tokio::test]
async fn test_message_round_trip_with_events() {
    let added = Arc::new(StdMutex::new(Vec::new()));
    let states = Arc::new(StdMutex::new(Vec::new()));
    let handlers = {
        let added = added.clone();
        let states = states.clone();
        EventHandlers::new()
            .with_message_added(move |persona, message| {
                added.lock().unwrap().push((persona.to_string(), message.role));
            })
            .with_queue_state_changed(move |state| states.lock().unwrap().push(state))
    };

    let model = Arc::new(ScriptedModel::replying(&["How was the hike?\nGlad you made it back."]));
    let processor = start(model.clone(), handlers).await;
    let sage = processor.add_persona(NewPersona::named("Sage")).await.unwrap();

    processor.send_message("Sage", "How was the hike?").await.unwrap();
    assert_eq!(processor.process_next().await, ProcessOutcome::Completed);

    let messages = processor.get_messages(&sage.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Glad you made it back.");
    assert!(!messages[1].read);

    let added = added.lock().unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(added[0], (sage.id.clone(), MessageRole::Human));
    assert_eq!(added[1], (sage.id.clone(), MessageRole::System));
    assert!(states.lock().unwrap().contains(&QueueState::Busy));

    let (system, user) = model.prompts.lock().unwrap()[0].clone();
    assert!(system.contains("Sage"));
    assert_eq!(user, "How was the hike?");
}

#[tokio::test]
async fn test_fast_scan_learns_topics() {
    let model = Arc::new(ScriptedModel::replying(&[
        "Tomatoes are a great start.",
        r#"[{"type": "topic", "name": "Gardening", "description": "Growing tomatoes",
            "level_current": 0.2, "level_ideal": 0.8}]"#,
    ]));
    let processor = start(model.clone(), EventHandlers::new()).await;
    let sage = processor.add_persona(NewPersona::named("Sage")).await.unwrap();

    processor.send_message(&sage.id, "I planted tomatoes today").await.unwrap();
    assert_eq!(processor.process_next().await, ProcessOutcome::Completed);
    assert_eq!(processor.process_next().await, ProcessOutcome::Completed);
    assert_eq!(processor.process_next().await, ProcessOutcome::Idle);
    assert_eq!(model.calls(), 2);

    let store = processor.store().read().await;
    let topic = &store.human().topics[0];
    assert_eq!(topic.name, "Gardening");
    assert_eq!(topic.learned_by.as_deref(), Some(sage.id.as_str()));

    let human = store.extraction_state(&ei::store::EntityRef::Human, DataType::Fact).unwrap();
    assert_eq!(human.messages_since_last_extract, 1);
}

#[tokio::test]
async fn test_abort_leaves_store_untouched() {
    let model = Arc::new(BlockingModel::default());
    let processor = start(model.clone(), EventHandlers::new()).await;
    let sage = processor.add_persona(NewPersona::named("Sage")).await.unwrap();
    processor.send_message(&sage.id, "Tell me a long story").await.unwrap();

    let running = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process_next().await })
    };
    model.started.notified().await;

    assert_eq!(processor.get_queue_status().await.state, QueueState::Busy);
    assert_eq!(processor.process_next().await, ProcessOutcome::Busy);
    assert!(processor.abort_current_operation().await);
    assert_eq!(running.await.unwrap(), ProcessOutcome::Aborted);

    assert_eq!(processor.get_messages(&sage.id).await.unwrap().len(), 1);
    let status = processor.get_queue_status().await;
    assert_eq!(status.state, QueueState::Idle);
    assert_eq!(status.pending_count, 0);
    assert!(!processor.abort_current_operation().await);
}

#[tokio::test]
async fn test_concurrent_sends_keep_single_call_in_flight() {
    let model = Arc::new(BlockingModel::default());
    let processor = start(model.clone(), EventHandlers::new()).await;
    for name in ["Sage", "Iris", "Bram", "Wren"] {
        processor.add_persona(NewPersona::named(name)).await.unwrap();
    }
    processor.send_message("Sage", "first").await.unwrap();

    let running = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process_next().await })
    };
    model.started.notified().await;

    let (a, b, c, busy) = futures::join!(
        processor.send_message("Iris", "second"),
        processor.send_message("Bram", "third"),
        processor.send_message("Wren", "fourth"),
        processor.process_next(),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(busy, ProcessOutcome::Busy);
    assert_eq!(processor.get_queue_status().await.pending_count, 3);
    assert_eq!(*model.calls.lock().unwrap(), 1);

    processor.abort_current_operation().await;
    assert_eq!(running.await.unwrap(), ProcessOutcome::Aborted);
}

#[tokio::test]
async fn test_paused_queue_accepts_but_does_not_process() {
    let model = Arc::new(ScriptedModel::replying(&["Later then."]));
    let processor = start(model.clone(), EventHandlers::new()).await;
    processor.add_persona(NewPersona::named("Sage")).await.unwrap();

    processor.pause_queue().await;
    processor.send_message("Sage", "are you there").await.unwrap();
    assert_eq!(processor.process_next().await, ProcessOutcome::Paused);
    assert_eq!(processor.get_queue_status().await.pending_count, 1);
    assert_eq!(model.calls(), 0);

    processor.resume_queue().await;
    assert_eq!(processor.process_next().await, ProcessOutcome::Completed);
}

#[tokio::test]
async fn test_tick_queues_heartbeat_for_quiet_persona() {
    let model = Arc::new(ScriptedModel::replying(&["Did you catch the meteor shower last night?"]));
    let processor = start(model.clone(), EventHandlers::new()).await;
    let sage = processor.add_persona(NewPersona::named("Sage")).await.unwrap();
    processor
        .store()
        .write()
        .await
        .persona_topic_upsert(&sage.id, Topic::new("Astronomy", "Stars and planets").with_levels(0.1, 0.9))
        .unwrap();

    let report = processor.tick(Utc::now() + Duration::hours(2)).await;
    assert_eq!(report.items.len(), 1);

    let again = processor.tick(Utc::now() + Duration::hours(2)).await;
    assert!(again.items.is_empty());

    assert_eq!(processor.process_next().await, ProcessOutcome::Completed);
    let messages = processor.get_messages(&sage.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::System);
    assert!(model.prompts.lock().unwrap()[0].1.contains("Astronomy"));
}

#[tokio::test]
async fn test_unknown_persona_is_not_found() {
    let processor = start(Arc::new(ScriptedModel::default()), EventHandlers::new()).await;
    let result = processor.send_message("nobody", "hello").await;
    assert!(matches!(result, Err(Error::PersonaNotFound { .. })));
}

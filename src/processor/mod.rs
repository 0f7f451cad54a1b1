//! Queue processor: the single consumer of the request queue.
//!
//! The processor owns the live store, the request queue and the collaborators.
//! It guarantees at most one model call in flight: `process_next` takes a call
//! gate for the whole claim/call/apply cycle, and a concurrent caller gets
//! [`ProcessOutcome::Busy`] instead of waiting. Everything that needs a model
//! becomes a queue item; simple edits go straight to the store.

mod handlers;
pub mod prompt;
mod response;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::error::{Error, ErrorCode, Result};
use crate::events::{EventHandlers, QueueState, StateConflict};
use crate::model::{ModelClient, ModelOutcome};
use crate::persistence::{CheckpointMeta, FilePersistence, Persistence};
use crate::queue::{FailOutcome, LlmQueueItem, Priority, QueueItemKind, QueuePayload, RequestQueue, ResponseTrigger};
use crate::scheduler::{self, TickReport};
use crate::store::{
    ContextStatus, EntityStore, Message, MessageRole, NewPersona, NewQuote, PersonaEntity, PersonaUpdate, Quote,
    StateSnapshot,
};
use crate::sync::{DirectoryRemote, PushResult, RemoteSync, ResolveStrategy, SyncCheck, SyncResolver};

use handlers::{Output, Prepared};
pub use response::strip_echo;

/// Result of one `process_next` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The item ran and its output was applied.
    #[default]
    Completed,
    /// The output was cut off; it was stored flagged as partial.
    Truncated,
    /// The response was empty after echo stripping; nothing was appended.
    NoResponse,
    /// The item had nothing to do and completed without a model call.
    Skipped,
    /// The call was cancelled; the store was not touched.
    Aborted,
    /// The call failed and the item went back to pending.
    Failed,
    /// The item was malformed or gave up; it will not run again.
    Dropped,
    /// Nothing pending.
    Idle,
    /// The queue is paused.
    Paused,
    /// Another call is in flight.
    Busy,
    /// An unresolved sync conflict blocks processing.
    Blocked,
}

/// Queue status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub state: QueueState,
    pub pending_count: usize,
}

/// How startup went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Ready to process. `restored` tells whether an auto checkpoint was loaded.
    Ready { restored: bool },
    /// The remote copy is newer; processing is blocked until `resolve_conflict`.
    Conflict(StateConflict),
}

enum Executed {
    Applied(handlers::Applied),
    Aborted,
}

/// The orchestration core.
pub struct Processor {
    config: Config,
    store: Arc<RwLock<EntityStore>>,
    queue: Arc<Mutex<RequestQueue>>,
    model: Arc<dyn ModelClient>,
    checkpoints: CheckpointManager,
    sync: Option<SyncResolver>,
    handlers: EventHandlers,
    call_gate: Mutex<()>,
    in_flight: Mutex<Option<CancellationToken>>,
    conflict: Mutex<Option<StateConflict>>,
    last_state: Mutex<Option<QueueState>>,
}

impl Processor {
    /// Build a processor from explicit collaborators.
    ///
    /// `remote` is `None` when sync is not configured.
    pub fn new(
        config: Config,
        model: Arc<dyn ModelClient>,
        persistence: Arc<dyn Persistence>,
        remote: Option<Arc<dyn RemoteSync>>,
        handlers: EventHandlers,
    ) -> Self {
        let store = Arc::new(RwLock::new(EntityStore::new()));
        let queue = Arc::new(Mutex::new(RequestQueue::with_max_attempts(config.queue.max_attempts)));
        let checkpoints = CheckpointManager::new(persistence, store.clone(), queue.clone());

        Self {
            config,
            store,
            queue,
            model,
            checkpoints,
            sync: remote.map(SyncResolver::new),
            handlers,
            call_gate: Mutex::new(()),
            in_flight: Mutex::new(None),
            conflict: Mutex::new(None),
            last_state: Mutex::new(None),
        }
    }

    /// Build a processor with file checkpoints under the data directory and, if
    /// configured, a directory remote.
    pub fn from_config(config: Config, model: Arc<dyn ModelClient>, handlers: EventHandlers) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(FilePersistence::new(config.checkpoint_dir()));
        let remote = config
            .sync
            .as_ref()
            .map(|s| Arc::new(DirectoryRemote::new(&s.remote_dir)) as Arc<dyn RemoteSync>);
        Self::new(config, model, persistence, remote, handlers)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the live store for direct edits and reads.
    pub fn store(&self) -> &Arc<RwLock<EntityStore>> {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    // ---- startup and sync ----------------------------------------------------

    /// Load the latest auto checkpoint (or start empty) and compare with the remote.
    pub async fn initialize(&self) -> InitOutcome {
        let restored = match self.checkpoints.persistence().load_latest_auto().await {
            Ok(Some(state)) => {
                let items = state.queue.clone();
                self.replace_state(state).await;
                let requeued = self.queue.lock().await.restore_pending(items);
                log::info!("Resumed from auto checkpoint with {} pending item(s)", requeued);
                true
            }
            Ok(None) => {
                log::info!("No auto checkpoint found, starting with empty state");
                self.replace_state(StateSnapshot::default()).await;
                false
            }
            Err(e) => {
                self.handlers
                    .error(e.code(), &format!("Failed to load latest checkpoint: {}", e));
                self.replace_state(StateSnapshot::default()).await;
                false
            }
        };

        if let Some(resolver) = &self.sync {
            let local = self.store.read().await.last_updated();
            if let SyncCheck::Conflict { local, remote } = resolver.check(local).await {
                let conflict = StateConflict {
                    local_updated: local,
                    remote_updated: remote,
                };
                *self.conflict.lock().await = Some(conflict);
                self.handlers.state_conflict(conflict);
                return InitOutcome::Conflict(conflict);
            }
        }

        self.emit_queue_state().await;
        InitOutcome::Ready { restored }
    }

    /// Swap the whole store and announce the change.
    async fn replace_state(&self, state: StateSnapshot) {
        let before = self.personas().await;
        self.store.write().await.replace(state);
        self.handlers.state_replaced(&before, &self.personas().await);
    }

    async fn personas(&self) -> Vec<PersonaEntity> {
        self.store.read().await.personas().to_vec()
    }

    /// The conflict blocking processing, if any.
    pub async fn pending_conflict(&self) -> Option<StateConflict> {
        *self.conflict.lock().await
    }

    /// Settle a detected conflict and unblock processing.
    pub async fn resolve_conflict(&self, strategy: ResolveStrategy) -> Result<()> {
        let Some(resolver) = &self.sync else {
            return Err(Error::Sync("remote sync is not configured".to_string()));
        };

        let local = self.store.read().await.snapshot();
        let resolution = match resolver.resolve(strategy, &local).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.handlers.error(e.code(), &format!("Conflict resolution failed: {}", e));
                return Err(e);
            }
        };

        if let Some(state) = resolution.adopt {
            self.replace_state(state).await;
        }
        if let Some(push) = &resolution.push
            && let Some(error) = &push.error
        {
            self.handlers.error(ErrorCode::SyncFailed, error);
        }

        *self.conflict.lock().await = None;
        log::info!("Sync conflict resolved with {:?}", strategy);
        self.emit_queue_state().await;
        Ok(())
    }

    /// Push the local state to the remote.
    ///
    /// Refused while a conflict is unresolved, since local state is not yet authoritative.
    pub async fn sync_push(&self) -> PushResult {
        let Some(resolver) = &self.sync else {
            return PushResult::failed("remote sync is not configured");
        };
        if self.conflict.lock().await.is_some() {
            return PushResult::failed("unresolved sync conflict");
        }

        let snapshot = self.store.read().await.snapshot();
        let result = resolver.push(&snapshot).await;
        if let Some(error) = &result.error {
            self.handlers.error(ErrorCode::SyncFailed, error);
        }
        result
    }

    // ---- conversation --------------------------------------------------------

    /// Append a human message and queue the persona's response.
    ///
    /// Paused personas store the message but are not asked to respond until resumed.
    pub async fn send_message(&self, persona: &str, content: impl Into<String>) -> Result<Message> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(Error::Validation("message is empty".to_string()));
        }

        let (persona_id, message, respond) = {
            let mut store = self.store.write().await;
            let persona = store
                .persona_get(persona)
                .ok_or_else(|| Error::PersonaNotFound { id: persona.to_string() })?
                .clone();
            if persona.is_archived {
                return Err(Error::PersonaArchived { id: persona.id });
            }
            let message = store.message_append(&persona.id, Message::human(content))?;
            (persona.id.clone(), message, !persona.is_paused_at(Utc::now()))
        };

        self.handlers.message_added(&persona_id, &message);
        if respond {
            self.enqueue(LlmQueueItem::new(
                Priority::High,
                QueuePayload::Response {
                    persona_id,
                    trigger: ResponseTrigger::HumanMessage {
                        message_id: message.id.clone(),
                    },
                },
            ))
            .await;
        }
        Ok(message)
    }

    /// A persona's full message log, oldest first.
    pub async fn get_messages(&self, persona: &str) -> Result<Vec<Message>> {
        let store = self.store.read().await;
        let persona = store
            .persona_get(persona)
            .ok_or_else(|| Error::PersonaNotFound { id: persona.to_string() })?;
        Ok(store.messages(&persona.id).to_vec())
    }

    pub async fn set_message_context_status(
        &self,
        persona: &str,
        message_id: &str,
        status: ContextStatus,
    ) -> Result<Message> {
        let mut store = self.store.write().await;
        let id = resolve_id(&store, persona)?;
        store.message_set_context_status(&id, message_id, status)
    }

    /// Mark a persona's messages read. Returns how many changed.
    pub async fn mark_read(&self, persona: &str) -> Result<usize> {
        let mut store = self.store.write().await;
        let id = resolve_id(&store, persona)?;
        Ok(store.messages_mark_read(&id))
    }

    // ---- queue -----------------------------------------------------------------

    /// Submit work to the queue. Returns the item id.
    pub async fn enqueue(&self, item: LlmQueueItem) -> String {
        let id = self.queue.lock().await.enqueue(item);
        self.emit_queue_state().await;
        id
    }

    pub async fn pause_queue(&self) {
        self.queue.lock().await.pause();
        log::info!("Queue paused");
        self.emit_queue_state().await;
    }

    pub async fn resume_queue(&self) {
        self.queue.lock().await.resume();
        log::info!("Queue resumed");
        self.emit_queue_state().await;
    }

    /// Paused wins over busy, which wins over idle.
    pub async fn get_queue_status(&self) -> QueueStatus {
        let (mode, pending_count) = {
            let queue = self.queue.lock().await;
            (queue.mode(), queue.pending_count())
        };
        let busy = self.in_flight.lock().await.is_some();
        QueueStatus {
            state: QueueState::from_parts(mode, busy),
            pending_count,
        }
    }

    /// Cancel the in-flight model call. Returns false if nothing was running.
    pub async fn abort_current_operation(&self) -> bool {
        match self.in_flight.lock().await.as_ref() {
            Some(token) => {
                log::info!("Aborting current operation");
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn emit_queue_state(&self) {
        let state = self.get_queue_status().await.state;
        let mut last = self.last_state.lock().await;
        if *last != Some(state) {
            *last = Some(state);
            drop(last);
            self.handlers.queue_state_changed(state);
        }
    }

    /// Claim and run the next queue item.
    pub async fn process_next(&self) -> ProcessOutcome {
        if self.conflict.lock().await.is_some() {
            return ProcessOutcome::Blocked;
        }
        let Ok(_gate) = self.call_gate.try_lock() else {
            return ProcessOutcome::Busy;
        };

        let item = {
            let mut queue = self.queue.lock().await;
            match queue.claim_next() {
                Some(item) => item,
                None if queue.is_paused() => return ProcessOutcome::Paused,
                None => return ProcessOutcome::Idle,
            }
        };
        log::debug!("Processing {:?} item {} (attempt {})", item.kind, item.id, item.attempts + 1);

        if let Err(e) = item.validate() {
            return self.handle_failure(&item, e).await;
        }

        let token = CancellationToken::new();
        *self.in_flight.lock().await = Some(token.clone());
        self.emit_queue_state().await;

        let result = self.execute(&item, &token).await;
        *self.in_flight.lock().await = None;

        let outcome = match result {
            Ok(Executed::Aborted) => {
                self.queue.lock().await.complete(&item.id);
                log::info!("Item {} aborted", item.id);
                ProcessOutcome::Aborted
            }
            Ok(Executed::Applied(applied)) => {
                {
                    let mut queue = self.queue.lock().await;
                    queue.complete(&item.id);
                    for follow_up in scheduler::drop_queued_extractions(&queue, applied.follow_ups) {
                        queue.enqueue(follow_up);
                    }
                }
                for (persona_id, message) in &applied.messages {
                    self.handlers.message_added(persona_id, message);
                }
                if applied.outcome == ProcessOutcome::Truncated {
                    self.handlers
                        .error(ErrorCode::Truncated, &format!("Response to item {} was truncated", item.id));
                }
                applied.outcome
            }
            Err(e) => self.handle_failure(&item, e).await,
        };

        self.emit_queue_state().await;
        outcome
    }

    async fn execute(&self, item: &LlmQueueItem, token: &CancellationToken) -> Result<Executed> {
        let now = Utc::now();
        let prepared = {
            let store = self.store.read().await;
            handlers::prepare(&store, item, &self.config, now)?
        };

        let prompt = match prepared {
            Prepared::Skip => {
                let mut store = self.store.write().await;
                return handlers::apply(&mut store, item, None, &self.config, now).map(Executed::Applied);
            }
            Prepared::Call(prompt) => prompt,
        };

        let outcome = tokio::select! {
            _ = token.cancelled() => ModelOutcome::Aborted,
            result = self.model.call(&prompt.system, &prompt.user, &prompt.history, token) => result?,
        };
        let (text, truncated) = match outcome {
            ModelOutcome::Aborted => return Ok(Executed::Aborted),
            ModelOutcome::Text(text) => (text, false),
            ModelOutcome::Truncated(text) => (text, true),
        };

        let mut store = self.store.write().await;
        if token.is_cancelled() {
            return Ok(Executed::Aborted);
        }
        let output = Output {
            text: &text,
            truncated,
        };
        handlers::apply(&mut store, item, Some(output), &self.config, Utc::now()).map(Executed::Applied)
    }

    async fn handle_failure(&self, item: &LlmQueueItem, error: Error) -> ProcessOutcome {
        let code = error.code();
        let message = format!("{:?} item {} failed: {}", item.kind, item.id, error);

        if matches!(code, ErrorCode::ValidationError | ErrorCode::NotFound) {
            self.queue.lock().await.fail_terminal(&item.id, &error.to_string());
            self.handlers.error(code, &message);
            return ProcessOutcome::Dropped;
        }

        let failed = self.queue.lock().await.fail(&item.id, error.to_string());
        self.handlers.error(code, &message);
        match failed {
            FailOutcome::GaveUp(_) => ProcessOutcome::Dropped,
            FailOutcome::Requeued { .. } | FailOutcome::Unknown => ProcessOutcome::Failed,
        }
    }

    // ---- personas --------------------------------------------------------------

    pub async fn add_persona(&self, new: NewPersona) -> Result<PersonaEntity> {
        let persona = self.store.write().await.persona_add(new)?;
        self.handlers.persona_added(&persona);
        Ok(persona)
    }

    /// Get or synthesize the persona for an integration agent.
    pub async fn ensure_integration_persona(&self, alias: &str) -> Result<PersonaEntity> {
        let (persona, created) = self.store.write().await.persona_ensure_integration(alias)?;
        if created {
            self.handlers.persona_added(&persona);
        }
        Ok(persona)
    }

    pub async fn update_persona(&self, persona: &str, update: PersonaUpdate) -> Result<PersonaEntity> {
        let updated = {
            let mut store = self.store.write().await;
            let id = resolve_id(&store, persona)?;
            store.persona_update(&id, update)?
        };
        self.handlers.persona_updated(&updated);
        Ok(updated)
    }

    /// Archive a persona and drop its queued responses.
    pub async fn archive_persona(&self, persona: &str) -> Result<PersonaEntity> {
        let archived = {
            let mut store = self.store.write().await;
            let id = resolve_id(&store, persona)?;
            store.persona_archive(&id)?
        };
        self.drop_pending_for(&archived.id, true).await;
        self.handlers.persona_updated(&archived);
        Ok(archived)
    }

    pub async fn unarchive_persona(&self, persona: &str) -> Result<PersonaEntity> {
        let restored = {
            let mut store = self.store.write().await;
            let id = resolve_id(&store, persona)?;
            store.persona_unarchive(&id)?
        };
        self.handlers.persona_updated(&restored);
        Ok(restored)
    }

    /// Delete a persona with its history. Returns false if it did not exist.
    pub async fn delete_persona(&self, persona: &str) -> bool {
        let removed = {
            let mut store = self.store.write().await;
            let Ok(id) = resolve_id(&store, persona) else {
                return false;
            };
            store.persona_delete(&id).then_some(id)
        };
        match removed {
            Some(id) => {
                self.drop_pending_for(&id, false).await;
                self.handlers.persona_removed(&id);
                true
            }
            None => false,
        }
    }

    /// Pause a persona, optionally until `until`.
    pub async fn pause_persona(&self, persona: &str, until: Option<DateTime<Utc>>) -> Result<PersonaEntity> {
        let paused = {
            let mut store = self.store.write().await;
            let id = resolve_id(&store, persona)?;
            store.persona_pause(&id, until)?
        };
        self.handlers.persona_updated(&paused);
        Ok(paused)
    }

    /// Resume a persona and answer any human message left waiting while it was paused.
    pub async fn resume_persona(&self, persona: &str) -> Result<PersonaEntity> {
        let resumed = {
            let mut store = self.store.write().await;
            let id = resolve_id(&store, persona)?;
            store.persona_resume(&id)?
        };
        self.handlers.persona_updated(&resumed);
        self.answer_waiting(&resumed.id).await;
        Ok(resumed)
    }

    pub async fn set_context_boundary(&self, persona: &str, boundary: Option<DateTime<Utc>>) -> Result<PersonaEntity> {
        let updated = {
            let mut store = self.store.write().await;
            let id = resolve_id(&store, persona)?;
            store.persona_set_context_boundary(&id, boundary)?
        };
        self.handlers.context_boundary_changed(&updated.id, boundary);
        Ok(updated)
    }

    async fn drop_pending_for(&self, persona_id: &str, responses_only: bool) {
        let removed = self.queue.lock().await.remove_pending_where(|i| {
            i.payload.persona_id() == Some(persona_id) && (!responses_only || i.kind == QueueItemKind::Response)
        });
        if removed > 0 {
            log::info!("Dropped {} queued item(s) for persona {}", removed, persona_id);
            self.emit_queue_state().await;
        }
    }

    /// Queue a response if the persona's latest message is an unanswered human message.
    async fn answer_waiting(&self, persona_id: &str) {
        let waiting = {
            let store = self.store.read().await;
            store
                .messages(persona_id)
                .last()
                .filter(|m| m.role == MessageRole::Human)
                .map(|m| m.id.clone())
        };
        let Some(message_id) = waiting else {
            return;
        };

        let already_queued = self
            .queue
            .lock()
            .await
            .has_item(|i| i.kind == QueueItemKind::Response && i.payload.persona_id() == Some(persona_id));
        if !already_queued {
            self.enqueue(LlmQueueItem::new(
                Priority::High,
                QueuePayload::Response {
                    persona_id: persona_id.to_string(),
                    trigger: ResponseTrigger::HumanMessage { message_id },
                },
            ))
            .await;
        }
    }

    // ---- quotes and validations ------------------------------------------------

    pub async fn add_quote(&self, new: NewQuote) -> Result<Quote> {
        let quote = self.store.write().await.quote_add(new)?;
        self.handlers.quote_added(&quote);
        Ok(quote)
    }

    pub async fn update_quote(&self, id: &str, start: usize, end: usize, data_item_ids: Vec<String>) -> Result<Quote> {
        let quote = self.store.write().await.quote_update(id, start, end, data_item_ids)?;
        self.handlers.quote_updated(&quote);
        Ok(quote)
    }

    pub async fn remove_quote(&self, id: &str) -> bool {
        let removed = self.store.write().await.quote_remove(id);
        if removed {
            self.handlers.quote_removed(id);
        }
        removed
    }

    /// Human confirms an uncertain item.
    pub async fn confirm_validation(&self, id: &str) -> Result<()> {
        self.store.write().await.validation_confirm(id)?;
        self.drop_validation_items(id).await;
        Ok(())
    }

    /// Human rejects an uncertain item; it is removed.
    pub async fn reject_validation(&self, id: &str) -> Result<()> {
        self.store.write().await.validation_reject(id)?;
        self.drop_validation_items(id).await;
        Ok(())
    }

    async fn drop_validation_items(&self, validation_id: &str) {
        self.queue.lock().await.remove_pending_where(|i| {
            matches!(&i.payload, QueuePayload::Validation { validation_id: v } if v == validation_id)
        });
        self.emit_queue_state().await;
    }

    // ---- checkpoints -------------------------------------------------------------

    pub async fn auto_save(&self) -> Result<CheckpointMeta> {
        self.checkpoints.auto_save().await.inspect_err(|e| {
            self.handlers.error(e.code(), &format!("Auto-save failed: {}", e));
        })
    }

    /// Save into a named manual slot (10-14).
    pub async fn save_checkpoint(&self, index: u8, name: &str) -> Result<CheckpointMeta> {
        self.checkpoints.manual_save(index, name).await.inspect_err(|e| {
            self.handlers.error(e.code(), &format!("Checkpoint save failed: {}", e));
        })
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>> {
        self.checkpoints.list().await.inspect_err(|e| {
            self.handlers.error(e.code(), &format!("Listing checkpoints failed: {}", e));
        })
    }

    pub async fn delete_checkpoint(&self, index: u8) -> Result<bool> {
        self.checkpoints.delete(index).await.inspect_err(|e| {
            self.handlers
                .error(e.code(), &format!("Deleting checkpoint {} failed: {}", index, e));
        })
    }

    /// Replace the live store with a checkpoint.
    ///
    /// False for an empty or invalid slot, or when the slot cannot be read (reported through `on_error`).
    pub async fn restore_checkpoint(&self, index: u8) -> bool {
        let before = self.personas().await;
        let restored = self.checkpoints.restore(index).await;
        self.after_restore(&before, restored, &format!("Restoring checkpoint {} failed", index))
            .await
    }

    /// Step back through auto saves. `undo(1)` restores the most recent one.
    pub async fn undo(&self, steps: usize) -> bool {
        let before = self.personas().await;
        let restored = self.checkpoints.undo(steps).await;
        self.after_restore(&before, restored, &format!("Undo of {} step(s) failed", steps))
            .await
    }

    async fn after_restore(&self, before: &[PersonaEntity], restored: Result<bool>, context: &str) -> bool {
        match restored {
            Ok(true) => {
                self.handlers.state_replaced(before, &self.personas().await);
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.handlers.error(e.code(), &format!("{}: {}", context, e));
                false
            }
        }
    }

    // ---- scheduling and lifecycle ------------------------------------------------

    /// Run one scheduler pass and queue what it decided.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        if self.conflict.lock().await.is_some() {
            return TickReport::default();
        }

        let mut report = {
            let mut store = self.store.write().await;
            let queue = self.queue.lock().await;
            scheduler::tick(&mut store, &queue, &self.config, now)
        };

        for item in std::mem::take(&mut report.items) {
            report.items.push(item.clone());
            self.enqueue(item).await;
        }
        for id in &report.resumed {
            let persona = self.store.read().await.persona_get(id).cloned();
            if let Some(persona) = persona {
                self.handlers.persona_updated(&persona);
            }
            self.answer_waiting(id).await;
        }
        report
    }

    /// Drain the queue and tick the scheduler until `shutdown` fires.
    ///
    /// An in-flight call is aborted on shutdown and allowed to unwind.
    pub async fn run(&self, shutdown: CancellationToken) {
        let tick_every = self.config.heartbeat.tick_interval;
        let idle = self.config.queue.idle_poll;
        let mut last_tick: Option<Instant> = None;
        log::info!("Processor loop started");

        while !shutdown.is_cancelled() {
            if last_tick.is_none_or(|t| t.elapsed() >= tick_every) {
                self.tick(Utc::now()).await;
                last_tick = Some(Instant::now());
            }

            let process = self.process_next();
            tokio::pin!(process);
            let outcome = tokio::select! {
                outcome = &mut process => outcome,
                _ = shutdown.cancelled() => {
                    self.abort_current_operation().await;
                    process.await
                }
            };

            let wait = matches!(
                outcome,
                ProcessOutcome::Idle
                    | ProcessOutcome::Paused
                    | ProcessOutcome::Busy
                    | ProcessOutcome::Blocked
                    | ProcessOutcome::Failed
            );
            if wait {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
        log::info!("Processor loop stopped");
    }

    /// Start the run loop and the auto-save timer as background tasks.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let auto_save = self
            .checkpoints
            .spawn_auto_save(
                self.config.checkpoint.auto_save_interval,
                shutdown.clone(),
                self.handlers.clone(),
            );
        let processor = Arc::clone(self);
        let runner = tokio::spawn(async move {
            processor.run(shutdown).await;
        });
        vec![runner, auto_save]
    }

    /// Abort in-flight work, write a final auto checkpoint and push if configured.
    ///
    /// An unresolved conflict skips the push and is reported as `Error::SyncConflict`.
    pub async fn shutdown(&self) -> Result<()> {
        self.abort_current_operation().await;
        self.auto_save().await?;

        if let Some(conflict) = *self.conflict.lock().await {
            return Err(Error::SyncConflict {
                local: conflict.local_updated,
                remote: conflict.remote_updated,
            });
        }

        let push_on_shutdown = self.config.sync.as_ref().is_none_or(|s| s.push_on_shutdown);
        if self.sync.is_some() && push_on_shutdown {
            let result = self.sync_push().await;
            if !result.success {
                return Err(Error::Sync(result.error.unwrap_or_else(|| "push failed".to_string())));
            }
        }
        log::info!("Shutdown complete");
        Ok(())
    }
}

/// Resolve an id or alias to a persona id.
fn resolve_id(store: &EntityStore, persona: &str) -> Result<String> {
    store
        .persona_get(persona)
        .map(|p| p.id.clone())
        .ok_or_else(|| Error::PersonaNotFound { id: persona.to_string() })
}

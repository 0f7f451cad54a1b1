//! Ei: orchestration core for a personal-companion platform.
//!
//! Ei keeps an entity store of the human, personas and conversations, drives a
//! single-consumer request queue of model calls, schedules heartbeats and the
//! daily ceremony, checkpoints state and reconciles it with a remote copy.
//! The model, persistence and remote are collaborators supplied by the host.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod persistence;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use checkpoint::CheckpointManager;
pub use config::Config;
pub use error::{Error, ErrorCode, Result};
pub use events::{EventHandlers, QueueState, StateConflict};
pub use model::{ModelClient, ModelOutcome};
pub use persistence::{Checkpoint, CheckpointMeta, FilePersistence, MemoryPersistence, Persistence};
pub use processor::{InitOutcome, ProcessOutcome, Processor, QueueStatus};
pub use queue::{LlmQueueItem, Priority, QueueItemKind, QueuePayload, RequestQueue};
pub use store::{EntityStore, Message, NewPersona, PersonaEntity, StateSnapshot};
pub use sync::{DirectoryRemote, PushResult, RemoteSync, ResolveStrategy, SyncResolver};

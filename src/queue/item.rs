//! Queue item types.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::types::new_id;
use crate::store::{DataType, EntityRef};

/// Dispatch priority. Higher variants are dequeued first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// What kind of model-bound work an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemKind {
    Response,
    Extraction,
    Validation,
    Ceremony,
}

/// Why a persona is being asked to speak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseTrigger {
    /// Answer a human message.
    HumanMessage { message_id: String },
    /// Reach out unprompted about a concept.
    Heartbeat { topic: String },
}

/// Work description carried by a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuePayload {
    Response {
        persona_id: String,
        trigger: ResponseTrigger,
    },
    Extraction {
        target: EntityRef,
        data_types: Vec<DataType>,
        /// Conversation the extraction reads from.
        persona_id: String,
        /// Per-message sweep that does not reset counters.
        #[serde(default)]
        fast_scan: bool,
    },
    Validation {
        validation_id: String,
    },
    Ceremony,
}

impl QueuePayload {
    pub fn kind(&self) -> QueueItemKind {
        match self {
            QueuePayload::Response { .. } => QueueItemKind::Response,
            QueuePayload::Extraction { .. } => QueueItemKind::Extraction,
            QueuePayload::Validation { .. } => QueueItemKind::Validation,
            QueuePayload::Ceremony => QueueItemKind::Ceremony,
        }
    }

    /// Persona the payload concerns, if any.
    pub fn persona_id(&self) -> Option<&str> {
        match self {
            QueuePayload::Response { persona_id, .. } | QueuePayload::Extraction { persona_id, .. } => {
                Some(persona_id)
            }
            QueuePayload::Validation { .. } | QueuePayload::Ceremony => None,
        }
    }
}

/// Lifecycle state while an item is still in the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    #[default]
    Pending,
    Active,
}

/// One unit of model-bound work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmQueueItem {
    pub id: String,
    pub kind: QueueItemKind,
    pub priority: Priority,
    pub payload: QueuePayload,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence, breaks ties between equal timestamps.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub state: ItemState,
}

impl LlmQueueItem {
    /// Build an item whose kind matches its payload.
    pub fn new(priority: Priority, payload: QueuePayload) -> Self {
        Self {
            id: new_id("item"),
            kind: payload.kind(),
            priority,
            payload,
            attempts: 0,
            created_at: Utc::now(),
            seq: 0,
            last_error: None,
            state: ItemState::Pending,
        }
    }

    /// Reject items whose declared kind disagrees with the payload or whose
    /// payload references are empty.
    pub fn validate(&self) -> Result<()> {
        if self.kind != self.payload.kind() {
            return Err(Error::Validation(format!(
                "item {} declares {:?} but carries a {:?} payload",
                self.id,
                self.kind,
                self.payload.kind()
            )));
        }
        match &self.payload {
            QueuePayload::Response { persona_id, .. } if persona_id.is_empty() => {
                Err(Error::Validation(format!("item {} has no persona", self.id)))
            }
            QueuePayload::Extraction { data_types, .. } if data_types.is_empty() => {
                Err(Error::Validation(format!("item {} has no data types", self.id)))
            }
            QueuePayload::Validation { validation_id } if validation_id.is_empty() => {
                Err(Error::Validation(format!("item {} has no validation id", self.id)))
            }
            _ => Ok(()),
        }
    }

    /// Dispatch order: higher priority first, then older, then earlier inserted.
    pub(crate) fn dispatch_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_payload() {
        let item = LlmQueueItem::new(Priority::Low, QueuePayload::Ceremony);
        assert_eq!(item.kind, QueueItemKind::Ceremony);
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_mismatched_kind_is_invalid() {
        let mut item = LlmQueueItem::new(
            Priority::High,
            QueuePayload::Validation {
                validation_id: "val-1".into(),
            },
        );
        item.kind = QueueItemKind::Response;
        assert!(matches!(item.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_empty_extraction_is_invalid() {
        let item = LlmQueueItem::new(
            Priority::Low,
            QueuePayload::Extraction {
                target: EntityRef::Human,
                data_types: Vec::new(),
                persona_id: "p".into(),
                fast_scan: false,
            },
        );
        assert!(item.validate().is_err());
    }

    #[test]
    fn test_payload_serde_shape() {
        let payload = QueuePayload::Response {
            persona_id: "persona-1".into(),
            trigger: ResponseTrigger::HumanMessage {
                message_id: "msg-1".into(),
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["trigger"]["type"], "human_message");
    }
}

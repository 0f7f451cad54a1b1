//! Entity types held by the store.
//!
//! Everything here is plain serializable data. Invariants that span entities
//! (alias uniqueness, append-only logs) are enforced by [`super::EntityStore`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::LlmQueueItem;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7())
}

/// Kinds of data extracted from conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Fact,
    Trait,
    Topic,
    Person,
}

impl DataType {
    /// Every data type, in extraction order.
    pub const ALL: [DataType; 4] = [DataType::Fact, DataType::Trait, DataType::Topic, DataType::Person];

    /// Data types swept by the per-message fast scan.
    pub const FAST_SCAN: [DataType; 2] = [DataType::Topic, DataType::Person];

    /// Whether this data type is tracked for the given entity.
    ///
    /// Personas only carry traits and topics; facts and people describe the human.
    pub fn applies_to(&self, entity: &EntityRef) -> bool {
        match entity {
            EntityRef::Human => true,
            EntityRef::Persona(_) => matches!(self, DataType::Trait | DataType::Topic),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Fact => "fact",
            DataType::Trait => "trait",
            DataType::Topic => "topic",
            DataType::Person => "person",
        }
    }
}

/// Reference to the entity that owns extracted data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Human,
    Persona(String),
}

impl EntityRef {
    /// Data types tracked for this entity.
    pub fn data_types(&self) -> Vec<DataType> {
        DataType::ALL.into_iter().filter(|dt| dt.applies_to(self)).collect()
    }
}

/// Common accessors shared by facts, traits, topics and people.
pub trait DataItem {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn last_updated(&self) -> DateTime<Utc>;
    fn persona_groups(&self) -> &[String];
}

/// A concept with an affect level, used for heartbeat decisions.
pub trait Concept {
    fn name(&self) -> &str;
    fn level_current(&self) -> f64;
    fn level_ideal(&self) -> f64;
    fn sentiment(&self) -> f64;

    /// How much more the owner wants to engage with this concept.
    fn desire_gap(&self) -> f64 {
        self.level_ideal() - self.level_current()
    }
}

macro_rules! impl_data_item {
    ($ty:ty) => {
        impl DataItem for $ty {
            fn id(&self) -> &str {
                &self.id
            }
            fn name(&self) -> &str {
                &self.name
            }
            fn last_updated(&self) -> DateTime<Utc> {
                self.last_updated
            }
            fn persona_groups(&self) -> &[String] {
                &self.persona_groups
            }
        }
    };
}

macro_rules! impl_concept {
    ($ty:ty) => {
        impl Concept for $ty {
            fn name(&self) -> &str {
                &self.name
            }
            fn level_current(&self) -> f64 {
                self.level_current
            }
            fn level_ideal(&self) -> f64 {
                self.level_ideal
            }
            fn sentiment(&self) -> f64 {
                self.sentiment
            }
        }
    };
}

/// Something known to be true about the human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub name: String,
    pub description: String,
    /// -1.0 (negative) to 1.0 (positive).
    pub sentiment: f64,
    /// 0.0 to 1.0; facts below the configured floor wait for validation.
    pub confidence: f64,
    /// Persona whose conversation produced this fact.
    #[serde(default)]
    pub learned_by: Option<String>,
    #[serde(default)]
    pub persona_groups: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl Fact {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: new_id("fact"),
            name: name.into(),
            description: description.into(),
            sentiment: 0.0,
            confidence: 1.0,
            learned_by: None,
            persona_groups: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// A behavioural trait of the human or of a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    pub id: String,
    pub name: String,
    pub description: String,
    pub sentiment: f64,
    /// 0.0 to 1.0.
    pub strength: f64,
    #[serde(default)]
    pub learned_by: Option<String>,
    #[serde(default)]
    pub persona_groups: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl Trait {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: new_id("trait"),
            name: name.into(),
            description: description.into(),
            sentiment: 0.0,
            strength: 0.5,
            learned_by: None,
            persona_groups: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

/// A subject of interest with an engagement level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    pub description: String,
    pub sentiment: f64,
    /// How much the topic has been engaged with recently (0.0 to 1.0).
    pub level_current: f64,
    /// How much the owner would like to engage with it (0.0 to 1.0).
    pub level_ideal: f64,
    #[serde(default)]
    pub learned_by: Option<String>,
    #[serde(default)]
    pub persona_groups: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl Topic {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: new_id("topic"),
            name: name.into(),
            description: description.into(),
            sentiment: 0.0,
            level_current: 0.5,
            level_ideal: 0.5,
            learned_by: None,
            persona_groups: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_levels(mut self, level_current: f64, level_ideal: f64) -> Self {
        self.level_current = level_current;
        self.level_ideal = level_ideal;
        self
    }

    pub fn with_sentiment(mut self, sentiment: f64) -> Self {
        self.sentiment = sentiment;
        self
    }
}

/// Someone in the human's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub relationship: String,
    pub description: String,
    pub sentiment: f64,
    pub level_current: f64,
    pub level_ideal: f64,
    #[serde(default)]
    pub learned_by: Option<String>,
    #[serde(default)]
    pub persona_groups: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl Person {
    pub fn new(name: impl Into<String>, relationship: impl Into<String>) -> Self {
        Self {
            id: new_id("person"),
            name: name.into(),
            relationship: relationship.into(),
            description: String::new(),
            sentiment: 0.0,
            level_current: 0.5,
            level_ideal: 0.5,
            learned_by: None,
            persona_groups: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

impl_data_item!(Fact);
impl_data_item!(Trait);
impl_data_item!(Topic);
impl_data_item!(Person);
impl_concept!(Topic);
impl_concept!(Person);

/// The single end user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HumanEntity {
    pub facts: Vec<Fact>,
    pub traits: Vec<Trait>,
    pub topics: Vec<Topic>,
    pub people: Vec<Person>,
    /// Free-form settings keyed by arbitrary strings.
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// How a persona came to exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaKind {
    /// Created by the human.
    #[default]
    Companion,
    /// Synthesized on demand for an external integration agent.
    Integration,
}

/// One AI character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaEntity {
    pub id: String,
    #[serde(default)]
    pub kind: PersonaKind,
    /// Names the persona answers to. The first alias is its display name.
    pub aliases: Vec<String>,
    pub short_description: String,
    pub long_description: String,
    #[serde(default)]
    pub traits: Vec<Trait>,
    #[serde(default)]
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub group_primary: Option<String>,
    #[serde(default)]
    pub groups_visible: Vec<String>,
    #[serde(default)]
    pub is_paused: bool,
    /// Pause lifts automatically at this time. `None` with `is_paused` means indefinitely.
    #[serde(default)]
    pub pause_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    /// Messages before this instant are outside the active context.
    #[serde(default)]
    pub context_boundary: Option<DateTime<Utc>>,
    /// Silence before a heartbeat. `None` uses the configured default.
    #[serde(default)]
    pub heartbeat_delay_ms: Option<u64>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PersonaEntity {
    pub fn display_name(&self) -> &str {
        self.aliases.first().map(String::as_str).unwrap_or(&self.id)
    }

    /// Case-insensitive alias match.
    pub fn has_alias(&self, alias: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(alias))
    }

    /// Whether the persona is paused at `now`, honouring `pause_until`.
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        match (self.is_paused, self.pause_until) {
            (false, _) => false,
            (true, None) => true,
            (true, Some(until)) => now < until,
        }
    }

    /// Whether the persona can see data tagged with `groups`.
    pub fn can_see(&self, groups: &[String]) -> bool {
        if groups.is_empty() {
            return true;
        }
        groups
            .iter()
            .any(|g| self.group_primary.as_deref() == Some(g.as_str()) || self.groups_visible.contains(g))
    }
}

/// Input for creating a persona.
#[derive(Debug, Clone, Default)]
pub struct NewPersona {
    pub aliases: Vec<String>,
    pub short_description: String,
    pub long_description: String,
    pub traits: Vec<Trait>,
    pub topics: Vec<Topic>,
    pub group_primary: Option<String>,
    pub groups_visible: Vec<String>,
    pub heartbeat_delay_ms: Option<u64>,
}

impl NewPersona {
    pub fn named(alias: impl Into<String>) -> Self {
        Self {
            aliases: vec![alias.into()],
            ..Default::default()
        }
    }
}

/// Partial persona update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct PersonaUpdate {
    pub aliases: Option<Vec<String>>,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub traits: Option<Vec<Trait>>,
    pub topics: Option<Vec<Topic>>,
    pub group_primary: Option<Option<String>>,
    pub groups_visible: Option<Vec<String>>,
    pub heartbeat_delay_ms: Option<Option<u64>>,
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Human,
    /// The persona.
    System,
}

/// Per-message override of the context window rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    #[default]
    Default,
    Always,
    Never,
}

/// One turn in a persona's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    #[serde(default)]
    pub context_status: ContextStatus,
    /// The model stopped mid-generation.
    #[serde(default)]
    pub partial: bool,
}

impl Message {
    /// A message typed by the human. Human messages are born read.
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            id: new_id("msg"),
            role: MessageRole::Human,
            content: content.into(),
            timestamp: Utc::now(),
            read: true,
            context_status: ContextStatus::Default,
            partial: false,
        }
    }

    /// A message written by a persona.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            id: new_id("msg"),
            role: MessageRole::System,
            content: content.into(),
            timestamp: Utc::now(),
            read: false,
            context_status: ContextStatus::Default,
            partial: false,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Extraction counters for one (entity, data type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionState {
    pub entity: EntityRef,
    pub data_type: DataType,
    pub last_extraction: Option<DateTime<Utc>>,
    pub messages_since_last_extract: u32,
    pub total_extractions: u32,
}

impl ExtractionState {
    pub fn new(entity: EntityRef, data_type: DataType) -> Self {
        Self {
            entity,
            data_type,
            last_extraction: None,
            messages_since_last_extract: 0,
            total_extractions: 0,
        }
    }
}

/// A captured excerpt of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub message_id: String,
    pub persona_id: String,
    /// Character offsets into the message content, end exclusive.
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub speaker: String,
    #[serde(default)]
    pub data_item_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for capturing a quote.
#[derive(Debug, Clone)]
pub struct NewQuote {
    pub message_id: String,
    pub start: usize,
    pub end: usize,
    pub data_item_ids: Vec<String>,
}

/// An extracted item whose confidence is too low to trust without review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingValidation {
    pub id: String,
    pub data_type: DataType,
    pub item_id: String,
    pub item_name: String,
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub learned_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingValidation {
    pub fn for_fact(fact: &Fact) -> Self {
        Self {
            id: new_id("val"),
            data_type: DataType::Fact,
            item_id: fact.id.clone(),
            item_name: fact.name.clone(),
            description: fact.description.clone(),
            confidence: fact.confidence,
            learned_by: fact.learned_by.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Timestamps the scheduler persists across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_ceremony: Option<DateTime<Utc>>,
    /// Last time persona affect levels were decayed.
    pub last_decay: Option<DateTime<Utc>>,
}

/// A serializable snapshot of the whole store plus its last-updated timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub human: HumanEntity,
    pub personas: Vec<PersonaEntity>,
    /// Message logs keyed by persona id.
    pub messages: BTreeMap<String, Vec<Message>>,
    #[serde(default)]
    pub extraction: Vec<ExtractionState>,
    #[serde(default)]
    pub validations: Vec<PendingValidation>,
    #[serde(default)]
    pub quotes: Vec<Quote>,
    #[serde(default)]
    pub scheduler: SchedulerState,
    /// Pending queue work carried for crash recovery.
    #[serde(default)]
    pub queue: Vec<LlmQueueItem>,
    pub last_updated: DateTime<Utc>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            human: HumanEntity::default(),
            personas: Vec::new(),
            messages: BTreeMap::new(),
            extraction: Vec::new(),
            validations: Vec::new(),
            quotes: Vec::new(),
            scheduler: SchedulerState::default(),
            queue: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn persona() -> PersonaEntity {
        let now = Utc::now();
        PersonaEntity {
            id: "persona-1".to_string(),
            kind: PersonaKind::Companion,
            aliases: vec!["Sage".to_string(), "S".to_string()],
            short_description: String::new(),
            long_description: String::new(),
            traits: Vec::new(),
            topics: Vec::new(),
            group_primary: Some("work".to_string()),
            groups_visible: vec!["books".to_string()],
            is_paused: false,
            pause_until: None,
            is_archived: false,
            archived_at: None,
            context_boundary: None,
            heartbeat_delay_ms: None,
            last_activity: None,
            last_heartbeat: None,
            created_at: now,
            last_updated: now,
        }
    }

    #[test]
    fn test_persona_data_types_exclude_fact_and_person() {
        let types = EntityRef::Persona("p".to_string()).data_types();
        assert_eq!(types, vec![DataType::Trait, DataType::Topic]);
        assert_eq!(EntityRef::Human.data_types().len(), 4);
    }

    #[test]
    fn test_desire_gap() {
        let topic = Topic::new("chess", "").with_levels(0.2, 0.7);
        assert!((topic.desire_gap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_alias_matching_is_case_insensitive() {
        let p = persona();
        assert!(p.has_alias("sage"));
        assert!(p.has_alias("s"));
        assert!(!p.has_alias("sag"));
        assert_eq!(p.display_name(), "Sage");
    }

    #[test]
    fn test_pause_until_expires() {
        let now = Utc::now();
        let mut p = persona();
        p.is_paused = true;
        p.pause_until = Some(now + Duration::minutes(5));
        assert!(p.is_paused_at(now));
        assert!(!p.is_paused_at(now + Duration::minutes(6)));

        p.pause_until = None;
        assert!(p.is_paused_at(now + Duration::days(365)));
    }

    #[test]
    fn test_group_visibility() {
        let p = persona();
        assert!(p.can_see(&[]));
        assert!(p.can_see(&["work".to_string()]));
        assert!(p.can_see(&["books".to_string()]));
        assert!(!p.can_see(&["family".to_string()]));
    }

    #[test]
    fn test_snapshot_serde_defaults() {
        let json = serde_json::json!({
            "version": 1,
            "human": {"facts": [], "traits": [], "topics": [], "people": []},
            "personas": [],
            "messages": {},
            "last_updated": "2026-01-01T00:00:00Z"
        });
        let snapshot: StateSnapshot = serde_json::from_value(json).unwrap();
        assert!(snapshot.queue.is_empty());
        assert!(snapshot.scheduler.last_ceremony.is_none());
    }
}

//! Core data types for the replication engine.
//!
//! The four tracked entity kinds, their typed SoR records, validated
//! identifiers, and the transient change events that flow from the store
//! hooks into the sync queue.
//!
//! # Data Flow
//!
//! ```text
//! SoR mutation ──▶ ChangeEvent ──▶ QueuedOperation ──▶ re-fetch ──▶ mirror files
//!   (store hook)    (capture)        (queue buffer)      (sync)       (mirror)
//! ```
//!
//! Records serialize with the camelCase field names used in the mirror tree,
//! so a record read back from a mirror file decodes into the same struct.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MirrorError;

/// The fixed set of entity kinds that are replicated into the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Owner,
    Answer,
    AssistRelation,
    ChatSession,
}

impl EntityKind {
    /// Registration table: every kind that gets a capture hook, in audit order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Owner,
        EntityKind::Answer,
        EntityKind::AssistRelation,
        EntityKind::ChatSession,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Owner => "owner",
            EntityKind::Answer => "answer",
            EntityKind::AssistRelation => "assist_relation",
            EntityKind::ChatSession => "chat_session",
        }
    }

    /// Human label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Owner => "Owners",
            EntityKind::Answer => "Answers",
            EntityKind::AssistRelation => "AssistRelations",
            EntityKind::ChatSession => "ChatSessions",
        }
    }

    /// SQLite table backing this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Owner => "owners",
            EntityKind::Answer => "answers",
            EntityKind::AssistRelation => "assist_relations",
            EntityKind::ChatSession => "chat_sessions",
        }
    }

    /// Document field holding the record's identifier.
    pub fn id_field(&self) -> &'static str {
        match self {
            EntityKind::Owner | EntityKind::Answer => "id",
            EntityKind::AssistRelation => "relationId",
            EntityKind::ChatSession => "sessionId",
        }
    }

    /// Document field naming the owner whose mirror directory the record
    /// belongs to.
    pub fn owner_field(&self) -> &'static str {
        match self {
            EntityKind::Owner => "id",
            EntityKind::Answer => "targetUserId",
            EntityKind::AssistRelation => "targetId",
            EntityKind::ChatSession => "targetUserId",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind '{}'", s))
    }
}

/// Kind of SoR mutation observed by a capture hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Save,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Save => f.write_str("save"),
            Operation::Delete => f.write_str("delete"),
        }
    }
}

/// Buffer key for an entity: `entityType:id`.
pub fn queue_key(kind: EntityKind, id: &str) -> String {
    format!("{}:{}", kind, id)
}

/// A single post-mutation notification.
///
/// The payload is advisory; the sync path always re-reads the SoR.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub id: String,
    pub operation: Operation,
    pub payload: Option<Value>,
}

impl ChangeEvent {
    pub fn save(kind: EntityKind, id: impl Into<String>, document: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            operation: Operation::Save,
            payload: Some(document),
        }
    }

    pub fn delete(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            operation: Operation::Delete,
            payload: None,
        }
    }

    pub fn key(&self) -> String {
        queue_key(self.kind, &self.id)
    }
}

/// The last-received operation buffered for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub kind: EntityKind,
    pub id: String,
    pub operation: Operation,
    pub payload: Option<Value>,
}

impl QueuedOperation {
    pub fn key(&self) -> String {
        queue_key(self.kind, &self.id)
    }
}

impl From<ChangeEvent> for QueuedOperation {
    fn from(event: ChangeEvent) -> Self {
        Self {
            kind: event.kind,
            id: event.id,
            operation: event.operation,
            payload: event.payload,
        }
    }
}

// ============ Identifiers ============

/// Directory names at the mirror root that never name an owner.
pub const RESERVED_DIRS: [&str; 2] = ["answers", "chatSessions"];

const MAX_ID_LEN: usize = 128;

fn validate_segment(
    what: &'static str,
    value: &str,
    reserved: &[&str],
) -> Result<(), MirrorError> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.len() > MAX_ID_LEN {
        Some("is too long")
    } else if value.starts_with('.') {
        Some("must not start with '.'")
    } else if value
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    {
        Some("contains a path separator or control character")
    } else if reserved.contains(&value) {
        Some("is a reserved directory name")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(MirrorError::InvalidId {
            what,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident, $what:literal, $reserved:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: impl Into<String>) -> Result<Self, MirrorError> {
                let value = value.into();
                validate_segment($what, &value, $reserved)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = MirrorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = MirrorError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

record_id!(
    /// Identifier of an owner; doubles as the owner's mirror directory name.
    OwnerId,
    "owner id",
    &RESERVED_DIRS
);
record_id!(AnswerId, "answer id", &[]);
record_id!(RelationId, "relation id", &[]);
record_id!(SessionId, "session id", &[]);

// ============ Records ============

/// A typed SoR record of one entity kind.
pub trait Record: Serialize + serde::de::DeserializeOwned + Send + Sync {
    const KIND: EntityKind;

    fn record_id(&self) -> &str;
}

/// Owner identity and profile fields, stored as `profile.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerProfile {
    pub id: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profile: Map<String, Value>,
}

impl OwnerProfile {
    /// A bare profile used when an owner is recovered without `profile.json`.
    pub fn bare(id: OwnerId) -> Self {
        let now = Utc::now();
        Self {
            id,
            email: None,
            unique_code: None,
            name: None,
            created_at: Some(now),
            updated_at: Some(now),
            last_login: None,
            profile: Map::new(),
        }
    }
}

/// Companion sub-documents; each one maps to its own mirror file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_card: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stranger_sentiments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversations_as_target: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistants_guidelines: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    #[serde(flatten)]
    pub profile: OwnerProfile,
    #[serde(default)]
    pub companion: CompanionData,
}

impl OwnerRecord {
    pub fn id(&self) -> &OwnerId {
        &self.profile.id
    }
}

impl Record for OwnerRecord {
    const KIND: EntityKind = EntityKind::Owner;

    fn record_id(&self) -> &str {
        self.profile.id.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionLayer {
    Basic,
    Emotional,
}

impl QuestionLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionLayer::Basic => "basic",
            QuestionLayer::Emotional => "emotional",
        }
    }
}

/// Who answered a question relative to the owner it describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerRelationship {
    #[default]
    #[serde(rename = "self")]
    SelfAnswer,
    Family,
    Friend,
}

impl AnswerRelationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerRelationship::SelfAnswer => "self",
            AnswerRelationship::Family => "family",
            AnswerRelationship::Friend => "friend",
        }
    }
}

/// A free-text questionnaire answer about `owner_id`, written by
/// `contributor_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub id: AnswerId,
    #[serde(rename = "userId")]
    pub contributor_id: OwnerId,
    #[serde(rename = "targetUserId")]
    pub owner_id: OwnerId,
    pub question_id: String,
    #[serde(default)]
    pub question_text: String,
    #[serde(default)]
    pub question_order: u32,
    pub question_layer: QuestionLayer,
    #[serde(default, rename = "relationshipType")]
    pub relationship: AnswerRelationship,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_nickname: Option<String>,
    pub answer: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for AnswerRecord {
    const KIND: EntityKind = EntityKind::Answer;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistRelationRecord {
    #[serde(rename = "relationId")]
    pub id: RelationId,
    pub assistant_id: OwnerId,
    pub target_id: OwnerId,
    pub relationship_type: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for AssistRelationRecord {
    const KIND: EntityKind = EntityKind::AssistRelation;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

fn default_true() -> bool {
    true
}

fn default_sentiment() -> f64 {
    50.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSessionRecord {
    pub session_id: SessionId,
    pub target_user_id: OwnerId,
    pub interlocutor_user_id: OwnerId,
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assist_relation_id: Option<RelationId>,
    #[serde(default = "default_sentiment")]
    pub sentiment_score: f64,
    #[serde(default)]
    pub messages: Vec<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for ChatSessionRecord {
    const KIND: EntityKind = EntityKind::ChatSession;

    fn record_id(&self) -> &str {
        self.session_id.as_str()
    }
}

/// Outcome of writing a document into the SoR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

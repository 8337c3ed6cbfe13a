//! Record types persisted by the memory store
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::MemoryError;

/// Free-form annotation value. Closed set of variants so serialization is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

pub type Metadata = BTreeMap<String, MetadataValue>;

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Integer(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            other => Err(MemoryError::validation(format!("unknown conversation status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Agent,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Agent => "agent",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "agent" | "assistant" => Ok(Role::Agent),
            "tool" => Ok(Role::Tool),
            other => Err(MemoryError::validation(format!("unknown message role '{}'", other))),
        }
    }
}

/// A conversation thread owned by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single message. Ids are assigned by the store and increase with
/// insertion order, which is the canonical message order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Metadata,
    pub summarized: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub category: String,
    pub title: String,
    pub content: String,
    pub tags: BTreeSet<String>,
    /// Advisory back-reference; never dereferenced for correctness.
    pub source_conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compact replacement for a contiguous block of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub conversation_id: String,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub message_count: i64,
    pub text: String,
    /// Knowledge entries extracted alongside this summary. Advisory.
    pub knowledge_entry_ids: Vec<String>,
    pub compression_ratio: f32,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn covers(&self, message_id: i64) -> bool {
        (self.start_message_id..=self.end_message_id).contains(&message_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub status: Option<ConversationStatus>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewKnowledgeEntry {
    pub category: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeUpdate {
    pub category: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_conversations: i64,
    pub active_conversations: i64,
    pub total_messages: i64,
    pub live_messages: i64,
    pub total_summaries: i64,
    pub total_knowledge: i64,
    pub database_size_bytes: i64,
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Canonical timestamp encoding; fixed width so that text comparison in SQL
/// matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_serializes_as_plain_json() {
        let mut metadata = Metadata::new();
        metadata.insert("channel".into(), "slack".into());
        metadata.insert("priority".into(), 3i64.into());
        metadata.insert("pinned".into(), true.into());
        metadata.insert("extra".into(), MetadataValue::Null);

        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"channel":"slack","extra":null,"pinned":true,"priority":3}"#);

        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn test_metadata_distinguishes_integer_and_float() {
        let value: MetadataValue = serde_json::from_str("2").unwrap();
        assert_eq!(value, MetadataValue::Integer(2));
        let value: MetadataValue = serde_json::from_str("2.5").unwrap();
        assert_eq!(value, MetadataValue::Float(2.5));
        let value: MetadataValue = serde_json::from_str(r#"{"a":[1,"b"]}"#).unwrap();
        assert!(matches!(value, MetadataValue::Map(_)));
    }

    #[test]
    fn test_role_parsing_accepts_assistant_alias() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Agent);
        assert_eq!("tool".parse::<Role>().unwrap(), Role::Tool);
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn test_summary_range_checks() {
        let summary = Summary {
            id: "s".into(),
            conversation_id: "c".into(),
            start_message_id: 10,
            end_message_id: 20,
            message_count: 11,
            text: String::new(),
            knowledge_entry_ids: vec![],
            compression_ratio: 0.1,
            created_at: Utc::now(),
        };
        assert!(summary.covers(10));
        assert!(summary.covers(20));
        assert!(!summary.covers(21));
    }

    #[test]
    fn test_timestamp_encoding_sorts_chronologically() {
        let early = now();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(parse_timestamp(&format_timestamp(&early)), Some(early));
        assert!(parse_timestamp("2024-01-02 03:04:05").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}

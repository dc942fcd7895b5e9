//! Common types used across Syncflow
//!
//! A [`Record`] is one unit of source data moving through a sync. It carries a
//! stable identity key (the upsert key at the destination), a type tag used
//! for routing, the chain of ancestors it was extracted under, and an
//! arbitrary JSON payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::hash_json;
use crate::error::{Result, SyncflowError};

/// Payload fields considered embeddable text, in priority order
const TEXT_FIELDS: &[&str] = &["title", "name", "content", "text", "body", "description"];

/// Stable identity of a record at the destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// SHA-256 of a record's canonical content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an ancestor record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub key: RecordKey,
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Breadcrumb {
    pub fn new(key: impl Into<RecordKey>, record_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            record_type: record_type.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One unit of extracted data in flight through a sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub record_type: String,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(
        key: impl Into<RecordKey>,
        record_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            record_type: record_type.into(),
            breadcrumbs: Vec::new(),
            payload,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_breadcrumbs(mut self, breadcrumbs: Vec<Breadcrumb>) -> Self {
        self.breadcrumbs = breadcrumbs;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Breadcrumb pointing at this record
    pub fn breadcrumb(&self) -> Breadcrumb {
        Breadcrumb {
            key: self.key.clone(),
            record_type: self.record_type.clone(),
            name: self.display_name(),
        }
    }

    /// Derive a child record that inherits this record's ancestry and timestamps
    pub fn child(
        &self,
        key: impl Into<RecordKey>,
        record_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Record {
        let mut breadcrumbs = self.breadcrumbs.clone();
        breadcrumbs.push(self.breadcrumb());
        Record {
            key: key.into(),
            record_type: record_type.into(),
            breadcrumbs,
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Most recent modification time known for this record
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }

    /// Human-readable name taken from the payload, if any
    pub fn display_name(&self) -> Option<String> {
        ["title", "name"]
            .iter()
            .find_map(|field| self.payload.get(*field).and_then(|v| v.as_str()))
            .map(str::to_string)
    }

    /// Hash of the content that determines whether a destination write is needed
    ///
    /// Timestamps are excluded: a record touched upstream without a content
    /// change must not be rewritten.
    pub fn content_hash(&self) -> Result<ContentHash> {
        let hash = hash_json(&(&self.record_type, &self.breadcrumbs, &self.payload))?;
        Ok(ContentHash(hash))
    }

    /// Text handed to the embedder
    ///
    /// The breadcrumb path comes first so that children carry their parents'
    /// context, followed by the known text fields of the payload. Payloads
    /// without any known text field fall back to their JSON encoding.
    pub fn embeddable_text(&self) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();

        let path: Vec<&str> = self
            .breadcrumbs
            .iter()
            .map(|b| b.name.as_deref().unwrap_or_else(|| b.key.as_str()))
            .collect();
        if !path.is_empty() {
            parts.push(path.join(" > "));
        }

        let fields: Vec<&str> = TEXT_FIELDS
            .iter()
            .filter_map(|field| self.payload.get(*field).and_then(|v| v.as_str()))
            .filter(|s| !s.trim().is_empty())
            .collect();

        if fields.is_empty() {
            if self.payload.is_null() {
                return Err(SyncflowError::InvalidRecord(format!(
                    "record {} has no embeddable content",
                    self.key
                )));
            }
            parts.push(serde_json::to_string(&self.payload)?);
        } else {
            parts.extend(fields.into_iter().map(str::to_string));
        }

        Ok(parts.join("\n"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_inherits_breadcrumbs() {
        let project = Record::new("p1", "project", json!({"name": "Apollo"}));
        let task = project.child("t1", "task", json!({"title": "Launch"}));
        let comment = task.child("c1", "comment", json!({"body": "done"}));

        assert_eq!(comment.breadcrumbs.len(), 2);
        assert_eq!(comment.breadcrumbs[0].key.as_str(), "p1");
        assert_eq!(comment.breadcrumbs[1].name.as_deref(), Some("Launch"));
    }

    #[test]
    fn test_content_hash_ignores_timestamps() {
        let a = Record::new("t1", "task", json!({"title": "x"}));
        let b = a.clone().with_updated_at(Utc::now());
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());

        let c = Record::new("t1", "task", json!({"title": "y"}));
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn test_embeddable_text_uses_path_and_fields() {
        let parent = Record::new("p1", "project", json!({"name": "Apollo"}));
        let task = parent.child("t1", "task", json!({"title": "Launch", "content": "Go for launch"}));
        assert_eq!(task.embeddable_text().unwrap(), "Apollo\nLaunch\nGo for launch");
    }

    #[test]
    fn test_embeddable_text_falls_back_to_json() {
        let record = Record::new("m1", "metric", json!({"value": 3}));
        assert_eq!(record.embeddable_text().unwrap(), r#"{"value":3}"#);

        let empty = Record::new("m2", "metric", serde_json::Value::Null);
        assert!(empty.embeddable_text().is_err());
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let record: Record =
            serde_json::from_str(r#"{"key":"t1","record_type":"task"}"#).unwrap();
        assert!(record.breadcrumbs.is_empty());
        assert!(record.payload.is_null());
        assert!(record.last_modified().is_none());
    }
}

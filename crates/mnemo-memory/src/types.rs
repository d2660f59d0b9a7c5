use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Internal, index-compatible identifier bound 1:1 to a stable id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct NumericId(pub i64);

impl std::fmt::Display for NumericId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input to [`crate::MemoryService::add`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRecord {
    /// Caller-supplied stable id. A UUID is generated when absent.
    #[serde(default, alias = "message_id")]
    pub stable_id: Option<String>,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    /// ISO-8601 timestamp; the current UTC time is used when absent.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewRecord {
    #[must_use]
    pub fn new(
        conversation_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role: role.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, stable_id: impl Into<String>) -> Self {
        self.stable_id = Some(stable_id.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A record as held by the metadata catalogue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub stable_id: String,
    pub numeric_id: NumericId,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub tags: BTreeSet<String>,
}

/// One entry of a `search` or `search_by_tag` result.
///
/// `score` is the raw inner-product similarity for semantic search and
/// `None` for tag scans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryHit {
    pub stable_id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub tags: Vec<String>,
    pub score: Option<f32>,
}

impl MemoryHit {
    #[must_use]
    pub fn from_record(record: &StoredRecord, score: Option<f32>) -> Self {
        Self {
            stable_id: record.stable_id.clone(),
            conversation_id: record.conversation_id.clone(),
            role: record.role.clone(),
            content: record.content.clone(),
            timestamp: record.timestamp.clone(),
            tags: record.tags.iter().cloned().collect(),
            score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddStatus {
    Added,
    Replaced,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    pub status: AddStatus,
    pub numeric_id: NumericId,
}

/// Trim tags, drop empty ones and collapse duplicates.
#[must_use]
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.as_ref().trim())
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Current UTC time as an RFC 3339 timestamp with millisecond precision.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_id_display() {
        assert_eq!(format!("{}", NumericId(42)), "42");
    }

    #[test]
    fn numeric_id_orders_by_value() {
        assert!(NumericId(1) < NumericId(2));
    }

    #[test]
    fn normalize_tags_trims_and_dedupes() {
        let tags = normalize_tags(&[" greeting", "greeting", "", "  ", "farewell "]);
        let expected: BTreeSet<String> = ["farewell", "greeting"].map(String::from).into();
        assert_eq!(tags, expected);
    }

    #[test]
    fn normalize_tags_keeps_case() {
        let tags = normalize_tags(&["Work", "work"]);
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn add_status_serializes_lowercase() {
        let json = serde_json::to_string(&AddOutcome {
            status: AddStatus::Exists,
            numeric_id: NumericId(3),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"exists","numeric_id":3}"#);
    }

    #[test]
    fn new_record_accepts_message_id_alias() {
        let record: NewRecord = serde_json::from_str(
            r#"{"message_id":"m1","conversation_id":"c","role":"user","content":"hi"}"#,
        )
        .unwrap();
        assert_eq!(record.stable_id.as_deref(), Some("m1"));
        assert!(record.tags.is_empty());
        assert!(record.timestamp.is_none());
    }

    #[test]
    fn now_timestamp_is_rfc3339() {
        let ts = now_timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn hit_from_record_copies_fields() {
        let record = StoredRecord {
            stable_id: "s".into(),
            numeric_id: NumericId(1),
            conversation_id: "c".into(),
            role: "user".into(),
            content: "hello".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            tags: normalize_tags(&["b", "a"]),
        };
        let hit = MemoryHit::from_record(&record, Some(0.5));
        assert_eq!(hit.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(hit.score, Some(0.5));
    }

    #[test]
    fn add_status_replaced_serializes_lowercase() {
        let json = serde_json::to_string(&AddOutcome {
            status: AddStatus::Replaced,
            numeric_id: NumericId(7),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"replaced","numeric_id":7}"#);
    }
}

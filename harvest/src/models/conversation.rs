use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Attributes = serde_json::Map<String, serde_json::Value>;

pub const PART_LIST_TYPE: &str = "conversation_part.list";

/// A conversation in canonical form, as handed to downstream consumers.
///
/// Built from a search result item, then progressively filled in by
/// enrichment. Consumers must check `enrichment` rather than assume any
/// sub-entity is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub contacts: Vec<ParticipantRef>,
    #[serde(default)]
    pub conversation_parts: ConversationParts,
    pub owner_id: Option<String>,
    pub owner: Option<OwnerProfile>,
    #[serde(default)]
    pub custom_attributes: Attributes,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub statistics: Attributes,
    pub rating: Option<Rating>,
    #[serde(default)]
    pub enrichment: EnrichmentFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub external_id: Option<String>,
}

/// Canonical message-part container. Upstream sends either a bare list or a
/// wrapped object; both are folded into this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationParts {
    #[serde(rename = "type")]
    pub kind: String,
    pub conversation_parts: Vec<serde_json::Value>,
    pub total_count: usize,
}

impl Default for ConversationParts {
    fn default() -> Self {
        Self {
            kind: PART_LIST_TYPE.to_string(),
            conversation_parts: Vec::new(),
            total_count: 0,
        }
    }
}

impl ConversationParts {
    pub fn from_parts(parts: Vec<serde_json::Value>, total_count: Option<usize>) -> Self {
        let total_count = total_count.unwrap_or(parts.len()).max(parts.len());
        Self {
            kind: PART_LIST_TYPE.to_string(),
            conversation_parts: parts,
            total_count,
        }
    }

    pub fn len(&self) -> usize {
        self.conversation_parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversation_parts.is_empty()
    }
}

/// Profile of the admin who owns (is assigned to) a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerProfile {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub job_title: Option<String>,
    pub away_mode_enabled: Option<bool>,
    #[serde(default)]
    pub groups: Vec<OwnerGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerGroup {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rating {
    pub rating: Option<i64>,
    pub remark: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Which enrichment sub-fetches landed for a record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrichmentFlags {
    pub body: bool,
    pub owner: bool,
    pub groups: bool,
}

impl EnrichmentFlags {
    pub fn is_complete(&self) -> bool {
        self.body && self.owner && self.groups
    }
}

impl ConversationRecord {
    /// A bare record with only the required fields set.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            updated_at: None,
            state: None,
            title: None,
            contacts: Vec::new(),
            conversation_parts: ConversationParts::default(),
            owner_id: None,
            owner: None,
            custom_attributes: Attributes::new(),
            tags: Vec::new(),
            statistics: Attributes::new(),
            rating: None,
            enrichment: EnrichmentFlags::default(),
        }
    }
}

//! Wire shapes returned by the remote API and the single conversion point
//! into the canonical model.
//!
//! Everything here is deliberately loose: ids may arrive as strings or
//! numbers, timestamps in several encodings, and list containers either bare
//! or wrapped. Nothing outside this module should look at these types.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{HarvestError, Result};
use crate::models::{
    Attributes, ConversationParts, ConversationRecord, OwnerGroup, OwnerProfile, ParticipantRef,
    Rating,
};
use crate::pipeline::dates::normalize_timestamp;

/// Timestamp as it appears on the wire.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawTimestamp {
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConversation {
    pub id: Option<Value>,
    pub created_at: Option<RawTimestamp>,
    pub updated_at: Option<RawTimestamp>,
    pub state: Option<String>,
    pub title: Option<String>,
    pub contacts: Option<ProviderContacts>,
    pub admin_assignee_id: Option<Value>,
    pub conversation_parts: Option<ProviderParts>,
    pub custom_attributes: Option<Attributes>,
    pub tags: Option<ProviderTags>,
    pub statistics: Option<Attributes>,
    pub conversation_rating: Option<ProviderRating>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderParts {
    List(Vec<Value>),
    Wrapped {
        #[serde(default)]
        conversation_parts: Vec<Value>,
        total_count: Option<usize>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderContacts {
    List(Vec<ProviderContact>),
    Wrapped {
        #[serde(default)]
        contacts: Vec<ProviderContact>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderContact {
    pub id: Option<Value>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderTags {
    List(Vec<ProviderTag>),
    Wrapped {
        #[serde(default)]
        tags: Vec<ProviderTag>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderTag {
    Name(String),
    Object { name: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRating {
    pub rating: Option<i64>,
    pub remark: Option<String>,
    pub created_at: Option<RawTimestamp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAdmin {
    pub id: Value,
    pub name: Option<String>,
    pub email: Option<String>,
    pub job_title: Option<String>,
    pub away_mode_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTeam {
    pub id: Value,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderTeams {
    List(Vec<ProviderTeam>),
    Wrapped {
        #[serde(default)]
        teams: Vec<ProviderTeam>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSearchResponse {
    #[serde(default)]
    pub conversations: Vec<Value>,
    pub pages: Option<ProviderPages>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPages {
    pub next: Option<ProviderNextPage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderNextPage {
    Cursor { starting_after: Option<String> },
    Url(String),
}

impl ProviderNextPage {
    /// Pull the cursor out of either a cursor object or a next-page URL.
    pub fn cursor(&self) -> Option<String> {
        match self {
            ProviderNextPage::Cursor { starting_after } => {
                starting_after.clone().filter(|c| !c.is_empty())
            }
            ProviderNextPage::Url(raw) => url::Url::parse(raw).ok().and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "starting_after")
                    .map(|(_, v)| v.into_owned())
                    .filter(|c| !c.is_empty())
            }),
        }
    }
}

/// Render an id that may be a JSON string or number.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ProviderParts {
    pub fn normalize(self) -> ConversationParts {
        match self {
            ProviderParts::List(parts) => ConversationParts::from_parts(parts, None),
            ProviderParts::Wrapped {
                conversation_parts,
                total_count,
            } => ConversationParts::from_parts(conversation_parts, total_count),
        }
    }
}

impl ProviderContacts {
    fn into_refs(self) -> Vec<ParticipantRef> {
        let contacts = match self {
            ProviderContacts::List(contacts) => contacts,
            ProviderContacts::Wrapped { contacts } => contacts,
        };
        contacts
            .into_iter()
            .filter_map(|c| {
                Some(ParticipantRef {
                    id: c.id.as_ref().and_then(id_string)?,
                    kind: c.kind,
                    external_id: c.external_id,
                })
            })
            .collect()
    }
}

impl ProviderTags {
    fn into_names(self) -> Vec<String> {
        let tags = match self {
            ProviderTags::List(tags) => tags,
            ProviderTags::Wrapped { tags } => tags,
        };
        tags.into_iter()
            .map(|t| match t {
                ProviderTag::Name(name) => name,
                ProviderTag::Object { name } => name,
            })
            .collect()
    }
}

impl ProviderConversation {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| HarvestError::Mapping(format!("Unrecognized conversation shape: {e}")))
    }

    pub fn owner_id(&self) -> Option<String> {
        self.admin_assignee_id.as_ref().and_then(id_string)
    }
}

/// Convert a provider conversation into the canonical record.
///
/// Fails when the id is missing or `created_at` cannot be interpreted; both
/// are required to place the record in a window and deduplicate it.
pub fn to_canonical(raw: ProviderConversation) -> Result<ConversationRecord> {
    let id = raw
        .id
        .as_ref()
        .and_then(id_string)
        .ok_or_else(|| HarvestError::Mapping("Conversation has no id".to_string()))?;

    let created_at = raw
        .created_at
        .as_ref()
        .and_then(normalize_timestamp)
        .ok_or_else(|| {
            HarvestError::Mapping(format!(
                "Conversation {id} has missing or unparseable created_at: {:?}",
                raw.created_at
            ))
        })?;

    let owner_id = raw.owner_id();
    let mut record = ConversationRecord::new(id, created_at);
    record.updated_at = raw.updated_at.as_ref().and_then(normalize_timestamp);
    record.state = raw.state;
    record.title = raw.title;
    record.contacts = raw.contacts.map(ProviderContacts::into_refs).unwrap_or_default();
    record.conversation_parts = raw
        .conversation_parts
        .map(ProviderParts::normalize)
        .unwrap_or_default();
    record.owner_id = owner_id;
    record.custom_attributes = raw.custom_attributes.unwrap_or_default();
    record.tags = raw.tags.map(ProviderTags::into_names).unwrap_or_default();
    record.statistics = raw.statistics.unwrap_or_default();
    record.rating = raw.conversation_rating.map(|r| Rating {
        rating: r.rating,
        remark: r.remark,
        created_at: r.created_at.as_ref().and_then(normalize_timestamp),
    });

    Ok(record)
}

/// Merge a full conversation body into a record built from a search item.
///
/// Message parts come from the full body whenever it carries them. Other
/// fields only fill gaps so that a sparse body never erases data already on
/// the record.
pub fn apply_full_body(record: &mut ConversationRecord, full: ProviderConversation) {
    let owner_id = full.owner_id();

    if let Some(parts) = full.conversation_parts {
        record.conversation_parts = parts.normalize();
    }

    if record.owner_id.is_none() {
        record.owner_id = owner_id;
    }
    if let Some(updated) = full.updated_at.as_ref().and_then(normalize_timestamp) {
        if record.updated_at.map_or(true, |current| updated > current) {
            record.updated_at = Some(updated);
        }
    }
    if record.state.is_none() {
        record.state = full.state;
    }
    if record.title.is_none() {
        record.title = full.title;
    }
    if record.contacts.is_empty() {
        record.contacts = full.contacts.map(ProviderContacts::into_refs).unwrap_or_default();
    }
    if record.custom_attributes.is_empty() {
        record.custom_attributes = full.custom_attributes.unwrap_or_default();
    }
    if record.tags.is_empty() {
        record.tags = full.tags.map(ProviderTags::into_names).unwrap_or_default();
    }
    if record.statistics.is_empty() {
        record.statistics = full.statistics.unwrap_or_default();
    }
    if record.rating.is_none() {
        record.rating = full.conversation_rating.map(|r| Rating {
            rating: r.rating,
            remark: r.remark,
            created_at: r.created_at.as_ref().and_then(normalize_timestamp),
        });
    }
}

pub fn owner_to_canonical(admin: ProviderAdmin) -> Result<OwnerProfile> {
    let id = id_string(&admin.id)
        .ok_or_else(|| HarvestError::Mapping("Admin has no id".to_string()))?;
    Ok(OwnerProfile {
        id,
        name: admin.name,
        email: admin.email,
        job_title: admin.job_title,
        away_mode_enabled: admin.away_mode_enabled,
        groups: Vec::new(),
    })
}

pub fn groups_to_canonical(teams: ProviderTeams) -> Vec<OwnerGroup> {
    let teams = match teams {
        ProviderTeams::List(teams) => teams,
        ProviderTeams::Wrapped { teams } => teams,
    };
    teams
        .into_iter()
        .filter_map(|t| {
            Some(OwnerGroup {
                id: id_string(&t.id)?,
                name: t.name,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn conversation(value: Value) -> ProviderConversation {
        ProviderConversation::from_value(value).expect("valid conversation")
    }

    #[test]
    fn test_to_canonical_maps_core_fields() {
        let raw = conversation(json!({
            "id": 12345,
            "created_at": 1709294400,
            "updated_at": "2024-03-01T13:00:00+01:00",
            "state": "closed",
            "admin_assignee_id": 77,
            "contacts": {
                "type": "contact.list",
                "contacts": [{"id": "u1", "type": "user", "external_id": "ext-1"}]
            },
            "tags": {"type": "tag.list", "tags": [{"id": "t1", "name": "billing"}]},
            "custom_attributes": {"plan": "pro"},
            "statistics": {"count_reopens": 1},
            "conversation_rating": {"rating": 5, "remark": "great", "created_at": 1709298000}
        }));

        let record = to_canonical(raw).expect("mapping should succeed");
        assert_eq!(record.id, "12345");
        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            record.updated_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(record.owner_id.as_deref(), Some("77"));
        assert_eq!(record.contacts[0].id, "u1");
        assert_eq!(record.tags, vec!["billing".to_string()]);
        assert_eq!(record.custom_attributes["plan"], "pro");
        assert_eq!(record.rating.as_ref().and_then(|r| r.rating), Some(5));
        assert!(!record.enrichment.body);
    }

    #[test]
    fn test_to_canonical_requires_id_and_created_at() {
        let missing_id = conversation(json!({"created_at": 1709294400}));
        assert!(matches!(to_canonical(missing_id), Err(HarvestError::Mapping(_))));

        let bad_ts = conversation(json!({"id": "c1", "created_at": "yesterday-ish"}));
        assert!(matches!(to_canonical(bad_ts), Err(HarvestError::Mapping(_))));
    }

    #[test]
    fn test_parts_bare_list_and_wrapped_normalize_identically() {
        let bare = conversation(json!({
            "id": "c1",
            "conversation_parts": [{"id": "p1"}, {"id": "p2"}]
        }));
        let wrapped = conversation(json!({
            "id": "c1",
            "conversation_parts": {
                "type": "conversation_part.list",
                "conversation_parts": [{"id": "p1"}, {"id": "p2"}],
                "total_count": 2
            }
        }));

        let bare_parts = bare.conversation_parts.map(ProviderParts::normalize);
        let wrapped_parts = wrapped.conversation_parts.map(ProviderParts::normalize);
        assert_eq!(bare_parts, wrapped_parts);
        assert_eq!(bare_parts.map(|p| p.total_count), Some(2));
    }

    #[test]
    fn test_apply_full_body_keeps_existing_fields() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut record = ConversationRecord::new("c1", created);
        record.tags = vec!["vip".to_string()];

        let full = conversation(json!({
            "id": "c1",
            "admin_assignee_id": "42",
            "tags": ["other"],
            "conversation_parts": {"conversation_parts": [{"id": "p1", "body": "hi"}]}
        }));
        apply_full_body(&mut record, full);

        assert_eq!(record.tags, vec!["vip".to_string()]);
        assert_eq!(record.owner_id.as_deref(), Some("42"));
        assert_eq!(record.conversation_parts.len(), 1);
    }

    #[test]
    fn test_apply_full_body_without_parts_keeps_existing_parts() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut record = ConversationRecord::new("c1", created);
        record.conversation_parts =
            ConversationParts::from_parts(vec![json!({"id": "p1"}), json!({"id": "p2"})], None);

        apply_full_body(&mut record, conversation(json!({ "id": "c1", "state": "open" })));

        assert_eq!(record.conversation_parts.len(), 2);
        assert_eq!(record.state.as_deref(), Some("open"));
    }

    #[test]
    fn test_next_page_cursor_from_url() {
        let next = ProviderNextPage::Url(
            "https://api.example.com/conversations/search?per_page=50&starting_after=abc%3D%3D"
                .to_string(),
        );
        assert_eq!(next.cursor().as_deref(), Some("abc=="));

        let next = ProviderNextPage::Cursor {
            starting_after: Some(String::new()),
        };
        assert_eq!(next.cursor(), None);
    }

    #[test]
    fn test_groups_accept_bare_and_wrapped() {
        let wrapped: ProviderTeams =
            serde_json::from_value(json!({"teams": [{"id": 1, "name": "Support"}]})).unwrap();
        let bare: ProviderTeams =
            serde_json::from_value(json!([{"id": "1", "name": "Support"}])).unwrap();

        assert_eq!(groups_to_canonical(wrapped), groups_to_canonical(bare));
    }
}

//! # Domain Types
//!
//! Core domain types used throughout LeadSync.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Lead       │   │    Contact      │   │    Pipeline     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (EntityId)  │   │  id             │   │  id             │       │
//! │  │  pipeline_id    │   │  name           │   │  name           │       │
//! │  │  status_id      │   │  phone (custom) │   │  statuses[]     │       │
//! │  │  price          │   └─────────────────┘   └─────────────────┘       │
//! │  │  custom fields  │                                                    │
//! │  │  _embedded      │   ┌─────────────────┐   ┌─────────────────┐       │
//! │  └─────────────────┘   │   LeadChange    │   │ StatusChange    │       │
//! │                        │  ─────────────  │   │ Event           │       │
//! │                        │  id, status_id  │   │  ─────────────  │       │
//! │                        │  pipeline_id    │   │  entity_id      │       │
//! │                        │  action         │   │  before / after │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identifier Newtypes
//! The CRM numbers everything with plain integers. Each kind of id gets its own
//! newtype so a status id can never be passed where a pipeline id is expected.
//! Zero means "unset" on the wire and is kept that way here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw CRM id.
            #[inline]
            pub const fn new(raw: u64) -> Self {
                $name(raw)
            }

            /// Returns the raw CRM id.
            #[inline]
            pub const fn get(&self) -> u64 {
                self.0
            }

            /// The CRM uses `0` for "no value".
            #[inline]
            pub const fn is_unset(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(ValidationError::Required {
                        field: $field.to_string(),
                    });
                }
                trimmed
                    .parse::<u64>()
                    .map($name)
                    .map_err(|e| ValidationError::InvalidFormat {
                        field: $field.to_string(),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a lead (the tracked entity).
    EntityId,
    "id"
);
numeric_id!(
    /// Identifier of a pipeline status.
    StatusId,
    "status_id"
);
numeric_id!(
    /// Identifier of a pipeline.
    PipelineId,
    "pipeline_id"
);
numeric_id!(
    /// Identifier of a CRM user.
    UserId,
    "user_id"
);
numeric_id!(
    /// Identifier of a contact.
    ContactId,
    "contact_id"
);

// =============================================================================
// Custom Fields
// =============================================================================

/// One value of a custom field. Values arrive as strings, numbers or booleans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomFieldValue {
    #[serde(default)]
    pub value: serde_json::Value,
}

impl CustomFieldValue {
    /// Renders the value as sheet text. `null` becomes `None`.
    pub fn as_text(&self) -> Option<String> {
        match &self.value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Interprets the value as a Unix timestamp.
    pub fn as_epoch(&self) -> Option<i64> {
        match &self.value {
            serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            serde_json::Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse().ok()
            }
            _ => None,
        }
    }
}

/// A named custom attribute on a lead or contact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomField {
    #[serde(default)]
    pub field_id: Option<u64>,

    #[serde(default)]
    pub field_name: String,

    #[serde(default)]
    pub field_code: Option<String>,

    #[serde(default)]
    pub values: Option<Vec<CustomFieldValue>>,
}

impl CustomField {
    /// Field name with runs of whitespace collapsed ("Количество  1" → "Количество 1").
    pub fn normalized_name(&self) -> String {
        self.field_name.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// All values, empty when the CRM sent `null`.
    pub fn values(&self) -> &[CustomFieldValue] {
        self.values.as_deref().unwrap_or(&[])
    }

    /// Whether this is a phone field (by code or by name).
    pub fn is_phone(&self) -> bool {
        if self.field_code.as_deref() == Some("PHONE") {
            return true;
        }
        let upper = self.field_name.to_uppercase();
        upper == "PHONE" || upper == "ТЕЛЕФОН"
    }
}

// =============================================================================
// Contacts & Companies
// =============================================================================

/// A contact linked to a lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub id: ContactId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomField>>,
}

impl Contact {
    /// First phone value on the contact, if any.
    pub fn phone(&self) -> Option<String> {
        self.custom_fields_values
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter(|cf| cf.is_phone())
            .find_map(|cf| cf.values().first().and_then(CustomFieldValue::as_text))
            .filter(|p| !p.is_empty())
    }
}

/// A company linked to a lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Company {
    #[serde(default)]
    pub id: u64,

    #[serde(default)]
    pub name: String,
}

/// The `_embedded` block of a lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadEmbedded {
    #[serde(default)]
    pub contacts: Vec<Contact>,

    #[serde(default)]
    pub companies: Vec<Company>,
}

// =============================================================================
// Lead
// =============================================================================

/// A lead as returned by `GET /api/v4/leads/{id}`.
///
/// Always a freshly fetched copy. Webhook payloads are never deserialized
/// into this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lead {
    pub id: EntityId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub price: Option<i64>,

    #[serde(default)]
    pub pipeline_id: PipelineId,

    #[serde(default)]
    pub status_id: StatusId,

    #[serde(default)]
    pub responsible_user_id: UserId,

    /// Unix seconds.
    #[serde(default)]
    pub created_at: i64,

    /// Unix seconds.
    #[serde(default)]
    pub updated_at: i64,

    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomField>>,

    #[serde(rename = "_embedded", default)]
    pub embedded: LeadEmbedded,
}

impl Lead {
    /// Custom fields, empty when the CRM sent `null`.
    pub fn custom_fields(&self) -> &[CustomField] {
        self.custom_fields_values.as_deref().unwrap_or(&[])
    }

    /// Creation time, `None` when the CRM reported no timestamp.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        epoch_to_utc(self.created_at)
    }

    /// Contact display name: the last named contact, else the lead's own name.
    pub fn contact_name(&self) -> String {
        self.embedded
            .contacts
            .iter()
            .rev()
            .find(|c| !c.name.is_empty())
            .map(|c| c.name.clone())
            .unwrap_or_else(|| self.name.clone())
    }

    /// First phone found across the embedded contacts.
    pub fn contact_phone(&self) -> String {
        self.embedded
            .contacts
            .iter()
            .find_map(Contact::phone)
            .unwrap_or_default()
    }

    /// Name of the first embedded company.
    pub fn company_name(&self) -> String {
        self.embedded
            .companies
            .first()
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }
}

/// Converts CRM epoch seconds, treating `0` as absent.
pub fn epoch_to_utc(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

// =============================================================================
// Pipelines & Users
// =============================================================================

/// A status inside a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    #[serde(default)]
    pub id: StatusId,

    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineEmbedded {
    #[serde(default)]
    pub statuses: Vec<PipelineStatus>,
}

/// A pipeline with its statuses (`GET /api/v4/leads/pipelines?with=statuses`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub id: PipelineId,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "_embedded", default)]
    pub embedded: PipelineEmbedded,
}

impl Pipeline {
    pub fn statuses(&self) -> &[PipelineStatus] {
        &self.embedded.statuses
    }
}

/// A CRM user (for the "responsible" column).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,

    #[serde(default)]
    pub name: String,
}

// =============================================================================
// Status Change Events
// =============================================================================

/// Status reference inside an event's before/after value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LeadStatusRef {
    #[serde(default)]
    pub id: StatusId,

    #[serde(default)]
    pub pipeline_id: PipelineId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventValue {
    #[serde(default)]
    pub lead_status: Option<LeadStatusRef>,
}

/// One `lead_status_changed` entry from the CRM event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub entity_id: EntityId,

    /// Unix seconds.
    #[serde(default)]
    pub created_at: i64,

    #[serde(default)]
    pub value_before: Vec<EventValue>,

    #[serde(default)]
    pub value_after: Vec<EventValue>,
}

impl StatusChangeEvent {
    /// Status the lead left.
    pub fn from_status(&self) -> Option<LeadStatusRef> {
        self.value_before.first().and_then(|v| v.lead_status)
    }

    /// Status the lead entered.
    pub fn to_status(&self) -> Option<LeadStatusRef> {
        self.value_after.first().and_then(|v| v.lead_status)
    }
}

// =============================================================================
// Change Descriptor
// =============================================================================

/// Where a change descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// `leads[add]` form group or `_embedded.leads` entry.
    Add,
    /// `leads[update]` form group.
    Update,
    /// `leads[status]` form group.
    Status,
    /// Synthesized by the CRM catch-up poll.
    Poll,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Add => write!(f, "add"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Status => write!(f, "status"),
            ChangeAction::Poll => write!(f, "poll"),
        }
    }
}

impl FromStr for ChangeAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(ChangeAction::Add),
            "update" => Ok(ChangeAction::Update),
            "status" => Ok(ChangeAction::Status),
            other => Err(ValidationError::InvalidFormat {
                field: "action".into(),
                reason: format!("unknown lead action '{}'", other),
            }),
        }
    }
}

/// A normalized "this lead changed" notification.
///
/// Only the id is trusted. Status and pipeline are hints used for dedup and
/// classification before the authoritative re-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadChange {
    pub id: EntityId,
    pub status_id: StatusId,
    pub pipeline_id: PipelineId,
    pub action: ChangeAction,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parsing() {
        assert_eq!("555".parse::<EntityId>().unwrap(), EntityId::new(555));
        assert_eq!(" 42 ".parse::<StatusId>().unwrap(), StatusId::new(42));
        assert!("".parse::<EntityId>().is_err());
        assert!("abc".parse::<PipelineId>().is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&EntityId::new(7)).unwrap();
        assert_eq!(json, "7");
        let map: std::collections::HashMap<EntityId, u8> =
            serde_json::from_str(r#"{"7": 1}"#).unwrap();
        assert_eq!(map.get(&EntityId::new(7)), Some(&1));
    }

    #[test]
    fn test_lead_deserialization_with_nulls() {
        let lead: Lead = serde_json::from_value(serde_json::json!({
            "id": 555,
            "name": "Сделка #555",
            "price": 120000,
            "pipeline_id": 10,
            "status_id": 20,
            "responsible_user_id": 3,
            "created_at": 1_700_000_000,
            "custom_fields_values": null,
            "_embedded": {
                "contacts": [{
                    "id": 9,
                    "name": "Иван",
                    "custom_fields_values": [{
                        "field_code": "PHONE",
                        "field_name": "Телефон",
                        "values": [{ "value": "+998901234567" }]
                    }]
                }],
                "companies": [{ "id": 1, "name": "ООО Ромашка" }]
            }
        }))
        .unwrap();

        assert_eq!(lead.id, EntityId::new(555));
        assert!(lead.custom_fields().is_empty());
        assert_eq!(lead.contact_name(), "Иван");
        assert_eq!(lead.contact_phone(), "+998901234567");
        assert_eq!(lead.company_name(), "ООО Ромашка");
        assert!(lead.created().is_some());
    }

    #[test]
    fn test_contact_name_falls_back_to_lead_name() {
        let lead = Lead {
            id: EntityId::new(1),
            name: "Lead name".into(),
            ..Default::default()
        };
        assert_eq!(lead.contact_name(), "Lead name");
        assert_eq!(lead.contact_phone(), "");
    }

    #[test]
    fn test_custom_field_name_normalization() {
        let cf = CustomField {
            field_name: "Количество  1 ".into(),
            ..Default::default()
        };
        assert_eq!(cf.normalized_name(), "Количество 1");
    }

    #[test]
    fn test_custom_field_epoch() {
        let v = CustomFieldValue { value: serde_json::json!(1_700_000_000) };
        assert_eq!(v.as_epoch(), Some(1_700_000_000));
        let v = CustomFieldValue { value: serde_json::json!("1700000000") };
        assert_eq!(v.as_epoch(), Some(1_700_000_000));
        let v = CustomFieldValue { value: serde_json::json!("12.01.2024") };
        assert_eq!(v.as_epoch(), None);
    }

    #[test]
    fn test_event_accessors() {
        let event: StatusChangeEvent = serde_json::from_value(serde_json::json!({
            "entity_id": 555,
            "created_at": 100,
            "value_before": [{ "lead_status": { "id": 1, "pipeline_id": 10 } }],
            "value_after": [{ "lead_status": { "id": 2, "pipeline_id": 10 } }]
        }))
        .unwrap();
        assert_eq!(event.from_status().unwrap().id, StatusId::new(1));
        assert_eq!(event.to_status().unwrap().id, StatusId::new(2));
    }
}

//! # Notification Normalization
//!
//! Turns a CRM webhook body into a flat list of [`LeadChange`] descriptors.
//!
//! ## Accepted Shapes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  JSON (application/json)                                                │
//! │    { "_embedded": { "leads": [ { "id": 555, "status_id": 1, ... } ] } } │
//! │    { "leads": { "status": [ { "id": "555", "status_id": "1" } ] } }     │
//! │                                                                         │
//! │  Form (application/x-www-form-urlencoded)                               │
//! │    leads[status][0][id]=555                                             │
//! │    leads[status][0][status_id]=1                                        │
//! │    leads[status][0][pipeline_id]=10                                     │
//! │    leads[add][0][id]=556 ...                                            │
//! │                                                                         │
//! │  Form keys are grouped by (action, index); each group is one lead.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries without a usable id are counted, not returned. Only a body that
//! cannot be decoded at all is an error.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{ChangeAction, EntityId, LeadChange, PipelineId, StatusId};

/// Result of normalizing one notification body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notification {
    pub changes: Vec<LeadChange>,

    /// Entries dropped because no id could be extracted.
    pub missing_id: usize,
}

impl Notification {
    /// Total entries seen, including the dropped ones.
    pub fn received(&self) -> usize {
        self.changes.len() + self.missing_id
    }
}

/// Parses a webhook body according to its content type.
///
/// Bodies without a JSON content type are sniffed: a leading `{` is treated
/// as JSON, anything else as form-encoded.
pub fn parse_notification(body: &[u8], content_type: &str) -> Result<Notification, ValidationError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ValidationError::MalformedBody(format!("body is not UTF-8: {}", e)))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Notification::default());
    }

    if content_type.contains("json") || trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
        from_json(&value)
    } else {
        Ok(from_form(trimmed))
    }
}

// =============================================================================
// JSON
// =============================================================================

fn from_json(value: &Value) -> Result<Notification, ValidationError> {
    let mut out = Notification::default();

    if let Some(leads) = value.pointer("/_embedded/leads").and_then(Value::as_array) {
        for lead in leads {
            push_entry(&mut out, ChangeAction::Add, |key| json_field(lead, key));
        }
        return Ok(out);
    }

    if let Some(groups) = value.get("leads").and_then(Value::as_object) {
        for (action, entries) in groups {
            let Ok(action) = action.parse::<ChangeAction>() else {
                continue;
            };
            let entries: Vec<&Value> = match entries {
                Value::Array(items) => items.iter().collect(),
                // PHP-style arrays sometimes arrive as {"0": {...}, "1": {...}}
                Value::Object(map) => map.values().collect(),
                _ => continue,
            };
            for lead in entries {
                push_entry(&mut out, action, |key| json_field(lead, key));
            }
        }
        return Ok(out);
    }

    Err(ValidationError::MalformedBody(
        "expected `_embedded.leads` or `leads` in JSON body".into(),
    ))
}

fn json_field(lead: &Value, key: &str) -> Option<String> {
    match lead.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// Form
// =============================================================================

/// Splits `leads[status][0][id]` into `("status", 0, "id")`.
fn split_form_key(key: &str) -> Option<(&str, u32, &str)> {
    let rest = key.strip_prefix("leads[")?.strip_suffix(']')?;
    let mut parts = rest.splitn(3, "][");
    let action = parts.next()?;
    let index = parts.next()?.parse().ok()?;
    let field = parts.next()?;
    if field.is_empty() {
        return None;
    }
    Some((action, index, field))
}

fn action_order(action: ChangeAction) -> u8 {
    match action {
        ChangeAction::Add => 0,
        ChangeAction::Update => 1,
        ChangeAction::Status => 2,
        ChangeAction::Poll => 3,
    }
}

fn from_form(body: &str) -> Notification {
    let mut groups: BTreeMap<(u8, u32), (ChangeAction, BTreeMap<String, String>)> = BTreeMap::new();

    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        let Some((action, index, field)) = split_form_key(&key) else {
            continue;
        };
        let Ok(action) = action.parse::<ChangeAction>() else {
            continue;
        };
        groups
            .entry((action_order(action), index))
            .or_insert_with(|| (action, BTreeMap::new()))
            .1
            .insert(field.to_string(), value.into_owned());
    }

    let mut out = Notification::default();
    for (_, (action, fields)) in groups {
        push_entry(&mut out, action, |key| fields.get(key).cloned());
    }
    out
}

// =============================================================================
// Shared
// =============================================================================

fn push_entry<F>(out: &mut Notification, action: ChangeAction, field: F)
where
    F: Fn(&str) -> Option<String>,
{
    let id = field("id")
        .and_then(|raw| raw.parse::<EntityId>().ok())
        .filter(|id| !id.is_unset());
    let Some(id) = id else {
        out.missing_id += 1;
        return;
    };

    let status_id = field("status_id")
        .and_then(|raw| raw.parse::<StatusId>().ok())
        .unwrap_or_default();
    let pipeline_id = field("pipeline_id")
        .and_then(|raw| raw.parse::<PipelineId>().ok())
        .unwrap_or_default();

    out.changes.push(LeadChange {
        id,
        status_id,
        pipeline_id,
        action,
    });
}

// =============================================================================
// Tests
// =============================================================================

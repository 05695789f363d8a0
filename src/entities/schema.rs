//! Syncable entity types and their field schemas
//!
//! Payloads arriving from clients are parsed into these typed schemas at the
//! boundary. Unknown fields are rejected, so nothing malformed reaches the
//! action log or the entity store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Types of entities that can be synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Report,
    Task,
    Profile,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Report, EntityType::Task, EntityType::Profile];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Report => "report",
            EntityType::Task => "task",
            EntityType::Profile => "profile",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(EntityType::Report),
            "task" => Ok(EntityType::Task),
            "profile" => Ok(EntityType::Profile),
            other => Err(SyncError::Validation(format!("unknown entity_type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Submitted,
    Acknowledged,
    InProgress,
    Resolved,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

/// Fields of a civic issue report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReportStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Fields of a work task attached to a report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

/// Fields of a user profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A typed set of entity fields: a full record for creates, a diff for updates
///
/// Absent (or `null`) fields are untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPatch {
    Report(ReportFields),
    Task(TaskFields),
    Profile(ProfileFields),
}

const MAX_TEXT_LEN: usize = 10_000;
const MAX_TITLE_LEN: usize = 200;

impl EntityPatch {
    /// Parse a client payload against the schema of `entity_type`
    pub fn parse(entity_type: EntityType, payload: &Value) -> Result<Self, SyncError> {
        if !payload.is_object() {
            return Err(SyncError::Validation(format!(
                "{} payload must be a JSON object",
                entity_type
            )));
        }

        let invalid = |e: serde_json::Error| {
            SyncError::Validation(format!("invalid {} payload: {}", entity_type, e))
        };

        let patch = match entity_type {
            EntityType::Report => {
                EntityPatch::Report(ReportFields::deserialize(payload).map_err(invalid)?)
            }
            EntityType::Task => {
                EntityPatch::Task(TaskFields::deserialize(payload).map_err(invalid)?)
            }
            EntityType::Profile => {
                EntityPatch::Profile(ProfileFields::deserialize(payload).map_err(invalid)?)
            }
        };

        patch.check_values()?;
        Ok(patch)
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPatch::Report(_) => EntityType::Report,
            EntityPatch::Task(_) => EntityType::Task,
            EntityPatch::Profile(_) => EntityType::Profile,
        }
    }

    /// Check the fields a new record must carry
    pub fn check_complete(&self) -> Result<(), SyncError> {
        let (field, value) = match self {
            EntityPatch::Report(r) => ("title", &r.title),
            EntityPatch::Task(t) => ("title", &t.title),
            EntityPatch::Profile(p) => ("display_name", &p.display_name),
        };

        match value {
            Some(v) if !v.trim().is_empty() => Ok(()),
            _ => Err(SyncError::Validation(format!(
                "{} requires a non-empty {}",
                self.entity_type(),
                field
            ))),
        }
    }

    /// Whether the patch only carries a status change
    pub fn is_status_only(&self) -> bool {
        match self {
            EntityPatch::Report(r) => {
                r.status.is_some() && *r == ReportFields { status: r.status, ..Default::default() }
            }
            EntityPatch::Task(t) => {
                t.status.is_some() && *t == TaskFields { status: t.status, ..Default::default() }
            }
            EntityPatch::Profile(_) => false,
        }
    }

    /// The touched fields as a JSON map
    pub fn into_fields(self) -> Result<Map<String, Value>, SyncError> {
        let value = match self {
            EntityPatch::Report(r) => serde_json::to_value(r)?,
            EntityPatch::Task(t) => serde_json::to_value(t)?,
            EntityPatch::Profile(p) => serde_json::to_value(p)?,
        };

        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    fn check_values(&self) -> Result<(), SyncError> {
        match self {
            EntityPatch::Report(r) => {
                check_text("title", r.title.as_deref(), MAX_TITLE_LEN)?;
                check_text("description", r.description.as_deref(), MAX_TEXT_LEN)?;
                check_text("address", r.address.as_deref(), MAX_TITLE_LEN * 2)?;
                if let Some(lat) = r.latitude {
                    if !(-90.0..=90.0).contains(&lat) {
                        return Err(SyncError::Validation(format!("latitude out of range: {}", lat)));
                    }
                }
                if let Some(lng) = r.longitude {
                    if !(-180.0..=180.0).contains(&lng) {
                        return Err(SyncError::Validation(format!("longitude out of range: {}", lng)));
                    }
                }
            }
            EntityPatch::Task(t) => {
                check_text("title", t.title.as_deref(), MAX_TITLE_LEN)?;
                check_text("description", t.description.as_deref(), MAX_TEXT_LEN)?;
            }
            EntityPatch::Profile(p) => {
                check_text("display_name", p.display_name.as_deref(), MAX_TITLE_LEN)?;
                check_text("bio", p.bio.as_deref(), MAX_TEXT_LEN)?;
            }
        }
        Ok(())
    }
}

fn check_text(field: &str, value: Option<&str>, max: usize) -> Result<(), SyncError> {
    match value {
        Some(v) if v.chars().count() > max => Err(SyncError::Validation(format!(
            "{} exceeds {} characters",
            field, max
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_report_payload() {
        let patch = EntityPatch::parse(
            EntityType::Report,
            &json!({"title": "Pothole", "latitude": 52.1, "status": "in_progress"}),
        )
        .unwrap();

        match &patch {
            EntityPatch::Report(r) => {
                assert_eq!(r.title.as_deref(), Some("Pothole"));
                assert_eq!(r.status, Some(ReportStatus::InProgress));
            }
            other => panic!("unexpected patch: {:?}", other),
        }
        assert!(patch.check_complete().is_ok());

        let fields = patch.into_fields().unwrap();
        assert_eq!(fields.len(), 3);
        assert!(!fields.contains_key("description"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = EntityPatch::parse(EntityType::Report, &json!({"titel": "typo"})).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_bad_enum_and_range_rejected() {
        assert!(EntityPatch::parse(EntityType::Task, &json!({"status": "done"})).is_err());
        assert!(EntityPatch::parse(EntityType::Report, &json!({"latitude": 91.0})).is_err());
        assert!(EntityPatch::parse(EntityType::Profile, &json!("not an object")).is_err());
    }

    #[test]
    fn test_create_requires_title() {
        let patch = EntityPatch::parse(EntityType::Report, &json!({"description": "x"})).unwrap();
        assert!(patch.check_complete().is_err());

        let patch = EntityPatch::parse(EntityType::Profile, &json!({"display_name": "  "})).unwrap();
        assert!(patch.check_complete().is_err());
    }

    #[test]
    fn test_status_only_detection() {
        let status = EntityPatch::parse(EntityType::Task, &json!({"status": "completed"})).unwrap();
        assert!(status.is_status_only());

        let mixed = EntityPatch::parse(
            EntityType::Task,
            &json!({"status": "completed", "title": "Fill"}),
        )
        .unwrap();
        assert!(!mixed.is_status_only());
    }

    #[test]
    fn test_entity_type_from_str() {
        assert_eq!("report".parse::<EntityType>().unwrap(), EntityType::Report);
        assert!("department".parse::<EntityType>().is_err());
    }
}

//! Validated client actions
//!
//! Raw upload actions are parsed once, at the boundary, into a closed set of
//! typed variants. Everything downstream matches on [`ActionPayload`] instead
//! of action-type strings.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{ActionType, OfflineAction};
#[cfg(test)]
use super::types::UploadAction;
use crate::entities::{EntityPatch, EntityType};
use crate::error::SyncError;

const MAX_CLIENT_ID_LEN: usize = 128;

/// What an action does, with its typed payload
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    Create(EntityPatch),
    Update {
        entity_id: i64,
        base_version: i64,
        patch: EntityPatch,
    },
    UpdateStatus {
        entity_id: i64,
        base_version: i64,
        patch: EntityPatch,
    },
    Delete {
        entity_id: i64,
        base_version: i64,
    },
}

/// A client action that passed boundary validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedAction {
    pub client_action_id: String,
    pub action_type: ActionType,
    pub entity_type: EntityType,
    pub client_timestamp: DateTime<Utc>,
    pub payload: ActionPayload,
    /// Payload as submitted, kept for conflict records
    pub raw_payload: Value,
}

/// Per-entity ordering key within an upload batch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Entity(EntityType, i64),
    /// Creates touch no existing entity and are never ordered against others
    Create(String),
}

impl ValidatedAction {
    /// Validate a wire action
    #[cfg(test)]
    pub fn parse(action: &UploadAction) -> Result<Self, SyncError> {
        check_client_id(&action.client_id)?;
        Self::build(
            &action.client_id,
            &action.action_type,
            &action.entity_type,
            action.entity_id,
            action.base_version,
            action.timestamp,
            &action.payload,
        )
    }

    /// Rebuild the typed action from an action log row
    pub fn from_stored(action: &OfflineAction) -> Result<Self, SyncError> {
        Self::build(
            &action.client_action_id,
            &action.action_type,
            &action.entity_type,
            action.entity_id,
            action.base_version,
            action.client_timestamp,
            &action.payload,
        )
    }

    fn build(
        client_id: &str,
        action_type: &str,
        entity_type: &str,
        entity_id: Option<i64>,
        base_version: Option<i64>,
        timestamp: DateTime<Utc>,
        payload: &Value,
    ) -> Result<Self, SyncError> {
        let action_type: ActionType = action_type.parse()?;
        let entity_type: EntityType = entity_type.parse()?;

        let target = || -> Result<(i64, i64), SyncError> {
            let entity_id = entity_id.ok_or_else(|| {
                SyncError::Validation(format!("{} requires entity_id", action_type.as_str()))
            })?;
            let base_version = base_version.ok_or_else(|| {
                SyncError::Validation(format!("{} requires base_version", action_type.as_str()))
            })?;
            if base_version < 1 {
                return Err(SyncError::Validation(format!(
                    "invalid base_version: {}",
                    base_version
                )));
            }
            Ok((entity_id, base_version))
        };

        let payload_kind = match action_type {
            ActionType::CreateEntity => {
                if entity_id.is_some() {
                    return Err(SyncError::Validation(
                        "create_entity must not carry entity_id".to_string(),
                    ));
                }
                let patch = EntityPatch::parse(entity_type, payload)?;
                patch.check_complete()?;
                ActionPayload::Create(patch)
            }
            ActionType::UpdateEntity => {
                let (entity_id, base_version) = target()?;
                let patch = EntityPatch::parse(entity_type, payload)?;
                ActionPayload::Update {
                    entity_id,
                    base_version,
                    patch,
                }
            }
            ActionType::UpdateStatus => {
                let (entity_id, base_version) = target()?;
                let patch = EntityPatch::parse(entity_type, payload)?;
                if !patch.is_status_only() {
                    return Err(SyncError::Validation(format!(
                        "update_status payload for {} must contain only a status",
                        entity_type
                    )));
                }
                ActionPayload::UpdateStatus {
                    entity_id,
                    base_version,
                    patch,
                }
            }
            ActionType::DeleteEntity => {
                let (entity_id, base_version) = target()?;
                ActionPayload::Delete {
                    entity_id,
                    base_version,
                }
            }
        };

        Ok(Self {
            client_action_id: client_id.to_string(),
            action_type,
            entity_type,
            client_timestamp: timestamp,
            payload: payload_kind,
            raw_payload: payload.clone(),
        })
    }

    pub fn entity_id(&self) -> Option<i64> {
        match &self.payload {
            ActionPayload::Create(_) => None,
            ActionPayload::Update { entity_id, .. }
            | ActionPayload::UpdateStatus { entity_id, .. }
            | ActionPayload::Delete { entity_id, .. } => Some(*entity_id),
        }
    }

    pub fn base_version(&self) -> Option<i64> {
        match &self.payload {
            ActionPayload::Create(_) => None,
            ActionPayload::Update { base_version, .. }
            | ActionPayload::UpdateStatus { base_version, .. }
            | ActionPayload::Delete { base_version, .. } => Some(*base_version),
        }
    }

    /// The fields this action changes, if it changes fields at all
    pub fn patch(&self) -> Option<&EntityPatch> {
        match &self.payload {
            ActionPayload::Create(patch)
            | ActionPayload::Update { patch, .. }
            | ActionPayload::UpdateStatus { patch, .. } => Some(patch),
            ActionPayload::Delete { .. } => None,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        match self.entity_id() {
            Some(id) => GroupKey::Entity(self.entity_type, id),
            None => GroupKey::Create(self.client_action_id.clone()),
        }
    }
}

/// Check an idempotency key before anything is recorded under it
pub fn check_client_id(client_id: &str) -> Result<(), SyncError> {
    if client_id.trim().is_empty() {
        return Err(SyncError::Validation("client_id must not be empty".to_string()));
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(SyncError::Validation(format!(
            "client_id exceeds {} bytes",
            MAX_CLIENT_ID_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(value: Value) -> UploadAction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_create() {
        let action = ValidatedAction::parse(&wire(json!({
            "client_id": "u1",
            "action_type": "create_entity",
            "entity_type": "report",
            "timestamp": "2024-05-01T09:00:00Z",
            "payload": {"title": "Pothole"}
        })))
        .unwrap();

        assert_eq!(action.action_type, ActionType::CreateEntity);
        assert_eq!(action.group_key(), GroupKey::Create("u1".to_string()));
        assert!(matches!(action.payload, ActionPayload::Create(EntityPatch::Report(_))));
    }

    #[test]
    fn test_update_requires_target() {
        let err = ValidatedAction::parse(&wire(json!({
            "client_id": "u2",
            "action_type": "update_entity",
            "entity_type": "report",
            "entity_id": 42,
            "timestamp": "2024-05-01T09:00:00Z",
            "payload": {"title": "Pothole"}
        })))
        .unwrap_err();
        assert!(err.to_string().contains("base_version"));

        let action = ValidatedAction::parse(&wire(json!({
            "client_id": "u2",
            "action_type": "update_entity",
            "entity_type": "report",
            "entity_id": 42,
            "base_version": 3,
            "timestamp": "2024-05-01T09:00:00Z",
            "payload": {"title": "Pothole"}
        })))
        .unwrap();
        assert_eq!(action.group_key(), GroupKey::Entity(EntityType::Report, 42));
        assert_eq!(action.base_version(), Some(3));
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let err = ValidatedAction::parse(&wire(json!({
            "client_id": "u3",
            "action_type": "upsert",
            "entity_type": "report",
            "timestamp": "2024-05-01T09:00:00Z",
            "payload": {}
        })))
        .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_update_status_payload_must_be_status_only() {
        let base = json!({
            "client_id": "u4",
            "action_type": "update_status",
            "entity_type": "task",
            "entity_id": 5,
            "base_version": 1,
            "timestamp": "2024-05-01T09:00:00Z",
        });

        let mut ok = base.clone();
        ok["payload"] = json!({"status": "completed"});
        assert!(ValidatedAction::parse(&wire(ok)).is_ok());

        let mut bad = base;
        bad["payload"] = json!({"status": "completed", "title": "x"});
        assert!(ValidatedAction::parse(&wire(bad)).is_err());
    }

    #[test]
    fn test_delete_ignores_payload() {
        let action = ValidatedAction::parse(&wire(json!({
            "client_id": "u5",
            "action_type": "delete_entity",
            "entity_type": "profile",
            "entity_id": 9,
            "base_version": 2,
            "timestamp": "2024-05-01T09:00:00Z"
        })))
        .unwrap();
        assert!(action.patch().is_none());
    }

    #[test]
    fn test_client_id_checks() {
        assert!(check_client_id("").is_err());
        assert!(check_client_id(&"x".repeat(200)).is_err());
        assert!(check_client_id("9b2f6a40-3a5e-4e0c-8a51-6f7f1a6c2b11").is_ok());
    }
}

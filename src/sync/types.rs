//! Sync data types
//!
//! Defines the persisted sync records and the JSON wire contracts:
//! - Per-device sync state and action log rows
//! - Conflict records and resolution strategies
//! - Upload / download / status request and response bodies

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::EntityType;
use crate::error::SyncError;

/// Sync cursors for one (user, device) pair
#[derive(Debug, Clone, Serialize)]
pub struct ClientSyncState {
    pub user_id: String,
    pub device_id: String,
    pub last_upload_at: Option<DateTime<Utc>>,
    pub last_download_at: Option<DateTime<Utc>>,
    pub device_info: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl ClientSyncState {
    /// Most recent upload or download
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_upload_at.max(self.last_download_at)
    }
}

/// Lifecycle of a submitted action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Applying,
    Applied,
    Conflict,
    FailedRetryable,
    FailedPermanent,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Applying => "applying",
            ActionStatus::Applied => "applied",
            ActionStatus::Conflict => "conflict",
            ActionStatus::FailedRetryable => "failed_retryable",
            ActionStatus::FailedPermanent => "failed_permanent",
        }
    }

    /// No further processing will ever change this action
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Applied | ActionStatus::FailedPermanent)
    }

    /// The action has an outcome that a replay must return as-is
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == ActionStatus::Conflict
    }
}

impl FromStr for ActionStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "applying" => Ok(ActionStatus::Applying),
            "applied" => Ok(ActionStatus::Applied),
            "conflict" => Ok(ActionStatus::Conflict),
            "failed_retryable" => Ok(ActionStatus::FailedRetryable),
            "failed_permanent" => Ok(ActionStatus::FailedPermanent),
            other => Err(SyncError::Validation(format!("unknown action status: {}", other))),
        }
    }
}

/// Kinds of client actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateEntity,
    UpdateEntity,
    DeleteEntity,
    /// Status-only change of a report or task
    UpdateStatus,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::CreateEntity => "create_entity",
            ActionType::UpdateEntity => "update_entity",
            ActionType::DeleteEntity => "delete_entity",
            ActionType::UpdateStatus => "update_status",
        }
    }
}

impl FromStr for ActionType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_entity" => Ok(ActionType::CreateEntity),
            "update_entity" => Ok(ActionType::UpdateEntity),
            "delete_entity" => Ok(ActionType::DeleteEntity),
            "update_status" => Ok(ActionType::UpdateStatus),
            other => Err(SyncError::Validation(format!("unknown action_type: {}", other))),
        }
    }
}

/// A client action as stored in the action log
#[derive(Debug, Clone, Serialize)]
pub struct OfflineAction {
    pub client_action_id: String,
    pub device_id: String,
    pub user_id: String,
    /// Kept as submitted so malformed actions stay auditable
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: Option<i64>,
    pub base_version: Option<i64>,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: ActionStatus,
    pub retry_count: i64,
    pub server_entity_id: Option<i64>,
    pub conflict_id: Option<String>,
    pub result_message: Option<String>,
}

/// How a conflict is (or was) resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    ServerWins,
    ClientWins,
    Merge,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server_wins" => Ok(ConflictStrategy::ServerWins),
            "client_wins" => Ok(ConflictStrategy::ClientWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(SyncError::Validation(format!("unknown resolution strategy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Unresolved => "unresolved",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

/// A detected conflict between a client action and the server state
#[derive(Debug, Clone, Serialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub client_action_id: String,
    pub user_id: String,
    pub device_id: String,
    /// Base version the client edited from
    pub client_version: i64,
    /// Version the server held at detection time
    pub server_version: i64,
    pub client_payload: Value,
    pub server_payload_snapshot: Value,
    pub resolution_strategy: ConflictStrategy,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Wire contracts
// ============================================================================

/// Body of `POST /sync/upload`
///
/// Actions stay raw JSON here so one malformed action fails on its own
/// instead of rejecting the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub device_id: String,
    #[serde(default)]
    pub last_known_server_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_info: Option<Value>,
    #[serde(default)]
    pub actions: Vec<Value>,
}

/// One queued client action as sent on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAction {
    pub client_id: String,
    pub action_type: String,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<i64>,
    #[serde(default)]
    pub base_version: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Conflict,
    Failed,
}

/// Outcome of one uploaded action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub client_id: String,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
    /// Strategy that settled the conflict, once it is resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictStrategy>,
    /// For failures: whether the client should resubmit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    pub message: String,
}

impl ActionResult {
    /// Build the client-facing result from the stored action
    ///
    /// Replays read the same row, so they always produce the same result.
    pub fn from_stored(action: &OfflineAction) -> Self {
        let message = action.result_message.clone().unwrap_or_default();
        let (status, retryable) = match action.status {
            ActionStatus::Applied if action.conflict_id.is_some() => (ResultStatus::Conflict, None),
            ActionStatus::Applied => (ResultStatus::Success, None),
            ActionStatus::Conflict => (ResultStatus::Conflict, None),
            ActionStatus::FailedPermanent => (ResultStatus::Failed, Some(false)),
            ActionStatus::FailedRetryable | ActionStatus::Pending | ActionStatus::Applying => {
                (ResultStatus::Failed, Some(true))
            }
        };

        let message = match action.status {
            ActionStatus::Pending | ActionStatus::Applying => {
                "action is still being processed".to_string()
            }
            _ => message,
        };

        Self {
            client_id: action.client_action_id.clone(),
            status,
            server_id: action.server_entity_id,
            conflict_id: action.conflict_id.clone(),
            resolution: None,
            retryable,
            message,
        }
    }

    /// A failure for an action that could not be recorded at all
    pub fn failed(client_id: impl Into<String>, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            status: ResultStatus::Failed,
            server_id: None,
            conflict_id: None,
            resolution: None,
            retryable: Some(retryable),
            message: message.into(),
        }
    }
}

/// Response from `POST /sync/upload`
#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub results: Vec<ActionResult>,
    /// Conflicts referenced by any result in this response
    pub conflicts: Vec<SyncConflict>,
    pub sync_timestamp: DateTime<Utc>,
}

/// Query of `GET /sync/download`
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadQuery {
    pub device_id: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub page_size: Option<i64>,
}

/// Response from `GET /sync/download`
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResponse {
    pub success: bool,
    pub data: BTreeMap<EntityType, Vec<Value>>,
    pub sync_timestamp: DateTime<Utc>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Query of `GET /sync/status`
#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    pub device_id: String,
}

/// Informational health of a device's sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    Good,
    Stale,
    NeedsAttention,
    NeverSynced,
}

/// Response from `GET /sync/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub device_id: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_upload: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
    pub pending_uploads: i64,
    pub conflicts: i64,
    pub sync_health: SyncHealth,
}

/// Body of `POST /sync/resolve-conflict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    pub conflict_id: String,
    pub resolution_strategy: ConflictStrategy,
    #[serde(default)]
    pub resolved_payload: Option<Value>,
}

/// Response from `POST /sync/resolve-conflict`
#[derive(Debug, Clone, Serialize)]
pub struct ResolveConflictResponse {
    pub success: bool,
    pub conflict: SyncConflict,
    /// The entity after resolution
    pub entity: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(status: ActionStatus) -> OfflineAction {
        let now = Utc::now();
        OfflineAction {
            client_action_id: "u1".to_string(),
            device_id: "device-a".to_string(),
            user_id: "user-1".to_string(),
            action_type: "create_entity".to_string(),
            entity_type: "report".to_string(),
            entity_id: None,
            base_version: None,
            payload: json!({"title": "Pothole"}),
            client_timestamp: now,
            submitted_at: now,
            updated_at: now,
            status,
            retry_count: 0,
            server_entity_id: None,
            conflict_id: None,
            result_message: Some("done".to_string()),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(ActionStatus::Applied.is_terminal());
        assert!(ActionStatus::FailedPermanent.is_terminal());
        assert!(!ActionStatus::Conflict.is_terminal());
        assert!(ActionStatus::Conflict.is_settled());
        assert!(!ActionStatus::FailedRetryable.is_settled());
        assert_eq!(
            "failed_retryable".parse::<ActionStatus>().unwrap(),
            ActionStatus::FailedRetryable
        );
    }

    #[test]
    fn test_result_from_stored_action() {
        let mut action = stored(ActionStatus::Applied);
        action.server_entity_id = Some(7);
        let result = ActionResult::from_stored(&action);
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.server_id, Some(7));

        action.conflict_id = Some("c-1".to_string());
        assert_eq!(ActionResult::from_stored(&action).status, ResultStatus::Conflict);

        let result = ActionResult::from_stored(&stored(ActionStatus::FailedRetryable));
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.retryable, Some(true));

        let result = ActionResult::from_stored(&stored(ActionStatus::Applying));
        assert_eq!(result.message, "action is still being processed");
    }

    #[test]
    fn test_upload_request_wire_format() {
        let request: UploadRequest = serde_json::from_value(json!({
            "device_id": "device-a",
            "last_known_server_timestamp": "2024-05-01T10:00:00Z",
            "actions": [{
                "client_id": "u1",
                "action_type": "create_entity",
                "entity_type": "report",
                "timestamp": "2024-05-01T09:00:00Z",
                "payload": {"title": "Pothole"}
            }]
        }))
        .unwrap();
        assert_eq!(request.actions.len(), 1);

        let action: UploadAction = serde_json::from_value(request.actions[0].clone()).unwrap();
        assert_eq!(action.client_id, "u1");
        assert!(action.entity_id.is_none());
    }

    #[test]
    fn test_result_serialization_omits_empty_fields() {
        let json = serde_json::to_value(ActionResult::failed("u9", false, "bad")).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json.get("server_id").is_none());
        assert_eq!(json["retryable"], false);
    }
}

//! Conflict resolution strategies
//!
//! Automatic resolution runs during upload, using the strategy configured for
//! the entity type. Conflicts left `unresolved` by the manual strategy (or by a
//! merge that could not reconcile a field) wait for a reviewer, who settles
//! them through [`ConflictResolver::resolve_manual`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::action::{ActionPayload, ValidatedAction};
use super::action_log::ActionLog;
use super::applier::{
    overlay, write_for, ActionApplier, ApplyOutcome, EntityWrite, SYSTEM_RESOLVER,
};
use super::conflict::ConflictLog;
use super::state_store::SyncStateStore;
use super::types::{ConflictStatus, ConflictStrategy, SyncConflict};
use crate::entities::{Actor, EntityPatch, EntityRecord, EntityStore, WriteOutcome};
use crate::error::{AppError, SyncError};

/// Device id recorded on entity writes made by a reviewer
pub const REVIEW_DEVICE: &str = "conflict-review";

/// How a field changed on both sides since the client's base is settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    /// The side with the later change timestamp wins; ties keep the server value
    #[default]
    LastWriterWins,
    PreferServer,
    PreferClient,
    /// Needs a human decision
    Manual,
}

/// Per-entity-type merge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MergePolicy {
    #[serde(default)]
    pub default: FieldPolicy,
    #[serde(default)]
    pub fields: HashMap<String, FieldPolicy>,
}

impl MergePolicy {
    pub fn for_field(&self, field: &str) -> FieldPolicy {
        self.fields.get(field).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    Merged(Map<String, Value>),
    /// Fields changed on both sides whose policy is `manual`
    Unresolvable(Vec<String>),
}

/// Field-level three-way merge
///
/// `base` is the entity at the client's base version. Without it every field
/// the server holds a different value for counts as changed on both sides.
pub fn merge_fields(
    policy: &MergePolicy,
    base: Option<&Map<String, Value>>,
    server: &Map<String, Value>,
    client_changes: &Map<String, Value>,
    client_changed_at: DateTime<Utc>,
    server_changed_at: DateTime<Utc>,
) -> MergeResult {
    let mut merged = server.clone();
    let mut unresolvable = Vec::new();

    for (field, client_value) in client_changes {
        let server_value = server.get(field);
        if server_value == Some(client_value) {
            continue;
        }

        let server_changed = match base {
            Some(base) => base.get(field) != server_value,
            None => true,
        };
        if !server_changed {
            merged.insert(field.clone(), client_value.clone());
            continue;
        }

        let take_client = match policy.for_field(field) {
            FieldPolicy::LastWriterWins => client_changed_at > server_changed_at,
            FieldPolicy::PreferServer => false,
            FieldPolicy::PreferClient => true,
            FieldPolicy::Manual => {
                unresolvable.push(field.clone());
                false
            }
        };
        if take_client {
            merged.insert(field.clone(), client_value.clone());
        }
    }

    if unresolvable.is_empty() {
        MergeResult::Merged(merged)
    } else {
        unresolvable.sort();
        MergeResult::Unresolvable(unresolvable)
    }
}

/// Outcome of resolving a conflict during upload
#[derive(Debug, Clone)]
pub enum AutoResolution {
    /// The client's intent was written, possibly merged
    Applied(EntityRecord),
    /// The action settled as `conflict`; the server state stands for now
    Recorded {
        conflict_id: String,
        strategy: ConflictStrategy,
    },
    /// The entity moved again while resolving; detection should run again
    VersionMoved,
    AlreadySettled,
}

#[derive(Clone)]
pub struct ConflictResolver {
    pool: SqlitePool,
    entities: Arc<dyn EntityStore>,
    applier: ActionApplier,
    conflicts: ConflictLog,
    actions: ActionLog,
}

impl ConflictResolver {
    pub fn new(
        pool: SqlitePool,
        entities: Arc<dyn EntityStore>,
        applier: ActionApplier,
        conflicts: ConflictLog,
        actions: ActionLog,
    ) -> Self {
        Self {
            pool,
            entities,
            applier,
            conflicts,
            actions,
        }
    }

    /// Resolve a freshly detected conflict with the configured strategy
    pub async fn resolve(
        &self,
        action: &ValidatedAction,
        actor: &Actor,
        current: &EntityRecord,
        strategy: ConflictStrategy,
        policy: &MergePolicy,
    ) -> Result<AutoResolution, SyncError> {
        // A deletion on the server always stands
        let strategy = if current.deleted {
            ConflictStrategy::ServerWins
        } else {
            strategy
        };

        tracing::info!(
            client_action_id = %action.client_action_id,
            entity_type = %action.entity_type,
            entity_id = current.id,
            client_version = action.base_version().unwrap_or_default(),
            server_version = current.version,
            strategy = %strategy,
            "Conflict detected"
        );

        match strategy {
            ConflictStrategy::ServerWins => {
                let mut conflict = new_conflict(action, actor, current, strategy);
                conflict.status = ConflictStatus::Resolved;
                conflict.resolved_payload = Some(current.to_wire());
                conflict.resolved_by = Some(SYSTEM_RESOLVER.to_string());
                conflict.resolved_at = Some(Utc::now());
                self.record(
                    action,
                    actor,
                    current,
                    conflict,
                    "server version kept; discard local copy",
                )
                .await
            }
            ConflictStrategy::Manual => self.defer(action, actor, current).await,
            ConflictStrategy::ClientWins => {
                let write = write_for(action, current)?;
                let conflict = new_conflict(action, actor, current, strategy);
                let outcome = self
                    .applier
                    .apply(
                        &action.client_action_id,
                        action.entity_type,
                        actor,
                        write,
                        Some(conflict),
                        "client version applied over server changes",
                    )
                    .await?;
                Ok(from_apply(outcome))
            }
            ConflictStrategy::Merge => {
                let (base_version, patch) = match &action.payload {
                    ActionPayload::Update {
                        base_version,
                        patch,
                        ..
                    }
                    | ActionPayload::UpdateStatus {
                        base_version,
                        patch,
                        ..
                    } => (*base_version, patch),
                    _ => return self.defer(action, actor, current).await,
                };

                let base = self
                    .entities
                    .fetch_revision(action.entity_type, current.id, base_version)
                    .await?;
                let changes = patch.clone().into_fields()?;

                match merge_fields(
                    policy,
                    base.as_ref(),
                    &current.data,
                    &changes,
                    action.client_timestamp,
                    current.updated_at,
                ) {
                    MergeResult::Merged(fields) => {
                        let conflict = new_conflict(action, actor, current, strategy);
                        let outcome = self
                            .applier
                            .apply(
                                &action.client_action_id,
                                action.entity_type,
                                actor,
                                EntityWrite::Update {
                                    id: current.id,
                                    expected_version: current.version,
                                    fields,
                                },
                                Some(conflict),
                                "merged with server changes",
                            )
                            .await?;
                        Ok(from_apply(outcome))
                    }
                    MergeResult::Unresolvable(fields) => {
                        tracing::info!(
                            client_action_id = %action.client_action_id,
                            fields = ?fields,
                            "Merge needs a reviewer"
                        );
                        self.defer(action, actor, current).await
                    }
                }
            }
        }
    }

    /// Leave the conflict for a reviewer
    async fn defer(
        &self,
        action: &ValidatedAction,
        actor: &Actor,
        current: &EntityRecord,
    ) -> Result<AutoResolution, SyncError> {
        let conflict = new_conflict(action, actor, current, ConflictStrategy::Manual);
        self.record(action, actor, current, conflict, "awaiting manual resolution")
            .await
    }

    /// Store the conflict and settle the action as `conflict`
    async fn record(
        &self,
        action: &ValidatedAction,
        actor: &Actor,
        current: &EntityRecord,
        conflict: SyncConflict,
        message: &str,
    ) -> Result<AutoResolution, SyncError> {
        let mut tx = self.pool.begin().await?;

        ConflictLog::insert_with(&mut *tx, &conflict).await?;
        let marked = ActionLog::mark_conflict_with(
            &mut *tx,
            &action.client_action_id,
            current.id,
            &conflict.id,
            message,
        )
        .await?;
        if !marked {
            return Ok(AutoResolution::AlreadySettled);
        }

        SyncStateStore::update_upload_cursor_with(
            &mut *tx,
            &actor.user_id,
            &actor.device_id,
            Utc::now(),
        )
        .await?;

        tx.commit().await?;

        Ok(AutoResolution::Recorded {
            conflict_id: conflict.id,
            strategy: conflict.resolution_strategy,
        })
    }

    /// Settle an unresolved conflict on a reviewer's decision
    ///
    /// `server_wins` only closes the conflict; the other strategies write the
    /// chosen data and move the action to `applied`.
    pub async fn resolve_manual(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
        resolved_payload: Option<&Value>,
        reviewer_id: &str,
        policy: &MergePolicy,
    ) -> Result<(SyncConflict, EntityRecord), AppError> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Conflict {} not found", conflict_id)))?;

        if conflict.status == ConflictStatus::Resolved {
            return Err(AppError::Conflict(format!(
                "Conflict {} is already resolved",
                conflict_id
            )));
        }

        let current = self
            .entities
            .fetch(conflict.entity_type, conflict.entity_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "{} {} not found",
                    conflict.entity_type, conflict.entity_id
                ))
            })?;

        let write = match strategy {
            ConflictStrategy::ServerWins => None,
            ConflictStrategy::ClientWins => {
                let action = self.load_action(&conflict).await?;
                Some(write_for(&action, &current)?)
            }
            ConflictStrategy::Merge => {
                let action = self.load_action(&conflict).await?;
                let patch = action.patch().ok_or_else(|| {
                    AppError::BadRequest("A delete cannot be merged".to_string())
                })?;
                let base = self
                    .entities
                    .fetch_revision(conflict.entity_type, current.id, conflict.client_version)
                    .await?;
                let changes = patch.clone().into_fields()?;

                match merge_fields(
                    policy,
                    base.as_ref(),
                    &current.data,
                    &changes,
                    action.client_timestamp,
                    current.updated_at,
                ) {
                    MergeResult::Merged(fields) => Some(EntityWrite::Update {
                        id: current.id,
                        expected_version: current.version,
                        fields,
                    }),
                    MergeResult::Unresolvable(fields) => {
                        return Err(AppError::Conflict(format!(
                            "Fields need a manual decision: {}",
                            fields.join(", ")
                        )))
                    }
                }
            }
            ConflictStrategy::Manual => {
                let payload = resolved_payload.ok_or_else(|| {
                    AppError::BadRequest("Manual resolution requires resolved_payload".to_string())
                })?;
                let fields = EntityPatch::parse(conflict.entity_type, payload)?.into_fields()?;
                Some(EntityWrite::Update {
                    id: current.id,
                    expected_version: current.version,
                    fields: overlay(&current.data, fields),
                })
            }
        };

        if write.is_some() && current.deleted {
            return Err(AppError::Conflict(format!(
                "{} {} has been deleted",
                conflict.entity_type, conflict.entity_id
            )));
        }

        let reviewer = Actor::new(reviewer_id, REVIEW_DEVICE);
        let mut tx = self.pool.begin().await?;

        let record = match write {
            Some(write) => match self
                .applier
                .write_with(&mut *tx, conflict.entity_type, &reviewer, write)
                .await?
            {
                WriteOutcome::Written(record) => record,
                WriteOutcome::VersionMoved { current_version } => {
                    return Err(AppError::Conflict(format!(
                        "{} {} changed to version {} during resolution; retry",
                        conflict.entity_type, conflict.entity_id, current_version
                    )))
                }
            },
            None => current,
        };

        let resolved = ConflictLog::resolve_with(
            &mut *tx,
            conflict_id,
            strategy,
            &record.to_wire(),
            reviewer_id,
        )
        .await?;
        if !resolved {
            return Err(AppError::Conflict(format!(
                "Conflict {} is already resolved",
                conflict_id
            )));
        }

        if strategy != ConflictStrategy::ServerWins {
            ActionLog::mark_applied_with(
                &mut *tx,
                &conflict.client_action_id,
                record.id,
                Some(conflict_id),
                &format!("resolved by {} ({})", reviewer_id, strategy),
            )
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            conflict_id = %conflict_id,
            strategy = %strategy,
            reviewer_id = %reviewer_id,
            entity_version = record.version,
            "Conflict resolved by reviewer"
        );

        let conflict = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Conflict {} not found", conflict_id)))?;

        Ok((conflict, record))
    }

    async fn load_action(&self, conflict: &SyncConflict) -> Result<ValidatedAction, AppError> {
        let stored = self
            .actions
            .get(&conflict.client_action_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Action {} not found", conflict.client_action_id))
            })?;
        Ok(ValidatedAction::from_stored(&stored)?)
    }
}

fn new_conflict(
    action: &ValidatedAction,
    actor: &Actor,
    current: &EntityRecord,
    strategy: ConflictStrategy,
) -> SyncConflict {
    SyncConflict {
        id: Uuid::new_v4().to_string(),
        entity_type: action.entity_type,
        entity_id: current.id,
        client_action_id: action.client_action_id.clone(),
        user_id: actor.user_id.clone(),
        device_id: actor.device_id.clone(),
        client_version: action.base_version().unwrap_or_default(),
        server_version: current.version,
        client_payload: action.raw_payload.clone(),
        server_payload_snapshot: current.to_wire(),
        resolution_strategy: strategy,
        status: ConflictStatus::Unresolved,
        resolved_payload: None,
        resolved_by: None,
        resolved_at: None,
        created_at: Utc::now(),
    }
}

fn from_apply(outcome: ApplyOutcome) -> AutoResolution {
    match outcome {
        ApplyOutcome::Applied(record) => AutoResolution::Applied(record),
        ApplyOutcome::VersionMoved { .. } => AutoResolution::VersionMoved,
        ApplyOutcome::AlreadySettled => AutoResolution::AlreadySettled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_untouched_and_server_only_fields_survive() {
        let base = map(json!({"title": "Pothole", "priority": "low", "address": "Main St"}));
        let server = map(json!({"title": "Pothole", "priority": "high", "address": "Main St"}));
        let client = map(json!({"title": "Deep pothole"}));
        let now = Utc::now();

        let merged = merge_fields(&MergePolicy::default(), Some(&base), &server, &client, now, now);
        assert_eq!(
            merged,
            MergeResult::Merged(map(json!({
                "title": "Deep pothole",
                "priority": "high",
                "address": "Main St"
            })))
        );
    }

    #[test]
    fn test_both_changed_uses_last_writer() {
        let base = map(json!({"title": "Pothole"}));
        let server = map(json!({"title": "Server title"}));
        let client = map(json!({"title": "Client title"}));
        let server_at = Utc::now();

        let later = merge_fields(
            &MergePolicy::default(),
            Some(&base),
            &server,
            &client,
            server_at + Duration::seconds(5),
            server_at,
        );
        assert_eq!(later, MergeResult::Merged(map(json!({"title": "Client title"}))));

        let earlier = merge_fields(
            &MergePolicy::default(),
            Some(&base),
            &server,
            &client,
            server_at - Duration::seconds(5),
            server_at,
        );
        assert_eq!(earlier, MergeResult::Merged(map(json!({"title": "Server title"}))));
    }

    #[test]
    fn test_field_policies() {
        let base = map(json!({"title": "A", "status": "submitted"}));
        let server = map(json!({"title": "B", "status": "acknowledged"}));
        let client = map(json!({"title": "C", "status": "closed"}));
        let now = Utc::now();

        let mut policy = MergePolicy::default();
        policy.fields.insert("title".to_string(), FieldPolicy::PreferClient);
        policy.fields.insert("status".to_string(), FieldPolicy::PreferServer);
        assert_eq!(
            merge_fields(&policy, Some(&base), &server, &client, now, now),
            MergeResult::Merged(map(json!({"title": "C", "status": "acknowledged"})))
        );

        policy.fields.insert("status".to_string(), FieldPolicy::Manual);
        assert_eq!(
            merge_fields(&policy, Some(&base), &server, &client, now, now),
            MergeResult::Unresolvable(vec!["status".to_string()])
        );
    }

    #[test]
    fn test_manual_field_changed_only_by_client_merges() {
        let base = map(json!({"status": "submitted"}));
        let server = map(json!({"status": "submitted", "title": "B"}));
        let client = map(json!({"status": "closed"}));
        let now = Utc::now();

        let mut policy = MergePolicy::default();
        policy.fields.insert("status".to_string(), FieldPolicy::Manual);
        assert_eq!(
            merge_fields(&policy, Some(&base), &server, &client, now, now),
            MergeResult::Merged(map(json!({"status": "closed", "title": "B"})))
        );
    }

    #[test]
    fn test_missing_history_treats_differences_as_both_changed() {
        let server = map(json!({"title": "B"}));
        let client = map(json!({"title": "C"}));
        let now = Utc::now();

        let merged = merge_fields(&MergePolicy::default(), None, &server, &client, now, now);
        assert_eq!(merged, MergeResult::Merged(map(json!({"title": "B"}))));
    }
}

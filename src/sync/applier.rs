//! Atomic application of validated actions
//!
//! The entity mutation, the action log transition and the upload cursor move
//! commit together or not at all.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};

use super::action::{ActionPayload, ValidatedAction};
use super::action_log::ActionLog;
use super::conflict::ConflictLog;
use super::state_store::SyncStateStore;
use super::types::{ConflictStatus, SyncConflict};
use crate::entities::{Actor, EntityRecord, EntityStore, EntityType, WriteOutcome};
use crate::error::SyncError;

/// Resolver identity recorded on automatically resolved conflicts
pub const SYSTEM_RESOLVER: &str = "system";

/// The entity mutation an action turns into
#[derive(Debug, Clone)]
pub enum EntityWrite {
    Create(Map<String, Value>),
    Update {
        id: i64,
        expected_version: i64,
        fields: Map<String, Value>,
    },
    Delete {
        id: i64,
        expected_version: i64,
    },
    /// Nothing to change; the action settles against the current record
    Noop(EntityRecord),
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(EntityRecord),
    /// Another writer committed between detection and this write; nothing was
    /// changed and detection should run again
    VersionMoved { current_version: i64 },
    /// The action reached a terminal state elsewhere; nothing was changed
    AlreadySettled,
}

/// Overlay patch fields onto the current entity data
pub fn overlay(current: &Map<String, Value>, patch: Map<String, Value>) -> Map<String, Value> {
    let mut fields = current.clone();
    for (key, value) in patch {
        fields.insert(key, value);
    }
    fields
}

/// The write that carries out the client's intent on top of `current`
pub fn write_for(action: &ValidatedAction, current: &EntityRecord) -> Result<EntityWrite, SyncError> {
    match &action.payload {
        ActionPayload::Create(_) => Err(SyncError::Validation(
            "create_entity has no existing entity to write over".to_string(),
        )),
        ActionPayload::Delete { .. } => Ok(EntityWrite::Delete {
            id: current.id,
            expected_version: current.version,
        }),
        ActionPayload::Update { patch, .. } | ActionPayload::UpdateStatus { patch, .. } => {
            Ok(EntityWrite::Update {
                id: current.id,
                expected_version: current.version,
                fields: overlay(&current.data, patch.clone().into_fields()?),
            })
        }
    }
}

#[derive(Clone)]
pub struct ActionApplier {
    pool: SqlitePool,
    entities: Arc<dyn EntityStore>,
}

impl ActionApplier {
    pub fn new(pool: SqlitePool, entities: Arc<dyn EntityStore>) -> Self {
        Self { pool, entities }
    }

    /// Run an entity write on the caller's connection
    pub async fn write_with(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        actor: &Actor,
        write: EntityWrite,
    ) -> Result<WriteOutcome, SyncError> {
        match write {
            EntityWrite::Create(fields) => Ok(WriteOutcome::Written(
                self.entities.create(conn, entity_type, fields, actor).await?,
            )),
            EntityWrite::Update {
                id,
                expected_version,
                fields,
            } => {
                self.entities
                    .update(conn, entity_type, id, expected_version, fields, actor)
                    .await
            }
            EntityWrite::Delete {
                id,
                expected_version,
            } => {
                self.entities
                    .delete(conn, entity_type, id, expected_version, actor)
                    .await
            }
            EntityWrite::Noop(record) => Ok(WriteOutcome::Written(record)),
        }
    }

    /// Apply one action in a single transaction
    ///
    /// When `conflict` is given, the action wins an automatically resolved
    /// conflict: the conflict is recorded as resolved with the written state.
    pub async fn apply(
        &self,
        client_action_id: &str,
        entity_type: EntityType,
        actor: &Actor,
        write: EntityWrite,
        conflict: Option<SyncConflict>,
        message: &str,
    ) -> Result<ApplyOutcome, SyncError> {
        let mut tx = self.pool.begin().await?;

        let outcome = self.write_with(&mut *tx, entity_type, actor, write).await?;

        let record = match outcome {
            WriteOutcome::Written(record) => record,
            WriteOutcome::VersionMoved { current_version } => {
                tracing::debug!(
                    client_action_id = %client_action_id,
                    current_version,
                    "Lost version race, rolling back"
                );
                return Ok(ApplyOutcome::VersionMoved { current_version });
            }
        };

        let conflict_id = match conflict {
            Some(mut conflict) => {
                conflict.status = ConflictStatus::Resolved;
                conflict.resolved_payload = Some(record.to_wire());
                conflict.resolved_by = Some(SYSTEM_RESOLVER.to_string());
                conflict.resolved_at = Some(Utc::now());
                ConflictLog::insert_with(&mut *tx, &conflict).await?;
                Some(conflict.id)
            }
            None => None,
        };

        let applied = ActionLog::mark_applied_with(
            &mut *tx,
            client_action_id,
            record.id,
            conflict_id.as_deref(),
            message,
        )
        .await?;
        if !applied {
            return Ok(ApplyOutcome::AlreadySettled);
        }

        SyncStateStore::update_upload_cursor_with(
            &mut *tx,
            &actor.user_id,
            &actor.device_id,
            Utc::now(),
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(
            client_action_id = %client_action_id,
            entity_type = %entity_type,
            entity_id = record.id,
            version = record.version,
            "Applied action"
        );
        Ok(ApplyOutcome::Applied(record))
    }
}

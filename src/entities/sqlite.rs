//! SQLite-backed entity store
//!
//! Keeps all syncable entities in one versioned table with a revision history,
//! which the merge strategy uses to see what changed since a client's base.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};

use super::{Actor, EntityRecord, EntityStore, EntityType, WriteOutcome};
use crate::error::SyncError;
use crate::time;

/// Reference [`EntityStore`] over the `sync_entities` table
#[derive(Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_with(
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<EntityRecord>, SyncError> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {} FROM sync_entities WHERE id = ? AND entity_type = ?",
            ENTITY_COLUMNS
        ))
        .bind(id)
        .bind(entity_type.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(EntityRow::into_record).transpose()
    }

    async fn record_revision(
        conn: &mut SqliteConnection,
        record: &EntityRecord,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sync_entity_revisions (
                entity_id, version, data, created_at, updated_by_user, updated_by_device
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(serde_json::to_string(&record.data)?)
        .bind(time::to_db(&record.updated_at))
        .bind(&record.updated_by_user)
        .bind(&record.updated_by_device)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Finish a compare-and-swap write: report the winner's version if the
    /// update matched nothing, otherwise load the new state
    async fn finish_write(
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        id: i64,
        rows_affected: u64,
    ) -> Result<WriteOutcome, SyncError> {
        let current = Self::fetch_with(conn, entity_type, id)
            .await?
            .ok_or_else(|| SyncError::Rejected(format!("{} {} not found", entity_type, id)))?;

        if rows_affected == 0 {
            if current.deleted {
                return Err(SyncError::Rejected(format!(
                    "{} {} has been deleted",
                    entity_type, id
                )));
            }
            return Ok(WriteOutcome::VersionMoved {
                current_version: current.version,
            });
        }

        Self::record_revision(conn, &current).await?;
        Ok(WriteOutcome::Written(current))
    }
}

const ENTITY_COLUMNS: &str = "id, entity_type, owner_id, version, data, deleted, change_seq, \
                              updated_at, updated_by_user, updated_by_device";

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<EntityRecord>, SyncError> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_with(&mut conn, entity_type, id).await
    }

    async fn fetch_revision(
        &self,
        entity_type: EntityType,
        id: i64,
        version: i64,
    ) -> Result<Option<Map<String, Value>>, SyncError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT r.data FROM sync_entity_revisions r
            JOIN sync_entities e ON e.id = r.entity_id
            WHERE r.entity_id = ? AND r.version = ? AND e.entity_type = ?
            "#,
        )
        .bind(id)
        .bind(version)
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(data,)| serde_json::from_str(&data).map_err(SyncError::from))
            .transpose()
    }

    async fn changed_only_by(
        &self,
        entity_type: EntityType,
        id: i64,
        after_version: i64,
        through_version: i64,
        actor: &Actor,
    ) -> Result<bool, SyncError> {
        let (total, own): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN r.updated_by_user = ? AND r.updated_by_device = ?
                             THEN 1 ELSE 0 END), 0)
            FROM sync_entity_revisions r
            JOIN sync_entities e ON e.id = r.entity_id
            WHERE r.entity_id = ? AND e.entity_type = ? AND r.version > ? AND r.version <= ?
            "#,
        )
        .bind(&actor.user_id)
        .bind(&actor.device_id)
        .bind(id)
        .bind(entity_type.as_str())
        .bind(after_version)
        .bind(through_version)
        .fetch_one(&self.pool)
        .await?;

        // A version missing from the history has an unknown writer
        Ok(total == through_version - after_version && own == total)
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        fields: Map<String, Value>,
        actor: &Actor,
    ) -> Result<EntityRecord, SyncError> {
        let now = time::to_db(&Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO sync_entities (
                entity_type, owner_id, version, data, deleted, change_seq,
                created_at, updated_at, updated_by_user, updated_by_device
            ) VALUES (
                ?, ?, 1, ?, 0,
                (SELECT COALESCE(MAX(change_seq), 0) + 1 FROM sync_entities),
                ?, ?, ?, ?
            )
            "#,
        )
        .bind(entity_type.as_str())
        .bind(&actor.user_id)
        .bind(serde_json::to_string(&fields)?)
        .bind(&now)
        .bind(&now)
        .bind(&actor.user_id)
        .bind(&actor.device_id)
        .execute(&mut *conn)
        .await?;

        // One live profile per user. Checked after the insert so the write lock
        // is taken first; the caller's rollback discards the row.
        if entity_type == EntityType::Profile {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sync_entities WHERE entity_type = 'profile' AND owner_id = ? AND deleted = 0",
            )
            .bind(&actor.user_id)
            .fetch_one(&mut *conn)
            .await?;

            if count > 1 {
                return Err(SyncError::Rejected(format!(
                    "user {} already has a profile",
                    actor.user_id
                )));
            }
        }

        let id = result.last_insert_rowid();
        let record = Self::fetch_with(conn, entity_type, id)
            .await?
            .ok_or_else(|| SyncError::Rejected(format!("{} {} vanished after insert", entity_type, id)))?;

        Self::record_revision(conn, &record).await?;
        Ok(record)
    }

    async fn update(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        id: i64,
        expected_version: i64,
        fields: Map<String, Value>,
        actor: &Actor,
    ) -> Result<WriteOutcome, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_entities SET
                data = ?,
                version = version + 1,
                change_seq = (SELECT COALESCE(MAX(change_seq), 0) + 1 FROM sync_entities),
                updated_at = ?,
                updated_by_user = ?,
                updated_by_device = ?
            WHERE id = ? AND entity_type = ? AND version = ? AND deleted = 0
            "#,
        )
        .bind(serde_json::to_string(&fields)?)
        .bind(time::to_db(&Utc::now()))
        .bind(&actor.user_id)
        .bind(&actor.device_id)
        .bind(id)
        .bind(entity_type.as_str())
        .bind(expected_version)
        .execute(&mut *conn)
        .await?;

        Self::finish_write(conn, entity_type, id, result.rows_affected()).await
    }

    async fn delete(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        id: i64,
        expected_version: i64,
        actor: &Actor,
    ) -> Result<WriteOutcome, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_entities SET
                deleted = 1,
                version = version + 1,
                change_seq = (SELECT COALESCE(MAX(change_seq), 0) + 1 FROM sync_entities),
                updated_at = ?,
                updated_by_user = ?,
                updated_by_device = ?
            WHERE id = ? AND entity_type = ? AND version = ? AND deleted = 0
            "#,
        )
        .bind(time::to_db(&Utc::now()))
        .bind(&actor.user_id)
        .bind(&actor.device_id)
        .bind(id)
        .bind(entity_type.as_str())
        .bind(expected_version)
        .execute(&mut *conn)
        .await?;

        Self::finish_write(conn, entity_type, id, result.rows_affected()).await
    }

    async fn changed_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<EntityRecord>, SyncError> {
        let since = since.map(|ts| time::to_db(&ts));

        // Reports are public civic records; tasks are visible to their owner
        // and assignee; profiles only to their owner.
        let rows = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            SELECT {} FROM sync_entities
            WHERE change_seq > ?
              AND (? IS NULL OR updated_at > ?)
              AND (
                  entity_type = 'report'
                  OR owner_id = ?
                  OR (entity_type = 'task' AND json_extract(data, '$.assignee_id') = ?)
              )
            ORDER BY change_seq ASC
            LIMIT ?
            "#,
            ENTITY_COLUMNS
        ))
        .bind(after_seq)
        .bind(&since)
        .bind(&since)
        .bind(user_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EntityRow::into_record).collect()
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: i64,
    entity_type: String,
    owner_id: String,
    version: i64,
    data: String,
    deleted: bool,
    change_seq: i64,
    updated_at: String,
    updated_by_user: String,
    updated_by_device: String,
}

impl EntityRow {
    fn into_record(self) -> Result<EntityRecord, SyncError> {
        let updated_at = time::from_db(&self.updated_at)
            .map_err(|e| SyncError::Storage(sqlx::Error::Decode(Box::new(e))))?;

        Ok(EntityRecord {
            entity_type: self.entity_type.parse()?,
            id: self.id,
            owner_id: self.owner_id,
            version: self.version,
            data: serde_json::from_str(&self.data)?,
            deleted: self.deleted,
            change_seq: self.change_seq,
            updated_at,
            updated_by_user: self.updated_by_user,
            updated_by_device: self.updated_by_device,
        })
    }
}

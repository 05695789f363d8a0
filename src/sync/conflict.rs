//! Conflict detection and the conflict log
//!
//! Detection is a version compare: an action edited from `base_version`, and
//! the server now holds `current.version`. A mismatch is only a conflict when
//! someone other than the submitting device wrote any of the versions in
//! between.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use super::types::{ConflictStatus, ConflictStrategy, SyncConflict};
use crate::entities::{Actor, EntityRecord, EntityStore};
use crate::error::SyncError;
use crate::time;

/// Result of comparing an action's base version with the server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The client edited the current version
    Current,
    /// The server moved on, but only through this device's own changes
    OwnChange,
    /// Another user or device changed the entity since the client's base
    Conflict,
}

/// Compares declared base versions against current entity versions
#[derive(Clone)]
pub struct ConflictDetector {
    entities: Arc<dyn EntityStore>,
}

impl ConflictDetector {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }

    pub async fn check(
        &self,
        base_version: i64,
        current: &EntityRecord,
        actor: &Actor,
    ) -> Result<Verdict, SyncError> {
        if base_version == current.version {
            return Ok(Verdict::Current);
        }

        if base_version > current.version {
            return Err(SyncError::Validation(format!(
                "base_version {} is ahead of server version {} for {} {}",
                base_version, current.version, current.entity_type, current.id
            )));
        }

        if !current.last_changed_by(actor) {
            return Ok(Verdict::Conflict);
        }

        let own_only = self
            .entities
            .changed_only_by(
                current.entity_type,
                current.id,
                base_version,
                current.version,
                actor,
            )
            .await?;

        if own_only {
            Ok(Verdict::OwnChange)
        } else {
            tracing::debug!(
                entity_type = %current.entity_type,
                entity_id = current.id,
                base_version,
                current_version = current.version,
                "Another writer changed the entity before this device's latest change"
            );
            Ok(Verdict::Conflict)
        }
    }
}

/// Repository for the `sync_conflicts` table
#[derive(Clone)]
pub struct ConflictLog {
    pool: SqlitePool,
}

impl ConflictLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a conflict inside the caller's transaction
    pub async fn insert_with(
        conn: &mut SqliteConnection,
        conflict: &SyncConflict,
    ) -> Result<(), SyncError> {
        let resolved_payload = conflict
            .resolved_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sync_conflicts (
                id, entity_type, entity_id, client_action_id, user_id, device_id,
                client_version, server_version, client_payload, server_payload_snapshot,
                resolution_strategy, status, resolved_payload, resolved_by, resolved_at,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conflict.id)
        .bind(conflict.entity_type.as_str())
        .bind(conflict.entity_id)
        .bind(&conflict.client_action_id)
        .bind(&conflict.user_id)
        .bind(&conflict.device_id)
        .bind(conflict.client_version)
        .bind(conflict.server_version)
        .bind(serde_json::to_string(&conflict.client_payload)?)
        .bind(serde_json::to_string(&conflict.server_payload_snapshot)?)
        .bind(conflict.resolution_strategy.as_str())
        .bind(conflict.status.as_str())
        .bind(&resolved_payload)
        .bind(&conflict.resolved_by)
        .bind(conflict.resolved_at.as_ref().map(time::to_db))
        .bind(time::to_db(&conflict.created_at))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Write the resolution fields of an unresolved conflict
    ///
    /// Returns `false` if the conflict was already resolved; resolution
    /// fields are only ever written once.
    pub async fn resolve_with(
        conn: &mut SqliteConnection,
        conflict_id: &str,
        strategy: ConflictStrategy,
        resolved_payload: &Value,
        resolved_by: &str,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_conflicts SET
                status = 'resolved',
                resolution_strategy = ?,
                resolved_payload = ?,
                resolved_by = ?,
                resolved_at = ?
            WHERE id = ? AND status = 'unresolved'
            "#,
        )
        .bind(strategy.as_str())
        .bind(serde_json::to_string(resolved_payload)?)
        .bind(resolved_by)
        .bind(time::to_db(&Utc::now()))
        .bind(conflict_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, conflict_id: &str) -> Result<Option<SyncConflict>, SyncError> {
        let row = sqlx::query_as::<_, ConflictRow>(&format!(
            "SELECT {} FROM sync_conflicts WHERE id = ?",
            CONFLICT_COLUMNS
        ))
        .bind(conflict_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConflictRow::into_conflict).transpose()
    }

    /// Unresolved conflicts raised by a user's actions, oldest first
    pub async fn list_unresolved(&self, user_id: &str) -> Result<Vec<SyncConflict>, SyncError> {
        let rows = sqlx::query_as::<_, ConflictRow>(&format!(
            r#"
            SELECT {} FROM sync_conflicts
            WHERE user_id = ? AND status = 'unresolved'
            ORDER BY created_at ASC
            "#,
            CONFLICT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRow::into_conflict).collect()
    }

    pub async fn count_unresolved(&self, user_id: &str) -> Result<i64, SyncError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_conflicts WHERE user_id = ? AND status = 'unresolved'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, client_action_id, user_id, device_id, \
                                client_version, server_version, client_payload, \
                                server_payload_snapshot, resolution_strategy, status, \
                                resolved_payload, resolved_by, resolved_at, created_at";

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    entity_type: String,
    entity_id: i64,
    client_action_id: String,
    user_id: String,
    device_id: String,
    client_version: i64,
    server_version: i64,
    client_payload: String,
    server_payload_snapshot: String,
    resolution_strategy: String,
    status: String,
    resolved_payload: Option<String>,
    resolved_by: Option<String>,
    resolved_at: Option<String>,
    created_at: String,
}

impl ConflictRow {
    fn into_conflict(self) -> Result<SyncConflict, SyncError> {
        let created_at = time::from_db(&self.created_at)
            .map_err(|e| SyncError::Storage(sqlx::Error::Decode(Box::new(e))))?;

        let status = match self.status.as_str() {
            "resolved" => ConflictStatus::Resolved,
            _ => ConflictStatus::Unresolved,
        };

        Ok(SyncConflict {
            id: self.id,
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id,
            client_action_id: self.client_action_id,
            user_id: self.user_id,
            device_id: self.device_id,
            client_version: self.client_version,
            server_version: self.server_version,
            client_payload: serde_json::from_str(&self.client_payload)?,
            server_payload_snapshot: serde_json::from_str(&self.server_payload_snapshot)?,
            resolution_strategy: self.resolution_strategy.parse()?,
            status,
            resolved_payload: self
                .resolved_payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            resolved_by: self.resolved_by,
            resolved_at: time::from_db_opt(self.resolved_at.as_deref()),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::entities::{EntityType, SqliteEntityStore, WriteOutcome};
    use serde_json::{json, Map};

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    /// A report written by each actor in turn, one version per writer
    async fn report_written_by(pool: &SqlitePool, writers: &[&Actor]) -> EntityRecord {
        let store = SqliteEntityStore::new(pool.clone());
        let mut conn = pool.acquire().await.unwrap();
        let mut record = store
            .create(&mut conn, EntityType::Report, fields(json!({"title": "Pothole"})), writers[0])
            .await
            .unwrap();

        for actor in &writers[1..] {
            let outcome = store
                .update(&mut conn, EntityType::Report, record.id, record.version, Map::new(), actor)
                .await
                .unwrap();
            record = match outcome {
                WriteOutcome::Written(record) => record,
                other => panic!("unexpected outcome: {:?}", other),
            };
        }
        record
    }

    fn detector(pool: &SqlitePool) -> ConflictDetector {
        ConflictDetector::new(Arc::new(SqliteEntityStore::new(pool.clone())))
    }

    fn conflict(id: &str) -> SyncConflict {
        SyncConflict {
            id: id.to_string(),
            entity_type: EntityType::Report,
            entity_id: 42,
            client_action_id: "b1".to_string(),
            user_id: "user-2".to_string(),
            device_id: "device-b".to_string(),
            client_version: 3,
            server_version: 4,
            client_payload: json!({"title": "From B"}),
            server_payload_snapshot: json!({"title": "From A"}),
            resolution_strategy: ConflictStrategy::Manual,
            status: ConflictStatus::Unresolved,
            resolved_payload: None,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_matching_version_is_current() {
        let pool = test_pool().await;
        let a = Actor::new("user-1", "device-a");
        let current = report_written_by(&pool, &[&a, &a, &a]).await;

        let b = Actor::new("user-2", "device-b");
        let verdict = detector(&pool).check(3, &current, &b).await.unwrap();
        assert_eq!(verdict, Verdict::Current);
    }

    #[tokio::test]
    async fn test_other_device_change_conflicts() {
        let pool = test_pool().await;
        let a = Actor::new("user-1", "device-a");
        let current = report_written_by(&pool, &[&a, &a, &a, &a]).await;
        let detector = detector(&pool);

        let b = Actor::new("user-2", "device-b");
        assert_eq!(detector.check(3, &current, &b).await.unwrap(), Verdict::Conflict);

        // Same user on another device still conflicts
        let other_device = Actor::new("user-1", "device-b");
        assert_eq!(
            detector.check(3, &current, &other_device).await.unwrap(),
            Verdict::Conflict
        );
    }

    #[tokio::test]
    async fn test_own_later_change_is_not_a_conflict() {
        let pool = test_pool().await;
        let a = Actor::new("user-1", "device-a");
        let current = report_written_by(&pool, &[&a, &a, &a, &a]).await;

        let verdict = detector(&pool).check(3, &current, &a).await.unwrap();
        assert_eq!(verdict, Verdict::OwnChange);
    }

    #[tokio::test]
    async fn test_foreign_change_before_own_latest_conflicts() {
        let pool = test_pool().await;
        let a = Actor::new("user-1", "device-a");
        let b = Actor::new("user-2", "device-b");
        // v4 by device-b, v5 by device-a
        let current = report_written_by(&pool, &[&a, &a, &a, &b, &a]).await;
        let detector = detector(&pool);

        assert_eq!(detector.check(3, &current, &a).await.unwrap(), Verdict::Conflict);
        assert_eq!(detector.check(4, &current, &a).await.unwrap(), Verdict::OwnChange);
    }

    #[tokio::test]
    async fn test_future_base_version_rejected() {
        let pool = test_pool().await;
        let a = Actor::new("user-1", "device-a");
        let current = report_written_by(&pool, &[&a, &a, &a, &a]).await;

        let err = detector(&pool).check(9, &current, &a).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_resolution_is_written_once() {
        let pool = test_pool().await;
        let log = ConflictLog::new(pool.clone());

        let mut conn = pool.acquire().await.unwrap();
        ConflictLog::insert_with(&mut conn, &conflict("c-1")).await.unwrap();

        let first = ConflictLog::resolve_with(
            &mut conn,
            "c-1",
            ConflictStrategy::ClientWins,
            &json!({"title": "From B"}),
            "reviewer-1",
        )
        .await
        .unwrap();
        assert!(first);

        let second = ConflictLog::resolve_with(
            &mut conn,
            "c-1",
            ConflictStrategy::ServerWins,
            &json!({"title": "From A"}),
            "reviewer-2",
        )
        .await
        .unwrap();
        assert!(!second);
        drop(conn);

        let stored = log.get("c-1").await.unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(stored.resolution_strategy, ConflictStrategy::ClientWins);
        assert_eq!(stored.resolved_by.as_deref(), Some("reviewer-1"));
        assert_eq!(stored.resolved_payload, Some(json!({"title": "From B"})));
    }

    #[tokio::test]
    async fn test_list_and_count_unresolved() {
        let pool = test_pool().await;
        let log = ConflictLog::new(pool.clone());

        let mut conn = pool.acquire().await.unwrap();
        ConflictLog::insert_with(&mut conn, &conflict("c-1")).await.unwrap();
        let mut resolved = conflict("c-2");
        resolved.status = ConflictStatus::Resolved;
        resolved.resolution_strategy = ConflictStrategy::ServerWins;
        ConflictLog::insert_with(&mut conn, &resolved).await.unwrap();
        drop(conn);

        let open = log.list_unresolved("user-2").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "c-1");
        assert_eq!(log.count_unresolved("user-2").await.unwrap(), 1);
        assert_eq!(log.count_unresolved("user-1").await.unwrap(), 0);
    }
}

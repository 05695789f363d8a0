//! Durable action log
//!
//! Every uploaded action is recorded under its client-generated id before it
//! is processed. The id is the idempotency key: a resubmitted action finds its
//! existing row and never executes twice.

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use super::types::{ActionStatus, OfflineAction, UploadAction};
use crate::error::SyncError;
use crate::time;

/// Outcome of recording an action
#[derive(Debug, Clone)]
pub enum Recorded {
    /// First time this id was seen
    New(OfflineAction),
    /// The id was already recorded; the stored row is returned untouched
    Existing(OfflineAction),
}

impl Recorded {
    pub fn action(&self) -> &OfflineAction {
        match self {
            Recorded::New(action) | Recorded::Existing(action) => action,
        }
    }
}

/// Repository for the `offline_actions` table
#[derive(Clone)]
pub struct ActionLog {
    pool: SqlitePool,
}

impl ActionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the action as `pending` unless its id is already known
    pub async fn record_pending(
        &self,
        user_id: &str,
        device_id: &str,
        action: &UploadAction,
    ) -> Result<Recorded, SyncError> {
        let now = time::to_db(&Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO offline_actions (
                client_action_id, device_id, user_id, action_type, entity_type,
                entity_id, base_version, payload, client_timestamp,
                submitted_at, updated_at, status, retry_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0)
            ON CONFLICT(client_action_id) DO NOTHING
            "#,
        )
        .bind(&action.client_id)
        .bind(device_id)
        .bind(user_id)
        .bind(&action.action_type)
        .bind(&action.entity_type)
        .bind(action.entity_id)
        .bind(action.base_version)
        .bind(serde_json::to_string(&action.payload)?)
        .bind(time::to_db(&action.timestamp))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let stored = self.get(&action.client_id).await?.ok_or_else(|| {
            SyncError::Rejected(format!("action {} vanished after insert", action.client_id))
        })?;

        if result.rows_affected() == 1 {
            Ok(Recorded::New(stored))
        } else {
            Ok(Recorded::Existing(stored))
        }
    }

    /// Fetch one action by its idempotency key
    pub async fn get(&self, client_action_id: &str) -> Result<Option<OfflineAction>, SyncError> {
        let row = sqlx::query_as::<_, ActionRow>(&format!(
            "SELECT {} FROM offline_actions WHERE client_action_id = ?",
            ACTION_COLUMNS
        ))
        .bind(client_action_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ActionRow::into_action).transpose()
    }

    /// Take exclusive ownership of an action for processing
    ///
    /// Succeeds for `pending` and `failed_retryable` rows, and for `applying`
    /// rows whose previous owner has not touched them within `lease`.
    pub async fn claim(&self, client_action_id: &str, lease: Duration) -> Result<bool, SyncError> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE offline_actions SET status = 'applying', updated_at = ?
            WHERE client_action_id = ?
              AND (
                  status IN ('pending', 'failed_retryable')
                  OR (status = 'applying' AND updated_at < ?)
              )
            "#,
        )
        .bind(time::to_db(&now))
        .bind(client_action_id)
        .bind(time::to_db(&(now - lease)))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark an action applied, inside the caller's transaction
    pub async fn mark_applied_with(
        conn: &mut SqliteConnection,
        client_action_id: &str,
        server_entity_id: i64,
        conflict_id: Option<&str>,
        message: &str,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE offline_actions SET
                status = 'applied',
                server_entity_id = ?,
                conflict_id = COALESCE(?, conflict_id),
                result_message = ?,
                updated_at = ?
            WHERE client_action_id = ? AND status NOT IN ('applied', 'failed_permanent')
            "#,
        )
        .bind(server_entity_id)
        .bind(conflict_id)
        .bind(message)
        .bind(time::to_db(&Utc::now()))
        .bind(client_action_id)
        .execute(&mut *conn)
        .await?;

        Ok(transitioned(client_action_id, ActionStatus::Applied, result.rows_affected()))
    }

    #[cfg(test)]
    pub async fn mark_applied(
        &self,
        client_action_id: &str,
        server_entity_id: i64,
        message: &str,
    ) -> Result<bool, SyncError> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_applied_with(&mut conn, client_action_id, server_entity_id, None, message).await
    }

    /// Mark an action as conflicting, inside the caller's transaction
    pub async fn mark_conflict_with(
        conn: &mut SqliteConnection,
        client_action_id: &str,
        server_entity_id: i64,
        conflict_id: &str,
        message: &str,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE offline_actions SET
                status = 'conflict',
                server_entity_id = ?,
                conflict_id = ?,
                result_message = ?,
                updated_at = ?
            WHERE client_action_id = ? AND status NOT IN ('applied', 'failed_permanent')
            "#,
        )
        .bind(server_entity_id)
        .bind(conflict_id)
        .bind(message)
        .bind(time::to_db(&Utc::now()))
        .bind(client_action_id)
        .execute(&mut *conn)
        .await?;

        Ok(transitioned(client_action_id, ActionStatus::Conflict, result.rows_affected()))
    }

    pub async fn mark_failed(
        &self,
        client_action_id: &str,
        retryable: bool,
        message: &str,
    ) -> Result<bool, SyncError> {
        let status = if retryable {
            ActionStatus::FailedRetryable
        } else {
            ActionStatus::FailedPermanent
        };

        let result = sqlx::query(
            r#"
            UPDATE offline_actions SET status = ?, result_message = ?, updated_at = ?
            WHERE client_action_id = ? AND status NOT IN ('applied', 'failed_permanent')
            "#,
        )
        .bind(status.as_str())
        .bind(message)
        .bind(time::to_db(&Utc::now()))
        .bind(client_action_id)
        .execute(&self.pool)
        .await?;

        Ok(transitioned(client_action_id, status, result.rows_affected()))
    }

    /// Count one more failed attempt and return the new total
    pub async fn increment_retry(&self, client_action_id: &str) -> Result<i64, SyncError> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            "UPDATE offline_actions SET retry_count = retry_count + 1 WHERE client_action_id = ?",
        )
        .bind(client_action_id)
        .execute(&mut *conn)
        .await?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT retry_count FROM offline_actions WHERE client_action_id = ?")
                .bind(client_action_id)
                .fetch_one(&mut *conn)
                .await?;

        Ok(count)
    }

    /// Actions of a device that still need another attempt
    pub async fn pending_count(&self, user_id: &str, device_id: &str) -> Result<i64, SyncError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM offline_actions
            WHERE user_id = ? AND device_id = ?
              AND status IN ('pending', 'applying', 'failed_retryable')
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

fn transitioned(client_action_id: &str, to: ActionStatus, rows_affected: u64) -> bool {
    if rows_affected == 0 {
        tracing::warn!(
            client_action_id = %client_action_id,
            to = to.as_str(),
            "Ignoring transition of a terminal or unknown action"
        );
        return false;
    }
    true
}

const ACTION_COLUMNS: &str = "client_action_id, device_id, user_id, action_type, entity_type, \
                              entity_id, base_version, payload, client_timestamp, submitted_at, \
                              updated_at, status, retry_count, server_entity_id, conflict_id, \
                              result_message";

#[derive(sqlx::FromRow)]
struct ActionRow {
    client_action_id: String,
    device_id: String,
    user_id: String,
    action_type: String,
    entity_type: String,
    entity_id: Option<i64>,
    base_version: Option<i64>,
    payload: String,
    client_timestamp: String,
    submitted_at: String,
    updated_at: String,
    status: String,
    retry_count: i64,
    server_entity_id: Option<i64>,
    conflict_id: Option<String>,
    result_message: Option<String>,
}

impl ActionRow {
    fn into_action(self) -> Result<OfflineAction, SyncError> {
        let parse = |s: &str| {
            time::from_db(s).map_err(|e| SyncError::Storage(sqlx::Error::Decode(Box::new(e))))
        };

        Ok(OfflineAction {
            client_timestamp: parse(&self.client_timestamp)?,
            submitted_at: parse(&self.submitted_at)?,
            updated_at: parse(&self.updated_at)?,
            status: self.status.parse()?,
            payload: serde_json::from_str::<Value>(&self.payload)?,
            client_action_id: self.client_action_id,
            device_id: self.device_id,
            user_id: self.user_id,
            action_type: self.action_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            base_version: self.base_version,
            retry_count: self.retry_count,
            server_entity_id: self.server_entity_id,
            conflict_id: self.conflict_id,
            result_message: self.result_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;

    fn upload(client_id: &str) -> UploadAction {
        serde_json::from_value(json!({
            "client_id": client_id,
            "action_type": "create_entity",
            "entity_type": "report",
            "timestamp": "2024-05-01T09:00:00Z",
            "payload": {"title": "Pothole"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_record_pending_is_idempotent() {
        let log = ActionLog::new(test_pool().await);

        let first = log.record_pending("user-1", "device-a", &upload("u1")).await.unwrap();
        assert!(matches!(first, Recorded::New(_)));
        assert_eq!(first.action().status, ActionStatus::Pending);

        let second = log.record_pending("user-1", "device-a", &upload("u1")).await.unwrap();
        assert!(matches!(second, Recorded::Existing(_)));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let log = ActionLog::new(test_pool().await);
        log.record_pending("user-1", "device-a", &upload("u1")).await.unwrap();

        assert!(log.claim("u1", Duration::seconds(300)).await.unwrap());
        assert!(!log.claim("u1", Duration::seconds(300)).await.unwrap());

        // An abandoned claim can be taken over once its lease has run out
        assert!(log.claim("u1", Duration::seconds(-1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_transitions_are_noops() {
        let log = ActionLog::new(test_pool().await);
        log.record_pending("user-1", "device-a", &upload("u1")).await.unwrap();

        assert!(log.mark_applied("u1", 7, "created report 7").await.unwrap());
        assert!(!log.mark_failed("u1", false, "late failure").await.unwrap());

        let stored = log.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Applied);
        assert_eq!(stored.server_entity_id, Some(7));
        assert!(!log.claim("u1", Duration::seconds(300)).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_counting_and_pending_count() {
        let log = ActionLog::new(test_pool().await);
        log.record_pending("user-1", "device-a", &upload("u1")).await.unwrap();
        log.record_pending("user-1", "device-a", &upload("u2")).await.unwrap();

        assert_eq!(log.increment_retry("u1").await.unwrap(), 1);
        assert_eq!(log.increment_retry("u1").await.unwrap(), 2);
        log.mark_failed("u1", true, "database locked").await.unwrap();
        assert_eq!(log.pending_count("user-1", "device-a").await.unwrap(), 2);

        log.mark_failed("u2", false, "invalid payload").await.unwrap();
        assert_eq!(log.pending_count("user-1", "device-a").await.unwrap(), 1);
        assert_eq!(log.pending_count("user-1", "device-b").await.unwrap(), 0);
    }
}

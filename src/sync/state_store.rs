//! Per-device sync state persistence

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use super::types::ClientSyncState;
use crate::error::SyncError;
use crate::time;

/// Repository for the `client_sync_state` table
#[derive(Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return the device's state, creating it with empty cursors on first contact
    ///
    /// Supplied `device_info` replaces the stored metadata.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        device_id: &str,
        device_info: Option<&Value>,
    ) -> Result<ClientSyncState, SyncError> {
        let info = device_info.map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO client_sync_state (user_id, device_id, device_info, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, device_id) DO UPDATE SET
                device_info = COALESCE(excluded.device_info, client_sync_state.device_info)
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(&info)
        .bind(time::to_db(&Utc::now()))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, SyncStateRow>(
            r#"
            SELECT user_id, device_id, last_upload_at, last_download_at,
                   device_info, created_at, retired_at
            FROM client_sync_state
            WHERE user_id = ? AND device_id = ?
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;

        row.into_state()
    }

    /// Advance the upload cursor inside the caller's transaction
    ///
    /// Older timestamps are ignored so out-of-order requests never move the
    /// cursor backwards. Returns whether the cursor moved.
    pub async fn update_upload_cursor_with(
        conn: &mut SqliteConnection,
        user_id: &str,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let at = time::to_db(&at);

        let result = sqlx::query(
            r#"
            UPDATE client_sync_state SET last_upload_at = ?
            WHERE user_id = ? AND device_id = ?
              AND (last_upload_at IS NULL OR last_upload_at < ?)
            "#,
        )
        .bind(&at)
        .bind(user_id)
        .bind(device_id)
        .bind(&at)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn update_upload_cursor(
        &self,
        user_id: &str,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let mut conn = self.pool.acquire().await?;
        Self::update_upload_cursor_with(&mut conn, user_id, device_id, at).await
    }

    /// Advance the download cursor; older timestamps are ignored
    pub async fn update_download_cursor(
        &self,
        user_id: &str,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let at = time::to_db(&at);

        let result = sqlx::query(
            r#"
            UPDATE client_sync_state SET last_download_at = ?
            WHERE user_id = ? AND device_id = ?
              AND (last_download_at IS NULL OR last_download_at < ?)
            "#,
        )
        .bind(&at)
        .bind(user_id)
        .bind(device_id)
        .bind(&at)
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected() == 1;
        if !moved {
            tracing::debug!(
                user_id = %user_id,
                device_id = %device_id,
                "Download cursor not advanced"
            );
        }
        Ok(moved)
    }
}

#[derive(sqlx::FromRow)]
struct SyncStateRow {
    user_id: String,
    device_id: String,
    last_upload_at: Option<String>,
    last_download_at: Option<String>,
    device_info: Option<String>,
    created_at: String,
    retired_at: Option<String>,
}

impl SyncStateRow {
    fn into_state(self) -> Result<ClientSyncState, SyncError> {
        let created_at = time::from_db(&self.created_at)
            .map_err(|e| SyncError::Storage(sqlx::Error::Decode(Box::new(e))))?;

        Ok(ClientSyncState {
            user_id: self.user_id,
            device_id: self.device_id,
            last_upload_at: time::from_db_opt(self.last_upload_at.as_deref()),
            last_download_at: time::from_db_opt(self.last_download_at.as_deref()),
            device_info: self
                .device_info
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at,
            retired_at: time::from_db_opt(self.retired_at.as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::{Duration, SubsecRound};
    use serde_json::json;

    #[tokio::test]
    async fn test_get_or_create() {
        let store = SyncStateStore::new(test_pool().await);

        let info = json!({"platform": "android", "app_version": "2.3.0"});
        let state = store
            .get_or_create("user-1", "device-a", Some(&info))
            .await
            .unwrap();
        assert!(state.last_upload_at.is_none());
        assert!(state.last_download_at.is_none());
        assert_eq!(state.device_info, Some(info.clone()));

        // Second call finds the same row and keeps metadata
        let again = store.get_or_create("user-1", "device-a", None).await.unwrap();
        assert_eq!(again.created_at, state.created_at);
        assert_eq!(again.device_info, Some(info));
    }

    #[tokio::test]
    async fn test_download_cursor_never_regresses() {
        let store = SyncStateStore::new(test_pool().await);
        store.get_or_create("user-1", "device-a", None).await.unwrap();

        let t1 = Utc::now().trunc_subsecs(6);
        let t0 = t1 - Duration::minutes(5);

        assert!(store.update_download_cursor("user-1", "device-a", t1).await.unwrap());
        assert!(!store.update_download_cursor("user-1", "device-a", t0).await.unwrap());

        let state = store.get_or_create("user-1", "device-a", None).await.unwrap();
        assert_eq!(state.last_download_at, Some(t1));
        assert_eq!(state.last_sync(), Some(t1));
    }

    #[tokio::test]
    async fn test_upload_cursor_is_monotonic() {
        let store = SyncStateStore::new(test_pool().await);
        store.get_or_create("user-1", "device-a", None).await.unwrap();

        let t1 = Utc::now();
        assert!(store.update_upload_cursor("user-1", "device-a", t1).await.unwrap());
        assert!(!store
            .update_upload_cursor("user-1", "device-a", t1 - Duration::seconds(1))
            .await
            .unwrap());
        assert!(!store.update_upload_cursor("user-1", "device-a", t1).await.unwrap());
    }
}

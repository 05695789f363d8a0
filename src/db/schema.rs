//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- One row per (user, device) tracking sync cursors
CREATE TABLE IF NOT EXISTS client_sync_state (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    last_upload_at TEXT,
    last_download_at TEXT,
    device_info TEXT,
    created_at TEXT NOT NULL,
    retired_at TEXT,

    UNIQUE(user_id, device_id)
);

-- Every client-submitted action and its outcome
CREATE TABLE IF NOT EXISTS offline_actions (
    client_action_id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id INTEGER,
    base_version INTEGER,
    payload TEXT NOT NULL,
    client_timestamp TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    server_entity_id INTEGER,
    conflict_id TEXT,
    result_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_actions_device ON offline_actions(user_id, device_id, status);
CREATE INDEX IF NOT EXISTS idx_actions_entity ON offline_actions(entity_type, entity_id);

-- Detected conflicts and their resolution
CREATE TABLE IF NOT EXISTS sync_conflicts (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    client_action_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    client_version INTEGER NOT NULL,
    server_version INTEGER NOT NULL,
    client_payload TEXT NOT NULL,
    server_payload_snapshot TEXT NOT NULL,
    resolution_strategy TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'unresolved',
    resolved_payload TEXT,
    resolved_by TEXT,
    resolved_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conflicts_user ON sync_conflicts(user_id, status);
CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON sync_conflicts(entity_type, entity_id);

-- Syncable entities (reports, tasks, profiles) behind the entity store
CREATE TABLE IF NOT EXISTS sync_entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    data TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    change_seq INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    updated_by_user TEXT NOT NULL,
    updated_by_device TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_change_seq ON sync_entities(change_seq);
CREATE INDEX IF NOT EXISTS idx_entities_owner ON sync_entities(entity_type, owner_id);

-- Entity field history and its writers, keyed by version
CREATE TABLE IF NOT EXISTS sync_entity_revisions (
    entity_id INTEGER NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_by_user TEXT NOT NULL,
    updated_by_device TEXT NOT NULL,

    PRIMARY KEY(entity_id, version)
);
"#;

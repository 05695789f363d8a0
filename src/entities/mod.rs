//! Entity access for the sync engine
//!
//! The sync engine never touches entity schemas directly. It reads and
//! mutates reports, tasks and profiles through the [`EntityStore`] trait,
//! which the owning collaborator implements. Writes run on a connection
//! supplied by the engine so that an entity mutation commits atomically with
//! the action log and cursor updates.
//!
//! Every entity carries a monotonically increasing `version`, the identity of
//! the last writer, and a global `change_seq` used for delta pagination.

mod schema;
mod sqlite;

pub use schema::{
    EntityPatch, EntityType, Priority, ProfileFields, ReportFields, ReportStatus, TaskFields,
    TaskStatus,
};
pub use sqlite::SqliteEntityStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqliteConnection;

use crate::error::SyncError;

/// The authenticated user and device performing a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub device_id: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Current server-side state of one entity
#[derive(Debug, Clone, Serialize)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub id: i64,
    pub owner_id: String,
    pub version: i64,
    pub data: Map<String, Value>,
    pub deleted: bool,
    pub change_seq: i64,
    pub updated_at: DateTime<Utc>,
    pub updated_by_user: String,
    pub updated_by_device: String,
}

impl EntityRecord {
    /// Whether `actor` made the latest change to this entity
    pub fn last_changed_by(&self, actor: &Actor) -> bool {
        self.updated_by_user == actor.user_id && self.updated_by_device == actor.device_id
    }

    /// Client-facing representation: the entity fields plus sync metadata
    pub fn to_wire(&self) -> Value {
        let mut obj = self.data.clone();
        obj.insert("id".into(), Value::from(self.id));
        obj.insert("version".into(), Value::from(self.version));
        obj.insert("deleted".into(), Value::from(self.deleted));
        obj.insert("owner_id".into(), Value::from(self.owner_id.clone()));
        obj.insert(
            "updated_at".into(),
            Value::from(crate::time::to_db(&self.updated_at)),
        );
        Value::Object(obj)
    }
}

/// Result of a version-checked write
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Written(EntityRecord),
    /// Another writer committed first; nothing was changed
    VersionMoved { current_version: i64 },
}

/// Generic entity access used by the sync engine
///
/// `update` and `delete` are compare-and-swap on `expected_version`.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch the current state of an entity, tombstones included
    async fn fetch(&self, entity_type: EntityType, id: i64)
        -> Result<Option<EntityRecord>, SyncError>;

    /// Fetch the fields an entity had at a past version, if history is kept
    async fn fetch_revision(
        &self,
        entity_type: EntityType,
        id: i64,
        version: i64,
    ) -> Result<Option<Map<String, Value>>, SyncError>;

    /// Whether every version in `(after_version, through_version]` was
    /// written by `actor`
    ///
    /// Versions without a recorded writer count as someone else's change.
    async fn changed_only_by(
        &self,
        entity_type: EntityType,
        id: i64,
        after_version: i64,
        through_version: i64,
        actor: &Actor,
    ) -> Result<bool, SyncError>;

    /// Create a new entity at version 1
    async fn create(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        fields: Map<String, Value>,
        actor: &Actor,
    ) -> Result<EntityRecord, SyncError>;

    /// Replace the fields of an entity if it is still at `expected_version`
    async fn update(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        id: i64,
        expected_version: i64,
        fields: Map<String, Value>,
        actor: &Actor,
    ) -> Result<WriteOutcome, SyncError>;

    /// Tombstone an entity if it is still at `expected_version`
    async fn delete(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        id: i64,
        expected_version: i64,
        actor: &Actor,
    ) -> Result<WriteOutcome, SyncError>;

    /// Entities visible to `user_id` changed after `since` and past `after_seq`,
    /// in change order
    async fn changed_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<EntityRecord>, SyncError>;
}

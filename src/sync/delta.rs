//! Incremental download pages
//!
//! Changes are paged in change-sequence order. The cursor carries the last
//! sequence number served, so a page boundary never skips or repeats an entity
//! even when several share one timestamp.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entities::{EntityStore, EntityType};
use crate::error::SyncError;

const CURSOR_PREFIX: &str = "v1:";

/// One page of changes visible to a user
#[derive(Debug, Clone)]
pub struct DeltaPage {
    /// Every entity type is present, possibly empty
    pub entities: BTreeMap<EntityType, Vec<Value>>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Change timestamp of the last entity on this page
    pub high_water: Option<DateTime<Utc>>,
}

pub fn encode_cursor(change_seq: i64) -> String {
    format!("{}{}", CURSOR_PREFIX, change_seq)
}

pub fn decode_cursor(cursor: &str) -> Result<i64, SyncError> {
    cursor
        .strip_prefix(CURSOR_PREFIX)
        .and_then(|seq| seq.parse::<i64>().ok())
        .filter(|seq| *seq >= 0)
        .ok_or_else(|| SyncError::Validation(format!("malformed cursor: {}", cursor)))
}

#[derive(Clone)]
pub struct DeltaProducer {
    entities: Arc<dyn EntityStore>,
}

impl DeltaProducer {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }

    pub async fn query(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: i64,
    ) -> Result<DeltaPage, SyncError> {
        let after_seq = cursor.map(decode_cursor).transpose()?.unwrap_or(0);

        let mut records = self
            .entities
            .changed_since(user_id, since, after_seq, page_size + 1)
            .await?;

        let has_more = records.len() as i64 > page_size;
        records.truncate(page_size.max(0) as usize);

        let mut entities: BTreeMap<EntityType, Vec<Value>> = EntityType::ALL
            .iter()
            .map(|entity_type| (*entity_type, Vec::new()))
            .collect();

        let last = records.last();
        let next_cursor = if has_more {
            last.map(|record| encode_cursor(record.change_seq))
        } else {
            None
        };
        let high_water = last.map(|record| record.updated_at);

        for record in &records {
            entities
                .entry(record.entity_type)
                .or_default()
                .push(record.to_wire());
        }

        tracing::debug!(
            user_id = %user_id,
            after_seq,
            count = records.len(),
            has_more,
            "Produced delta page"
        );

        Ok(DeltaPage {
            entities,
            next_cursor,
            has_more,
            high_water,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::entities::{Actor, SqliteEntityStore};
    use serde_json::{json, Map};
    use std::collections::HashSet;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cursor_format() {
        assert_eq!(encode_cursor(17), "v1:17");
        assert_eq!(decode_cursor("v1:17").unwrap(), 17);
        assert!(decode_cursor("17").is_err());
        assert!(decode_cursor("v1:abc").is_err());
        assert!(decode_cursor("v1:-3").is_err());
    }

    #[tokio::test]
    async fn test_pages_cover_every_change_once() {
        let pool = test_pool().await;
        let store = Arc::new(SqliteEntityStore::new(pool.clone()));
        let actor = Actor::new("user-1", "device-a");

        let mut conn = pool.acquire().await.unwrap();
        for i in 0..7 {
            store
                .create(
                    &mut conn,
                    EntityType::Report,
                    fields(json!({"title": format!("Report {}", i)})),
                    &actor,
                )
                .await
                .unwrap();
        }
        drop(conn);

        let producer = DeltaProducer::new(store);
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = producer
                .query("user-2", None, cursor.as_deref(), 3)
                .await
                .unwrap();
            pages += 1;
            for report in &page.entities[&EntityType::Report] {
                assert!(seen.insert(report["id"].as_i64().unwrap()));
            }
            assert!(page.entities.contains_key(&EntityType::Profile));
            if !page.has_more {
                assert!(page.next_cursor.is_none());
                break;
            }
            cursor = page.next_cursor;
        }

        assert_eq!(pages, 3);
        assert_eq!(seen.len(), 7);
    }

    #[tokio::test]
    async fn test_private_entities_hidden_from_others() {
        let pool = test_pool().await;
        let store = Arc::new(SqliteEntityStore::new(pool.clone()));
        let owner = Actor::new("user-1", "device-a");

        let mut conn = pool.acquire().await.unwrap();
        store
            .create(&mut conn, EntityType::Profile, fields(json!({"display_name": "Ana"})), &owner)
            .await
            .unwrap();
        drop(conn);

        let producer = DeltaProducer::new(store);
        let mine = producer.query("user-1", None, None, 10).await.unwrap();
        assert_eq!(mine.entities[&EntityType::Profile].len(), 1);
        assert!(mine.high_water.is_some());

        let theirs = producer.query("user-2", None, None, 10).await.unwrap();
        assert!(theirs.entities[&EntityType::Profile].is_empty());
        assert!(theirs.high_water.is_none());
    }

    #[tokio::test]
    async fn test_malformed_cursor_is_rejected() {
        let pool = test_pool().await;
        let producer = DeltaProducer::new(Arc::new(SqliteEntityStore::new(pool)));
        let err = producer
            .query("user-1", None, Some("garbage"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}

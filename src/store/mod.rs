//! Generic columnar store (§4.4): one row per entity, absorbed through the
//! write-buffer cache (C3) and flushed in batched checkpoints.

pub mod schema;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqlitePool};

use crate::cache::{CacheWeight, WriteBufferCache};
use crate::clock::SharedClock;
use crate::config::CheckpointConfig;
use crate::error::{Error, Result};
use schema::Schema;

/// Reason a checkpoint ran (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    DirtyCount,
    Interval,
    MemoryPressure,
    Eviction,
    Explicit,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointStats {
    pub entity_count: usize,
    pub total_bytes: usize,
    pub duration_ms: u64,
    pub trigger: Option<CheckpointTrigger>,
}

#[derive(Debug, Clone, Default)]
pub struct CostComparison {
    pub writes_without_cache: u64,
    pub writes_with_cache: u64,
    pub checkpoints: u64,
}

/// A generic entity: an ordered JSON object keyed by schema column name.
#[derive(Debug, Clone)]
pub struct Entity(pub Map<String, Value>);

impl CacheWeight for Entity {
    fn cache_weight(&self) -> u32 {
        serde_json::to_vec(&self.0).map(|v| v.len() as u32).unwrap_or(64)
    }
}

pub struct ColumnarStore {
    pool: SqlitePool,
    schema: Schema,
    cache: Arc<WriteBufferCache<String, Entity>>,
    checkpoint_config: CheckpointConfig,
    clock: SharedClock,
    last_checkpoint_ms: AtomicI64,
    writes_without_cache: std::sync::atomic::AtomicU64,
    writes_with_cache: std::sync::atomic::AtomicU64,
    checkpoints_run: std::sync::atomic::AtomicU64,
}

impl ColumnarStore {
    pub fn new(
        pool: SqlitePool,
        schema: Schema,
        checkpoint_config: CheckpointConfig,
        clock: SharedClock,
        cache_max_entries: usize,
        cache_max_bytes: u64,
    ) -> Arc<Self> {
        let cache = WriteBufferCache::new(cache_max_entries, cache_max_bytes);
        let now = clock.now_ms();
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            cache.set_on_evict(Arc::new(move |key: &String, entity: &Entity, _reason, was_dirty| {
                if !was_dirty {
                    return;
                }
                let Some(this) = weak.upgrade() else { return };
                let key = key.clone();
                let entity = entity.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.flush_evicted(&key, entity).await {
                        tracing::warn!(key = %key, error = %err, "failed to flush dirty entity evicted from write-buffer cache");
                    }
                });
            }));
            Self {
                pool,
                schema,
                cache,
                checkpoint_config,
                clock,
                last_checkpoint_ms: AtomicI64::new(now),
                writes_without_cache: Default::default(),
                writes_with_cache: Default::default(),
                checkpoints_run: Default::default(),
            }
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&self.schema.create_table_sql()).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Entity>> {
        if let Some(entity) = self.cache.get(&key.to_string()) {
            return Ok(Some(entity));
        }
        let columns = self.schema.all_sql_columns().join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            columns, self.schema.table, self.schema.primary_key.sql_column
        );
        let row = sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let entity = row_to_entity(&row, &self.schema)?;
                self.cache.set(key.to_string(), entity.clone(), false);
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    pub fn create(&self, key: String, mut entity: Entity) -> Result<()> {
        let now = Value::from(self.clock.now_ms());
        if let Some(field) = &self.schema.created_at_field {
            entity.0.insert(field.clone(), now.clone());
        }
        if let Some(field) = &self.schema.version_field {
            entity.0.insert(field.clone(), Value::from(1));
        }
        self.writes_with_cache.fetch_add(1, Ordering::Relaxed);
        self.cache.set(key, entity, true);
        Ok(())
    }

    pub fn update(&self, key: &str, patch: Map<String, Value>) -> Result<()> {
        let mut entity = self
            .cache
            .get(&key.to_string())
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        for (field, value) in patch {
            entity.0.insert(field, value);
        }
        if let Some(field) = &self.schema.updated_at_field {
            entity.0.insert(field.clone(), Value::from(self.clock.now_ms()));
        }
        if let Some(field) = &self.schema.version_field {
            let next = entity.0.get(field).and_then(Value::as_i64).unwrap_or(0) + 1;
            entity.0.insert(field.clone(), Value::from(next));
        }
        self.writes_with_cache.fetch_add(1, Ordering::Relaxed);
        self.cache.set(key.to_string(), entity, true);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.cache.delete(&key.to_string());
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.schema.table, self.schema.primary_key.sql_column
        );
        sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        self.writes_without_cache.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes dirty entries to the database inside a single SQL transaction
    /// (§4.4: "one UPSERT per dirty entity").
    pub async fn checkpoint(&self, trigger: CheckpointTrigger) -> Result<CheckpointStats> {
        let started = self.clock.now_ms();
        let dirty = self.cache.get_dirty_entries();
        if dirty.is_empty() {
            return Ok(CheckpointStats { trigger: Some(trigger), ..Default::default() });
        }

        let keys: Vec<String> = dirty.iter().map(|(k, _)| k.clone()).collect();
        let total_bytes = self.upsert_entities(&dirty).await?;
        self.cache.mark_clean(&keys);
        self.checkpoints_run.fetch_add(1, Ordering::Relaxed);
        self.last_checkpoint_ms.store(self.clock.now_ms(), Ordering::SeqCst);

        Ok(CheckpointStats {
            entity_count: dirty.len(),
            total_bytes,
            duration_ms: (self.clock.now_ms() - started).max(0) as u64,
            trigger: Some(trigger),
        })
    }

    /// Persists a single entity outside the normal checkpoint cycle, for an
    /// entry the write-buffer cache is about to drop while still dirty
    /// (§4.3 `onEvict`, §4.4 `CheckpointTrigger::Eviction`) — the capacity
    /// eviction that triggered this has already happened by the time this
    /// runs, so there is nothing left in the cache to mark clean.
    async fn flush_evicted(&self, key: &str, entity: Entity) -> Result<()> {
        self.upsert_entities(std::slice::from_ref(&(key.to_string(), entity))).await?;
        self.checkpoints_run.fetch_add(1, Ordering::Relaxed);
        self.last_checkpoint_ms.store(self.clock.now_ms(), Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_entities(&self, entities: &[(String, Entity)]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut total_bytes = 0usize;
        let columns = self.schema.all_sql_columns();
        let placeholders = columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let conflict_updates = columns
            .iter()
            .filter(|c| **c != self.schema.primary_key.sql_column)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            self.schema.table,
            columns.join(", "),
            placeholders,
            self.schema.primary_key.sql_column,
            conflict_updates
        );

        for (key, entity) in entities {
            total_bytes += entity.cache_weight() as usize;
            let mut query = sqlx::query(&sql);
            for column in &columns {
                let value = if *column == self.schema.primary_key.sql_column {
                    Value::String(key.clone())
                } else {
                    entity.0.get(*column).cloned().unwrap_or(Value::Null)
                };
                query = bind_json_value(query, value);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(total_bytes)
    }

    /// Whether a checkpoint should run right now given the configured
    /// triggers (dirty-count threshold, wall interval, memory pressure).
    pub fn should_checkpoint(&self, memory_pressure_ratio: f64) -> Option<CheckpointTrigger> {
        let stats = self.cache.get_stats();
        if stats.dirty_count >= self.checkpoint_config.dirty_count_threshold {
            return Some(CheckpointTrigger::DirtyCount);
        }
        if memory_pressure_ratio >= self.checkpoint_config.memory_pressure_ratio {
            return Some(CheckpointTrigger::MemoryPressure);
        }
        let elapsed = self.clock.now_ms() - self.last_checkpoint_ms.load(Ordering::SeqCst);
        if elapsed >= self.checkpoint_config.interval_ms {
            return Some(CheckpointTrigger::Interval);
        }
        None
    }

    pub fn get_cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.get_stats()
    }

    pub fn get_cost_comparison(&self) -> CostComparison {
        CostComparison {
            writes_without_cache: self.writes_without_cache.load(Ordering::Relaxed),
            writes_with_cache: self.writes_with_cache.load(Ordering::Relaxed),
            checkpoints: self.checkpoints_run.load(Ordering::Relaxed),
        }
    }

    /// Final checkpoint and teardown; idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.checkpoint(CheckpointTrigger::Explicit).await?;
        Ok(())
    }
}

fn row_to_entity(row: &SqliteRow, schema: &Schema) -> Result<Entity> {
    let mut map = Map::new();
    for column in row.columns() {
        let name = column.name().to_string();
        let value: Value = row
            .try_get::<Option<String>, _>(name.as_str())
            .map(|s| s.map(Value::String).unwrap_or(Value::Null))
            .or_else(|_| {
                row.try_get::<Option<i64>, _>(name.as_str())
                    .map(|i| i.map(Value::from).unwrap_or(Value::Null))
            })
            .or_else(|_| {
                row.try_get::<Option<f64>, _>(name.as_str())
                    .map(|f| f.map(Value::from).unwrap_or(Value::Null))
            })
            .map_err(Error::from)?;
        map.insert(name, value);
    }
    let _ = &schema.table;
    Ok(Entity(map))
}

fn bind_json_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VirtualClock;
    use schema::{ColumnSpec, ColumnType};

    async fn store() -> Arc<ColumnarStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let schema = Schema::new("widgets", ColumnSpec::new("id", ColumnType::Text))
            .column(ColumnSpec::new("label", ColumnType::Text))
            .with_updated_at_field("updated_at")
            .with_created_at_field("created_at");
        let store = ColumnarStore::new(
            pool,
            schema,
            CheckpointConfig::default(),
            Arc::new(VirtualClock::new(0)),
            100,
            1024 * 1024,
        );
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_then_checkpoint_then_read_back() {
        let store = store().await;
        let mut entity = Map::new();
        entity.insert("label".into(), Value::String("first".into()));
        store.create("w1".into(), Entity(entity)).unwrap();
        store.checkpoint(CheckpointTrigger::Explicit).await.unwrap();

        // Cache is now clean but warm; a fresh store instance pointed at the
        // same pool would read the persisted row back.
        let stats = store.get_cache_stats();
        assert_eq!(stats.dirty_count, 0);
    }

    #[tokio::test]
    async fn dirty_entry_evicted_from_cache_is_still_persisted() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let schema = Schema::new("widgets", ColumnSpec::new("id", ColumnType::Text))
            .column(ColumnSpec::new("label", ColumnType::Text));
        let store = ColumnarStore::new(pool.clone(), schema, CheckpointConfig::default(), Arc::new(VirtualClock::new(0)), 1, 1024 * 1024);
        store.ensure_schema().await.unwrap();

        let mut a = Map::new();
        a.insert("label".into(), Value::String("a".into()));
        store.create("a".into(), Entity(a)).unwrap();

        // The cache's max_entries is 1, so creating a second entity evicts
        // "a" while it is still dirty; the eviction hook must flush it
        // instead of dropping the write.
        let mut b = Map::new();
        b.insert("label".into(), Value::String("b".into()));
        store.create("b".into(), Entity(b)).unwrap();

        // The eviction hook flushes on a spawned task; give it a turn.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let row = sqlx::query("SELECT label FROM widgets WHERE id = ?")
            .bind("a")
            .fetch_optional(&pool)
            .await
            .unwrap();
        assert!(row.is_some(), "entry evicted while dirty should have been flushed to the database");
    }
}

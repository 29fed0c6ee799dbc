use crate::error::CacheError;
use crate::layers::{FieldValues, LayerRegistry};
use crate::store::{CacheEntry, EntryStatus, LayerStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Event for audit trail ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub layer_id: String,
    pub entity_key: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        layer_id: &str,
        entity_key: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            layer_id: layer_id.to_string(),
            entity_key: entity_key.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    fn for_entry(entry: &CacheEntry) -> Self {
        let event_type = match entry.status {
            EntryStatus::Ok => "entry_written",
            EntryStatus::Failed => "entry_failed",
            EntryStatus::Stale => "entry_invalidated",
        };
        Event::new(
            event_type,
            &entry.layer_id,
            &entry.entity_key,
            serde_json::json!({
                "status": entry.status.as_str(),
                "fields": entry.produced_values.len(),
                "failure": entry.failure,
            }),
            "layer_store",
        )
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Cache entries: one row per (layer, entity), overwritten in place
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cache_entries (
            layer_id TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            produced_values TEXT NOT NULL,
            status TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            source_fingerprint TEXT,
            failure TEXT,
            PRIMARY KEY (layer_id, entity_key)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            layer_id TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cache_status ON cache_entries(layer_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_key, layer_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, layer_id, entity_key, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.layer_id,
            event.entity_key,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(conn: &Connection, entity_key: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, layer_id, entity_key, data, actor
         FROM events
         WHERE entity_key = ?1
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_key], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp_str, 1)?,
                event_type: row.get(2)?,
                layer_id: row.get(3)?,
                entity_key: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_timestamp(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let values_json: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let computed_at_str: String = row.get(4)?;

    let produced_values: FieldValues =
        serde_json::from_str(&values_json).map_err(|e| conversion_error(2, e))?;
    let status = EntryStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown entry status: {}", status_str).into(),
        )
    })?;

    Ok(CacheEntry {
        layer_id: row.get(0)?,
        entity_key: row.get(1)?,
        produced_values,
        status,
        computed_at: parse_timestamp(&computed_at_str, 4)?,
        source_fingerprint: row.get(5)?,
        failure: row.get(6)?,
    })
}

const ENTRY_COLUMNS: &str =
    "layer_id, entity_key, produced_values, status, computed_at, source_fingerprint, failure";

// ============================================================================
// SQLITE LAYER STORE
// ============================================================================

/// Layer store persisted in SQLite.
///
/// One connection behind a mutex; every write is a single upsert plus its
/// audit event, committed together.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    known_layers: HashSet<String>,
}

impl SqliteStore {
    pub fn open(path: &Path, registry: &LayerRegistry) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache database: {:?}", path))?;
        Self::from_connection(conn, registry)
    }

    pub fn open_in_memory(registry: &LayerRegistry) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, registry)
    }

    pub fn from_connection(conn: Connection, registry: &LayerRegistry) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            known_layers: registry.layer_ids().into_iter().collect(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("cache database connection poisoned"))
    }

    /// Audit trail for one entity, newest first
    pub fn events_for_entity(&self, entity_key: &str) -> Result<Vec<Event>> {
        let conn = self.lock()?;
        get_events_for_entity(&conn, entity_key)
    }

    /// Number of entries across all layers
    pub fn count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl LayerStore for SqliteStore {
    fn get(&self, entity_key: &str, layer_id: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM cache_entries WHERE layer_id = ?1 AND entity_key = ?2",
            ENTRY_COLUMNS
        );

        let entry = conn
            .query_row(&sql, params![layer_id, entity_key], entry_from_row)
            .optional()
            .with_context(|| format!("Failed to read {}/{}", layer_id, entity_key))?;

        Ok(entry)
    }

    fn put_entry(&self, entry: CacheEntry) -> Result<()> {
        if !self.known_layers.contains(&entry.layer_id) {
            return Err(CacheError::UnknownLayer(entry.layer_id).into());
        }

        let values_json = serde_json::to_string(&entry.produced_values)?;
        let event = Event::for_entry(&entry);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO cache_entries (
                layer_id, entity_key, produced_values, status, computed_at,
                source_fingerprint, failure
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(layer_id, entity_key) DO UPDATE SET
                produced_values = excluded.produced_values,
                status = excluded.status,
                computed_at = excluded.computed_at,
                source_fingerprint = excluded.source_fingerprint,
                failure = excluded.failure",
            params![
                entry.layer_id,
                entry.entity_key,
                values_json,
                entry.status.as_str(),
                entry.computed_at.to_rfc3339(),
                entry.source_fingerprint,
                entry.failure,
            ],
        )?;
        insert_event(&tx, &event)?;

        tx.commit()
            .with_context(|| format!("Failed to commit {}/{}", entry.layer_id, entry.entity_key))?;

        debug!(
            layer = %entry.layer_id,
            entity = %entry.entity_key,
            status = %entry.status,
            "cache entry written"
        );
        Ok(())
    }

    fn entry_page(
        &self,
        layer_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM cache_entries
             WHERE layer_id = ?1 AND (?2 IS NULL OR entity_key > ?2)
             ORDER BY entity_key
             LIMIT ?3",
            ENTRY_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(
                params![layer_id, after, limit as i64],
                entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn clear_layer(&self, layer_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE layer_id = ?1",
            params![layer_id],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::LayerDefinition;
    use crate::source::Entity;
    use serde_json::json;

    fn registry() -> LayerRegistry {
        let mut registry = LayerRegistry::new();
        registry
            .register(
                LayerDefinition::new("vitals", |_: &Entity| Ok(FieldValues::new()))
                    .produces("hr")
                    .produces("spo2"),
            )
            .unwrap();
        registry
            .register(
                LayerDefinition::new("narrative", |_: &Entity| Ok(FieldValues::new()))
                    .produces("title"),
            )
            .unwrap();
        registry
    }

    fn vitals(hr: i64, spo2: i64) -> FieldValues {
        let mut values = FieldValues::new();
        values.insert("hr".to_string(), json!(hr));
        values.insert("spo2".to_string(), json!(spo2));
        values
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();

        let entry = CacheEntry::new("CASE-002", "vitals", vitals(110, 91), EntryStatus::Ok)
            .with_fingerprint("abc123");
        store.put_entry(entry.clone()).unwrap();

        let loaded = store.get("CASE-002", "vitals").unwrap().unwrap();
        assert_eq!(loaded.produced_values, entry.produced_values);
        assert_eq!(loaded.source_fingerprint.as_deref(), Some("abc123"));
        assert_eq!(loaded.computed_at, entry.computed_at);
        assert!(store.get("CASE-002", "narrative").unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_single_entry() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();

        store.put("CASE-002", "vitals", vitals(110, 91), EntryStatus::Ok).unwrap();
        store.put("CASE-002", "vitals", vitals(95, 98), EntryStatus::Ok).unwrap();

        assert_eq!(store.count().unwrap(), 1, "latest write replaces the entry");
        assert_eq!(
            store.get("CASE-002", "vitals").unwrap().unwrap().produced_values,
            vitals(95, 98)
        );
    }

    #[test]
    fn test_put_unknown_layer_fails() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();
        let err = store
            .put("CASE-002", "imaging", FieldValues::new(), EntryStatus::Ok)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::UnknownLayer(id)) if id == "imaging"
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_failed_entry_keeps_detail() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();
        store
            .put_entry(
                CacheEntry::new("CASE-003", "narrative", FieldValues::new(), EntryStatus::Failed)
                    .with_failure("upstream 503"),
            )
            .unwrap();

        let entry = store.get("CASE-003", "narrative").unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.failure.as_deref(), Some("upstream 503"));
    }

    #[test]
    fn test_entries_for_layer_ordered() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();
        for key in ["CASE-010", "CASE-002", "CASE-007"] {
            store.put(key, "vitals", vitals(80, 99), EntryStatus::Ok).unwrap();
        }

        let keys: Vec<String> = crate::store::LayerEntries::new(&store, "vitals", 2)
            .map(|e| e.unwrap().entity_key)
            .collect();
        assert_eq!(keys, vec!["CASE-002", "CASE-007", "CASE-010"]);

        let stats = store.layer_stats("vitals").unwrap();
        assert_eq!(stats.ok, 3);
    }

    #[test]
    fn test_entries_for_layer_includes_empty_key() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();
        store.put("", "vitals", vitals(70, 98), EntryStatus::Ok).unwrap();
        store.put("CASE-001", "vitals", vitals(80, 99), EntryStatus::Ok).unwrap();

        let keys: Vec<String> = crate::store::LayerEntries::new(&store, "vitals", 1)
            .map(|e| e.unwrap().entity_key)
            .collect();
        assert_eq!(keys, vec!["", "CASE-001"]);
        assert_eq!(store.layer_stats("vitals").unwrap().total, 2);
    }

    #[test]
    fn test_event_log() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();
        store.put("CASE-002", "vitals", vitals(110, 91), EntryStatus::Ok).unwrap();
        store.mark_stale("CASE-002", "vitals").unwrap();

        let events = store.events_for_entity("CASE-002").unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "entry_invalidated");
        assert_eq!(events[1].event_type, "entry_written");
        assert_eq!(events[1].actor, "layer_store");

        println!("✅ Event log test PASSED");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = SqliteStore::open(&path, &registry()).unwrap();
            store.put("CASE-002", "narrative", FieldValues::new(), EntryStatus::Ok).unwrap();
        }

        let store = SqliteStore::open(&path, &registry()).unwrap();
        assert!(store.get("CASE-002", "narrative").unwrap().is_some());
    }

    #[test]
    fn test_clear_layer() {
        let store = SqliteStore::open_in_memory(&registry()).unwrap();
        store.put("A", "vitals", vitals(1, 2), EntryStatus::Ok).unwrap();
        store.put("B", "vitals", vitals(1, 2), EntryStatus::Ok).unwrap();
        store.put("A", "narrative", FieldValues::new(), EntryStatus::Ok).unwrap();

        assert_eq!(store.clear_layer("vitals").unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
    }
}

//! Persistence backends for the agent pool.
//!
//! The pool writes through on every `put`/`remove`; on startup it reloads
//! all entries and discards the stale ones.  The sqlite backend keeps the
//! whole entry round-trippable: status, schema version, collected fields and
//! deadlines survive a restart bit-exactly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::pool::PoolEntry;
use super::session::AgentStatus;

/// Abstraction over the pool persistence backend.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Save or overwrite an entry.
    async fn save(&self, entry: &PoolEntry) -> Result<(), String>;

    /// Remove an entry.  Removing an absent entry is not an error.
    async fn remove(&self, tenant_id: &str, agent_id: &str) -> Result<(), String>;

    /// Load every persisted entry.
    async fn load_all(&self) -> Result<Vec<PoolEntry>, String>;
}

// ─── MemoryPoolStore ──────────────────────────────────────────────────────────

/// Process-local store, used by tests.
#[derive(Default)]
pub struct MemoryPoolStore {
    entries: Mutex<HashMap<(String, String), PoolEntry>>,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    async fn save(&self, entry: &PoolEntry) -> Result<(), String> {
        self.entries
            .lock()
            .map_err(|e| e.to_string())?
            .insert((entry.tenant_id.clone(), entry.agent_id.clone()), entry.clone());
        Ok(())
    }

    async fn remove(&self, tenant_id: &str, agent_id: &str) -> Result<(), String> {
        self.entries
            .lock()
            .map_err(|e| e.to_string())?
            .remove(&(tenant_id.to_string(), agent_id.to_string()));
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PoolEntry>, String> {
        Ok(self
            .entries
            .lock()
            .map_err(|e| e.to_string())?
            .values()
            .cloned()
            .collect())
    }
}

// ─── SqlitePoolStore ──────────────────────────────────────────────────────────

/// Sqlite-backed pool store.
pub struct SqlitePoolStore {
    conn: Mutex<Connection>,
}

impl SqlitePoolStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("failed to open pool db: {e}"))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS agent_pool (
                tenant_id         TEXT NOT NULL,
                agent_id          TEXT NOT NULL,
                agent_type        TEXT NOT NULL,
                status            TEXT NOT NULL,
                schema_version    TEXT NOT NULL,
                collected_fields  TEXT NOT NULL,
                created_at        TEXT NOT NULL,
                ttl_deadline      TEXT NOT NULL,
                approval_deadline TEXT,
                task_id           TEXT,
                PRIMARY KEY (tenant_id, agent_id)
            )
            "#,
            [],
        )
        .map_err(|e| format!("failed to create pool table: {e}"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{raw}': {e}"))
}

#[async_trait]
impl PoolStore for SqlitePoolStore {
    async fn save(&self, entry: &PoolEntry) -> Result<(), String> {
        let fields_json = serde_json::to_string(&entry.collected_fields)
            .map_err(|e| format!("failed to serialize fields: {e}"))?;
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO agent_pool (
                tenant_id, agent_id, agent_type, status, schema_version,
                collected_fields, created_at, ttl_deadline, approval_deadline, task_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            rusqlite::params![
                entry.tenant_id,
                entry.agent_id,
                entry.agent_type,
                entry.status.as_str(),
                entry.schema_version,
                fields_json,
                entry.created_at.to_rfc3339(),
                entry.ttl_deadline.to_rfc3339(),
                entry.approval_deadline.map(|d| d.to_rfc3339()),
                entry.task_id,
            ],
        )
        .map_err(|e| format!("failed to save pool entry: {e}"))?;
        Ok(())
    }

    async fn remove(&self, tenant_id: &str, agent_id: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "DELETE FROM agent_pool WHERE tenant_id = ?1 AND agent_id = ?2",
            rusqlite::params![tenant_id, agent_id],
        )
        .map_err(|e| format!("failed to remove pool entry: {e}"))?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PoolEntry>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT tenant_id, agent_id, agent_type, status, schema_version,
                       collected_fields, created_at, ttl_deadline, approval_deadline, task_id
                FROM agent_pool
                "#,
            )
            .map_err(|e| format!("failed to prepare pool query: {e}"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })
            .map_err(|e| format!("failed to query pool entries: {e}"))?;

        let mut entries = Vec::new();
        for row in rows {
            let (
                tenant_id,
                agent_id,
                agent_type,
                status_raw,
                schema_version,
                fields_json,
                created_raw,
                ttl_raw,
                approval_raw,
                task_id,
            ) = row.map_err(|e| format!("failed to read pool row: {e}"))?;

            let status = AgentStatus::parse(&status_raw)
                .ok_or_else(|| format!("unknown pool status '{status_raw}'"))?;
            let collected_fields = serde_json::from_str(&fields_json)
                .map_err(|e| format!("invalid collected fields: {e}"))?;
            let approval_deadline = approval_raw
                .as_deref()
                .map(parse_timestamp)
                .transpose()?;

            entries.push(PoolEntry {
                tenant_id,
                agent_id,
                agent_type,
                status,
                schema_version,
                collected_fields,
                created_at: parse_timestamp(&created_raw)?,
                ttl_deadline: parse_timestamp(&ttl_raw)?,
                approval_deadline,
                task_id,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(tenant: &str, agent_id: &str) -> PoolEntry {
        let mut fields = serde_json::Map::new();
        fields.insert("recipient".to_string(), json!("alice@x.com"));
        fields.insert("retries".to_string(), json!(3));
        PoolEntry {
            agent_id: agent_id.to_string(),
            agent_type: "send_email".to_string(),
            tenant_id: tenant.to_string(),
            status: AgentStatus::WaitingForApproval,
            schema_version: "abc123".to_string(),
            collected_fields: fields,
            created_at: Utc::now(),
            ttl_deadline: Utc::now() + chrono::Duration::hours(1),
            approval_deadline: Some(Utc::now() + chrono::Duration::minutes(30)),
            task_id: Some("task-1".to_string()),
        }
    }

    #[tokio::test]
    async fn sqlite_roundtrip_preserves_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlitePoolStore::open(dir.path().join("pool.db")).unwrap();

        let original = entry("t1", "send_email-1");
        store.save(&original).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], original);
    }

    #[tokio::test]
    async fn sqlite_save_is_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlitePoolStore::open(dir.path().join("pool.db")).unwrap();

        let mut e = entry("t1", "send_email-1");
        store.save(&e).await.unwrap();
        e.status = AgentStatus::WaitingForInput;
        store.save(&e).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, AgentStatus::WaitingForInput);
    }

    #[tokio::test]
    async fn sqlite_remove_absent_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlitePoolStore::open(dir.path().join("pool.db")).unwrap();
        assert!(store.remove("t1", "missing").await.is_ok());
    }

    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");

        let original = entry("t1", "send_email-1");
        {
            let store = SqlitePoolStore::open(&path).unwrap();
            store.save(&original).await.unwrap();
        }

        let store = SqlitePoolStore::open(&path).unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![original]);
    }
}

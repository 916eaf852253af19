//! Incremental sync cursors.
//!
//! One cursor per (account, entity type) pair marks how far a sync has
//! progressed. Only the executor that holds the job for that pair writes its
//! cursor; the dispatcher reads it to decide whether a resync is due. Cursors
//! are never deleted except by an explicit `reset`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, SyncError};

/// Entity types pulled from the advertising platform.
///
/// Creatives are embedded in ad pages and carry no cursor of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Account,
    Campaign,
    Ad,
    Insight,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Account => "account",
            EntityType::Campaign => "campaign",
            EntityType::Ad => "ad",
            EntityType::Insight => "insight",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "account" => Ok(EntityType::Account),
            "campaign" => Ok(EntityType::Campaign),
            "ad" => Ok(EntityType::Ad),
            "insight" => Ok(EntityType::Insight),
            other => Err(SyncError::Invariant(format!(
                "unknown entity type '{other}' in store"
            ))),
        }
    }
}

/// Incremental progress marker for one (account, entity type) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCursor {
    pub account_id: String,
    pub entity_type: EntityType,
    /// Timestamp the pair has been synced through.
    pub last_synced_at: DateTime<Utc>,
    /// Page cursor last durably applied; resuming passes it back to the API.
    pub last_synced_id: Option<String>,
    /// Window the page position belongs to (insight date ranges). Remote page
    /// cursors are query-scoped, so a stored position is only resumable by a
    /// job with the same scope.
    pub page_scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed cursor store.
pub struct SyncCursorStore {
    conn: Mutex<Connection>,
}

impl SyncCursorStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                account_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                last_synced_at TEXT NOT NULL,
                last_synced_id TEXT,
                page_scope TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, entity_type)
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, account_id: &str, entity_type: EntityType) -> Result<Option<SyncCursor>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT account_id, entity_type, last_synced_at, last_synced_id, page_scope, updated_at
                FROM sync_cursors
                WHERE account_id = ?1 AND entity_type = ?2
                "#,
                params![account_id, entity_type.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((account_id, entity, last_synced_at, last_synced_id, page_scope, updated_at)) => {
                Ok(Some(SyncCursor {
                    account_id,
                    entity_type: EntityType::parse(&entity)?,
                    last_synced_at: parse_ts(&last_synced_at)?,
                    last_synced_id,
                    page_scope,
                    updated_at: parse_ts(&updated_at)?,
                }))
            }
        }
    }

    /// Advance the cursor after a page has been durably persisted (upsert).
    ///
    /// `page_scope` names the window `last_synced_id` belongs to; readers must
    /// not resume from a position stored under a different scope.
    pub fn advance(
        &self,
        account_id: &str,
        entity_type: EntityType,
        last_synced_at: DateTime<Utc>,
        last_synced_id: Option<&str>,
        page_scope: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO sync_cursors (account_id, entity_type, last_synced_at, last_synced_id, page_scope, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(account_id, entity_type) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                last_synced_id = excluded.last_synced_id,
                page_scope = excluded.page_scope,
                updated_at = excluded.updated_at
            "#,
            params![
                account_id,
                entity_type.as_str(),
                last_synced_at.to_rfc3339(),
                last_synced_id,
                page_scope,
                now,
            ],
        )?;
        Ok(())
    }

    /// Explicit reset; the only path that deletes a cursor.
    pub fn reset(&self, account_id: &str, entity_type: EntityType) -> Result<bool> {
        let affected = self.conn.lock().unwrap().execute(
            "DELETE FROM sync_cursors WHERE account_id = ?1 AND entity_type = ?2",
            params![account_id, entity_type.as_str()],
        )?;
        Ok(affected > 0)
    }
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Invariant(format!("bad timestamp '{s}' in store: {e}")))
}

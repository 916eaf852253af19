//! Cron window registry.
//!
//! Per (user, job type), the set of UTC hours during which that job type may
//! be dispatched. The registry is fail-closed: a missing or disabled row means
//! not allowed, so crawls never run merely because configuration is absent.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::jobs::JobType;

/// SQLite-backed window registry. Written by the settings collaborator,
/// read by the dispatcher.
pub struct CronWindowRegistry {
    conn: Mutex<Connection>,
}

impl CronWindowRegistry {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cron_windows (
                user_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                hours TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                PRIMARY KEY (user_id, job_type)
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create or replace the window for (user, job type).
    ///
    /// An enabled window must carry at least one hour; hours are 0-23.
    pub fn upsert_window(
        &self,
        user_id: &str,
        job_type: JobType,
        hours: &[u8],
        enabled: bool,
    ) -> Result<()> {
        if enabled && hours.is_empty() {
            return Err(SyncError::Validation(
                "enabled cron window must contain at least one hour".to_string(),
            ));
        }
        if let Some(bad) = hours.iter().find(|h| **h > 23) {
            return Err(SyncError::Validation(format!(
                "cron window hour {bad} out of range 0-23"
            )));
        }

        let mut sorted: Vec<u8> = hours.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let hours_json = serde_json::to_string(&sorted)
            .map_err(|e| SyncError::Invariant(format!("hour set serialization failed: {e}")))?;

        self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO cron_windows (user_id, job_type, hours, enabled)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, job_type) DO UPDATE SET
                hours = excluded.hours,
                enabled = excluded.enabled
            "#,
            params![user_id, job_type.as_str(), hours_json, enabled],
        )?;
        Ok(())
    }

    /// True iff an enabled window for (user, job type) contains `hour`.
    pub fn is_allowed(&self, user_id: &str, job_type: JobType, hour: u8) -> Result<bool> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT hours, enabled FROM cron_windows WHERE user_id = ?1 AND job_type = ?2",
                params![user_id, job_type.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?
        };

        match row {
            // Fail-closed default
            None => Ok(false),
            Some((_, false)) => Ok(false),
            Some((hours_json, true)) => {
                let hours: Vec<u8> = serde_json::from_str(&hours_json).map_err(|e| {
                    SyncError::Invariant(format!("bad hour set in registry: {e}"))
                })?;
                Ok(hours.contains(&hour))
            }
        }
    }
}

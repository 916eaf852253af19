//! Resource claim ledger.
//!
//! A claim is an exclusive, time-bounded assignment of a managed advertising
//! account to an operator. `claim` checks "account is free" and "operator is
//! under the limit" and inserts in one transaction, so two operators can never
//! claim the same account concurrently. Expired claims are swept lazily: every
//! read path purges them before evaluating availability.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, Transaction};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::cursor::parse_ts;
use crate::error::{Result, SyncError};

/// An active claim row.
#[derive(Debug, Clone)]
pub struct ResourceClaim {
    pub operator_id: String,
    pub account_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// SQLite-backed claim ledger.
pub struct ClaimLedger {
    conn: Mutex<Connection>,
    claim_limit: usize,
    claim_ttl: Duration,
}

impl ClaimLedger {
    pub fn new<P: AsRef<Path>>(db_path: P, claim_limit: usize, claim_ttl: Duration) -> Result<Self> {
        Self::init(Connection::open(db_path)?, claim_limit, claim_ttl)
    }

    pub fn in_memory(claim_limit: usize, claim_ttl: Duration) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, claim_limit, claim_ttl)
    }

    fn init(conn: Connection, claim_limit: usize, claim_ttl: Duration) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS resource_claims (
                account_id TEXT PRIMARY KEY,
                operator_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            claim_limit,
            claim_ttl,
        })
    }

    /// Claim `account_id` for `operator_id`.
    ///
    /// Sweep, availability check, limit check and insert all happen inside one
    /// transaction under the connection mutex.
    pub fn claim(&self, operator_id: &str, account_id: &str) -> Result<ResourceClaim> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.claim_ttl)
            .map_err(|e| SyncError::Invariant(format!("claim TTL out of range: {e}")))?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        sweep_expired(&tx, now)?;

        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM resource_claims WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(SyncError::AlreadyClaimed(account_id.to_string()));
        }

        let held: i64 = tx.query_row(
            "SELECT COUNT(*) FROM resource_claims WHERE operator_id = ?1",
            params![operator_id],
            |row| row.get(0),
        )?;
        if held as usize >= self.claim_limit {
            return Err(SyncError::LimitExceeded(self.claim_limit));
        }

        let claim = ResourceClaim {
            operator_id: operator_id.to_string(),
            account_id: account_id.to_string(),
            claimed_at: now,
            expires_at: now + ttl,
        };
        tx.execute(
            r#"
            INSERT INTO resource_claims (account_id, operator_id, claimed_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                claim.account_id,
                claim.operator_id,
                claim.claimed_at.to_rfc3339(),
                claim.expires_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(claim)
    }

    /// Release a claim. Releasing a claim the operator does not hold is a no-op.
    pub fn release(&self, operator_id: &str, account_id: &str) -> Result<bool> {
        let affected = self.conn.lock().unwrap().execute(
            "DELETE FROM resource_claims WHERE account_id = ?1 AND operator_id = ?2",
            params![account_id, operator_id],
        )?;
        Ok(affected > 0)
    }

    /// Active claims held by one operator.
    pub fn list_active(&self, operator_id: &str) -> Result<Vec<ResourceClaim>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        sweep_expired(&tx, Utc::now())?;

        let claims = query_claims(
            &tx,
            "SELECT account_id, operator_id, claimed_at, expires_at
             FROM resource_claims WHERE operator_id = ?1 ORDER BY account_id",
            params![operator_id],
        )?;
        tx.commit()?;
        Ok(claims)
    }

    /// All active claims; the dispatcher's account enumeration source.
    pub fn list_all_active(&self) -> Result<Vec<ResourceClaim>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        sweep_expired(&tx, Utc::now())?;

        let claims = query_claims(
            &tx,
            "SELECT account_id, operator_id, claimed_at, expires_at
             FROM resource_claims ORDER BY account_id",
            params![],
        )?;
        tx.commit()?;
        Ok(claims)
    }
}

fn sweep_expired(tx: &Transaction<'_>, now: DateTime<Utc>) -> Result<()> {
    tx.execute(
        "DELETE FROM resource_claims WHERE expires_at <= ?1",
        params![now.to_rfc3339()],
    )?;
    Ok(())
}

fn query_claims(
    tx: &Transaction<'_>,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<ResourceClaim>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt
        .query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(account_id, operator_id, claimed_at, expires_at)| {
            Ok(ResourceClaim {
                account_id,
                operator_id,
                claimed_at: parse_ts(&claimed_at)?,
                expires_at: parse_ts(&expires_at)?,
            })
        })
        .collect()
}

//! Crawl job store and lifecycle state machine.
//!
//! States: `Pending → Running → {Completed, Failed} → Cleaned`.
//!
//! The Pending→Running transition is an atomic conditional update keyed by job
//! id (`UPDATE ... WHERE id = ? AND state = 'pending'`), which guarantees
//! at-most-one executor per job and is the sole cross-worker concurrency
//! primitive. The dispatcher only creates jobs; once claimed, a job is owned
//! exclusively by its executor until it reaches a terminal state.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::cursor::{parse_ts, EntityType};
use crate::error::{Result, SyncError};

/// Closed set of crawl job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    AccountSync,
    CampaignSync,
    AdSync,
    InsightSync,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::AccountSync,
        JobType::CampaignSync,
        JobType::AdSync,
        JobType::InsightSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::AccountSync => "account-sync",
            JobType::CampaignSync => "campaign-sync",
            JobType::AdSync => "ad-sync",
            JobType::InsightSync => "insight-sync",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "account-sync" => Ok(JobType::AccountSync),
            "campaign-sync" => Ok(JobType::CampaignSync),
            "ad-sync" => Ok(JobType::AdSync),
            "insight-sync" => Ok(JobType::InsightSync),
            other => Err(SyncError::Invariant(format!(
                "unknown job type '{other}' in store"
            ))),
        }
    }

    /// The entity type whose cursor this job type advances.
    pub fn entity_type(&self) -> EntityType {
        match self {
            JobType::AccountSync => EntityType::Account,
            JobType::CampaignSync => EntityType::Campaign,
            JobType::AdSync => EntityType::Ad,
            JobType::InsightSync => EntityType::Insight,
        }
    }

    /// Insight jobs carry an explicit date range; the rest sync incrementally.
    pub fn carries_date_range(&self) -> bool {
        matches!(self, JobType::InsightSync)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cleaned,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cleaned => "cleaned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cleaned" => Ok(JobState::Cleaned),
            other => Err(SyncError::Invariant(format!(
                "unknown job state '{other}' in store"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cleaned)
    }
}

/// One unit of scheduled crawl work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub account_id: String,
    /// Operator whose cron window admitted this job.
    pub operator_id: String,
    pub adset_id: Option<String>,
    pub ad_id: Option<String>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub state: JobState,
    pub error: Option<String>,
    pub attempts: i64,
    pub cancel_requested: bool,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CrawlJob {
    /// A fresh Pending job for (account, job type).
    pub fn new(operator_id: &str, account_id: &str, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            account_id: account_id.to_string(),
            operator_id: operator_id.to_string(),
            adset_id: None,
            ad_id: None,
            date_start: None,
            date_end: None,
            state: JobState::Pending,
            error: None,
            attempts: 0,
            cancel_requested: false,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// An insight job scoped to a date range.
    pub fn insight(
        operator_id: &str,
        account_id: &str,
        date_start: NaiveDate,
        date_end: NaiveDate,
    ) -> Self {
        let mut job = Self::new(operator_id, account_id, JobType::InsightSync);
        job.date_start = Some(date_start);
        job.date_end = Some(date_end);
        job
    }
}

const JOB_COLUMNS: &str = "id, job_type, account_id, operator_id, adset_id, ad_id, \
     date_start, date_end, state, error, attempts, cancel_requested, worker_id, \
     created_at, started_at, finished_at";

/// SQLite-backed crawl job store.
pub struct CrawlJobStore {
    conn: Mutex<Connection>,
}

impl CrawlJobStore {
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
            CREATE TABLE IF NOT EXISTS crawl_jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                account_id TEXT NOT NULL,
                operator_id TEXT NOT NULL,
                adset_id TEXT,
                ad_id TEXT,
                date_start TEXT,
                date_end TEXT,
                state TEXT NOT NULL,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_crawl_jobs_state ON crawl_jobs(state, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_crawl_jobs_dedup
             ON crawl_jobs(account_id, job_type, state)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create(&self, job: &CrawlJob) -> Result<()> {
        self.conn.lock().unwrap().execute(
            &format!(
                "INSERT INTO crawl_jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                job.id.to_string(),
                job.job_type.as_str(),
                job.account_id,
                job.operator_id,
                job.adset_id,
                job.ad_id,
                job.date_start.map(|d| d.to_string()),
                job.date_end.map(|d| d.to_string()),
                job.state.as_str(),
                job.error,
                job.attempts,
                job.cancel_requested,
                job.worker_id,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<CrawlJob>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = ?1"),
            params![id.to_string()],
            job_from_row,
        )
        .optional()?
        .map(|raw| raw.into_job())
        .transpose()
    }

    /// Dedup check: an existing Pending/Running job with the same
    /// (account, job type, date range) key.
    pub fn find_active(
        &self,
        account_id: &str,
        job_type: JobType,
        date_start: Option<NaiveDate>,
        date_end: Option<NaiveDate>,
    ) -> Result<Option<CrawlJob>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM crawl_jobs
                 WHERE account_id = ?1 AND job_type = ?2
                   AND state IN ('pending', 'running')
                   AND date_start IS ?3 AND date_end IS ?4
                 LIMIT 1"
            ),
            params![
                account_id,
                job_type.as_str(),
                date_start.map(|d| d.to_string()),
                date_end.map(|d| d.to_string()),
            ],
            job_from_row,
        )
        .optional()?
        .map(|raw| raw.into_job())
        .transpose()
    }

    /// Atomic Pending→Running transition. Returns false if the job was
    /// already claimed (or is not Pending), meaning the caller lost the race.
    pub fn claim(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        let affected = self.conn.lock().unwrap().execute(
            r#"
            UPDATE crawl_jobs
            SET state = 'running',
                worker_id = ?2,
                started_at = ?3,
                attempts = attempts + 1
            WHERE id = ?1 AND state = 'pending'
            "#,
            params![id.to_string(), worker_id, Utc::now().to_rfc3339()],
        )?;
        Ok(affected == 1)
    }

    /// Claim the oldest Pending job, if any. Select and conditional update run
    /// under the connection mutex, so concurrent workers on this store never
    /// pick the same job; the CAS still guards against other processes.
    pub fn claim_next_pending(&self, worker_id: &str) -> Result<Option<CrawlJob>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM crawl_jobs WHERE state = 'pending'
                 ORDER BY created_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let affected = tx.execute(
            r#"
            UPDATE crawl_jobs
            SET state = 'running',
                worker_id = ?2,
                started_at = ?3,
                attempts = attempts + 1
            WHERE id = ?1 AND state = 'pending'
            "#,
            params![id, worker_id, Utc::now().to_rfc3339()],
        )?;
        if affected != 1 {
            return Ok(None);
        }

        let job = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )?
            .into_job()?;
        tx.commit()?;
        Ok(Some(job))
    }

    /// Running→Completed. Errors if the job is not Running.
    pub fn complete(&self, id: Uuid) -> Result<()> {
        self.finish(id, JobState::Completed, None)
    }

    /// Running→Failed with the failure reason recorded for inspection.
    pub fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        self.finish(id, JobState::Failed, Some(error))
    }

    fn finish(&self, id: Uuid, state: JobState, error: Option<&str>) -> Result<()> {
        let affected = self.conn.lock().unwrap().execute(
            r#"
            UPDATE crawl_jobs
            SET state = ?2, error = ?3, finished_at = ?4
            WHERE id = ?1 AND state = 'running'
            "#,
            params![
                id.to_string(),
                state.as_str(),
                error,
                Utc::now().to_rfc3339()
            ],
        )?;
        if affected != 1 {
            return Err(SyncError::ConcurrencyConflict(format!(
                "job {id} is not running; cannot transition to {}",
                state.as_str()
            )));
        }
        Ok(())
    }

    /// Flag a job for cancellation; the executor honors it at the next page
    /// boundary.
    pub fn request_cancel(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn.lock().unwrap().execute(
            "UPDATE crawl_jobs SET cancel_requested = 1
             WHERE id = ?1 AND state IN ('pending', 'running')",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn cancel_requested(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let flagged: Option<bool> = conn
            .query_row(
                "SELECT cancel_requested FROM crawl_jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        flagged.ok_or_else(|| SyncError::NotFound(format!("job {id}")))
    }

    /// Reclaim orphaned jobs: Running with `started_at` older than the
    /// liveness timeout are force-transitioned to Failed.
    pub fn reclaim_timed_out(&self, liveness_timeout: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(liveness_timeout)
                .map_err(|e| SyncError::Invariant(format!("liveness timeout out of range: {e}")))?;
        let affected = self.conn.lock().unwrap().execute(
            r#"
            UPDATE crawl_jobs
            SET state = 'failed',
                error = 'reclaimed: exceeded liveness timeout',
                finished_at = ?2
            WHERE state = 'running' AND started_at <= ?1
            "#,
            params![cutoff.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Ok(affected)
    }

    /// Archive terminal jobs older than the retention threshold.
    pub fn archive_older_than(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| SyncError::Invariant(format!("retention out of range: {e}")))?;
        let affected = self.conn.lock().unwrap().execute(
            r#"
            UPDATE crawl_jobs
            SET state = 'cleaned'
            WHERE state IN ('completed', 'failed') AND finished_at <= ?1
            "#,
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }

    #[cfg(test)]
    pub(crate) fn force_started_at(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE crawl_jobs SET started_at = ?2 WHERE id = ?1",
            params![id.to_string(), started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_finished_at(&self, id: Uuid, finished_at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE crawl_jobs SET finished_at = ?2 WHERE id = ?1",
            params![id.to_string(), finished_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Row image before timestamp/enum parsing, so rusqlite row mapping stays
/// within its own error type.
struct RawJob {
    id: String,
    job_type: String,
    account_id: String,
    operator_id: String,
    adset_id: Option<String>,
    ad_id: Option<String>,
    date_start: Option<String>,
    date_end: Option<String>,
    state: String,
    error: Option<String>,
    attempts: i64,
    cancel_requested: bool,
    worker_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        job_type: row.get(1)?,
        account_id: row.get(2)?,
        operator_id: row.get(3)?,
        adset_id: row.get(4)?,
        ad_id: row.get(5)?,
        date_start: row.get(6)?,
        date_end: row.get(7)?,
        state: row.get(8)?,
        error: row.get(9)?,
        attempts: row.get(10)?,
        cancel_requested: row.get(11)?,
        worker_id: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        finished_at: row.get(15)?,
    })
}

impl RawJob {
    fn into_job(self) -> Result<CrawlJob> {
        Ok(CrawlJob {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| SyncError::Invariant(format!("bad job id in store: {e}")))?,
            job_type: JobType::parse(&self.job_type)?,
            account_id: self.account_id,
            operator_id: self.operator_id,
            adset_id: self.adset_id,
            ad_id: self.ad_id,
            date_start: parse_date(self.date_start.as_deref())?,
            date_end: parse_date(self.date_end.as_deref())?,
            state: JobState::parse(&self.state)?,
            error: self.error,
            attempts: self.attempts,
            cancel_requested: self.cancel_requested,
            worker_id: self.worker_id,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn parse_date(s: Option<&str>) -> Result<Option<NaiveDate>> {
    s.map(|s| {
        s.parse::<NaiveDate>()
            .map_err(|e| SyncError::Invariant(format!("bad date '{s}' in store: {e}")))
    })
    .transpose()
}

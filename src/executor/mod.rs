//! Crawl job execution.
//!
//! An executor owns a job from the moment its Pending→Running claim succeeds
//! until the job reaches a terminal state. Work proceeds page by page: fetch,
//! upsert into the sink, then advance the cursor. The cursor is only advanced
//! after the sink write, so a crash mid-job re-fetches at most one page and
//! the upsert makes that re-fetch idempotent. Cancellation is cooperative and
//! only observed at page boundaries.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::credentials::{CredentialKind, CredentialStore};
use crate::cursor::SyncCursorStore;
use crate::error::{Result, SyncError};
use crate::jobs::{CrawlJob, CrawlJobStore, JobState};
use crate::remote::{PageRequest, RemoteClient};
use crate::sink::EntitySink;

pub struct JobExecutor {
    jobs: Arc<CrawlJobStore>,
    cursors: Arc<SyncCursorStore>,
    credentials: Arc<CredentialStore>,
    client: Arc<RemoteClient>,
    sink: Arc<dyn EntitySink>,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<CrawlJobStore>,
        cursors: Arc<SyncCursorStore>,
        credentials: Arc<CredentialStore>,
        client: Arc<RemoteClient>,
        sink: Arc<dyn EntitySink>,
    ) -> Self {
        Self {
            jobs,
            cursors,
            credentials,
            client,
            sink,
        }
    }

    /// Claim and run one job by id.
    ///
    /// Returns `ConcurrencyConflict` if another executor claimed it first.
    pub async fn run(&self, job_id: Uuid, worker_id: &str) -> Result<JobState> {
        if !self.jobs.claim(job_id, worker_id)? {
            return Err(SyncError::ConcurrencyConflict(format!(
                "job {job_id} already claimed or not pending"
            )));
        }
        let job = self
            .jobs
            .get(job_id)?
            .ok_or_else(|| SyncError::NotFound(format!("job {job_id}")))?;
        self.run_claimed(job).await
    }

    /// Run a job that is already in the Running state (claimed by the caller).
    pub async fn run_claimed(&self, job: CrawlJob) -> Result<JobState> {
        info!(
            job_id = %job.id,
            job_type = %job.job_type.as_str(),
            account_id = %job.account_id,
            attempt = job.attempts,
            "Executing crawl job"
        );

        match self.sync_pages(&job).await {
            Ok(SyncOutcome::Finished { pages, items }) => {
                self.jobs.complete(job.id)?;
                info!(
                    job_id = %job.id,
                    pages,
                    items,
                    "Crawl job completed"
                );
                Ok(JobState::Completed)
            }
            Ok(SyncOutcome::Cancelled) => {
                self.jobs.fail(job.id, "cancelled at page boundary")?;
                info!(job_id = %job.id, "Crawl job cancelled");
                Ok(JobState::Failed)
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "Crawl job failed");
                self.jobs.fail(job.id, &err.to_string())?;
                Ok(JobState::Failed)
            }
        }
    }

    async fn sync_pages(&self, job: &CrawlJob) -> Result<SyncOutcome> {
        let credential = self.credentials.get_active(CredentialKind::AccessToken)?;
        let entity = job.job_type.entity_type();

        // Remote page cursors are scoped to the query that produced them, so a
        // position stored for one insight date range must never seed another.
        let page_scope = job
            .date_start
            .zip(job.date_end)
            .map(|(start, end)| format!("{start}..{end}"));

        // Resume from the last durably applied page, but only within the same
        // scope; anything else starts from the first page.
        let mut page_cursor: Option<String> = self
            .cursors
            .get(&job.account_id, entity)?
            .filter(|c| c.page_scope == page_scope)
            .and_then(|c| c.last_synced_id);
        let mut pages = 0usize;
        let mut items = 0usize;

        loop {
            if self.jobs.cancel_requested(job.id)? {
                return Ok(SyncOutcome::Cancelled);
            }

            let request = PageRequest {
                entity_type: entity,
                account_id: &job.account_id,
                cursor: page_cursor.as_deref(),
                date_start: job.date_start,
                date_end: job.date_end,
            };
            let page = self.client.fetch_page(&request, &credential).await?;

            self.sink.upsert(&job.account_id, entity, &page.items).await?;
            pages += 1;
            items += page.items.len();

            // Advance only after the upsert above has landed
            if page.has_more {
                let next = page.next_cursor.ok_or_else(|| {
                    SyncError::Invariant(format!(
                        "page for job {} claims more data but has no cursor",
                        job.id
                    ))
                })?;
                self.cursors.advance(
                    &job.account_id,
                    entity,
                    Utc::now(),
                    Some(&next),
                    page_scope.as_deref(),
                )?;
                page_cursor = Some(next);
            } else {
                // Completion clears the page position; the next sync of this
                // pair starts from the beginning.
                self.cursors
                    .advance(&job.account_id, entity, Utc::now(), None, None)?;
                return Ok(SyncOutcome::Finished { pages, items });
            }
        }
    }
}

enum SyncOutcome {
    Finished { pages: usize, items: usize },
    Cancelled,
}

/// Background worker: polls for Pending jobs and executes them one at a time.
pub struct Worker {
    id: String,
    jobs: Arc<CrawlJobStore>,
    executor: Arc<JobExecutor>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: String,
        jobs: Arc<CrawlJobStore>,
        executor: Arc<JobExecutor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            jobs,
            executor,
            poll_interval,
        }
    }

    /// Spawn the polling loop. The handle is held by main for shutdown.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(worker_id = %self.id, "Worker started");
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                // Drain the queue before going back to sleep
                loop {
                    match self.jobs.claim_next_pending(&self.id) {
                        Ok(Some(job)) => {
                            let job_id = job.id;
                            if let Err(err) = self.executor.run_claimed(job).await {
                                error!(
                                    worker_id = %self.id,
                                    job_id = %job_id,
                                    error = %err,
                                    "Job execution aborted"
                                );
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!(worker_id = %self.id, error = %err, "Failed to poll for jobs");
                            break;
                        }
                    }
                }
            }
        })
    }
}

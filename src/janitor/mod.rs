//! Background janitor.
//!
//! Two sweeps per pass: reclaim Running jobs whose executor is presumed dead
//! (started_at past the liveness timeout), then archive terminal jobs past the
//! retention threshold. Both are single UPDATE statements in the job store;
//! the janitor just runs them on an interval and reports what moved.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::jobs::CrawlJobStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    /// Running jobs force-failed for exceeding the liveness timeout.
    pub reclaimed: usize,
    /// Terminal jobs moved to Cleaned.
    pub archived: usize,
}

pub struct Janitor {
    jobs: Arc<CrawlJobStore>,
    liveness_timeout: Duration,
    job_retention: Duration,
    interval: Duration,
}

impl Janitor {
    pub fn new(
        jobs: Arc<CrawlJobStore>,
        liveness_timeout: Duration,
        job_retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            liveness_timeout,
            job_retention,
            interval,
        }
    }

    /// One cleanup pass. Reclaim runs before archive so a job reclaimed in
    /// this pass is not archived until it ages past retention.
    pub fn cleanup_old_jobs(&self) -> Result<CleanupStats> {
        let reclaimed = self.jobs.reclaim_timed_out(self.liveness_timeout)?;
        let archived = self.jobs.archive_older_than(self.job_retention)?;

        if reclaimed > 0 || archived > 0 {
            info!(reclaimed, archived, "Janitor pass finished");
        }
        Ok(CleanupStats {
            reclaimed,
            archived,
        })
    }

    /// Spawn the interval loop.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                "Janitor started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if let Err(err) = self.cleanup_old_jobs() {
                    error!(error = %err, "Janitor pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{CrawlJob, JobState, JobType};
    use chrono::Utc;

    fn janitor(jobs: &Arc<CrawlJobStore>) -> Janitor {
        Janitor::new(
            Arc::clone(jobs),
            Duration::from_secs(3600),
            Duration::from_secs(7 * 24 * 3600),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn stale_running_job_is_reclaimed_and_fresh_one_kept() {
        let jobs = Arc::new(CrawlJobStore::in_memory().unwrap());
        let stale = CrawlJob::new("op-1", "act_1", JobType::AdSync);
        let fresh = CrawlJob::new("op-1", "act_2", JobType::AdSync);
        jobs.create(&stale).unwrap();
        jobs.create(&fresh).unwrap();
        jobs.claim(stale.id, "worker-a").unwrap();
        jobs.claim(fresh.id, "worker-b").unwrap();

        // One worker died two hours ago, the other checked in ten minutes ago
        jobs.force_started_at(stale.id, Utc::now() - chrono::Duration::hours(2))
            .unwrap();
        jobs.force_started_at(fresh.id, Utc::now() - chrono::Duration::minutes(10))
            .unwrap();

        let stats = janitor(&jobs).cleanup_old_jobs().unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.archived, 0);

        let stale = jobs.get(stale.id).unwrap().unwrap();
        assert_eq!(stale.state, JobState::Failed);
        assert!(stale.error.unwrap().contains("liveness"));
        assert_eq!(jobs.get(fresh.id).unwrap().unwrap().state, JobState::Running);
    }

    #[test]
    fn old_terminal_jobs_are_archived() {
        let jobs = Arc::new(CrawlJobStore::in_memory().unwrap());
        let old = CrawlJob::new("op-1", "act_1", JobType::CampaignSync);
        let recent = CrawlJob::new("op-1", "act_2", JobType::CampaignSync);
        for job in [&old, &recent] {
            jobs.create(job).unwrap();
            jobs.claim(job.id, "worker-a").unwrap();
            jobs.complete(job.id).unwrap();
        }
        jobs.force_finished_at(old.id, Utc::now() - chrono::Duration::days(30))
            .unwrap();

        let stats = janitor(&jobs).cleanup_old_jobs().unwrap();
        assert_eq!(stats.archived, 1);
        assert_eq!(jobs.get(old.id).unwrap().unwrap().state, JobState::Cleaned);
        assert_eq!(
            jobs.get(recent.id).unwrap().unwrap().state,
            JobState::Completed
        );
    }

    #[test]
    fn reclaimed_job_is_not_archived_in_the_same_pass() {
        let jobs = Arc::new(CrawlJobStore::in_memory().unwrap());
        let job = CrawlJob::new("op-1", "act_1", JobType::AdSync);
        jobs.create(&job).unwrap();
        jobs.claim(job.id, "worker-a").unwrap();
        jobs.force_started_at(job.id, Utc::now() - chrono::Duration::days(30))
            .unwrap();

        let stats = janitor(&jobs).cleanup_old_jobs().unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.archived, 0);
        // Failed just now, so it survives retention until it ages out
        assert_eq!(jobs.get(job.id).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn empty_store_is_a_noop() {
        let jobs = Arc::new(CrawlJobStore::in_memory().unwrap());
        let stats = janitor(&jobs).cleanup_old_jobs().unwrap();
        assert_eq!(stats.reclaimed, 0);
        assert_eq!(stats.archived, 0);
    }
}

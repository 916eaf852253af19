//! Crawl dispatcher.
//!
//! Turns "what should be synced right now" into Pending crawl jobs. The
//! dispatcher enumerates claimed accounts, applies the operator's cron window
//! at the current UTC hour, skips work that is already in flight or whose
//! cursor is still fresh, and creates one Pending job per surviving
//! (account, job type) pair. It never transitions jobs itself.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::claims::ClaimLedger;
use crate::config::SyncConfig;
use crate::cron::CronWindowRegistry;
use crate::cursor::SyncCursorStore;
use crate::error::{Result, SyncError};
use crate::jobs::{CrawlJob, CrawlJobStore, JobType};

/// A dispatch request, typically arriving through the HTTP API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchRequest {
    /// Restrict to these accounts; `None` means all claimed accounts.
    pub account_ids: Option<Vec<String>>,
    /// Restrict to these job types; `None` means all of them.
    pub job_types: Option<Vec<JobType>>,
    /// Reporting window for insight jobs. Both ends or neither.
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
}

/// What one dispatch pass did, broken down by skip reason.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub created: Vec<Uuid>,
    pub skipped_window_closed: usize,
    pub skipped_in_flight: usize,
    pub skipped_fresh: usize,
}

impl DispatchOutcome {
    pub fn skipped(&self) -> usize {
        self.skipped_window_closed + self.skipped_in_flight + self.skipped_fresh
    }
}

/// Callers get the aggregate `skipped` count alongside the breakdown.
impl Serialize for DispatchOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DispatchOutcome", 5)?;
        state.serialize_field("created", &self.created)?;
        state.serialize_field("skipped", &self.skipped())?;
        state.serialize_field("skipped_window_closed", &self.skipped_window_closed)?;
        state.serialize_field("skipped_in_flight", &self.skipped_in_flight)?;
        state.serialize_field("skipped_fresh", &self.skipped_fresh)?;
        state.end()
    }
}

pub struct Dispatcher {
    claims: Arc<ClaimLedger>,
    jobs: Arc<CrawlJobStore>,
    cursors: Arc<SyncCursorStore>,
    cron: Arc<CronWindowRegistry>,
    config: SyncConfig,
}

impl Dispatcher {
    pub fn new(
        claims: Arc<ClaimLedger>,
        jobs: Arc<CrawlJobStore>,
        cursors: Arc<SyncCursorStore>,
        cron: Arc<CronWindowRegistry>,
        config: SyncConfig,
    ) -> Self {
        Self {
            claims,
            jobs,
            cursors,
            cron,
            config,
        }
    }

    /// Run one dispatch pass at the current wall-clock time.
    pub fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        self.dispatch_at(request, Utc::now())
    }

    /// Run one dispatch pass as of `now`. Split out so tests can pin the hour
    /// the cron windows are evaluated against.
    pub fn dispatch_at(
        &self,
        request: &DispatchRequest,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let date_range = validate_date_range(request)?;
        let hour = now.hour() as u8;

        let job_types: Vec<JobType> = request
            .job_types
            .clone()
            .unwrap_or_else(|| JobType::ALL.to_vec());

        let mut outcome = DispatchOutcome::default();

        for claim in self.claims.list_all_active()? {
            if let Some(wanted) = &request.account_ids {
                if !wanted.contains(&claim.account_id) {
                    continue;
                }
            }

            for &job_type in &job_types {
                // Insight jobs only exist for an explicit reporting window
                if job_type.carries_date_range() && date_range.is_none() {
                    continue;
                }

                if !self.cron.is_allowed(&claim.operator_id, job_type, hour)? {
                    debug!(
                        account_id = %claim.account_id,
                        operator_id = %claim.operator_id,
                        job_type = %job_type.as_str(),
                        hour,
                        "Cron window closed, skipping"
                    );
                    outcome.skipped_window_closed += 1;
                    continue;
                }

                let (date_start, date_end) = if job_type.carries_date_range() {
                    let (s, e) = date_range.ok_or_else(|| {
                        SyncError::Invariant("insight dispatch without date range".to_string())
                    })?;
                    (Some(s), Some(e))
                } else {
                    (None, None)
                };

                if self
                    .jobs
                    .find_active(&claim.account_id, job_type, date_start, date_end)?
                    .is_some()
                {
                    outcome.skipped_in_flight += 1;
                    continue;
                }

                if !job_type.carries_date_range() && self.cursor_is_fresh(&claim.account_id, job_type, now)? {
                    outcome.skipped_fresh += 1;
                    continue;
                }

                let mut job = CrawlJob::new(&claim.operator_id, &claim.account_id, job_type);
                job.date_start = date_start;
                job.date_end = date_end;
                self.jobs.create(&job)?;
                info!(
                    job_id = %job.id,
                    account_id = %claim.account_id,
                    job_type = %job_type.as_str(),
                    "Dispatched crawl job"
                );
                outcome.created.push(job.id);
            }
        }

        Ok(outcome)
    }

    /// True if the cursor for (account, entity) was advanced more recently
    /// than the entity's staleness threshold.
    fn cursor_is_fresh(
        &self,
        account_id: &str,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let entity = job_type.entity_type();
        let Some(cursor) = self.cursors.get(account_id, entity)? else {
            return Ok(false);
        };
        let threshold = chrono::Duration::from_std(self.config.staleness_for(entity))
            .map_err(|e| SyncError::Invariant(format!("staleness threshold out of range: {e}")))?;
        Ok(now.signed_duration_since(cursor.last_synced_at) < threshold)
    }
}

/// Both date bounds or neither; end must not precede start.
fn validate_date_range(request: &DispatchRequest) -> Result<Option<(NaiveDate, NaiveDate)>> {
    match (request.date_start, request.date_end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) if end >= start => Ok(Some((start, end))),
        (Some(start), Some(end)) => Err(SyncError::Validation(format!(
            "date_end {end} precedes date_start {start}"
        ))),
        _ => Err(SyncError::Validation(
            "date_start and date_end must be given together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::EntityType;
    use crate::jobs::JobState;
    use chrono::TimeZone;
    use std::time::Duration;

    struct Fixture {
        dispatcher: Dispatcher,
        claims: Arc<ClaimLedger>,
        jobs: Arc<CrawlJobStore>,
        cursors: Arc<SyncCursorStore>,
        cron: Arc<CronWindowRegistry>,
    }

    fn fixture() -> Fixture {
        let claims = Arc::new(ClaimLedger::in_memory(5, Duration::from_secs(3600)).unwrap());
        let jobs = Arc::new(CrawlJobStore::in_memory().unwrap());
        let cursors = Arc::new(SyncCursorStore::in_memory().unwrap());
        let cron = Arc::new(CronWindowRegistry::in_memory().unwrap());
        let dispatcher = Dispatcher::new(
            Arc::clone(&claims),
            Arc::clone(&jobs),
            Arc::clone(&cursors),
            Arc::clone(&cron),
            SyncConfig::default(),
        );
        Fixture {
            dispatcher,
            claims,
            jobs,
            cursors,
            cron,
        }
    }

    fn two_pm() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    fn open_window(fx: &Fixture, operator: &str, job_type: JobType) {
        fx.cron.upsert_window(operator, job_type, &[14], true).unwrap();
    }

    #[test]
    fn dispatch_creates_jobs_for_claimed_accounts_in_window() {
        let fx = fixture();
        fx.claims.claim("op-1", "act_1").unwrap();
        open_window(&fx, "op-1", JobType::CampaignSync);

        let outcome = fx
            .dispatcher
            .dispatch_at(
                &DispatchRequest {
                    job_types: Some(vec![JobType::CampaignSync]),
                    ..Default::default()
                },
                two_pm(),
            )
            .unwrap();

        assert_eq!(outcome.created.len(), 1);
        let job = fx.jobs.get(outcome.created[0]).unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.account_id, "act_1");
        assert_eq!(job.operator_id, "op-1");
    }

    #[test]
    fn closed_cron_window_blocks_dispatch() {
        let fx = fixture();
        fx.claims.claim("op-1", "act_1").unwrap();
        // No window configured at all: fail-closed

        let outcome = fx
            .dispatcher
            .dispatch_at(
                &DispatchRequest {
                    job_types: Some(vec![JobType::CampaignSync]),
                    ..Default::default()
                },
                two_pm(),
            )
            .unwrap();

        assert!(outcome.created.is_empty());
        assert_eq!(outcome.skipped_window_closed, 1);
    }

    #[test]
    fn active_job_with_same_key_is_not_duplicated() {
        let fx = fixture();
        fx.claims.claim("op-1", "act_1").unwrap();
        open_window(&fx, "op-1", JobType::AdSync);
        let request = DispatchRequest {
            job_types: Some(vec![JobType::AdSync]),
            ..Default::default()
        };

        let first = fx.dispatcher.dispatch_at(&request, two_pm()).unwrap();
        assert_eq!(first.created.len(), 1);

        let second = fx.dispatcher.dispatch_at(&request, two_pm()).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.skipped_in_flight, 1);
    }

    #[test]
    fn fresh_cursor_suppresses_resync() {
        let fx = fixture();
        fx.claims.claim("op-1", "act_1").unwrap();
        open_window(&fx, "op-1", JobType::AdSync);
        let now = two_pm();
        // Synced 10 minutes ago, well under the 6h ad staleness threshold
        fx.cursors
            .advance("act_1", EntityType::Ad, now - chrono::Duration::minutes(10), None, None)
            .unwrap();

        let request = DispatchRequest {
            job_types: Some(vec![JobType::AdSync]),
            ..Default::default()
        };
        let outcome = fx.dispatcher.dispatch_at(&request, now).unwrap();
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.skipped_fresh, 1);

        // A cursor older than the threshold no longer suppresses
        fx.cursors
            .advance("act_1", EntityType::Ad, now - chrono::Duration::hours(7), None, None)
            .unwrap();
        let outcome = fx.dispatcher.dispatch_at(&request, now).unwrap();
        assert_eq!(outcome.created.len(), 1);
    }

    #[test]
    fn insight_jobs_require_a_date_range_and_carry_it() {
        let fx = fixture();
        fx.claims.claim("op-1", "act_1").unwrap();
        open_window(&fx, "op-1", JobType::InsightSync);
        let request_without_dates = DispatchRequest {
            job_types: Some(vec![JobType::InsightSync]),
            ..Default::default()
        };

        // Without dates, insight jobs are silently omitted
        let outcome = fx
            .dispatcher
            .dispatch_at(&request_without_dates, two_pm())
            .unwrap();
        assert!(outcome.created.is_empty());

        let request = DispatchRequest {
            job_types: Some(vec![JobType::InsightSync]),
            date_start: Some("2024-01-01".parse().unwrap()),
            date_end: Some("2024-01-07".parse().unwrap()),
            ..Default::default()
        };
        let outcome = fx.dispatcher.dispatch_at(&request, two_pm()).unwrap();
        assert_eq!(outcome.created.len(), 1);

        let job = fx.jobs.get(outcome.created[0]).unwrap().unwrap();
        assert_eq!(job.job_type, JobType::InsightSync);
        assert_eq!(job.date_start, request.date_start);
        assert_eq!(job.date_end, request.date_end);
    }

    #[test]
    fn same_account_different_date_range_is_a_new_job() {
        let fx = fixture();
        fx.claims.claim("op-1", "act_1").unwrap();
        open_window(&fx, "op-1", JobType::InsightSync);

        let mut request = DispatchRequest {
            job_types: Some(vec![JobType::InsightSync]),
            date_start: Some("2024-01-01".parse().unwrap()),
            date_end: Some("2024-01-07".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(
            fx.dispatcher.dispatch_at(&request, two_pm()).unwrap().created.len(),
            1
        );
        // Same range again: deduplicated
        assert_eq!(
            fx.dispatcher
                .dispatch_at(&request, two_pm())
                .unwrap()
                .skipped_in_flight,
            1
        );

        request.date_start = Some("2024-01-08".parse().unwrap());
        request.date_end = Some("2024-01-14".parse().unwrap());
        assert_eq!(
            fx.dispatcher.dispatch_at(&request, two_pm()).unwrap().created.len(),
            1
        );
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let fx = fixture();
        let request = DispatchRequest {
            date_start: Some("2024-01-07".parse().unwrap()),
            date_end: Some("2024-01-01".parse().unwrap()),
            ..Default::default()
        };
        let err = fx.dispatcher.dispatch_at(&request, two_pm()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let half_open = DispatchRequest {
            date_start: Some("2024-01-01".parse().unwrap()),
            ..Default::default()
        };
        let err = fx.dispatcher.dispatch_at(&half_open, two_pm()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn outcome_serializes_an_aggregate_skipped_count() {
        let outcome = DispatchOutcome {
            created: vec![],
            skipped_window_closed: 1,
            skipped_in_flight: 2,
            skipped_fresh: 3,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["skipped"], 6);
        assert_eq!(value["skipped_window_closed"], 1);
        assert_eq!(value["skipped_in_flight"], 2);
        assert_eq!(value["skipped_fresh"], 3);
    }

    #[test]
    fn account_filter_restricts_dispatch() {
        let fx = fixture();
        fx.claims.claim("op-1", "act_1").unwrap();
        fx.claims.claim("op-1", "act_2").unwrap();
        open_window(&fx, "op-1", JobType::CampaignSync);

        let request = DispatchRequest {
            account_ids: Some(vec!["act_2".to_string()]),
            job_types: Some(vec![JobType::CampaignSync]),
            ..Default::default()
        };
        let outcome = fx.dispatcher.dispatch_at(&request, two_pm()).unwrap();
        assert_eq!(outcome.created.len(), 1);
        let job = fx.jobs.get(outcome.created[0]).unwrap().unwrap();
        assert_eq!(job.account_id, "act_2");
    }
}

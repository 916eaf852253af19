//! Rate-limited, retrying client for the advertising platform API.
//!
//! The raw transport sits behind the [`AdsApi`] trait so tests can script
//! responses; [`HttpAdsApi`] implements it over the platform's Graph-style
//! REST surface. [`RemoteClient`] wraps the transport and owns the
//! cross-cutting policy: a per-credential token bucket, bounded exponential
//! backoff with jitter for `RateLimited`/`Transient` failures, and immediate
//! credential invalidation on `AuthFailed`.

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::credentials::{Credential, CredentialStore};
use crate::cursor::EntityType;
use crate::error::{Result, SyncError};

mod limiter;

pub use limiter::RateLimiter;

/// One page of platform items.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Remote failure classification, mapped from transport status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited")]
    RateLimited,
    #[error("auth failed: {0}")]
    AuthFailed(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Scope of one page fetch.
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub entity_type: EntityType,
    pub account_id: &'a str,
    pub cursor: Option<&'a str>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
}

/// Raw transport to the advertising platform.
#[async_trait]
pub trait AdsApi: Send + Sync {
    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        credential: &Credential,
    ) -> std::result::Result<Page, ApiError>;
}

// ── HTTP transport ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PagingCursors {
    after: Option<String>,
}

#[derive(Deserialize)]
struct Paging {
    cursors: Option<PagingCursors>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Vec<Value>,
    paging: Option<Paging>,
}

/// HTTP client for the platform's REST API.
///
/// Takes a `base_url` so tests can point it at a mock server.
pub struct HttpAdsApi {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpAdsApi {
    pub fn new(base_url: String) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url,
        }
    }

    fn edge(entity_type: EntityType) -> &'static str {
        match entity_type {
            EntityType::Account => "details",
            EntityType::Campaign => "campaigns",
            EntityType::Ad => "ads",
            EntityType::Insight => "insights",
        }
    }
}

#[async_trait]
impl AdsApi for HttpAdsApi {
    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        credential: &Credential,
    ) -> std::result::Result<Page, ApiError> {
        let url = format!(
            "{}/{}/{}",
            self.base_url,
            request.account_id,
            Self::edge(request.entity_type)
        );

        let mut query: Vec<(&str, String)> = vec![("limit", "100".to_string())];
        if let Some(cursor) = request.cursor {
            query.push(("after", cursor.to_string()));
        }
        if let (Some(since), Some(until)) = (request.date_start, request.date_end) {
            query.push((
                "time_range",
                format!(r#"{{"since":"{since}","until":"{until}"}}"#),
            ));
        }

        let response = self
            .http_client
            .get(&url)
            .query(&query)
            .bearer_auth(&credential.secret)
            .send()
            .await
            .map_err(|e| ApiError::Transient(format!("request failed: {e}")))?;

        check_response_status(&response)?;

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ApiError::Permanent(format!("malformed response body: {e}")))?;

        let next_cursor = envelope
            .paging
            .as_ref()
            .and_then(|p| p.cursors.as_ref())
            .and_then(|c| c.after.clone());
        let has_more = envelope
            .paging
            .as_ref()
            .map(|p| p.next.is_some())
            .unwrap_or(false);

        Ok(Page {
            items: envelope.data,
            next_cursor,
            has_more,
        })
    }
}

/// Map status codes onto the error taxonomy.
///
/// - 401 → auth failure (credential rejected)
/// - 429 → rate limited
/// - 5xx → transient
/// - other non-2xx → permanent
fn check_response_status(response: &reqwest::Response) -> std::result::Result<(), ApiError> {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => Err(ApiError::AuthFailed(
            "platform rejected the access token".to_string(),
        )),
        StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited),
        s if s.is_server_error() => Err(ApiError::Transient(format!("platform error: {s}"))),
        s if !s.is_success() => Err(ApiError::Permanent(format!("platform rejected request: {s}"))),
        _ => Ok(()),
    }
}

// ── Policy wrapper ─────────────────────────────────────────────────────────

/// Rate-limited, retrying view of the platform API shared by all executors.
pub struct RemoteClient {
    api: Arc<dyn AdsApi>,
    limiter: RateLimiter,
    credentials: Arc<CredentialStore>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RemoteClient {
    pub fn new(api: Arc<dyn AdsApi>, credentials: Arc<CredentialStore>, cfg: &SyncConfig) -> Self {
        Self {
            api,
            limiter: RateLimiter::new(cfg.rate_limit_per_minute),
            credentials,
            max_attempts: cfg.retry_max_attempts.max(1),
            base_delay: cfg.retry_base_delay,
            max_delay: cfg.retry_max_delay,
        }
    }

    /// Fetch one page, applying the retry budget.
    ///
    /// `RateLimited`/`Transient` are retried with exponential backoff plus
    /// jitter; once the budget is exhausted they surface as `Transient`.
    /// `AuthFailed` invalidates the credential and surfaces immediately, as
    /// does `Permanent`.
    pub async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        credential: &Credential,
    ) -> Result<Page> {
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            self.limiter.acquire(credential.id).await;

            match self.api.fetch_page(request, credential).await {
                Ok(page) => return Ok(page),
                Err(ApiError::AuthFailed(reason)) => {
                    warn!(
                        credential_id = %credential.id,
                        account_id = %request.account_id,
                        "Auth failure from platform, invalidating credential"
                    );
                    self.credentials.invalidate(credential.id)?;
                    return Err(SyncError::AuthFailed(reason));
                }
                Err(ApiError::Permanent(reason)) => {
                    return Err(SyncError::Permanent(reason));
                }
                Err(retryable @ (ApiError::RateLimited | ApiError::Transient(_))) => {
                    last_error = retryable.to_string();
                    if attempt + 1 < self.max_attempts {
                        let delay = self.backoff_delay(attempt);
                        debug!(
                            account_id = %request.account_id,
                            entity = %request.entity_type.as_str(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "Retrying page fetch after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(SyncError::Transient(format!(
            "retry budget of {} attempts exhausted: {last_error}",
            self.max_attempts
        )))
    }

    /// Exponential delay capped at `max_delay`, plus up to 50% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = if exp.as_millis() == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2)
        };
        exp + Duration::from_millis(jitter_ms)
    }
}

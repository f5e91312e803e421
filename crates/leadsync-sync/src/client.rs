//! # CRM API Client
//!
//! Throttled, retrying access to the amoCRM v4 REST API.
//!
//! ## Request Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  caller ──► Throttle::acquire ──► TokenManager::access_token ──► HTTP  │
//! │                 ▲                                                │      │
//! │                 │          429: sleep min(attempt × step, cap)   │      │
//! │                 └─────────────── (≤ max_attempts) ◄──────────────┘      │
//! │                                                                         │
//! │   401 once ──► invalidate cached token, retry                          │
//! │   204/404 on a single entity ──► NotFound                              │
//! │   429 after the last attempt ──► RateLimited                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collections are paginated by following `_links.next.href` until an empty
//! page, a 204, or no next link.
//!
//! The engine talks to [`CrmApi`], so tests can drive it without HTTP.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use leadsync_core::{
    first_entries, Contact, ContactId, EntityId, FirstEntry, Lead, Pipeline, PipelineId,
    StatusChangeEvent, StatusId, User,
};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::CrmSettings;
use crate::error::{SyncError, SyncResult};
use crate::throttle::Throttle;
use crate::token::TokenManager;

/// Page size for collection requests.
const PAGE_LIMIT: &str = "250";

// =============================================================================
// Request Types
// =============================================================================

/// Timestamp a collection range filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    CreatedAt,
    UpdatedAt,
}

impl DateField {
    fn as_str(&self) -> &'static str {
        match self {
            DateField::CreatedAt => "created_at",
            DateField::UpdatedAt => "updated_at",
        }
    }
}

/// One custom field value in a PATCH body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldPatch {
    pub field_id: u64,
    pub values: Vec<FieldPatchValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldPatchValue {
    pub value: Value,
}

/// Body of `PATCH /api/v4/leads/{id}`. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<StatusId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<PipelineId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_fields_values: Option<Vec<FieldPatch>>,
}

impl LeadPatch {
    pub fn status(status: StatusId, pipeline: PipelineId) -> Self {
        LeadPatch {
            status_id: Some(status),
            pipeline_id: Some(pipeline),
            custom_fields_values: None,
        }
    }

    pub fn with_text_field(mut self, field_id: u64, text: &str) -> Self {
        self.custom_fields_values
            .get_or_insert_with(Vec::new)
            .push(FieldPatch {
                field_id,
                values: vec![FieldPatchValue {
                    value: Value::String(text.to_string()),
                }],
            });
        self
    }
}

// =============================================================================
// CrmApi Trait
// =============================================================================

/// What the reconciliation engine needs from the CRM.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Fetches a lead with contacts and companies embedded.
    async fn get_lead(&self, id: EntityId) -> SyncResult<Lead>;

    async fn get_contact(&self, id: ContactId) -> SyncResult<Contact>;

    /// All leads whose `field` lies in `[from, to]` (Unix seconds).
    async fn leads_between(&self, field: DateField, from: i64, to: i64) -> SyncResult<Vec<Lead>>;

    /// `lead_status_changed` events created in `[from, to]`.
    async fn status_change_events(&self, from: i64, to: i64)
        -> SyncResult<Vec<StatusChangeEvent>>;

    async fn patch_lead(&self, id: EntityId, patch: &LeadPatch) -> SyncResult<()>;

    /// Pipelines with their statuses.
    async fn pipelines(&self) -> SyncResult<Vec<Pipeline>>;

    async fn users(&self) -> SyncResult<Vec<User>>;

    /// Per entity, the earliest move from outside `targets` into it.
    async fn first_entries_between(
        &self,
        from: i64,
        to: i64,
        targets: &HashSet<StatusId>,
    ) -> SyncResult<BTreeMap<EntityId, FirstEntry>> {
        let events = self.status_change_events(from, to).await?;
        Ok(first_entries(&events, targets))
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded linear backoff on HTTP 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            step: Duration::from_secs(10),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &CrmSettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            step: Duration::from_secs(settings.retry_step_secs),
            cap: Duration::from_secs(settings.retry_cap_secs),
        }
    }

    /// Wait after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        (self.step * attempt).min(self.cap)
    }
}

// =============================================================================
// Client
// =============================================================================

/// HTTP implementation of [`CrmApi`].
pub struct RateLimitedApiClient {
    http: Client,
    base_url: Url,
    tokens: Arc<TokenManager>,
    throttle: Arc<Throttle>,
    retry: RetryPolicy,
}

impl RateLimitedApiClient {
    pub fn new(
        settings: &CrmSettings,
        tokens: Arc<TokenManager>,
        throttle: Arc<Throttle>,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| SyncError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: settings.base_url()?,
            tokens,
            throttle,
            retry: RetryPolicy::from_settings(settings),
        })
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Sends one request through the throttle, retrying on 429. Returns the
    /// last response when every attempt was rate limited.
    async fn send(&self, method: Method, url: &Url, body: Option<&Value>) -> SyncResult<Response> {
        let mut reauthenticated = false;
        let mut attempt = 1;
        loop {
            let token = self.tokens.access_token().await?;
            self.throttle.acquire().await;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let resp = request.send().await?;

            match resp.status() {
                StatusCode::TOO_MANY_REQUESTS if attempt < self.retry.max_attempts => {
                    let wait = self.retry.delay(attempt);
                    warn!(
                        %method,
                        path = url.path(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        wait_secs = wait.as_secs(),
                        "CRM rate limit hit, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                StatusCode::UNAUTHORIZED if !reauthenticated => {
                    warn!(%method, path = url.path(), "CRM rejected token, revalidating");
                    self.tokens.invalidate().await;
                    reauthenticated = true;
                }
                _ => return Ok(resp),
            }
        }
    }

    /// Maps a non-success response to an error.
    async fn check(&self, resp: Response, url: &Url) -> SyncResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let endpoint = url.path().to_string();
        let message = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited {
                endpoint,
                attempts: self.retry.max_attempts,
            },
            StatusCode::UNAUTHORIZED => SyncError::AuthFailed(format!("{}: {}", endpoint, message)),
            StatusCode::NOT_FOUND => SyncError::NotFound(endpoint),
            _ => SyncError::Crm {
                endpoint,
                status: status.as_u16(),
                message,
            },
        })
    }

    /// GET returning `None` on 204 No Content.
    async fn get_value(&self, url: &Url) -> SyncResult<Option<Value>> {
        let resp = self.send(Method::GET, url, None).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = self.check(resp, url).await?;
        Ok(Some(resp.json().await?))
    }

    /// Raw GET of an API path, for diagnostics endpoints.
    pub async fn get_raw(&self, path_and_query: &str) -> SyncResult<Value> {
        let url = self.endpoint(path_and_query)?;
        Ok(self.get_value(&url).await?.unwrap_or(Value::Null))
    }

    /// Follows `_links.next.href` collecting `_embedded.<key>` items.
    async fn paginate<T: DeserializeOwned>(&self, first: Url, key: &str) -> SyncResult<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first);
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            let Some(page) = self.get_value(&url).await? else {
                break;
            };
            pages += 1;

            let batch = page
                .pointer(&format!("/_embedded/{}", key))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            for item in batch {
                items.push(serde_json::from_value(item)?);
            }

            next = page
                .pointer("/_links/next/href")
                .and_then(Value::as_str)
                .map(|href| url.join(href))
                .transpose()?
                .filter(|n| *n != url);
        }

        debug!(key, pages, items = items.len(), "Collection fetched");
        Ok(items)
    }
}

#[async_trait]
impl CrmApi for RateLimitedApiClient {
    async fn get_lead(&self, id: EntityId) -> SyncResult<Lead> {
        let mut url = self.endpoint(&format!("/api/v4/leads/{}", id))?;
        url.query_pairs_mut().append_pair("with", "contacts,companies");
        match self.get_value(&url).await {
            Ok(Some(value)) => Ok(serde_json::from_value(value)?),
            Ok(None) | Err(SyncError::NotFound(_)) => Err(SyncError::NotFound(format!("lead {}", id))),
            Err(e) => Err(e),
        }
    }

    async fn get_contact(&self, id: ContactId) -> SyncResult<Contact> {
        let url = self.endpoint(&format!("/api/v4/contacts/{}", id))?;
        match self.get_value(&url).await {
            Ok(Some(value)) => Ok(serde_json::from_value(value)?),
            Ok(None) | Err(SyncError::NotFound(_)) => {
                Err(SyncError::NotFound(format!("contact {}", id)))
            }
            Err(e) => Err(e),
        }
    }

    async fn leads_between(&self, field: DateField, from: i64, to: i64) -> SyncResult<Vec<Lead>> {
        let mut url = self.endpoint("/api/v4/leads")?;
        url.query_pairs_mut()
            .append_pair(&format!("filter[{}][from]", field.as_str()), &from.to_string())
            .append_pair(&format!("filter[{}][to]", field.as_str()), &to.to_string())
            .append_pair("with", "contacts")
            .append_pair("limit", PAGE_LIMIT);
        self.paginate(url, "leads").await
    }

    async fn status_change_events(
        &self,
        from: i64,
        to: i64,
    ) -> SyncResult<Vec<StatusChangeEvent>> {
        let mut url = self.endpoint("/api/v4/events")?;
        url.query_pairs_mut()
            .append_pair("filter[type]", "lead_status_changed")
            .append_pair("filter[created_at][from]", &from.to_string())
            .append_pair("filter[created_at][to]", &to.to_string())
            .append_pair("limit", "100");
        self.paginate(url, "events").await
    }

    async fn patch_lead(&self, id: EntityId, patch: &LeadPatch) -> SyncResult<()> {
        let url = self.endpoint(&format!("/api/v4/leads/{}", id))?;
        let body = serde_json::to_value(patch)?;
        let resp = self.send(Method::PATCH, &url, Some(&body)).await?;
        self.check(resp, &url).await?;
        debug!(entity_id = %id, ?patch, "Lead patched");
        Ok(())
    }

    async fn pipelines(&self) -> SyncResult<Vec<Pipeline>> {
        let mut url = self.endpoint("/api/v4/leads/pipelines")?;
        url.query_pairs_mut()
            .append_pair("with", "statuses")
            .append_pair("limit", PAGE_LIMIT);
        self.paginate(url, "pipelines").await
    }

    async fn users(&self) -> SyncResult<Vec<User>> {
        let mut url = self.endpoint("/api/v4/users")?;
        url.query_pairs_mut().append_pair("limit", PAGE_LIMIT);
        self.paginate(url, "users").await
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # LeadSync Sync Server
//!
//! HTTP front of the reconciliation engine.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Server Routes                              │
//! │                                                                         │
//! │  POST /webhook/amocrm, POST /   CRM notification → push batch          │
//! │  GET  /health, GET /            liveness                                │
//! │  POST /oauth/exchange           authorization code → token pair         │
//! │  GET  /oauth/url                consent URL for the operator            │
//! │  POST /admin/rotate             active sheet → archive                  │
//! │  GET  /structure                CRM pipelines with statuses (raw)       │
//! │  GET  /leads/custom_fields      CRM lead custom fields (raw)            │
//! │  GET  /leads/{id}               one CRM lead with embeds (raw)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod routes;

use std::sync::Arc;

use leadsync_sync::{RateLimitedApiClient, ReconciliationEngine};

pub use error::ApiError;
pub use routes::router;

/// Shared application state.
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,

    /// The concrete CRM client, for token exchange and raw passthrough.
    pub crm: Arc<RateLimitedApiClient>,
}

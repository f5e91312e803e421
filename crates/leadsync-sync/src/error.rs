//! # Sync Error Types
//!
//! Error types for reconciliation operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   CRM access    │  │     Domain              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  AuthFailed     │  │  Domain (unmapped       │ │
//! │  │  InvalidUrl     │  │  RateLimited    │  │    status, cycles)      │ │
//! │  │  ConfigLoad/Save│  │  NotFound       │  │  Validation (payload)   │ │
//! │  └─────────────────┘  │  Crm / Connect  │  └─────────────────────────┘ │
//! │                       └─────────────────┘                              │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Table        │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  Quota          │  │  Internal       │                              │
//! │  │  Store          │  │  ShuttingDown   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-entity failures are counted by the engine and never abort a batch.
//! Systemic ones ([`SyncError::is_systemic`]) bubble up to the poller, which
//! backs off before retrying the whole cycle.

use leadsync_core::{CoreError, ValidationError};
use leadsync_store::StoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all reconciliation failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid URL (CRM base URL, redirect URL).
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // CRM Errors
    // =========================================================================
    /// No usable token and no way to get one. Needs operator action.
    #[error("CRM authentication failed: {0}")]
    AuthFailed(String),

    /// Still rate limited after all retry attempts.
    #[error("CRM rate limit persisted after {attempts} attempts on {endpoint}")]
    RateLimited { endpoint: String, attempts: u32 },

    /// The entity no longer exists in the CRM.
    #[error("CRM resource not found: {0}")]
    NotFound(String),

    /// Any other non-success CRM response.
    #[error("CRM request {endpoint} failed with status {status}: {message}")]
    Crm {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Transport failure talking to the CRM.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// CRM response body did not match the expected shape.
    #[error("Failed to decode CRM response: {0}")]
    Decode(String),

    // =========================================================================
    // Domain Errors
    // =========================================================================
    /// Status mapping or precedence configuration problem.
    #[error(transparent)]
    Domain(#[from] CoreError),

    /// Malformed inbound payload.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Table Errors
    // =========================================================================
    /// Table backend quota exhausted.
    #[error("Table quota exceeded: {0}")]
    Quota(String),

    /// Any other table or state-file failure.
    #[error("Table storage error: {0}")]
    Store(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Poller is shutting down.
    #[error("Sync poller is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Quota(msg) => SyncError::Quota(msg),
            other => SyncError::Store(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Connection(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if retrying the same operation later can succeed.
    ///
    /// ## Retryable Errors
    /// - Rate limits and quota exhaustion
    /// - Transport failures
    /// - CRM 5xx responses
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } | SyncError::Quota(_) | SyncError::Connection(_) => true,
            SyncError::Crm { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true for failures that affect every entity, not just one:
    /// the poller backs off instead of moving on.
    pub fn is_systemic(&self) -> bool {
        matches!(self, SyncError::AuthFailed(_) | SyncError::Quota(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

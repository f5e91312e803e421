//! # Store Error Types
//!
//! Error types for table and state-file operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  reqwest / io / serde_json error                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Quota is split out from everything else    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (leadsync-sync) ← Quota becomes systemic, poller backs off  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Table and state storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend refused the call for quota reasons (HTTP 429).
    ///
    /// ## When This Occurs
    /// - Sheets per-minute read/write quota exhausted
    ///
    /// Cached row indexes stay valid; retrying later is safe.
    #[error("Table backend quota exceeded: {0}")]
    Quota(String),

    /// Any other backend failure.
    #[error("Table backend error: {0}")]
    Backend(String),

    /// Backend credentials are missing or rejected.
    #[error("Table backend authentication failed: {0}")]
    Auth(String),

    /// Partition does not exist.
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    /// Partition already exists (rename target taken).
    #[error("Partition already exists: {0}")]
    PartitionExists(String),

    /// Column name not part of the schema.
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// State file read/write failed.
    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// State file or API body could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for quota errors, which callers back off on.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::Quota(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(429) {
            StoreError::Quota(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

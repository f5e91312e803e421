//! # Error Types
//!
//! Domain-specific error types for leadsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  leadsync-core errors (this file)                                      │
//! │  ├── CoreError        - Vocabulary / mapping failures                  │
//! │  └── ValidationError  - Malformed webhook payloads, bad config values  │
//! │                                                                         │
//! │  leadsync-store errors (separate crate)                                │
//! │  └── StoreError       - Table backend + state file failures            │
//! │                                                                         │
//! │  leadsync-sync errors (separate crate)                                 │
//! │  └── SyncError        - Auth, rate limits, CRM transport               │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → ApiError → HTTP       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::PipelineId;

// =============================================================================
// Core Error
// =============================================================================

/// Domain errors raised by the pure reconciliation helpers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A sheet status could not be resolved to a CRM status id.
    ///
    /// ## When This Occurs
    /// - The operator picked a status the pipeline does not have
    /// - The pipeline was never loaded (unknown pipeline id)
    /// - No global fallback id is configured for that status
    #[error("No status id for '{status}' in pipeline {pipeline}")]
    UnmappedStatus { status: String, pipeline: PipelineId },

    /// A precedence rule references itself through a cycle.
    #[error("Precedence rules form a cycle through '{0}'")]
    PrecedenceCycle(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised for inbound notifications that cannot be interpreted. A batch
/// counts these instead of aborting.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Invalid format (e.g., non-numeric id).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Body is neither JSON nor form-encoded in a recognizable shape.
    #[error("Malformed notification body: {0}")]
    MalformedBody(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

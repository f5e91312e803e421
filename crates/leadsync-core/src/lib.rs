//! # leadsync-core: Pure Domain Logic for LeadSync
//!
//! This crate contains the deterministic half of CRM ↔ sheet reconciliation:
//! everything that can be decided from data alone, with no network, no files
//! and no clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        LeadSync Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/sync-server (axum + poller)                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        leadsync-sync (tokens, CRM client, engine)               │   │
//! │  └──────────────┬──────────────────────────────┬───────────────────┘   │
//! │                 │                              │                        │
//! │  ┌──────────────▼───────────────┐              │                        │
//! │  │  leadsync-store (sheets,     │              │                        │
//! │  │  row index, sync state)      │              │                        │
//! │  └──────────────┬───────────────┘              │                        │
//! │                 │                              │                        │
//! │  ┌──────────────▼──────────────────────────────▼───────────────────┐   │
//! │  │             ★ leadsync-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────┐ ┌──────────┐ ┌────────────┐ ┌────────┐ ┌──────┐  │   │
//! │  │   │  types  │ │ webhook  │ │ vocabulary │ │ events │ │ row  │  │   │
//! │  │   │ ids,    │ │ JSON +   │ │ maps,      │ │ first  │ │schema│  │   │
//! │  │   │ Lead    │ │ form     │ │ resolver   │ │ entry  │ │build │  │   │
//! │  │   └─────────┘ └──────────┘ └────────────┘ └────────┘ └──────┘  │   │
//! │  │                     ┌────────────┐                              │   │
//! │  │                     │ precedence │                              │   │
//! │  │                     └────────────┘                              │   │
//! │  │   NO I/O • NO CLOCK • PURE FUNCTIONS                           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Id newtypes, lead/pipeline/event models, change descriptors
//! - [`webhook`] - Webhook body normalization
//! - [`vocabulary`] - Status/pipeline naming, three-tier resolver, classification
//! - [`precedence`] - Partial order guarding automatic sheet writes
//! - [`events`] - First entry into a watched status set
//! - [`row`] - Column schema and the lead → row builder
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use leadsync_core::webhook::parse_notification;
//!
//! let body = b"leads%5Bstatus%5D%5B0%5D%5Bid%5D=555&leads%5Bstatus%5D%5B0%5D%5Bstatus_id%5D=42";
//! let notification = parse_notification(body, "application/x-www-form-urlencoded").unwrap();
//!
//! assert_eq!(notification.changes.len(), 1);
//! assert_eq!(notification.changes[0].id.get(), 555);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod events;
pub mod precedence;
pub mod row;
pub mod types;
pub mod vocabulary;
pub mod webhook;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use events::{first_entries, FirstEntry};
pub use precedence::{PrecedenceRule, PrecedenceTable};
pub use row::{build_row, RowContext, RowView, TableRow, TableSchema};
pub use types::*;
pub use vocabulary::{
    PipelineStatusMap, ResolutionTier, StatusClass, StatusResolver, StatusSets, Vocabulary,
};
pub use webhook::{parse_notification, Notification};

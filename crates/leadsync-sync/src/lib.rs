//! # leadsync-sync: Reconciliation Engine for LeadSync
//!
//! Keeps amoCRM leads and the order sheet in agreement.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        LeadSync Sync Layer                              │
//! │                                                                         │
//! │   webhook batch ──┐                       ┌── Poller (interval task)    │
//! │                   ▼                       ▼                             │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    ReconciliationEngine                          │  │
//! │  │                                                                  │  │
//! │  │  push: dedup → retired? → classify → re-fetch → filters → write │  │
//! │  │  pull: snapshot → marker fills / status edits → PATCH           │  │
//! │  │  catch-up, sweep, bootstrap, rotate                             │  │
//! │  └───────┬──────────────────────┬──────────────────────┬───────────┘  │
//! │          ▼                      ▼                      ▼               │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌──────────────────────┐ │
//! │  │ dyn CrmApi     │  │ IndexedTableStore  │  │ SyncStateStore       │ │
//! │  │ RateLimited-   │  │ (leadsync-store)   │  │ (leadsync-store)     │ │
//! │  │ ApiClient      │  └────────────────────┘  └──────────────────────┘ │
//! │  │  Throttle      │                                                    │
//! │  │  TokenManager  │                                                    │
//! │  └────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`client`] - CRM API trait and the throttled, retrying HTTP client
//! - [`clock`] - Wall-clock abstraction
//! - [`config`] - Layered configuration (defaults, TOML, environment)
//! - [`dedup`] - Redelivery window keyed by `(entity, status)`
//! - [`engine`] - Push, pull, catch-up, sweep and rotation
//! - [`error`] - Sync error types
//! - [`poller`] - Background schedule with backoff
//! - [`staff`] - Staff code directory with TTL cache
//! - [`throttle`] - Minimum spacing between CRM calls
//! - [`token`] - OAuth token pair storage and refresh
//!
//! ## Usage
//!
//! ```rust,ignore
//! use leadsync_sync::{Poller, ReconciliationEngine, SyncConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let engine = Arc::new(ReconciliationEngine::new(config, crm, backend, state, clock)?);
//! engine.initialize().await?;
//!
//! let (poller, handle) = Poller::new(engine.clone());
//! tokio::spawn(poller.run());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod poller;
pub mod staff;
pub mod throttle;
pub mod token;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{CrmApi, DateField, LeadPatch, RateLimitedApiClient, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendKind, CrmSettings, ServerSettings, SyncConfig, SyncSettings, TableSettings};
pub use dedup::DedupWindow;
pub use engine::{BatchOutcome, PollOutcome, ReconciliationEngine, SkipCounts};
pub use error::{SyncError, SyncResult};
pub use poller::{bootstrap_with_retry, Poller, PollerHandle};
pub use staff::{StaffDirectory, StaffMap};
pub use throttle::Throttle;
pub use token::{extract_code, TokenManager, TokenPair, TokenStore};

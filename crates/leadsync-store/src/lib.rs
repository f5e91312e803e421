//! # leadsync-store: Table and State Storage for LeadSync
//!
//! Everything LeadSync persists outside the CRM: sheet rows and the local
//! sync-state document.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         leadsync-store                                  │
//! │                                                                         │
//! │   ┌──────────────────────────┐        ┌───────────────────────────┐    │
//! │   │ IndexedTableStore        │        │ SyncStateStore            │    │
//! │   │  • row index per sheet   │        │  • known status / marker  │    │
//! │   │  • header + dropdown     │        │  • expiry + tombstones    │    │
//! │   │  • rotate to archive     │        │  • CRM cursor             │    │
//! │   └────────────┬─────────────┘        │  • atomic JSON flush      │    │
//! │                │                      └───────────────────────────┘    │
//! │   ┌────────────▼─────────────┐                                          │
//! │   │ dyn TableBackend         │                                          │
//! │   │  GoogleSheetsBackend     │                                          │
//! │   │  MemoryBackend           │                                          │
//! │   └──────────────────────────┘                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod sheets;
pub mod sync_state;
pub mod table;

pub use backend::{Grid, TableBackend};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryBackend;
pub use sheets::{GoogleSheetsBackend, ServiceAccountKey};
pub use sync_state::{EntityState, StateDocument, SyncStateStore};
pub use table::{IndexedTableStore, RowIndex, UpsertOutcome};

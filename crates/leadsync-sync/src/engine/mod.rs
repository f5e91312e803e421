//! # Reconciliation Engine
//!
//! Keeps the CRM pipeline and the sheet in agreement, in both directions.
//!
//! ## Entity Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   UNTRACKED ──trigger status──► TRACKED(s) ──status s'──► TRACKED(s')   │
//! │       ▲                            │  ▲                      │          │
//! │       │                            └──┘ same status: no-op   │          │
//! │       │                                                      ▼          │
//! │   (never again)  ◄──── sweep ──── PURGED ◄── expiry armed (terminal)   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Directions
//! - **push** (`push.rs`): webhook batches and the CRM catch-up poll feed
//!   change descriptors; each is deduplicated, re-fetched from the CRM and
//!   written to the sheet.
//! - **pull** (`pull.rs`): a periodic sheet snapshot; operator edits to the
//!   status and marker columns become CRM PATCHes.
//!
//! The engine owns every registry it needs (pipeline/status maps, dedup
//! window, row index via the store) and is shared as `Arc<ReconciliationEngine>`.
//! Push and pull take the same per-lead lock, so a webhook echoing an
//! operator edit is judged against the status the edit left behind.

mod locks;
mod pull;
mod push;

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Duration;
use leadsync_core::{
    EntityId, PipelineStatusMap, PrecedenceTable, StatusId, StatusSets, UserId,
};
use leadsync_store::{IndexedTableStore, SyncStateStore, TableBackend};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::client::CrmApi;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::dedup::DedupWindow;
use crate::error::{SyncError, SyncResult};
use crate::staff::StaffDirectory;

use self::locks::EntityLocks;

// =============================================================================
// Outcomes
// =============================================================================

/// Why a change descriptor in a push batch was not written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub no_id: usize,
    pub duplicate: usize,
    pub retired: usize,
    pub status_mismatch: usize,
    pub not_found: usize,
    pub too_old: usize,
    pub pipeline_filtered: usize,
    pub unchanged: usize,
    pub precedence: usize,
    pub no_row: usize,
}

/// Result of one push batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub received: usize,
    pub written: usize,
    pub trigger_matches: usize,
    pub terminal_matches: usize,
    pub tracked_matches: usize,
    pub skipped: SkipCounts,
    pub failed: usize,
    pub seen_status_ids: BTreeSet<StatusId>,
}

/// Result of one pull cycle over the sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    pub rows_seen: usize,
    pub baselined: usize,
    pub retired: usize,
    pub marker_fills: usize,
    pub status_pushes: usize,
    pub unchanged: usize,
    pub mapping_failures: usize,
    pub errors: usize,
}

// =============================================================================
// Catalog
// =============================================================================

/// CRM vocabulary loaded by [`ReconciliationEngine::initialize`].
#[derive(Debug, Default)]
struct Catalog {
    map: PipelineStatusMap,
    sets: StatusSets,
    users: HashMap<UserId, String>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct ReconciliationEngine {
    config: SyncConfig,
    crm: Arc<dyn CrmApi>,
    store: IndexedTableStore,
    state: SyncStateStore,
    dedup: DedupWindow,
    precedence: PrecedenceTable,
    staff: StaffDirectory,
    clock: Arc<dyn Clock>,
    catalog: RwLock<Catalog>,
    locks: EntityLocks,
}

impl ReconciliationEngine {
    pub fn new(
        config: SyncConfig,
        crm: Arc<dyn CrmApi>,
        backend: Arc<dyn TableBackend>,
        state: SyncStateStore,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let precedence = PrecedenceTable::new(&config.sync.precedence)?;
        let dedup_ttl = seconds(config.sync.dedup_ttl_secs)?;
        let staff_ttl = seconds(config.table.staff_cache_ttl_secs)?;

        let store = IndexedTableStore::new(
            backend,
            config.table.schema.clone(),
            config.table.worksheet.clone(),
            config.vocabulary.sheet_choices.clone(),
        );
        let staff = StaffDirectory::new(config.table.staff_sheet.clone(), staff_ttl);

        Ok(Self {
            crm,
            store,
            state,
            dedup: DedupWindow::new(dedup_ttl),
            precedence,
            staff,
            clock,
            catalog: RwLock::new(Catalog::default()),
            locks: EntityLocks::default(),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &IndexedTableStore {
        &self.store
    }

    pub fn state(&self) -> &SyncStateStore {
        &self.state
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Loads pipelines, statuses and users from the CRM and resolves the
    /// trigger and terminal status sets.
    ///
    /// A failed pipeline listing leaves the maps empty; terminal ids then
    /// come from the static terminal map. Auth failures are returned.
    pub async fn initialize(&self) -> SyncResult<()> {
        let pipelines = match self.crm.pipelines().await {
            Ok(pipelines) => pipelines,
            Err(e @ SyncError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Could not load pipelines, using static status map only");
                Vec::new()
            }
        };

        let users = match self.crm.users().await {
            Ok(users) => users.into_iter().map(|u| (u.id, u.name)).collect(),
            Err(e @ SyncError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Could not load users, responsible names fall back to ids");
                HashMap::new()
            }
        };

        let map = PipelineStatusMap::build(&pipelines, &self.config.vocabulary);
        let sets = StatusSets::resolve(
            &map,
            &self.config.vocabulary,
            &self.config.sync.trigger_status_names,
            &self.config.sync.trigger_status_ids,
            &self.config.sync.terminal_statuses,
        );

        self.warn_on_gaps(&sets);
        info!(
            pipelines = map.pipeline_count(),
            users = users.len(),
            trigger_ids = ?sets.trigger_ids(),
            terminal_ids = sets.terminal_ids().count(),
            "CRM catalog loaded"
        );

        *self.catalog.write().await = Catalog { map, sets, users };
        Ok(())
    }

    fn warn_on_gaps(&self, sets: &StatusSets) {
        if sets.trigger_ids().is_empty() {
            warn!("No trigger status ids resolved, new leads will not be added");
        }
        if self.config.sync.fallback_pipeline_id.is_unset() {
            warn!("No fallback pipeline configured, status updates use each lead's own pipeline");
        }
        let unset: Vec<&str> = self
            .config
            .sync
            .terminal_statuses
            .iter()
            .filter(|(_, id)| id.is_unset())
            .map(|(name, _)| name.as_str())
            .collect();
        if !unset.is_empty() {
            warn!(statuses = ?unset, "Terminal statuses without a configured id");
        }
    }

    /// Seeds sync state from the rows already in the sheet, so they are not
    /// taken for fresh operator edits. Returns how many rows were adopted.
    pub async fn bootstrap(&self) -> SyncResult<usize> {
        let rows = self.store.snapshot().await?;
        let adopted = rows
            .iter()
            .filter(|row| self.state.baseline(row.id, &row.status, &row.marker))
            .count();
        self.flush().await;
        info!(rows = rows.len(), adopted, "Sync state bootstrapped from sheet");
        Ok(adopted)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Purges entities whose expiry passed. They are never tracked again.
    pub async fn sweep_expired(&self) -> Vec<EntityId> {
        let purged = self.state.sweep(self.clock.now());
        if !purged.is_empty() {
            self.flush().await;
        }
        purged
    }

    /// Renames the active partition to `archive` (default `Archive YYYY-MM`).
    /// Tracking state is left as is.
    pub async fn rotate_archive(&self, archive: Option<&str>) -> SyncResult<String> {
        let name = match archive.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let offset = self.config.table.date_offset()?;
                self.clock
                    .now()
                    .with_timezone(&offset)
                    .format("Archive %Y-%m")
                    .to_string()
            }
        };
        self.store.rotate(&name).await?;
        Ok(name)
    }

    async fn flush(&self) {
        if let Err(e) = self.state.flush().await {
            warn!(error = %e, "Failed to persist sync state, will retry on next flush");
        }
    }
}

fn seconds(secs: u64) -> SyncResult<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| SyncError::InvalidConfig(format!("duration out of range: {}s", secs)))
}

//! Sheet → CRM: operator edits found by a periodic snapshot.
//!
//! ```text
//!   row ──► retired? skip
//!       ──► untracked? baseline, no CRM call
//!       ──► marker ""→"A-17"?  PATCH dispatched status + marker field
//!       ──► status ≠ known and in sheet vocabulary?
//!               sheet → CRM name → resolver (display, raw, global)
//!               PATCH status_id + pipeline_id
//! ```

use leadsync_core::{EntityId, PipelineId, RowView, StatusId, StatusResolver};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PollOutcome, ReconciliationEngine};
use crate::client::LeadPatch;
use crate::error::SyncResult;

/// What happened to one row.
enum RowEffect {
    Pushed,
    Unchanged,
    MappingFailed,
}

impl ReconciliationEngine {
    /// One pass over the active partition. Systemic failures (auth, quota)
    /// end the pass and are returned; anything else is counted per row.
    pub async fn poll_table(&self) -> SyncResult<PollOutcome> {
        let cycle_id = Uuid::new_v4();
        let rows = self.store.snapshot().await?;
        let mut outcome = PollOutcome {
            rows_seen: rows.len(),
            ..PollOutcome::default()
        };

        for row in &rows {
            if self.state.is_retired(row.id) {
                outcome.retired += 1;
                continue;
            }
            let _lead_lock = self.locks.acquire(row.id).await;
            if self.state.baseline(row.id, &row.status, &row.marker) {
                outcome.baselined += 1;
                continue;
            }

            if let Err(e) = self.pull_marker(row, &mut outcome).await {
                if e.is_systemic() {
                    self.flush().await;
                    return Err(e);
                }
                outcome.errors += 1;
                warn!(%cycle_id, entity_id = %row.id, error = %e, "Marker sync failed");
            }

            match self.pull_status(row).await {
                Ok(RowEffect::Pushed) => outcome.status_pushes += 1,
                Ok(RowEffect::Unchanged) => outcome.unchanged += 1,
                Ok(RowEffect::MappingFailed) => outcome.mapping_failures += 1,
                Err(e) if e.is_systemic() => {
                    self.flush().await;
                    return Err(e);
                }
                Err(e) => {
                    outcome.errors += 1;
                    warn!(%cycle_id, entity_id = %row.id, error = %e, "Status sync to CRM failed");
                }
            }
        }

        self.flush().await;
        if outcome.status_pushes + outcome.marker_fills + outcome.errors > 0 {
            info!(
                %cycle_id,
                rows = outcome.rows_seen,
                status_pushes = outcome.status_pushes,
                marker_fills = outcome.marker_fills,
                mapping_failures = outcome.mapping_failures,
                errors = outcome.errors,
                "Sheet poll processed"
            );
        }
        Ok(outcome)
    }

    /// A marker appearing in a previously empty cell dispatches the lead.
    /// The new marker is remembered whether or not the PATCH worked.
    async fn pull_marker(&self, row: &RowView, outcome: &mut PollOutcome) -> SyncResult<()> {
        let known = self.state.known_marker(row.id).unwrap_or_default();
        if known == row.marker {
            return Ok(());
        }
        self.state.remember_marker(row.id, &row.marker);
        if !known.is_empty() || row.marker.is_empty() {
            return Ok(());
        }

        let patched = self.dispatch(row.id, &row.marker).await?;
        if patched {
            outcome.marker_fills += 1;
        } else {
            outcome.mapping_failures += 1;
        }
        Ok(())
    }

    async fn dispatch(&self, id: EntityId, marker: &str) -> SyncResult<bool> {
        let lead = self.crm.get_lead(id).await?;
        let target = self.config.sync.dispatched_status.as_str();
        let Some((status_id, pipeline_id)) = self.resolve_target(id, lead.pipeline_id, target).await
        else {
            return Ok(false);
        };

        let mut patch = LeadPatch::status(status_id, pipeline_id);
        if let Some(field_id) = self.config.sync.marker_field_id {
            patch = patch.with_text_field(field_id, marker);
        }
        self.crm.patch_lead(id, &patch).await?;
        info!(entity_id = %id, marker, status_id = %status_id, "Lead dispatched from sheet marker");
        Ok(true)
    }

    async fn pull_status(&self, row: &RowView) -> SyncResult<RowEffect> {
        let known = self.state.known_status(row.id).unwrap_or_default();
        if row.status.is_empty()
            || row.status == known
            || !self.config.vocabulary.is_sheet_value(&row.status)
        {
            return Ok(RowEffect::Unchanged);
        }

        let lead = self.crm.get_lead(row.id).await?;
        let target = self.config.vocabulary.to_crm(&row.status);
        let Some((status_id, pipeline_id)) =
            self.resolve_target(row.id, lead.pipeline_id, target).await
        else {
            return Ok(RowEffect::MappingFailed);
        };

        if lead.status_id == status_id && lead.pipeline_id == pipeline_id {
            debug!(entity_id = %row.id, "CRM already at the sheet status");
        } else {
            self.crm
                .patch_lead(row.id, &LeadPatch::status(status_id, pipeline_id))
                .await?;
        }

        self.state.remember_status(row.id, &row.status);
        self.arm_expiry(row.id, &row.status, target, self.clock.now());
        info!(entity_id = %row.id, status = %row.status, status_id = %status_id, "Sheet status pushed to CRM");
        Ok(RowEffect::Pushed)
    }

    /// Resolves a CRM display name in the lead's pipeline. Unmapped names
    /// are logged and yield `None`.
    async fn resolve_target(
        &self,
        id: EntityId,
        pipeline: PipelineId,
        name: &str,
    ) -> Option<(StatusId, PipelineId)> {
        let catalog = self.catalog.read().await;
        let resolver = StatusResolver::new(&catalog.map, &self.config.sync.terminal_statuses);
        let patch_pipeline = if pipeline.is_unset() {
            self.config.sync.fallback_pipeline_id
        } else {
            pipeline
        };

        match resolver.resolve(pipeline, name) {
            Ok((status_id, tier)) => {
                debug!(entity_id = %id, status = name, status_id = %status_id, ?tier, "Status resolved");
                Some((status_id, patch_pipeline))
            }
            Err(e) => {
                warn!(
                    entity_id = %id,
                    pipeline_id = %pipeline,
                    status = name,
                    error = %e,
                    "No CRM status for sheet value"
                );
                None
            }
        }
    }
}

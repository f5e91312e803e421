//! CRM → sheet: webhook batches and the CRM catch-up poll.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use leadsync_core::{
    build_row, ChangeAction, EntityId, Lead, LeadChange, Notification, RowContext, StatusClass,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BatchOutcome, Catalog, ReconciliationEngine};
use crate::client::DateField;
use crate::error::{SyncError, SyncResult};
use crate::staff::StaffMap;

/// Per-batch scratch shared by every change in the batch.
struct Batch {
    now: DateTime<Utc>,
    staff: Option<StaffMap>,
}

impl ReconciliationEngine {
    /// Runs a parsed webhook notification through the push path.
    pub async fn push_notification(&self, notification: &Notification) -> SyncResult<BatchOutcome> {
        let mut outcome = self.push_changes(&notification.changes).await?;
        outcome.received += notification.missing_id;
        outcome.skipped.no_id += notification.missing_id;
        Ok(outcome)
    }

    /// Processes change descriptors one by one and flushes state once.
    ///
    /// Per-entity failures are counted. Auth and quota failures stop the
    /// batch and are returned after the state written so far is flushed.
    pub async fn push_changes(&self, changes: &[LeadChange]) -> SyncResult<BatchOutcome> {
        let batch_id = Uuid::new_v4();
        let catalog = self.catalog.read().await;
        let mut batch = Batch {
            now: self.clock.now(),
            staff: None,
        };
        let mut outcome = BatchOutcome {
            received: changes.len(),
            ..BatchOutcome::default()
        };

        for change in changes {
            if let Err(e) = self.push_one(change, &catalog, &mut batch, &mut outcome).await {
                self.dedup.release(change.id, change.status_id);
                if e.is_systemic() {
                    self.flush().await;
                    warn!(%batch_id, entity_id = %change.id, error = %e, "Push batch aborted");
                    return Err(e);
                }
                outcome.failed += 1;
                warn!(%batch_id, entity_id = %change.id, error = %e, "Failed to push change");
            }
        }

        self.flush().await;
        info!(
            %batch_id,
            received = outcome.received,
            written = outcome.written,
            failed = outcome.failed,
            "Push batch processed"
        );
        Ok(outcome)
    }

    async fn push_one(
        &self,
        change: &LeadChange,
        catalog: &Catalog,
        batch: &mut Batch,
        outcome: &mut BatchOutcome,
    ) -> SyncResult<()> {
        let id = change.id;
        if id.is_unset() {
            outcome.skipped.no_id += 1;
            return Ok(());
        }
        outcome.seen_status_ids.insert(change.status_id);
        let _lead_lock = self.locks.acquire(id).await;

        if self.dedup.is_duplicate(id, change.status_id, batch.now) {
            debug!(entity_id = %id, status_id = %change.status_id, "Duplicate change dropped");
            outcome.skipped.duplicate += 1;
            return Ok(());
        }
        if self.state.is_retired(id) {
            debug!(entity_id = %id, "Change for retired entity ignored");
            outcome.skipped.retired += 1;
            return Ok(());
        }

        let hinted = catalog.sets.classify(change.status_id);
        if hinted == StatusClass::Other && !self.state.is_tracked(id) {
            outcome.skipped.status_mismatch += 1;
            return Ok(());
        }

        let lead = match self.crm.get_lead(id).await {
            Ok(lead) => self.enrich_contacts(lead).await,
            Err(SyncError::NotFound(_)) => {
                debug!(entity_id = %id, "Lead vanished before re-fetch");
                outcome.skipped.not_found += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let cutoff = self.config.sync.created_after;
        if cutoff > 0 && lead.created_at > 0 && lead.created_at < cutoff {
            outcome.skipped.too_old += 1;
            return Ok(());
        }
        let pipeline_name = catalog.map.pipeline_name(lead.pipeline_id).unwrap_or("");
        if !self.config.pipeline_allowed(pipeline_name) {
            debug!(entity_id = %id, pipeline = pipeline_name, "Pipeline not in allow-list");
            outcome.skipped.pipeline_filtered += 1;
            return Ok(());
        }

        match catalog.sets.classify(lead.status_id) {
            StatusClass::Trigger => {
                outcome.trigger_matches += 1;
                self.write_trigger_row(&lead, catalog, batch, outcome).await
            }
            StatusClass::Terminal(display) => {
                outcome.terminal_matches += 1;
                self.write_status(id, &display, batch.now, outcome).await
            }
            StatusClass::Other if self.state.is_tracked(id) => {
                outcome.tracked_matches += 1;
                let display = catalog
                    .map
                    .status_display(lead.status_id)
                    .map(str::to_string)
                    .unwrap_or_else(|| lead.status_id.to_string());
                self.write_status(id, &display, batch.now, outcome).await
            }
            StatusClass::Other => {
                outcome.skipped.status_mismatch += 1;
                Ok(())
            }
        }
    }

    /// Replaces embedded contact stubs with full contacts (for the phone).
    async fn enrich_contacts(&self, mut lead: Lead) -> Lead {
        for contact in lead.embedded.contacts.iter_mut() {
            if contact.id.is_unset() {
                continue;
            }
            match self.crm.get_contact(contact.id).await {
                Ok(full) => *contact = full,
                Err(e) => {
                    debug!(entity_id = %lead.id, contact_id = %contact.id, error = %e, "Contact enrichment failed")
                }
            }
        }
        lead
    }

    async fn write_trigger_row(
        &self,
        lead: &Lead,
        catalog: &Catalog,
        batch: &mut Batch,
        outcome: &mut BatchOutcome,
    ) -> SyncResult<()> {
        let status = match catalog.map.status_display(lead.status_id) {
            Some(display) => display.to_string(),
            None => self.config.vocabulary.display_status(
                self.config
                    .sync
                    .trigger_status_names
                    .first()
                    .map(String::as_str)
                    .unwrap_or_default(),
            ),
        };

        if self.state.known_status(lead.id).as_deref() == Some(status.as_str())
            && self.store.find_row(lead.id).await?.is_some()
        {
            outcome.skipped.unchanged += 1;
            return Ok(());
        }

        let staff = match &batch.staff {
            Some(staff) => staff.clone(),
            None => {
                let staff = self.staff.mapping(&self.store, batch.now).await;
                batch.staff = Some(staff.clone());
                staff
            }
        };
        let responsible = if lead.responsible_user_id.is_unset() {
            String::new()
        } else {
            catalog
                .users
                .get(&lead.responsible_user_id)
                .cloned()
                .unwrap_or_else(|| lead.responsible_user_id.to_string())
        };

        let row = build_row(
            lead,
            &RowContext {
                schema: self.store.schema(),
                status: &status,
                pipeline: catalog.map.pipeline_display(lead.pipeline_id),
                responsible: &responsible,
                staff: &staff,
                offset: self.config.table.date_offset()?,
            },
        );
        let placed = self.store.upsert(&row).await?;

        self.state.remember_status(lead.id, &status);
        self.state.remember_marker(lead.id, "");
        outcome.written += 1;
        info!(entity_id = %lead.id, row = placed.row(), status = %status, "Lead row written");
        Ok(())
    }

    /// Writes a status (by CRM display name) into the entity's status cell,
    /// honoring the precedence guard, and arms expiry when configured.
    async fn write_status(
        &self,
        id: EntityId,
        display: &str,
        now: DateTime<Utc>,
        outcome: &mut BatchOutcome,
    ) -> SyncResult<()> {
        let sheet_value = self.config.vocabulary.to_sheet(display);
        let known = self.state.known_status(id);

        if known.as_deref() == Some(sheet_value) {
            if self.state.expires_at(id).is_none() {
                self.arm_expiry(id, sheet_value, display, now);
            }
            outcome.skipped.unchanged += 1;
            return Ok(());
        }
        if self.precedence.suppresses(known.as_deref(), sheet_value) {
            debug!(
                entity_id = %id,
                current = known.as_deref().unwrap_or(""),
                incoming = sheet_value,
                "Lower-ranked status suppressed"
            );
            outcome.skipped.precedence += 1;
            return Ok(());
        }

        let column = &self.store.schema().status_column;
        if !self.store.update_cell(id, column, sheet_value).await? {
            debug!(entity_id = %id, "No row in active partition for status update");
            outcome.skipped.no_row += 1;
            return Ok(());
        }

        self.state.remember_status(id, sheet_value);
        self.arm_expiry(id, sheet_value, display, now);
        outcome.written += 1;
        info!(entity_id = %id, status = sheet_value, "Lead status written");
        Ok(())
    }

    /// Lifetime is looked up by the sheet value, then by the display name.
    pub(super) fn arm_expiry(&self, id: EntityId, sheet_value: &str, display: &str, now: DateTime<Utc>) {
        let lifetime = self
            .config
            .expiry_for(sheet_value)
            .or_else(|| self.config.expiry_for(display));
        if let Some(lifetime) = lifetime {
            let at = now + lifetime;
            if self.state.remember_expiry(id, at) {
                debug!(entity_id = %id, expires_at = %at, "Expiry armed");
            }
        }
    }

    // =========================================================================
    // CRM Catch-up Poll
    // =========================================================================

    /// Re-reads the CRM from the persisted cursor (or `now − lookback`) to
    /// now and pushes what the webhooks may have missed: first entries into
    /// the watched statuses, and tracked leads updated in the window.
    pub async fn catch_up(&self) -> SyncResult<BatchOutcome> {
        if !self.config.sync.catch_up_enabled {
            return Ok(BatchOutcome::default());
        }

        let now = self.clock.now().timestamp();
        let lookback = i64::try_from(self.config.sync.catch_up_lookback_secs).unwrap_or(i64::MAX);
        let from = self
            .state
            .crm_cursor()
            .unwrap_or_else(|| now.saturating_sub(lookback));
        if from >= now {
            return Ok(BatchOutcome::default());
        }

        let watched = self.catalog.read().await.sets.watched();
        let mut changes: BTreeMap<EntityId, LeadChange> = BTreeMap::new();

        if !watched.is_empty() {
            for (id, entry) in self.crm.first_entries_between(from, now, &watched).await? {
                changes.insert(
                    id,
                    LeadChange {
                        id,
                        status_id: entry.status,
                        pipeline_id: entry.pipeline,
                        action: ChangeAction::Poll,
                    },
                );
            }
        }

        for lead in self.crm.leads_between(DateField::UpdatedAt, from, now).await? {
            if !self.state.is_tracked(lead.id) {
                continue;
            }
            changes.entry(lead.id).or_insert(LeadChange {
                id: lead.id,
                status_id: lead.status_id,
                pipeline_id: lead.pipeline_id,
                action: ChangeAction::Poll,
            });
        }

        let changes: Vec<LeadChange> = changes.into_values().collect();
        let outcome = self.push_changes(&changes).await?;

        self.state.set_crm_cursor(now);
        self.flush().await;
        debug!(from, to = now, changes = changes.len(), "CRM catch-up done");
        Ok(outcome)
    }
}

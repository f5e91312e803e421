use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use leadsync_core::{
    ChangeAction, Contact, ContactId, EntityId, Lead, LeadChange, Pipeline, PipelineId,
    StatusChangeEvent, StatusId, User, UserId,
};
use leadsync_store::{Grid, MemoryBackend, RowIndex, SyncStateStore};
use serde_json::json;
use tokio::sync::Notify;

use super::ReconciliationEngine;
use crate::client::{CrmApi, DateField, LeadPatch};
use crate::clock::{Clock, ManualClock};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

const ACTIVE: &str = "Sheet1";

// =============================================================================
// Fake CRM
// =============================================================================

#[derive(Default)]
struct FakeApi {
    leads: Mutex<HashMap<EntityId, Lead>>,
    contacts: Mutex<HashMap<ContactId, Contact>>,
    events: Mutex<Vec<StatusChangeEvent>>,
    patches: Mutex<Vec<(EntityId, LeadPatch)>>,
    fetches: AtomicUsize,
    auth_broken: AtomicBool,
    patch_gate: Mutex<Option<PatchGate>>,
}

/// Holds the next `patch_lead` call open until released.
#[derive(Clone, Default)]
struct PatchGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl FakeApi {
    fn put(&self, lead: Lead) {
        self.leads.lock().unwrap().insert(lead.id, lead);
    }

    fn remove(&self, id: u64) {
        self.leads.lock().unwrap().remove(&EntityId::new(id));
    }

    fn set_status(&self, id: u64, status: u64, updated_at: i64) {
        let mut leads = self.leads.lock().unwrap();
        let lead = leads.get_mut(&EntityId::new(id)).unwrap();
        lead.status_id = StatusId::new(status);
        lead.updated_at = updated_at;
    }

    fn hold_next_patch(&self) -> PatchGate {
        let gate = PatchGate::default();
        *self.patch_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn patches(&self) -> Vec<(EntityId, LeadPatch)> {
        self.patches.lock().unwrap().clone()
    }

    fn check_auth(&self) -> SyncResult<()> {
        if self.auth_broken.load(Ordering::SeqCst) {
            return Err(SyncError::AuthFailed("token revoked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CrmApi for FakeApi {
    async fn get_lead(&self, id: EntityId) -> SyncResult<Lead> {
        self.check_auth()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.leads
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("lead {}", id)))
    }

    async fn get_contact(&self, id: ContactId) -> SyncResult<Contact> {
        self.contacts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("contact {}", id)))
    }

    async fn leads_between(&self, field: DateField, from: i64, to: i64) -> SyncResult<Vec<Lead>> {
        self.check_auth()?;
        Ok(self
            .leads
            .lock()
            .unwrap()
            .values()
            .filter(|l| {
                let at = match field {
                    DateField::CreatedAt => l.created_at,
                    DateField::UpdatedAt => l.updated_at,
                };
                at >= from && at <= to
            })
            .cloned()
            .collect())
    }

    async fn status_change_events(&self, from: i64, to: i64) -> SyncResult<Vec<StatusChangeEvent>> {
        self.check_auth()?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.created_at >= from && e.created_at <= to)
            .cloned()
            .collect())
    }

    async fn patch_lead(&self, id: EntityId, patch: &LeadPatch) -> SyncResult<()> {
        self.check_auth()?;
        let gate = self.patch_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let mut leads = self.leads.lock().unwrap();
        let lead = leads
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("lead {}", id)))?;
        if let Some(status) = patch.status_id {
            lead.status_id = status;
        }
        if let Some(pipeline) = patch.pipeline_id {
            lead.pipeline_id = pipeline;
        }
        self.patches.lock().unwrap().push((id, patch.clone()));
        Ok(())
    }

    async fn pipelines(&self) -> SyncResult<Vec<Pipeline>> {
        self.check_auth()?;
        Ok(serde_json::from_value(json!([
            {
                "id": 7,
                "name": "Nilufar - Sotuv Bioflex",
                "_embedded": { "statuses": [
                    { "id": 42,  "name": "NOMERATSIYALANMAGAN ZAKAZ" },
                    { "id": 142, "name": "Успешно" },
                    { "id": 143, "name": "Заказ отправлен" },
                    { "id": 150, "name": "Отказ" },
                    { "id": 160, "name": "Консультация" }
                ]}
            },
            {
                "id": 8,
                "name": "Munira - Sotuv Bioflex",
                "_embedded": { "statuses": [
                    { "id": 242, "name": "NOMERATSIYALANMAGAN ZAKAZ" },
                    { "id": 243, "name": "ЗАКАЗ ОТПРАВЛЕН" },
                    { "id": 250, "name": "ОТКАЗ" }
                ]}
            }
        ]))
        .unwrap())
    }

    async fn users(&self) -> SyncResult<Vec<User>> {
        self.check_auth()?;
        Ok(vec![User {
            id: UserId::new(1),
            name: "Dilnoza".into(),
        }])
    }
}

// =============================================================================
// Harness
// =============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn lead(id: u64, status: u64, pipeline: u64) -> Lead {
    Lead {
        id: EntityId::new(id),
        name: format!("Сделка #{}", id),
        price: Some(120_000),
        pipeline_id: PipelineId::new(pipeline),
        status_id: StatusId::new(status),
        responsible_user_id: UserId::new(1),
        created_at: t0().timestamp() - 3600,
        updated_at: t0().timestamp() - 3600,
        ..Lead::default()
    }
}

fn change(id: u64, status: u64) -> LeadChange {
    LeadChange {
        id: EntityId::new(id),
        status_id: StatusId::new(status),
        pipeline_id: PipelineId::new(7),
        action: ChangeAction::Status,
    }
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.sync.terminal_statuses = BTreeMap::from([
        ("Успешно".to_string(), StatusId::new(142)),
        ("Отказ".to_string(), StatusId::new(150)),
    ]);
    config.sync.expiry_secs = BTreeMap::from([("Успешно".to_string(), 86_400)]);
    config.sync.marker_field_id = Some(900);
    config
}

struct Harness {
    engine: ReconciliationEngine,
    crm: Arc<FakeApi>,
    backend: Arc<MemoryBackend>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new() -> Self {
        Self::with(config(), MemoryBackend::new()).await
    }

    async fn with(config: SyncConfig, backend: MemoryBackend) -> Self {
        let crm = Arc::new(FakeApi::default());
        let backend = Arc::new(backend);
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = ReconciliationEngine::new(
            config,
            crm.clone(),
            backend.clone(),
            SyncStateStore::in_memory(),
            clock.clone(),
        )
        .unwrap();
        engine.initialize().await.unwrap();
        Self {
            engine,
            crm,
            backend,
            clock,
        }
    }

    fn grid(&self) -> Grid {
        self.backend.grid(ACTIVE).unwrap_or_default()
    }

    fn rows_for(&self, id: u64) -> Vec<Vec<String>> {
        let idx = self.engine.store().schema().id_index();
        self.grid()
            .into_iter()
            .skip(1)
            .filter(|r| r.get(idx).map(String::as_str) == Some(id.to_string().as_str()))
            .collect()
    }

    fn cell(&self, id: u64, column: &str) -> String {
        let idx = self.engine.store().schema().index_of(column).unwrap();
        self.rows_for(id)
            .first()
            .and_then(|r| r.get(idx).cloned())
            .unwrap_or_default()
    }

    /// Operator edit of one cell in the entity's row.
    async fn edit(&self, id: u64, column: &str, value: &str) {
        let row = self
            .engine
            .store()
            .find_row(EntityId::new(id))
            .await
            .unwrap()
            .unwrap();
        let col = self.engine.store().schema().index_of(column).unwrap() + 1;
        self.backend.set_cell(ACTIVE, row, col, value);
    }

    async fn push(&self, changes: &[LeadChange]) -> super::BatchOutcome {
        self.engine.push_changes(changes).await.unwrap()
    }
}

// =============================================================================
// Push
// =============================================================================

#[tokio::test]
async fn test_scenario_555_full_lifecycle() {
    let h = Harness::new().await;
    h.crm.put(lead(555, 42, 7));

    let out = h.push(&[change(555, 42)]).await;
    assert_eq!((out.written, out.trigger_matches), (1, 1));
    assert_eq!(h.cell(555, "статус"), "В процессе");
    assert_eq!(h.cell(555, "Воронка"), "Нилуфар");
    assert_eq!(h.cell(555, "Ответственный"), "Dilnoza");

    h.clock.advance(Duration::seconds(10));
    h.crm.set_status(555, 142, t0().timestamp());
    let out = h.push(&[change(555, 142)]).await;
    assert_eq!((out.written, out.terminal_matches), (1, 1));
    assert_eq!(h.cell(555, "статус"), "Успешно");
    let armed_at = t0() + Duration::seconds(10);
    assert_eq!(
        h.engine.state().expires_at(EntityId::new(555)),
        Some(armed_at + Duration::days(1))
    );

    let writes = h.backend.write_count();
    h.clock.advance(Duration::seconds(30));
    let out = h.push(&[change(555, 142)]).await;
    assert_eq!(out.skipped.duplicate, 1);
    assert_eq!(h.backend.write_count(), writes);

    h.clock.advance(Duration::days(1));
    assert_eq!(h.engine.sweep_expired().await, vec![EntityId::new(555)]);
    assert!(!h.engine.state().is_tracked(EntityId::new(555)));

    let fetches = h.crm.fetches.load(Ordering::SeqCst);
    let out = h.push(&[change(555, 142)]).await;
    assert_eq!(out.skipped.retired, 1);
    assert_eq!(out.written, 0);
    assert_eq!(h.backend.write_count(), writes);
    assert_eq!(h.crm.fetches.load(Ordering::SeqCst), fetches);
    assert!(!h.engine.state().is_tracked(EntityId::new(555)));
}

#[tokio::test]
async fn test_identical_notification_twice_mutates_once() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));

    h.push(&[change(1, 42)]).await;
    let writes = h.backend.write_count();
    let out = h.push(&[change(1, 42)]).await;

    assert_eq!(out.skipped.duplicate, 1);
    assert_eq!(h.backend.write_count(), writes);
    assert_eq!(h.rows_for(1).len(), 1);
}

#[tokio::test]
async fn test_status_moves_keep_one_row_per_lead() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.crm.put(lead(2, 42, 7));

    h.push(&[change(1, 42), change(2, 42)]).await;
    h.crm.set_status(1, 160, 0);
    h.push(&[change(1, 160)]).await;
    h.clock.advance(Duration::seconds(301));
    h.crm.set_status(1, 42, 0);
    let out = h.push(&[change(1, 42)]).await;

    assert_eq!(out.written, 1);
    assert_eq!(h.rows_for(1).len(), 1);
    assert_eq!(h.rows_for(2).len(), 1);
    assert_eq!(h.cell(1, "статус"), "В процессе");
    assert_eq!(h.grid().len(), 3);
}

#[tokio::test]
async fn test_precedence_guard_keeps_higher_status() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.push(&[change(1, 42)]).await;
    h.crm.set_status(1, 142, 0);
    h.push(&[change(1, 142)]).await;
    assert_eq!(h.cell(1, "статус"), "Успешно");

    h.crm.set_status(1, 143, 0);
    let out = h.push(&[change(1, 143)]).await;
    assert_eq!(out.tracked_matches, 1);
    assert_eq!(out.skipped.precedence, 1);
    assert_eq!(h.cell(1, "статус"), "Успешно");
}

#[tokio::test]
async fn test_untracked_non_trigger_is_skipped_without_fetch() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 160, 7));

    let out = h.push(&[change(1, 160)]).await;
    assert_eq!(out.skipped.status_mismatch, 1);
    assert_eq!(h.crm.fetches.load(Ordering::SeqCst), 0);
    assert!(h.grid().len() <= 1);
}

#[tokio::test]
async fn test_vanished_lead_is_skipped() {
    let h = Harness::new().await;
    let out = h.push(&[change(404, 42)]).await;
    assert_eq!(out.skipped.not_found, 1);
    assert_eq!(out.failed, 0);
}

#[tokio::test]
async fn test_cutoff_and_pipeline_filters() {
    let mut config = config();
    config.sync.created_after = t0().timestamp() - 60;
    let h = Harness::with(config, MemoryBackend::new()).await;
    h.crm.put(lead(1, 42, 7));
    let out = h.push(&[change(1, 42)]).await;
    assert_eq!(out.skipped.too_old, 1);

    let mut config = self::config();
    config.sync.pipeline_keywords = vec!["munira".into()];
    let h = Harness::with(config, MemoryBackend::new()).await;
    h.crm.put(lead(1, 42, 7));
    h.crm.put(lead(2, 242, 8));
    let out = h.push(&[change(1, 42), change(2, 242)]).await;
    assert_eq!(out.skipped.pipeline_filtered, 1);
    assert_eq!(out.written, 1);
    assert_eq!(h.cell(2, "Воронка"), "Мунира");
}

#[tokio::test]
async fn test_trigger_row_uses_staff_directory_and_full_contact() {
    let staff = vec![
        vec!["Код сотрудника".to_string(), "Имя".to_string()],
        vec!["100".to_string(), "Нилуфар А.".to_string()],
    ];
    let h = Harness::with(config(), MemoryBackend::with_partition("Staff", staff)).await;

    let mut l: Lead = serde_json::from_value(json!({
        "id": 5,
        "status_id": 42,
        "pipeline_id": 7,
        "responsible_user_id": 1,
        "custom_fields_values": [
            { "field_name": "Код сотрудника", "values": [{ "value": "0100" }] }
        ],
        "_embedded": { "contacts": [{ "id": 9 }] }
    }))
    .unwrap();
    l.created_at = t0().timestamp();
    h.crm.put(l);
    h.crm.contacts.lock().unwrap().insert(
        ContactId::new(9),
        serde_json::from_value(json!({
            "id": 9,
            "name": "Азиз",
            "custom_fields_values": [
                { "field_code": "PHONE", "field_name": "Телефон", "values": [{ "value": "+998901112233" }] }
            ]
        }))
        .unwrap(),
    );

    h.push(&[change(5, 42)]).await;
    assert_eq!(h.cell(5, "Ф.И.О."), "Азиз");
    assert_eq!(h.cell(5, "Контактный номер"), "+998901112233");
    assert_eq!(h.cell(5, "Ответственный"), "Нилуфар А.");
}

#[tokio::test]
async fn test_auth_failure_aborts_batch_and_releases_dedup() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.crm.auth_broken.store(true, Ordering::SeqCst);

    let err = h.engine.push_changes(&[change(1, 42)]).await.unwrap_err();
    assert!(err.is_systemic());

    h.crm.auth_broken.store(false, Ordering::SeqCst);
    let out = h.push(&[change(1, 42)]).await;
    assert_eq!(out.skipped.duplicate, 0);
    assert_eq!(out.written, 1);
}

#[tokio::test]
async fn test_index_matches_grid_after_pushes_and_rotation() {
    let h = Harness::new().await;
    for id in 1..=3 {
        h.crm.put(lead(id, 42, 7));
    }
    h.push(&[change(1, 42), change(2, 42)]).await;

    let archive = h.engine.rotate_archive(None).await.unwrap();
    assert_eq!(archive, "Archive 2026-03");
    assert!(h.backend.partitions().contains(&archive));

    h.push(&[change(3, 42)]).await;
    let schema = h.engine.store().schema().clone();
    let cached = h.engine.store().cached_index().await.unwrap();
    assert_eq!(cached, RowIndex::build(&h.grid(), &schema));
    assert_eq!(cached.get(EntityId::new(3)), Some(2));
    assert_eq!(cached.len(), 1);
}

// =============================================================================
// CRM Catch-up
// =============================================================================

fn entry_event(entity: u64, at: i64, from: u64, to: u64) -> StatusChangeEvent {
    serde_json::from_value(json!({
        "entity_id": entity,
        "created_at": at,
        "value_before": [{ "lead_status": { "id": from, "pipeline_id": 7 } }],
        "value_after":  [{ "lead_status": { "id": to, "pipeline_id": 7 } }]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_catch_up_writes_missed_entries_and_advances_cursor() {
    let h = Harness::new().await;
    h.crm.put(lead(900, 42, 7));
    let now = t0().timestamp();
    h.crm.events.lock().unwrap().extend([
        entry_event(900, now - 300, 160, 42),
        entry_event(900, now - 200, 42, 160),
        entry_event(900, now - 100, 160, 42),
    ]);

    let out = h.engine.catch_up().await.unwrap();
    assert_eq!(out.received, 1);
    assert_eq!(out.written, 1);
    assert_eq!(h.rows_for(900).len(), 1);
    assert_eq!(h.engine.state().crm_cursor(), Some(now));

    let out = h.engine.catch_up().await.unwrap();
    assert_eq!(out.received, 0);
}

#[tokio::test]
async fn test_catch_up_picks_up_tracked_leads_updated_in_window() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.push(&[change(1, 42)]).await;
    h.engine.state().set_crm_cursor(t0().timestamp());

    h.clock.advance(Duration::seconds(120));
    h.crm.set_status(1, 150, t0().timestamp() + 60);
    let out = h.engine.catch_up().await.unwrap();

    assert_eq!(out.terminal_matches, 1);
    assert_eq!(h.cell(1, "статус"), "Отказ");
}

// =============================================================================
// Pull
// =============================================================================

#[tokio::test]
async fn test_marker_fill_dispatches_once() {
    let h = Harness::new().await;
    h.crm.put(lead(555, 42, 7));
    h.push(&[change(555, 42)]).await;

    h.edit(555, "Заказ №", "A-17").await;
    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.marker_fills, 1);

    let patches = h.crm.patches();
    assert_eq!(patches.len(), 1);
    let expected = LeadPatch::status(StatusId::new(143), PipelineId::new(7)).with_text_field(900, "A-17");
    assert_eq!(patches[0], (EntityId::new(555), expected));
    assert_eq!(h.engine.state().known_marker(EntityId::new(555)).as_deref(), Some("A-17"));

    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.marker_fills, 0);
    assert_eq!(h.crm.patches().len(), 1);
}

#[tokio::test]
async fn test_sheet_status_edit_is_pushed_through_vocabulary() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.crm.put(lead(2, 42, 7));
    h.push(&[change(1, 42), change(2, 42)]).await;

    h.edit(1, "статус", "Отказ").await;
    h.edit(2, "статус", "Успешно").await;
    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.status_pushes, 2);

    let patches: HashMap<EntityId, LeadPatch> = h.crm.patches().into_iter().collect();
    assert_eq!(patches[&EntityId::new(1)].status_id, Some(StatusId::new(150)));
    assert_eq!(patches[&EntityId::new(2)].status_id, Some(StatusId::new(143)));
    assert_eq!(patches[&EntityId::new(1)].pipeline_id, Some(PipelineId::new(7)));

    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.status_pushes, 0);
    assert_eq!(out.unchanged, 2);
}

#[tokio::test]
async fn test_operator_success_survives_echo_webhook_during_patch() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.push(&[change(1, 42)]).await;
    h.edit(1, "статус", "Успешно").await;

    let gate = h.crm.hold_next_patch();
    let echo_started = AtomicBool::new(false);

    let (polled, echoed, ()) = tokio::join!(
        h.engine.poll_table(),
        async {
            gate.entered.notified().await;
            echo_started.store(true, Ordering::SeqCst);
            h.engine.push_changes(&[change(1, 143)]).await
        },
        async {
            while !echo_started.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            gate.release.notify_one();
        },
    );

    assert_eq!(polled.unwrap().status_pushes, 1);
    let echoed = echoed.unwrap();
    assert_eq!(echoed.written, 0);
    assert_eq!(echoed.skipped.precedence, 1);
    assert_eq!(h.cell(1, "статус"), "Успешно");
    assert_eq!(h.engine.state().known_status(EntityId::new(1)).as_deref(), Some("Успешно"));

    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.status_pushes, 0);
    assert_eq!(h.cell(1, "статус"), "Успешно");
    assert_eq!(h.crm.patches().len(), 1);
}

#[tokio::test]
async fn test_unknown_pipeline_falls_back_to_global_map() {
    let h = Harness::new().await;
    h.crm.put(lead(600, 42, 9));
    h.push(&[change(600, 42)]).await;

    h.edit(600, "статус", "Отказ").await;
    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.status_pushes, 1);
    assert_eq!(
        h.crm.patches()[0].1,
        LeadPatch::status(StatusId::new(150), PipelineId::new(9))
    );

    h.edit(600, "статус", "У курера").await;
    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.mapping_failures, 1);
    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.mapping_failures, 1);
    assert_eq!(h.engine.state().known_status(EntityId::new(600)).as_deref(), Some("Отказ"));
}

#[tokio::test]
async fn test_bad_row_does_not_stop_the_loop() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.crm.put(lead(2, 42, 7));
    h.push(&[change(1, 42), change(2, 42)]).await;
    h.crm.remove(1);

    h.edit(1, "статус", "Отказ").await;
    h.edit(2, "статус", "Отказ").await;
    let out = h.engine.poll_table().await.unwrap();

    assert_eq!(out.errors, 1);
    assert_eq!(out.status_pushes, 1);
    assert_eq!(h.engine.state().known_status(EntityId::new(1)).as_deref(), Some("В процессе"));
}

#[tokio::test]
async fn test_bootstrap_adopts_existing_rows_without_pushing() {
    let schema = config().table.schema;
    let mut row = vec![String::new(); schema.width()];
    row[schema.id_index()] = "10".into();
    row[schema.status_index()] = "Отказ".into();
    row[schema.marker_index()] = "B-2".into();
    let backend = MemoryBackend::with_partition(ACTIVE, vec![schema.columns.clone(), row]);

    let h = Harness::with(config(), backend).await;
    h.crm.put(lead(10, 150, 7));
    assert_eq!(h.engine.bootstrap().await.unwrap(), 1);
    assert_eq!(h.engine.state().known_status(EntityId::new(10)).as_deref(), Some("Отказ"));

    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.unchanged, 1);
    assert!(h.crm.patches().is_empty());
}

#[tokio::test]
async fn test_quota_during_poll_is_returned() {
    let h = Harness::new().await;
    h.backend.fail_next_with_quota(1);
    let err = h.engine.poll_table().await.unwrap_err();
    assert!(matches!(err, SyncError::Quota(_)));
    assert!(err.is_systemic());
}

#[tokio::test]
async fn test_retired_rows_are_left_alone() {
    let h = Harness::new().await;
    h.crm.put(lead(1, 42, 7));
    h.push(&[change(1, 42)]).await;
    h.engine.state().forget(EntityId::new(1), h.clock.now());

    h.edit(1, "статус", "Отказ").await;
    let out = h.engine.poll_table().await.unwrap();
    assert_eq!(out.retired, 1);
    assert!(h.crm.patches().is_empty());
}

//! # Status Vocabulary
//!
//! Everything needed to translate between CRM status ids, raw CRM status
//! names, canonical display names and the values an operator picks in the
//! sheet.
//!
//! ## Translation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Status Name Translation                           │
//! │                                                                         │
//! │  CRM raw name            display name           sheet value             │
//! │  ─────────────           ────────────           ───────────             │
//! │  "ЗАКАЗ ОТПРАВЛЕН" ──┐                                                  │
//! │  "Заказ отправлен" ──┴──► "У курера"  ──────►  "У курера"               │
//! │                                         ◄──┬── "У курера"               │
//! │                                            └── "Успешно"  (many-to-one) │
//! │                                                                         │
//! │  CRM → sheet:  status_display  (+ optional sheet_overrides)             │
//! │  sheet → CRM:  sheet_to_crm, then StatusResolver (3 tiers)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resolution Order (sheet → CRM)
//! 1. Pipeline display map: `pipeline → display name → status id`
//! 2. Pipeline raw map:     `pipeline → raw name → status id`
//! 3. Global static map:    `display name → status id` (configured)

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{Pipeline, PipelineId, StatusId};

// =============================================================================
// Static Vocabulary
// =============================================================================

/// Configured name translations.
///
/// Defaults carry the vocabulary the sales team uses today; any of the maps
/// can be replaced from the `[vocabulary]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Raw CRM status name → canonical display name.
    pub status_display: BTreeMap<String, String>,

    /// Raw CRM pipeline name → display name.
    pub pipeline_display: BTreeMap<String, String>,

    /// Display name → sheet value, applied when writing terminal statuses.
    /// Names not listed are written unchanged.
    pub sheet_overrides: BTreeMap<String, String>,

    /// Sheet value → CRM display name used for the status id lookup.
    pub sheet_to_crm: BTreeMap<String, String>,

    /// Values offered in the status column's dropdown.
    pub sheet_choices: Vec<String>,
}

fn pairs(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Default for Vocabulary {
    fn default() -> Self {
        Vocabulary {
            status_display: pairs(&[
                ("Неразобранное", "Неразобранное"),
                ("КОНСУЛТАЦИЯ", "Консультация"),
                ("Консультация", "Консультация"),
                ("ДУМКА", "Раздумье"),
                ("Раздумье", "Раздумье"),
                ("Заказ", "Заказ"),
                ("ЗАКАЗ", "Заказ"),
                ("NOMERATSIYALANMAGAN ZAKAZ", "В процессе"),
                ("Заказ без нумерации", "В процессе"),
                ("ЗАКАЗ ОТПРАВЛЕН", "У курера"),
                ("Заказ отправлен", "У курера"),
                ("OTKAZ", "Отказ"),
                ("ОТКАЗ", "Отказ"),
                ("Отказ", "Отказ"),
                ("Успешно", "Успешно"),
                ("Успешно реализовано", "Успешно"),
                ("Закрыто и не реализовано", "Закрыто и не реализовано"),
            ]),
            pipeline_display: pairs(&[
                ("Nilufar - Sotuv Bioflex", "Нилуфар"),
                ("NILUFAR - SOTUV BIOFLEX", "Нилуфар"),
                ("Munira - Sotuv Bioflex", "Мунира"),
                ("MUNIRA - SOTUV BIOFLEX", "Мунира"),
                ("Rushana  - Sotuv Bioflex", "Рушана"),
                ("Rushana - Sotuv Bioflex", "Рушана"),
                ("RUSHANA - SOTUV BIOFLEX", "Рушана"),
                ("Baza Uspeshno", "База (Успешно)"),
                ("BAZA USPESHNO", "База (Успешно)"),
                ("Baza Dumka", "База (Раздумье)"),
                ("BAZA DUMKA", "База (Раздумье)"),
                ("Akobir - Sotuv Bioflex", "Акобир"),
                ("AKOBIR - SOTUV BIOFLEX", "Акобир"),
            ]),
            sheet_overrides: BTreeMap::new(),
            sheet_to_crm: pairs(&[
                ("В процессе", "В процессе"),
                ("У курера", "У курера"),
                ("Успешно", "У курера"),
                ("Отказ", "Отказ"),
            ]),
            sheet_choices: vec![
                "В процессе".to_string(),
                "У курера".to_string(),
                "Успешно".to_string(),
                "Отказ".to_string(),
            ],
        }
    }
}

impl Vocabulary {
    /// Canonical display name for a raw CRM status name.
    ///
    /// Exact spelling first, then trimmed (the CRM has "Успешно " with a
    /// trailing space in some pipelines).
    pub fn display_status(&self, raw: &str) -> String {
        self.status_display
            .get(raw)
            .or_else(|| self.status_display.get(raw.trim()))
            .cloned()
            .unwrap_or_else(|| raw.trim().to_string())
    }

    /// Display name for a raw pipeline name. Unknown pipelines keep their raw name.
    pub fn display_pipeline(&self, raw: &str) -> String {
        self.pipeline_display
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.trim().to_string())
    }

    /// Sheet value written for a CRM display name.
    pub fn to_sheet<'a>(&'a self, display: &'a str) -> &'a str {
        self.sheet_overrides
            .get(display)
            .map(String::as_str)
            .unwrap_or(display)
    }

    /// CRM display name targeted by a sheet value.
    pub fn to_crm<'a>(&'a self, sheet_value: &'a str) -> &'a str {
        self.sheet_to_crm
            .get(sheet_value)
            .map(String::as_str)
            .unwrap_or(sheet_value)
    }

    /// Whether an operator-entered value belongs to the sheet vocabulary.
    pub fn is_sheet_value(&self, value: &str) -> bool {
        self.sheet_to_crm.contains_key(value) || self.sheet_choices.iter().any(|c| c == value)
    }
}

// =============================================================================
// Pipeline / Status Map
// =============================================================================

/// Pipeline and status lookups built once from the CRM's pipeline listing.
#[derive(Debug, Clone, Default)]
pub struct PipelineStatusMap {
    raw_to_id: HashMap<PipelineId, HashMap<String, StatusId>>,
    display_to_id: HashMap<PipelineId, HashMap<String, StatusId>>,
    id_to_display: HashMap<StatusId, String>,
    pipeline_names: HashMap<PipelineId, String>,
    pipeline_displays: HashMap<PipelineId, String>,
}

/// One status entry, as yielded by [`PipelineStatusMap::entries`].
#[derive(Debug, Clone, Copy)]
pub struct StatusEntry<'a> {
    pub pipeline: PipelineId,
    pub id: StatusId,
    pub raw: &'a str,
    pub display: &'a str,
}

impl PipelineStatusMap {
    /// Builds the map from the pipeline listing.
    ///
    /// Pipelines whose raw name has no configured display name are
    /// registered under the raw name.
    pub fn build(pipelines: &[Pipeline], vocab: &Vocabulary) -> Self {
        let mut map = PipelineStatusMap::default();

        for pipeline in pipelines {
            let raw_name = pipeline.name.trim().to_string();
            map.pipeline_displays
                .insert(pipeline.id, vocab.display_pipeline(&pipeline.name));
            map.pipeline_names.insert(pipeline.id, raw_name);

            let raw_ids = map.raw_to_id.entry(pipeline.id).or_default();
            let display_ids = map.display_to_id.entry(pipeline.id).or_default();

            for status in pipeline.statuses() {
                let raw = status.name.trim();
                if status.id.is_unset() || raw.is_empty() {
                    continue;
                }
                let display = vocab.display_status(&status.name);
                raw_ids.insert(raw.to_string(), status.id);
                display_ids.insert(display.clone(), status.id);
                map.id_to_display.insert(status.id, display);
            }
        }

        map
    }

    /// Number of pipelines loaded.
    pub fn pipeline_count(&self) -> usize {
        self.pipeline_names.len()
    }

    /// Raw CRM name of a pipeline.
    pub fn pipeline_name(&self, pipeline: PipelineId) -> Option<&str> {
        self.pipeline_names.get(&pipeline).map(String::as_str)
    }

    /// Display name of a pipeline, empty when the pipeline is unknown.
    pub fn pipeline_display(&self, pipeline: PipelineId) -> &str {
        self.pipeline_displays
            .get(&pipeline)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Display name of a status.
    pub fn status_display(&self, status: StatusId) -> Option<&str> {
        self.id_to_display.get(&status).map(String::as_str)
    }

    /// Status id for a display name within a pipeline.
    pub fn by_display(&self, pipeline: PipelineId, display: &str) -> Option<StatusId> {
        self.display_to_id.get(&pipeline)?.get(display).copied()
    }

    /// Status id for a raw name within a pipeline.
    pub fn by_raw(&self, pipeline: PipelineId, raw: &str) -> Option<StatusId> {
        self.raw_to_id.get(&pipeline)?.get(raw).copied()
    }

    /// Every (pipeline, status) pair.
    pub fn entries(&self) -> impl Iterator<Item = StatusEntry<'_>> {
        self.raw_to_id.iter().flat_map(move |(pipeline, statuses)| {
            statuses.iter().map(move |(raw, id)| StatusEntry {
                pipeline: *pipeline,
                id: *id,
                raw: raw.as_str(),
                display: self
                    .id_to_display
                    .get(id)
                    .map(String::as_str)
                    .unwrap_or(raw.as_str()),
            })
        })
    }
}

// =============================================================================
// Status Resolver (sheet → CRM)
// =============================================================================

/// Which lookup produced a status id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    PipelineDisplay,
    PipelineRaw,
    Global,
}

/// Explicit three-tier status lookup.
pub struct StatusResolver<'a> {
    map: &'a PipelineStatusMap,
    global: &'a BTreeMap<String, StatusId>,
}

impl<'a> StatusResolver<'a> {
    pub fn new(map: &'a PipelineStatusMap, global: &'a BTreeMap<String, StatusId>) -> Self {
        StatusResolver { map, global }
    }

    /// Resolves a CRM display name to a status id within `pipeline`.
    pub fn resolve(&self, pipeline: PipelineId, name: &str) -> CoreResult<(StatusId, ResolutionTier)> {
        if let Some(id) = self.map.by_display(pipeline, name) {
            return Ok((id, ResolutionTier::PipelineDisplay));
        }
        if let Some(id) = self.map.by_raw(pipeline, name) {
            return Ok((id, ResolutionTier::PipelineRaw));
        }
        match self.global.get(name) {
            Some(id) if !id.is_unset() => Ok((*id, ResolutionTier::Global)),
            _ => Err(CoreError::UnmappedStatus {
                status: name.to_string(),
                pipeline,
            }),
        }
    }
}

// =============================================================================
// Status Classification (CRM → sheet)
// =============================================================================

/// How an observed status relates to tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusClass {
    /// Starts tracking: a full row is written.
    Trigger,
    /// A configured terminal status, with its display name.
    Terminal(String),
    /// Neither. Only relevant for already tracked entities.
    Other,
}

/// Trigger and terminal status ids, resolved against the loaded pipelines.
#[derive(Debug, Clone, Default)]
pub struct StatusSets {
    trigger: HashSet<StatusId>,
    terminal: HashMap<StatusId, String>,
}

impl StatusSets {
    /// Resolves the configured names and ids.
    ///
    /// - Trigger: any status whose raw name equals a trigger name, or whose
    ///   display name equals a trigger name's display form, plus explicit ids.
    /// - Terminal: any status whose display or raw name is a key of
    ///   `terminal_map`. When nothing matched (pipelines could not be loaded)
    ///   the non-zero ids of `terminal_map` are used directly.
    pub fn resolve(
        map: &PipelineStatusMap,
        vocab: &Vocabulary,
        trigger_names: &[String],
        trigger_ids: &[StatusId],
        terminal_map: &BTreeMap<String, StatusId>,
    ) -> Self {
        let trigger_displays: Vec<String> =
            trigger_names.iter().map(|n| vocab.display_status(n)).collect();

        let mut sets = StatusSets::default();

        for entry in map.entries() {
            let raw_hit = trigger_names.iter().any(|n| n.trim() == entry.raw);
            let display_hit = trigger_displays.iter().any(|d| d == entry.display);
            if raw_hit || display_hit {
                sets.trigger.insert(entry.id);
            }

            if terminal_map.contains_key(entry.display) || terminal_map.contains_key(entry.raw) {
                sets.terminal.insert(entry.id, entry.display.to_string());
            }
        }

        sets.trigger
            .extend(trigger_ids.iter().copied().filter(|id| !id.is_unset()));

        if sets.terminal.is_empty() {
            sets.terminal = terminal_map
                .iter()
                .filter(|(_, id)| !id.is_unset())
                .map(|(name, id)| (*id, name.clone()))
                .collect();
        }

        sets
    }

    pub fn classify(&self, status: StatusId) -> StatusClass {
        if self.trigger.contains(&status) {
            return StatusClass::Trigger;
        }
        match self.terminal.get(&status) {
            Some(name) => StatusClass::Terminal(name.clone()),
            None => StatusClass::Other,
        }
    }

    pub fn is_trigger(&self, status: StatusId) -> bool {
        self.trigger.contains(&status)
    }

    pub fn trigger_ids(&self) -> &HashSet<StatusId> {
        &self.trigger
    }

    pub fn terminal_ids(&self) -> impl Iterator<Item = StatusId> + '_ {
        self.terminal.keys().copied()
    }

    /// Trigger ∪ terminal, the target set of the catch-up event query.
    pub fn watched(&self) -> HashSet<StatusId> {
        self.trigger.iter().copied().chain(self.terminal_ids()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Indexed Table Store
//!
//! Maps the fixed column schema onto a quota-limited [`TableBackend`] with a
//! cached `entity id → row` index per partition.
//!
//! ## Read Budget
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Partition Lifecycle                                  │
//! │                                                                         │
//! │   first touch ──► read_grid (1 call) ──► enforce header + dropdown      │
//! │                          │                                              │
//! │                          ▼                                              │
//! │                   RowIndex { id → row, free rows, next row }            │
//! │                          │                                              │
//! │        ┌─────────────────┼──────────────────┐                           │
//! │        ▼                 ▼                  ▼                           │
//! │     upsert          update_cell         find_row      (no reads)        │
//! │                                                                         │
//! │   snapshot ──► read_grid ──► rebuild index from the same grid           │
//! │   rotate   ──► rename ──► reset cached state for both names             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed backend call (quota included) leaves the index as it was: the
//! index is only extended after the write succeeded.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use leadsync_core::row::{is_blank, RowView, TableRow, TableSchema};
use leadsync_core::EntityId;
use tracing::{debug, info, warn};

use crate::backend::{Grid, TableBackend};
use crate::error::{StoreError, StoreResult};

/// Last row covered by the dropdown applied when the header is enforced.
pub const VALIDATED_ROWS: usize = 2000;

// =============================================================================
// Row Index
// =============================================================================

/// Where every entity lives in one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowIndex {
    rows: HashMap<EntityId, usize>,
    free: BTreeSet<usize>,
    next: usize,
}

impl RowIndex {
    /// Builds the index from a full grid (header in row 1).
    ///
    /// When an id appears twice the upper row wins. Blank rows become
    /// reusable free slots.
    pub fn build(grid: &Grid, schema: &TableSchema) -> Self {
        let mut rows = HashMap::new();
        let mut free = BTreeSet::new();

        for (i, cells) in grid.iter().enumerate().skip(1) {
            let row = i + 1;
            if is_blank(cells) {
                free.insert(row);
            } else if let Some(view) = schema.view(cells) {
                rows.entry(view.id).or_insert(row);
            }
        }

        Self {
            rows,
            free,
            next: (grid.len() + 1).max(2),
        }
    }

    pub fn get(&self, id: EntityId) -> Option<usize> {
        self.rows.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row the next new entity goes to: lowest blank row, else past the end.
    pub fn peek_free(&self) -> usize {
        self.free.iter().next().copied().unwrap_or(self.next)
    }

    /// Records that `id` now occupies `row`.
    pub fn occupy(&mut self, id: EntityId, row: usize) {
        if !self.free.remove(&row) && row >= self.next {
            self.next = row + 1;
        }
        self.rows.insert(id, row);
    }
}

// =============================================================================
// Store
// =============================================================================

/// Result of [`IndexedTableStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated { row: usize },
    Inserted { row: usize },
}

impl UpsertOutcome {
    pub fn row(&self) -> usize {
        match self {
            UpsertOutcome::Updated { row } | UpsertOutcome::Inserted { row } => *row,
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    index: Option<RowIndex>,
    /// Header and dropdown already enforced.
    prepared: bool,
}

type PartitionHandle = Arc<tokio::sync::Mutex<Partition>>;

/// Row-oriented access to the active partition.
pub struct IndexedTableStore {
    backend: Arc<dyn TableBackend>,
    schema: TableSchema,
    active: String,
    choices: Vec<String>,
    partitions: Mutex<HashMap<String, PartitionHandle>>,
}

impl IndexedTableStore {
    /// `choices` are the values offered by the status-column dropdown.
    pub fn new(
        backend: Arc<dyn TableBackend>,
        schema: TableSchema,
        active: impl Into<String>,
        choices: Vec<String>,
    ) -> Self {
        Self {
            backend,
            schema,
            active: active.into(),
            choices,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    fn handle(&self, partition: &str) -> PartitionHandle {
        self.partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(partition.to_string())
            .or_default()
            .clone()
    }

    fn status_column(&self) -> usize {
        self.schema.status_index() + 1
    }

    // =========================================================================
    // Partition Preparation
    // =========================================================================

    /// Reads the active partition, creating it and enforcing the header on
    /// first touch and whenever the partition had to be recreated.
    async fn prepare(&self, part: &mut Partition) -> StoreResult<Grid> {
        let (mut grid, created) = match self.backend.read_grid(&self.active).await? {
            Some(grid) => (grid, false),
            None => {
                self.backend
                    .create_partition(&self.active, self.schema.width())
                    .await?;
                info!(partition = %self.active, "Created active partition");
                (Vec::new(), true)
            }
        };

        if part.prepared && !created {
            return Ok(grid);
        }

        if !header_matches(grid.first(), &self.schema.columns) {
            self.backend
                .write_row(&self.active, 1, &self.schema.columns)
                .await?;
            info!(partition = %self.active, "Rewrote table header");
            match grid.first_mut() {
                Some(header) => *header = self.schema.columns.clone(),
                None => grid.push(self.schema.columns.clone()),
            }
        }

        if let Err(e) = self
            .backend
            .set_choice_validation(
                &self.active,
                self.status_column(),
                2..=VALIDATED_ROWS,
                &self.choices,
            )
            .await
        {
            warn!(partition = %self.active, error = %e, "Failed to apply status dropdown");
        }

        part.prepared = true;
        Ok(grid)
    }

    async fn loaded<'p>(&self, part: &'p mut Partition) -> StoreResult<&'p mut RowIndex> {
        if part.index.is_none() {
            let grid = self.prepare(part).await?;
            let index = RowIndex::build(&grid, &self.schema);
            debug!(partition = %self.active, rows = index.len(), "Built row index");
            part.index = Some(index);
        }
        Ok(part.index.get_or_insert_with(RowIndex::default))
    }

    // =========================================================================
    // Row Operations
    // =========================================================================

    /// Writes `row` over the entity's existing row, or into the next free row.
    pub async fn upsert(&self, row: &TableRow) -> StoreResult<UpsertOutcome> {
        let handle = self.handle(&self.active);
        let mut part = handle.lock().await;
        let index = self.loaded(&mut part).await?;

        if let Some(existing) = index.get(row.id) {
            let written = self
                .backend
                .write_row(&self.active, existing, &row.cells)
                .await;
            forget_if_missing(&mut part, written)?;
            debug!(entity_id = %row.id, row = existing, "Updated row");
            return Ok(UpsertOutcome::Updated { row: existing });
        }

        let target = index.peek_free();
        let written = self.backend.write_row(&self.active, target, &row.cells).await;
        forget_if_missing(&mut part, written)?;
        if let Some(index) = part.index.as_mut() {
            index.occupy(row.id, target);
        }
        debug!(entity_id = %row.id, row = target, "Inserted row");

        if let Err(e) = self
            .backend
            .set_choice_validation(
                &self.active,
                self.status_column(),
                target..=target,
                &self.choices,
            )
            .await
        {
            warn!(entity_id = %row.id, row = target, error = %e, "Failed to apply status dropdown to new row");
        }

        Ok(UpsertOutcome::Inserted { row: target })
    }

    /// Overwrites one cell of the entity's row. `false` when the entity has
    /// no row.
    pub async fn update_cell(&self, id: EntityId, column: &str, value: &str) -> StoreResult<bool> {
        let position = self
            .schema
            .index_of(column)
            .ok_or_else(|| StoreError::UnknownColumn(column.to_string()))?;

        let handle = self.handle(&self.active);
        let mut part = handle.lock().await;
        let index = self.loaded(&mut part).await?;

        let Some(row) = index.get(id) else {
            return Ok(false);
        };
        let written = self
            .backend
            .write_cell(&self.active, row, position + 1, value)
            .await;
        forget_if_missing(&mut part, written)?;
        debug!(entity_id = %id, row, column, "Updated cell");
        Ok(true)
    }

    pub async fn find_row(&self, id: EntityId) -> StoreResult<Option<usize>> {
        let handle = self.handle(&self.active);
        let mut part = handle.lock().await;
        Ok(self.loaded(&mut part).await?.get(id))
    }

    /// Reads every entity row of the active partition in one call and
    /// rebuilds the index from that same grid.
    pub async fn snapshot(&self) -> StoreResult<Vec<RowView>> {
        let handle = self.handle(&self.active);
        let mut part = handle.lock().await;
        let grid = self.prepare(&mut part).await?;
        part.index = Some(RowIndex::build(&grid, &self.schema));

        Ok(grid
            .iter()
            .skip(1)
            .filter_map(|cells| self.schema.view(cells))
            .collect())
    }

    /// Reads an auxiliary partition as-is. Missing partitions read empty.
    pub async fn read_lookup(&self, partition: &str) -> StoreResult<Grid> {
        Ok(self
            .backend
            .read_grid(partition)
            .await?
            .unwrap_or_default())
    }

    /// Moves the active partition aside under `archive`. The next operation
    /// recreates a fresh active partition.
    pub async fn rotate(&self, archive: &str) -> StoreResult<()> {
        if archive == self.active {
            return Err(StoreError::PartitionExists(archive.to_string()));
        }

        let handle = self.handle(&self.active);
        let mut part = handle.lock().await;
        self.backend.rename_partition(&self.active, archive).await?;
        *part = Partition::default();

        self.partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(archive);

        info!(from = %self.active, to = archive, "Rotated active partition");
        Ok(())
    }

    /// The cached index of the active partition, if built.
    pub async fn cached_index(&self) -> Option<RowIndex> {
        let handle = self.handle(&self.active);
        let part = handle.lock().await;
        part.index.clone()
    }
}

fn header_matches(header: Option<&Vec<String>>, columns: &[String]) -> bool {
    let Some(header) = header else {
        return false;
    };
    let mut cells: Vec<&str> = header.iter().map(|c| c.trim()).collect();
    while cells.last() == Some(&"") {
        cells.pop();
    }
    cells.len() == columns.len() && cells.iter().zip(columns).all(|(a, b)| *a == b.as_str())
}

// =============================================================================
// Tests
// =============================================================================

/// A write into a partition removed outside the service drops the cached
/// state, so the next operation recreates it with its header.
fn forget_if_missing(part: &mut Partition, written: StoreResult<()>) -> StoreResult<()> {
    if let Err(StoreError::PartitionNotFound(name)) = &written {
        warn!(partition = %name, "Active partition disappeared, dropping cached index");
        *part = Partition::default();
    }
    written
}

//! # In-Memory Table Backend
//!
//! A [`TableBackend`] that keeps partitions in process memory. Used by the
//! engine tests and for running the server without Google credentials.
//!
//! Also lets tests play the operator: edit cells, clear rows, and make the
//! next calls fail with a quota error.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{Grid, TableBackend};
use crate::error::{StoreError, StoreResult};

/// A choice validation recorded by [`MemoryBackend::set_choice_validation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedValidation {
    pub partition: String,
    pub column: usize,
    pub rows: RangeInclusive<usize>,
    pub choices: Vec<String>,
}

#[derive(Debug, Default)]
struct Sheets {
    grids: HashMap<String, Grid>,
    validations: Vec<RecordedValidation>,
}

/// In-process table backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sheets: Mutex<Sheets>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    quota_failures: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with one partition holding `grid`.
    pub fn with_partition(name: &str, grid: Grid) -> Self {
        let backend = Self::default();
        backend.lock().grids.insert(name.to_string(), grid);
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sheets> {
        self.sheets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_quota_failure(&self) -> StoreResult<()> {
        let remaining = self.quota_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.quota_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Quota("simulated quota exhaustion".into()));
        }
        Ok(())
    }

    /// Makes the next `count` backend calls fail with a quota error.
    pub fn fail_next_with_quota(&self, count: usize) {
        self.quota_failures.store(count, Ordering::SeqCst);
    }

    /// Number of full-grid reads served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of row/cell writes served.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current contents of a partition.
    pub fn grid(&self, partition: &str) -> Option<Grid> {
        self.lock().grids.get(partition).cloned()
    }

    /// Partition names.
    pub fn partitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().grids.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn validations(&self) -> Vec<RecordedValidation> {
        self.lock().validations.clone()
    }

    /// Operator edit: sets one cell (1-based), growing the grid as needed.
    pub fn set_cell(&self, partition: &str, row: usize, column: usize, value: &str) {
        let mut sheets = self.lock();
        let grid = sheets.grids.entry(partition.to_string()).or_default();
        put_cell(grid, row, column, value);
    }

    /// Operator edit: blanks a whole row.
    pub fn clear_row(&self, partition: &str, row: usize) {
        let mut sheets = self.lock();
        if let Some(cells) = sheets
            .grids
            .get_mut(partition)
            .and_then(|g| g.get_mut(row.saturating_sub(1)))
        {
            cells.iter_mut().for_each(String::clear);
        }
    }

    /// Operator edit: deletes a row, shifting everything below it up.
    pub fn delete_row(&self, partition: &str, row: usize) {
        let mut sheets = self.lock();
        if let Some(grid) = sheets.grids.get_mut(partition) {
            if row >= 1 && row <= grid.len() {
                grid.remove(row - 1);
            }
        }
    }
}

fn put_cell(grid: &mut Grid, row: usize, column: usize, value: &str) {
    if grid.len() < row {
        grid.resize(row, Vec::new());
    }
    let cells = &mut grid[row - 1];
    if cells.len() < column {
        cells.resize(column, String::new());
    }
    cells[column - 1] = value.to_string();
}

#[async_trait]
impl TableBackend for MemoryBackend {
    async fn read_grid(&self, partition: &str) -> StoreResult<Option<Grid>> {
        self.take_quota_failure()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().grids.get(partition).cloned())
    }

    async fn create_partition(&self, partition: &str, _columns: usize) -> StoreResult<()> {
        self.take_quota_failure()?;
        let mut sheets = self.lock();
        if sheets.grids.contains_key(partition) {
            return Err(StoreError::PartitionExists(partition.to_string()));
        }
        sheets.grids.insert(partition.to_string(), Vec::new());
        Ok(())
    }

    async fn write_row(&self, partition: &str, row: usize, cells: &[String]) -> StoreResult<()> {
        self.take_quota_failure()?;
        let mut sheets = self.lock();
        let grid = sheets
            .grids
            .get_mut(partition)
            .ok_or_else(|| StoreError::PartitionNotFound(partition.to_string()))?;
        for (i, value) in cells.iter().enumerate() {
            put_cell(grid, row, i + 1, value);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_cell(
        &self,
        partition: &str,
        row: usize,
        column: usize,
        value: &str,
    ) -> StoreResult<()> {
        self.take_quota_failure()?;
        let mut sheets = self.lock();
        let grid = sheets
            .grids
            .get_mut(partition)
            .ok_or_else(|| StoreError::PartitionNotFound(partition.to_string()))?;
        put_cell(grid, row, column, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rename_partition(&self, from: &str, to: &str) -> StoreResult<()> {
        self.take_quota_failure()?;
        let mut sheets = self.lock();
        if sheets.grids.contains_key(to) {
            return Err(StoreError::PartitionExists(to.to_string()));
        }
        let grid = sheets
            .grids
            .remove(from)
            .ok_or_else(|| StoreError::PartitionNotFound(from.to_string()))?;
        sheets.grids.insert(to.to_string(), grid);
        for v in sheets.validations.iter_mut().filter(|v| v.partition == from) {
            v.partition = to.to_string();
        }
        Ok(())
    }

    async fn set_choice_validation(
        &self,
        partition: &str,
        column: usize,
        rows: RangeInclusive<usize>,
        choices: &[String],
    ) -> StoreResult<()> {
        self.take_quota_failure()?;
        self.lock().validations.push(RecordedValidation {
            partition: partition.to_string(),
            column,
            rows,
            choices: choices.to_vec(),
        });
        Ok(())
    }
}

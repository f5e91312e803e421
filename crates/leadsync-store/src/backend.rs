//! # Table Backend Trait
//!
//! The minimal surface a spreadsheet-like service has to offer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    IndexedTableStore                                    │
//! │                          │                                              │
//! │                          ▼                                              │
//! │              ┌───────────────────────┐                                  │
//! │              │  dyn TableBackend     │                                  │
//! │              └───────────┬───────────┘                                  │
//! │                 ┌────────┴─────────┐                                    │
//! │                 ▼                  ▼                                    │
//! │     GoogleSheetsBackend     MemoryBackend                               │
//! │     (Sheets API v4)         (tests, local dev)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows and columns are 1-based, matching sheet notation. Row 1 is the header.

use std::ops::RangeInclusive;

use async_trait::async_trait;

use crate::error::StoreResult;

/// A full partition read: rows of string cells, header included.
pub type Grid = Vec<Vec<String>>;

#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Reads every populated row. `None` when the partition does not exist.
    async fn read_grid(&self, partition: &str) -> StoreResult<Option<Grid>>;

    /// Creates an empty partition wide enough for `columns`.
    async fn create_partition(&self, partition: &str, columns: usize) -> StoreResult<()>;

    /// Overwrites one row starting at column 1.
    async fn write_row(&self, partition: &str, row: usize, cells: &[String]) -> StoreResult<()>;

    /// Overwrites one cell.
    async fn write_cell(
        &self,
        partition: &str,
        row: usize,
        column: usize,
        value: &str,
    ) -> StoreResult<()>;

    /// Renames a partition. Fails if `to` already exists.
    async fn rename_partition(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Restricts a column range to a fixed list of choices.
    async fn set_choice_validation(
        &self,
        partition: &str,
        column: usize,
        rows: RangeInclusive<usize>,
        choices: &[String],
    ) -> StoreResult<()>;
}

//! Abstract period store contract.
//!
//! A period store is an append-only, period-partitioned columnar table. Rows
//! for one period are contiguous, windows of successive periods increase
//! monotonically and never overlap, and the id -> row-number index of each
//! stored period is persisted next to the rows.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::period::Period;
use crate::schema::FieldDef;
use crate::table::{ColumnTable, RowIndex};
use crate::value::{Column, FieldType};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data on disk failed validation.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// The table has no such field.
    #[error("Unknown field '{field}' in table '{table}'")]
    UnknownField { table: String, field: String },

    /// Appended rows carry a column of the wrong type.
    #[error("Field '{field}' of table '{table}' has type {expected}, got {actual}")]
    TypeMismatch {
        table: String,
        field: String,
        expected: FieldType,
        actual: FieldType,
    },

    /// Periods must be appended in strictly increasing order.
    #[error("Period {period} of table '{table}' cannot be appended after period {last}")]
    NonMonotonicPeriod {
        table: String,
        period: Period,
        last: Period,
    },

    /// Another process holds the store.
    #[error("Store is locked: {0}")]
    Locked(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// A `(start, stop)` row range, `stop` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowWindow {
    /// First row.
    pub start: u64,
    /// One past the last row.
    pub stop: u64,
}

impl RowWindow {
    /// The window of a period that has not been materialized.
    pub const EMPTY: Self = Self { start: 0, stop: 0 };

    /// The window `[start, stop)`.
    #[must_use]
    pub const fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    /// Number of rows.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    /// True when the window holds no row.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This window restricted to the first `nrows` rows.
    #[must_use]
    pub fn clamp(self, nrows: u64) -> Self {
        let stop = self.stop.min(nrows);
        Self {
            start: self.start.min(stop),
            stop,
        }
    }

    /// True if the windows share a row.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.stop && other.start < self.stop
    }
}

impl fmt::Display for RowWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.start, self.stop)
    }
}

/// Source of a durable id -> row-number index.
pub trait IndexReader: fmt::Debug + Send + Sync {
    /// Reads the whole index.
    fn load(&self) -> Result<RowIndex, StorageError>;
}

/// Read-through handle to a durable index that is not held in memory.
#[derive(Debug, Clone)]
pub struct DiskIndex {
    period: Period,
    reader: Arc<dyn IndexReader>,
}

impl DiskIndex {
    /// A handle on the index of `period`, read through `reader`.
    #[must_use]
    pub fn new(period: Period, reader: Arc<dyn IndexReader>) -> Self {
        Self { period, reader }
    }

    /// Period the index belongs to.
    #[must_use]
    pub const fn period(&self) -> Period {
        self.period
    }

    /// Loads the complete index from storage.
    pub fn load(&self) -> Result<RowIndex, StorageError> {
        self.reader.load()
    }
}

/// An id -> row-number index that is either resident or behind a handle.
///
/// Lookups through a lazy slot always load the complete index first and then
/// index the loaded copy. Ids absent from the index map to `-1`, so indexing
/// the durable handle piecewise with such rows is never attempted.
#[derive(Debug, Clone)]
pub enum IndexSlot {
    /// Held in memory.
    Materialized(Arc<RowIndex>),
    /// Loaded from storage on use.
    Lazy(DiskIndex),
}

impl IndexSlot {
    /// True for resident indices.
    #[must_use]
    pub const fn is_materialized(&self) -> bool {
        matches!(self, Self::Materialized(_))
    }

    /// The full index, loading it from storage for lazy slots.
    pub fn materialize(&self) -> Result<Arc<RowIndex>, StorageError> {
        match self {
            Self::Materialized(index) => Ok(Arc::clone(index)),
            Self::Lazy(handle) => Ok(Arc::new(handle.load()?)),
        }
    }

    /// Rows of `ids`, `-1` for absent ids.
    pub fn rows_for(&self, ids: &[i64]) -> Result<Vec<i64>, StorageError> {
        Ok(self.materialize()?.rows_for(ids))
    }
}

/// Append-only, period-partitioned columnar table for one entity.
pub trait PeriodStore: fmt::Debug + Send {
    /// Table (entity) name.
    fn name(&self) -> &str;

    /// Stored fields, in column order.
    fn fields(&self) -> &[FieldDef];

    /// Total number of rows appended so far.
    fn nrows(&self) -> u64;

    /// Row window of every stored period.
    fn windows(&self) -> &BTreeMap<Period, RowWindow>;

    /// Reads one field over `window`. Rows beyond the table end are not an
    /// error: they simply yield fewer (possibly zero) values.
    fn read_field(&self, window: RowWindow, field: &str) -> Result<Column, StorageError>;

    /// Reads every field over `window`.
    fn read_rows(&self, window: RowWindow) -> Result<ColumnTable, StorageError>;

    /// Appends the rows of `period`, returning the window they occupy.
    fn append(&mut self, period: Period, rows: &ColumnTable) -> Result<RowWindow, StorageError>;

    /// Makes every appended row durable.
    fn flush(&mut self) -> Result<(), StorageError>;

    /// Persists the id -> row-number index of `period`.
    fn write_index(&mut self, period: Period, index: &RowIndex) -> Result<(), StorageError>;

    /// Handle to the persisted index of `period`, if one was written.
    fn index_handle(&self, period: Period) -> Result<Option<DiskIndex>, StorageError>;

    /// Window of `period`, empty when the period was never stored.
    fn window(&self, period: Period) -> RowWindow {
        self.windows().get(&period).copied().unwrap_or(RowWindow::EMPTY)
    }

    /// Reads one field for a whole period.
    fn read_period(&self, period: Period, field: &str) -> Result<Column, StorageError> {
        self.read_field(self.window(period), field)
    }

    /// Element type of `field`, if the store holds it.
    fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields()
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.field_type)
    }

    /// True if the store holds `field`.
    fn has_field(&self, field: &str) -> bool {
        self.field_type(field).is_some()
    }
}

/// Checks an append against the store state and extracts the columns in
/// store order.
pub(crate) fn columns_for_append(
    table: &str,
    fields: &[FieldDef],
    windows: &BTreeMap<Period, RowWindow>,
    period: Period,
    rows: &ColumnTable,
) -> Result<Vec<Column>, StorageError> {
    if let Some((&last, _)) = windows.iter().next_back() {
        if period <= last {
            return Err(StorageError::NonMonotonicPeriod {
                table: table.to_string(),
                period,
                last,
            });
        }
    }
    fields
        .iter()
        .map(|field| {
            let column = rows.column(&field.name).ok_or_else(|| StorageError::UnknownField {
                table: table.to_string(),
                field: field.name.clone(),
            })?;
            if column.field_type() != field.field_type {
                return Err(StorageError::TypeMismatch {
                    table: table.to_string(),
                    field: field.name.clone(),
                    expected: field.field_type,
                    actual: column.field_type(),
                });
            }
            Ok(column.as_ref().clone())
        })
        .collect()
}

/// Converts a row count to the store's row numbering.
pub(crate) fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Converts a store row number to an in-memory offset.
pub(crate) fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed(RowIndex);

    impl IndexReader for Fixed {
        fn load(&self) -> Result<RowIndex, StorageError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_window_clamp() {
        assert_eq!(RowWindow::new(2, 10).clamp(5), RowWindow::new(2, 5));
        assert!(RowWindow::new(7, 10).clamp(5).is_empty());
        assert_eq!(RowWindow::EMPTY.len(), 0);
    }

    #[test]
    fn test_lazy_slot_materializes_before_indexing() {
        let index = RowIndex::from_ids(&[3, 1]).unwrap();
        let slot = IndexSlot::Lazy(DiskIndex::new(Period::new(2000), Arc::new(Fixed(index))));
        assert!(!slot.is_materialized());
        assert_eq!(slot.rows_for(&[1, 3, 2, -1, 50]).unwrap(), vec![1, 0, -1, -1, -1]);
    }
}

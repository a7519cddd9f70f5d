//! In-memory storage backend.
//!
//! This module provides an in-memory implementation of [`PeriodStore`].
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::period::Period;
use crate::schema::FieldDef;
use crate::storage::traits::{
    columns_for_append, to_u64, to_usize, DiskIndex, IndexReader, PeriodStore, RowWindow,
    StorageError,
};
use crate::table::{ColumnTable, RowIndex};
use crate::value::Column;

/// An index kept alive in memory behind the durable-index interface.
#[derive(Debug)]
struct SharedIndex(Arc<RowIndex>);

impl IndexReader for SharedIndex {
    fn load(&self) -> Result<RowIndex, StorageError> {
        Ok(self.0.as_ref().clone())
    }
}

/// Period store holding every column in memory.
#[derive(Debug, Clone)]
pub struct InMemoryPeriodStore {
    name: String,
    fields: Vec<FieldDef>,
    columns: Vec<Column>,
    nrows: u64,
    windows: BTreeMap<Period, RowWindow>,
    indexes: BTreeMap<Period, Arc<RowIndex>>,
}

impl InMemoryPeriodStore {
    /// Creates an empty store with the given fields.
    #[must_use]
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        let columns = fields.iter().map(|f| Column::empty(f.field_type)).collect();
        Self {
            name: name.into(),
            fields,
            columns,
            nrows: 0,
            windows: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    /// Builds a store from rows sorted by period.
    ///
    /// Each run of equal `period` values becomes that period's window. A
    /// period that reappears after a later one is rejected.
    pub fn from_table(name: impl Into<String>, table: &ColumnTable) -> Result<Self, StorageError> {
        let name = name.into();
        let periods = table
            .column("period")
            .and_then(|c| c.as_ints())
            .ok_or_else(|| StorageError::UnknownField {
                table: name.clone(),
                field: "period".to_string(),
            })?;

        let mut windows: BTreeMap<Period, RowWindow> = BTreeMap::new();
        let mut start = 0usize;
        while start < periods.len() {
            let period = periods[start];
            let stop = periods[start..]
                .iter()
                .position(|p| *p != period)
                .map_or(periods.len(), |offset| start + offset);
            let period = Period::new(period);
            if let Some((&last, _)) = windows.iter().next_back() {
                if period <= last {
                    return Err(StorageError::NonMonotonicPeriod {
                        table: name,
                        period,
                        last,
                    });
                }
            }
            windows.insert(period, RowWindow::new(to_u64(start), to_u64(stop)));
            start = stop;
        }

        Ok(Self {
            name,
            fields: table.fields(),
            columns: table.iter().map(|(_, c)| c.as_ref().clone()).collect(),
            nrows: to_u64(table.len()),
            windows,
            indexes: BTreeMap::new(),
        })
    }

    fn position(&self, field: &str) -> Result<usize, StorageError> {
        self.fields
            .iter()
            .position(|f| f.name == field)
            .ok_or_else(|| StorageError::UnknownField {
                table: self.name.clone(),
                field: field.to_string(),
            })
    }
}

impl PeriodStore for InMemoryPeriodStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    fn nrows(&self) -> u64 {
        self.nrows
    }

    fn windows(&self) -> &BTreeMap<Period, RowWindow> {
        &self.windows
    }

    fn read_field(&self, window: RowWindow, field: &str) -> Result<Column, StorageError> {
        let pos = self.position(field)?;
        let window = window.clamp(self.nrows);
        Ok(self.columns[pos].slice(to_usize(window.start), to_usize(window.stop)))
    }

    fn read_rows(&self, window: RowWindow) -> Result<ColumnTable, StorageError> {
        let window = window.clamp(self.nrows);
        let (start, stop) = (to_usize(window.start), to_usize(window.stop));
        ColumnTable::from_columns(
            self.fields
                .iter()
                .zip(&self.columns)
                .map(|(f, c)| (f.name.clone(), c.slice(start, stop))),
        )
        .map_err(|e| StorageError::Corrupted(e.to_string()))
    }

    fn append(&mut self, period: Period, rows: &ColumnTable) -> Result<RowWindow, StorageError> {
        let incoming = columns_for_append(&self.name, &self.fields, &self.windows, period, rows)?;
        for (column, new) in self.columns.iter_mut().zip(&incoming) {
            column
                .extend_from(new)
                .map_err(|e| StorageError::BackendError(e.to_string()))?;
        }
        let window = RowWindow::new(self.nrows, self.nrows + to_u64(rows.len()));
        self.nrows = window.stop;
        self.windows.insert(period, window);
        Ok(window)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn write_index(&mut self, period: Period, index: &RowIndex) -> Result<(), StorageError> {
        self.indexes.insert(period, Arc::new(index.clone()));
        Ok(())
    }

    fn index_handle(&self, period: Period) -> Result<Option<DiskIndex>, StorageError> {
        Ok(self.indexes.get(&period).map(|index| {
            DiskIndex::new(period, Arc::new(SharedIndex(Arc::clone(index))) as Arc<dyn IndexReader>)
        }))
    }
}

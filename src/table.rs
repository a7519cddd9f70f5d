//! Columnar tables and id -> row-number indices.
//!
//! A [`ColumnTable`] is the in-memory shape of an entity period: an ordered
//! set of equally long named columns, `id` and `period` among them. Columns
//! are shared through `Arc` so that snapshots (the lag cache, contexts) alias
//! the data until a writer touches it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::schema::FieldDef;
use crate::value::{Binding, Column, FieldType};

/// Dense id -> row-number mapping.
///
/// Indexed by id; holds the row of that id or `-1` when the id is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowIndex(Vec<i64>);

impl RowIndex {
    /// Builds the index of a table whose id column is `ids`.
    pub fn from_ids(ids: &[i64]) -> Result<Self, ExecutionError> {
        let Some(&max_id) = ids.iter().max() else {
            return Ok(Self::default());
        };
        if let Some(bad) = ids.iter().find(|id| **id < 0) {
            return Err(ExecutionError::precondition(format!("negative id {bad}")));
        }
        let size = usize::try_from(max_id)
            .map_err(|_| ExecutionError::precondition(format!("id {max_id} is too large")))?
            + 1;
        let mut rows = vec![-1i64; size];
        for (row, id) in ids.iter().enumerate() {
            // ids were checked non-negative above
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let slot = *id as usize;
            rows[slot] = i64::try_from(row).unwrap_or(-1);
        }
        Ok(Self(rows))
    }

    /// Wraps raw slots, `-1` marking absent ids.
    #[must_use]
    pub const fn from_vec(rows: Vec<i64>) -> Self {
        Self(rows)
    }

    /// The raw slots.
    #[must_use]
    pub fn into_vec(self) -> Vec<i64> {
        self.0
    }

    /// The raw slots.
    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    /// Number of slots (largest id + 1).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no slot exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Row of `id`, if present.
    #[must_use]
    pub fn row_of(&self, id: i64) -> Option<usize> {
        let slot = usize::try_from(id).ok()?;
        let row = *self.0.get(slot)?;
        usize::try_from(row).ok()
    }

    /// Rows of `ids`, `-1` for every absent id.
    #[must_use]
    pub fn rows_for(&self, ids: &[i64]) -> Vec<i64> {
        ids.iter()
            .map(|id| {
                usize::try_from(*id)
                    .ok()
                    .and_then(|slot| self.0.get(slot).copied())
                    .unwrap_or(-1)
            })
            .collect()
    }

    /// Number of ids present.
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.iter().filter(|r| **r >= 0).count()
    }
}

/// An ordered set of equally long, uniquely named columns.
#[derive(Debug, Clone, Default)]
pub struct ColumnTable {
    names: Vec<String>,
    columns: Vec<Arc<Column>>,
    len: usize,
}

impl ColumnTable {
    /// A table with the given fields and no rows.
    #[must_use]
    pub fn empty(fields: &[FieldDef]) -> Self {
        Self {
            names: fields.iter().map(|f| f.name.clone()).collect(),
            columns: fields
                .iter()
                .map(|f| Arc::new(Column::empty(f.field_type)))
                .collect(),
            len: 0,
        }
    }

    /// Builds a table, checking that names are unique and lengths coherent.
    pub fn from_columns<N: Into<String>>(
        columns: impl IntoIterator<Item = (N, Column)>,
    ) -> Result<Self, ExecutionError> {
        let mut table = Self::default();
        for (name, column) in columns {
            let name = name.into();
            if table.names.contains(&name) {
                return Err(ExecutionError::precondition(format!("duplicate column '{name}'")));
            }
            if !table.names.is_empty() && column.len() != table.len {
                return Err(ExecutionError::precondition(format!(
                    "incoherent column lengths: {name}'s is {} while the len of others is {}",
                    column.len(),
                    table.len
                )));
            }
            table.len = column.len();
            table.names.push(name);
            table.columns.push(Arc::new(column));
        }
        Ok(table)
    }

    /// Number of rows.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True when the table has no rows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Column names, in order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Field definitions in column order.
    #[must_use]
    pub fn fields(&self) -> Vec<FieldDef> {
        self.names
            .iter()
            .zip(&self.columns)
            .map(|(name, col)| FieldDef::new(name.clone(), col.field_type()))
            .collect()
    }

    /// True if the table has a column `name`.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// The column `name`.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Arc<Column>> {
        self.position(name).map(|i| &self.columns[i])
    }

    /// Element type of column `name`.
    #[must_use]
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.column(name).map(|c| c.field_type())
    }

    /// Columns with their names, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Column>)> {
        self.names.iter().map(String::as_str).zip(&self.columns)
    }

    /// The `id` column, when present and integer typed.
    #[must_use]
    pub fn ids(&self) -> Option<&[i64]> {
        self.column("id").and_then(|c| c.as_ints())
    }

    /// Approximate memory footprint in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.columns.iter().map(|c| c.nbytes()).sum()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// A table aliasing the named columns of this one.
    pub fn select(&self, names: &[String]) -> Result<Self, ExecutionError> {
        let mut out = Self {
            len: self.len,
            ..Self::default()
        };
        for name in names {
            let column = self.column(name).ok_or_else(|| {
                ExecutionError::precondition(format!("table has no column '{name}'"))
            })?;
            out.names.push(name.clone());
            out.columns.push(Arc::clone(column));
        }
        Ok(out)
    }

    /// Rows `start..stop` of every column, clamped to the table length.
    #[must_use]
    pub fn slice(&self, start: usize, stop: usize) -> Self {
        let stop = stop.min(self.len);
        let start = start.min(stop);
        Self {
            names: self.names.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| Arc::new(c.slice(start, stop)))
                .collect(),
            len: stop - start,
        }
    }

    /// Overwrites a column in place with a scalar (broadcast) or a column of
    /// the same length. The column keeps its position and type.
    pub fn assign(&mut self, name: &str, value: &Binding) -> Result<(), ExecutionError> {
        let pos = self.position(name).ok_or_else(|| {
            ExecutionError::precondition(format!("table has no column '{name}'"))
        })?;
        let column = Arc::make_mut(&mut self.columns[pos]);
        match value {
            Binding::Scalar(v) => {
                column.fill(*v);
                Ok(())
            }
            Binding::Column(src) => column.overwrite(src),
            Binding::Globals(_) => Err(ExecutionError::precondition(format!(
                "cannot store the global state handle into field '{name}'"
            ))),
        }
    }

    /// Builds the id -> row index of this table.
    pub fn row_index(&self) -> Result<RowIndex, ExecutionError> {
        self.ids().map_or_else(|| Ok(RowIndex::default()), RowIndex::from_ids)
    }

    /// Merges `input` into this table by id.
    ///
    /// The result keeps this table's fields, holds the sorted union of both id
    /// sets, takes `input`'s values for every field it carries and fills the
    /// remaining cells of new individuals with missing values.
    pub fn merge(&self, input: &Self) -> Result<(Self, RowIndex), ExecutionError> {
        let own_ids = self.ids().unwrap_or(&[]);
        let input_ids = input
            .ids()
            .ok_or_else(|| ExecutionError::precondition("merged rows have no integer id column"))?;

        let mut ids: Vec<i64> = own_ids.iter().chain(input_ids).copied().collect();
        ids.sort_unstable();
        ids.dedup();

        let index = RowIndex::from_ids(&ids)?;
        let own_rows = index.rows_for(own_ids);
        let input_rows = index.rows_for(input_ids);

        let mut merged = Self {
            len: ids.len(),
            ..Self::default()
        };
        for (name, column) in self.iter() {
            let mut out = Column::missing(column.field_type(), ids.len());
            out.put(&own_rows, column)?;
            if let Some(incoming) = input.column(name) {
                out.put(&input_rows, incoming)?;
            }
            merged.names.push(name.to_string());
            merged.columns.push(Arc::new(out));
        }
        Ok((merged, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn people() -> ColumnTable {
        ColumnTable::from_columns([
            ("id", Column::Int(vec![1, 3])),
            ("age", Column::Int(vec![10, 30])),
            ("income", Column::Float(vec![1.0, 3.0])),
        ])
        .unwrap()
    }

    #[test]
    fn test_row_index_marks_absent_ids() {
        let index = RowIndex::from_ids(&[4, 1]).unwrap();
        assert_eq!(index.as_slice(), &[-1, 1, -1, -1, 0]);
        assert_eq!(index.row_of(4), Some(0));
        assert_eq!(index.row_of(2), None);
        assert_eq!(index.row_of(99), None);
        assert_eq!(index.rows_for(&[1, 7, -3]), vec![1, -1, -1]);
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn test_from_columns_rejects_incoherent_lengths() {
        let err = ColumnTable::from_columns([
            ("id", Column::Int(vec![1, 2])),
            ("age", Column::Int(vec![1])),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("incoherent column lengths"));
    }

    #[test]
    fn test_merge_adds_new_ids_with_missing_values() {
        let input = ColumnTable::from_columns([
            ("id", Column::Int(vec![2, 3])),
            ("age", Column::Int(vec![20, 31])),
        ])
        .unwrap();
        let (merged, index) = people().merge(&input).unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged.ids().unwrap(), &[1, 2, 3]);
        assert_eq!(merged.column("age").unwrap().as_ints().unwrap(), &[10, 20, 31]);
        let income = merged.column("income").unwrap().as_floats().unwrap();
        assert!((income[0] - 1.0).abs() < f64::EPSILON);
        assert!(income[1].is_nan());
        assert!((income[2] - 3.0).abs() < f64::EPSILON);
        assert_eq!(index.row_of(2), Some(1));
    }

    #[test]
    fn test_assign_is_in_place_and_does_not_touch_aliases() {
        let mut table = people();
        let lag = table.select(&["age".to_string()]).unwrap();

        table.assign("age", &Binding::Scalar(Value::Int(5))).unwrap();

        assert_eq!(table.column("age").unwrap().as_ints().unwrap(), &[5, 5]);
        assert_eq!(lag.column("age").unwrap().as_ints().unwrap(), &[10, 30]);
        assert_eq!(table.names()[1], "age");
    }

    #[test]
    fn test_slice_clamps_to_length() {
        let table = people();
        assert_eq!(table.slice(1, 10).len(), 1);
        assert_eq!(table.slice(5, 10).len(), 0);
    }
}
